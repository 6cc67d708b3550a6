use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::thread;

use clap::Parser;
use color_eyre::eyre::{self, Context};
use crossbeam_channel::Receiver;

use revmedia_common::bin_common::init::{init_eyre, init_logger};
use revmedia_common::bin_common::termination::Termination;
use revmedia_common::config::Config;
use revmedia_common::store::MediaStore;
use revmedia_common::thumbs::ThumbStore;

use revmedia_ingest::pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command()]
/// Replays a historical dump of post envelopes through the ingest pipeline
struct Cli {
    /// Path to the TOML config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// A file to additionally write the logs to
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Override the configured number of worker threads
    #[arg(long, short = 'j')]
    workers: Option<usize>,

    /// Newline-delimited JSON file, one post envelope per line
    #[arg(long, short = 'i', default_value = "posts.ndjson")]
    input: PathBuf,

    /// Only process up to this many lines
    #[arg(long, default_value_t = usize::MAX)]
    limit: usize,
}

fn main() -> eyre::Result<()> {
    init_eyre()?;
    let cli = Cli::parse();
    init_logger(cli.logfile.as_deref())?;

    let config = Config::load(cli.config.as_deref())?;
    let workers = cli.workers.unwrap_or(config.workers).max(1);

    let store = MediaStore::open(&config.db_path, config.db_connections)
        .wrap_err_with(|| format!("failed to open the store at {}", config.db_path.display()))?;
    let termination = Termination::install().wrap_err("failed to install signal handlers")?;

    let mut pipelines = Vec::with_capacity(workers);
    for _ in 0..workers {
        pipelines.push(Pipeline::new(
            store.clone(),
            ThumbStore::new(&config.thumbs_root),
            config.url_rules(),
            config.http_proxy.clone(),
            config.thumb_size,
        )?);
    }

    let file = File::open(&cli.input)
        .wrap_err_with(|| format!("could not open the dump at {}", cli.input.display()))?;
    log::info!(
        "Backfilling from {} with {workers} workers",
        cli.input.display()
    );

    let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(workers * 4);

    thread::scope(|s| {
        for (i, pipeline) in pipelines.into_iter().enumerate() {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("B{i:03}"))
                .spawn_scoped(s, move || worker(rx, pipeline))
                .expect("failed to spawn a worker thread");
        }
        drop(rx);

        let mut lines = 0usize;
        for line in BufReader::new(file).lines() {
            if termination.is_terminating() {
                log::info!("Termination requested, stopping the backfill");
                break;
            }
            if lines >= cli.limit {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to read the dump: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            lines += 1;
            if lines % 10_000 == 0 {
                log::info!("Progress: {lines} envelopes queued");
            }
            if tx.send(line.into_bytes()).is_err() {
                break;
            }
        }
        drop(tx);
        log::info!("Queued {lines} envelopes, waiting for the workers");
    });

    log::info!("Backfill done");
    Ok(())
}

fn worker(rx: Receiver<Vec<u8>>, pipeline: Pipeline) {
    while let Ok(payload) = rx.recv() {
        if let Err(e) = pipeline.process(&payload) {
            log::error!("Failed to process an envelope: {e:?}");
        }
    }
}
