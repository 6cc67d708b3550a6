use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{self, Context};
use crossbeam_channel::{Receiver, Sender};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};

use revmedia_common::bin_common::init::{init_eyre, init_logger};
use revmedia_common::bin_common::termination::Termination;
use revmedia_common::config::Config;
use revmedia_common::store::MediaStore;
use revmedia_common::thumbs::ThumbStore;

use revmedia_ingest::pipeline::Pipeline;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command()]
/// Consumes post/comment envelopes from the bus and indexes their media
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
}

fn main() -> eyre::Result<()> {
    init_eyre()?;
    let cli = Cli::parse();
    init_logger(cli.logfile.as_deref())?;

    let config = Config::load(cli.config.as_deref())?;
    let workers = cli.workers.unwrap_or(config.workers).max(1);

    let subreddits = config.load_subreddits()?;
    if subreddits.is_empty() {
        eyre::bail!(
            "no subreddits configured in {}",
            config.subreddits_file.display()
        );
    }
    log::info!("Consuming {} subreddits with {workers} workers", subreddits.len());

    let store = MediaStore::open(&config.db_path, config.db_connections)
        .wrap_err_with(|| format!("failed to open the store at {}", config.db_path.display()))?;
    let termination = Termination::install().wrap_err("failed to install signal handlers")?;

    // Built up front so a broken proxy config fails fast, one per worker so
    // no HTTP connection pool is shared.
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

    let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(workers * 4);

    thread::scope(|s| {
        for (i, pipeline) in pipelines.into_iter().enumerate() {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("W{i:03}"))
                .spawn_scoped(s, move || worker(rx, pipeline))
                .expect("failed to spawn a worker thread");
        }
        drop(rx);

        consume(&config, &subreddits, tx, &termination);
    });

    log::info!("All workers drained, goodbye");
    Ok(())
}

fn worker(rx: Receiver<Vec<u8>>, pipeline: Pipeline) {
    log::debug!("Ingest worker at your service");
    while let Ok(payload) = rx.recv() {
        if let Err(e) = pipeline.process(&payload) {
            log::error!("Failed to process an envelope: {e:?}");
        }
    }
    log::debug!("Ingest worker done");
}

/// Single producer: reads the broker, pushes payloads into the bounded
/// queue. Returning drops `tx`, which is what tells the workers to stop.
fn consume(config: &Config, subreddits: &[String], tx: Sender<Vec<u8>>, termination: &Termination) {
    let (host, port) = match parse_broker_addr(&config.broker_addr) {
        Ok(parts) => parts,
        Err(e) => {
            log::error!("Bad broker address '{}': {e}", config.broker_addr);
            return;
        }
    };

    while !termination.is_terminating() {
        let mut options = MqttOptions::new("revmedia-ingest", &host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut connection) = Client::new(options, 64);

        for sub in subreddits {
            // mirrors the <type>.<subreddit> routing key of the exchange
            if let Err(e) = client.subscribe(format!("reddit/+/{sub}"), QoS::AtMostOnce) {
                log::error!("Failed to subscribe to {sub}: {e}");
            }
        }
        log::info!("Subscribed to {} topics on {host}:{port}", subreddits.len());

        for event in connection.iter() {
            if termination.is_terminating() {
                log::info!("Termination requested, closing the bus connection");
                return;
            }
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    log::debug!("Envelope on {}", publish.topic);
                    if tx.send(publish.payload.to_vec()).is_err() {
                        log::error!("The work queue is gone, stopping the consumer");
                        return;
                    }
                }
                Ok(_) => (),
                Err(e) => {
                    log::error!("Bus connection error: {e}. Reconnecting...");
                    break;
                }
            }
        }

        if !termination.is_terminating() {
            thread::sleep(RECONNECT_DELAY);
        }
    }
}

fn parse_broker_addr(addr: &str) -> eyre::Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port.parse().wrap_err("the port is not a number")?;
            Ok((host.to_string(), port))
        }
        _ => Ok((addr.to_string(), 1883)),
    }
}
