mod cache;
mod http;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{self, Context};

use revmedia_common::bin_common::init::{init_eyre, init_logger};
use revmedia_common::bin_common::termination::Termination;
use revmedia_common::config::Config;
use revmedia_common::store::MediaStore;

use cache::ResponseCache;
use routes::{App, Handler};

const HANDLER_THREADS: usize = 16;

#[derive(Parser, Debug)]
#[command()]
/// Serves the similarity search API over the indexed media
struct Cli {
    /// Path to the TOML config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// A file to additionally write the logs to
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> eyre::Result<()> {
    init_eyre()?;
    let cli = Cli::parse();
    init_logger(cli.logfile.as_deref())?;

    let config = Config::load(cli.config.as_deref())?;
    let addr = cli.addr.unwrap_or_else(|| config.http_addr.clone());

    let store = MediaStore::open(&config.db_path, config.db_connections)
        .wrap_err_with(|| format!("failed to open the store at {}", config.db_path.display()))?;
    let subreddits = config.load_subreddits().unwrap_or_else(|e| {
        log::warn!("No subreddit list: {e}");
        Vec::new()
    });

    let static_root = config
        .thumbs_root
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("static"));

    let app = App {
        store,
        cache: ResponseCache::new(),
        subreddits: Arc::new(subreddits),
        proxy: config.http_proxy.clone(),
        tn_size: config.thumb_size,
        nsfw: config.nsfw,
        static_root,
    };

    let mut handlers = Vec::with_capacity(HANDLER_THREADS);
    for _ in 0..HANDLER_THREADS {
        let handler = Handler::new(app.clone())?;
        handlers.push(move |request: &http::Request| handler.handle(request));
    }

    let termination = Termination::install().wrap_err("failed to install signal handlers")?;
    http::serve(&addr, handlers, &termination)
}
