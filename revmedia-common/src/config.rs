use std::path::{Path, PathBuf};

use color_eyre::eyre::{self, Context};
use serde::Deserialize;

use crate::urls::UrlRules;

const DEFAULT_DB_PATH: &str = "revmedia.db";
const DEFAULT_SUBREDDITS_FILE: &str = "subs.txt";
const DEFAULT_THUMBS_ROOT: &str = "static/thumbs";
const DEFAULT_THUMB_SIZE: u32 = 500;
const DEFAULT_WORKERS: usize = 30;
const DEFAULT_DB_CONNECTIONS: usize = 8;
const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:5010";

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    db_path: Option<String>,
    http_proxy: Option<String>,
    subreddits_file: Option<String>,
    thumbs_root: Option<String>,
    thumb_size: Option<u32>,
    workers: Option<usize>,
    db_connections: Option<usize>,
    broker_addr: Option<String>,
    http_addr: Option<String>,
    nsfw: Option<bool>,
    cache: Option<CacheConfigFile>,
    skip_urls: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct CacheConfigFile {
    backend: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub http_proxy: Option<String>,
    pub subreddits_file: PathBuf,
    pub thumbs_root: PathBuf,
    /// Long-edge cap for video frame thumbnails.
    pub thumb_size: u32,
    pub workers: usize,
    pub db_connections: usize,
    pub broker_addr: String,
    pub http_addr: String,
    pub nsfw: bool,
    pub cache_backend: CacheBackend,
    skip_urls: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.into(),
            http_proxy: None,
            subreddits_file: DEFAULT_SUBREDDITS_FILE.into(),
            thumbs_root: DEFAULT_THUMBS_ROOT.into(),
            thumb_size: DEFAULT_THUMB_SIZE,
            workers: DEFAULT_WORKERS,
            db_connections: DEFAULT_DB_CONNECTIONS,
            broker_addr: DEFAULT_BROKER_ADDR.to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            nsfw: false,
            cache_backend: CacheBackend::Memory,
            skip_urls: None,
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file is fine when no path was given
    /// explicitly; every field falls back to its default.
    pub fn load(path: Option<&Path>) -> eyre::Result<Self> {
        let file = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("could not read config at {}", path.display()))?;
                toml::from_str(&text)
                    .wrap_err_with(|| format!("could not parse config at {}", path.display()))?
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> eyre::Result<Self> {
        let defaults = Self::default();
        let cache_backend = match file.cache.and_then(|c| c.backend) {
            None => CacheBackend::Memory,
            Some(name) if name == "memory" => CacheBackend::Memory,
            Some(name) => eyre::bail!("unsupported cache backend: {name}"),
        };

        Ok(Self {
            db_path: file.db_path.map(PathBuf::from).unwrap_or(defaults.db_path),
            http_proxy: file.http_proxy,
            subreddits_file: file
                .subreddits_file
                .map(PathBuf::from)
                .unwrap_or(defaults.subreddits_file),
            thumbs_root: file
                .thumbs_root
                .map(PathBuf::from)
                .unwrap_or(defaults.thumbs_root),
            thumb_size: file.thumb_size.unwrap_or(defaults.thumb_size),
            workers: file.workers.unwrap_or(defaults.workers),
            db_connections: file.db_connections.unwrap_or(defaults.db_connections),
            broker_addr: file.broker_addr.unwrap_or(defaults.broker_addr),
            http_addr: file.http_addr.unwrap_or(defaults.http_addr),
            nsfw: file.nsfw.unwrap_or(false),
            cache_backend,
            skip_urls: file.skip_urls,
        })
    }

    pub fn url_rules(&self) -> UrlRules {
        match &self.skip_urls {
            Some(skips) => UrlRules::with_skip_substrings(skips.clone()),
            None => UrlRules::default(),
        }
    }

    /// One subreddit per line, trimmed and lowercased, blanks dropped.
    pub fn load_subreddits(&self) -> eyre::Result<Vec<String>> {
        let text = std::fs::read_to_string(&self.subreddits_file).wrap_err_with(|| {
            format!(
                "could not read the subreddit list at {}",
                self.subreddits_file.display()
            )
        })?;
        Ok(text
            .lines()
            .map(|line| line.trim().to_lowercase())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(PathBuf::from("revmedia.db"), config.db_path);
        assert_eq!(30, config.workers);
        assert_eq!(CacheBackend::Memory, config.cache_backend);
    }

    #[test]
    fn file_overrides_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
            db_path = "/data/ir.db"
            http_proxy = "http://localhost:5050"
            workers = 4
            skip_urls = ["youtube.com"]

            [cache]
            backend = "memory"
            "#,
        )
        .unwrap();
        let config = Config::from_file(file).unwrap();
        assert_eq!(PathBuf::from("/data/ir.db"), config.db_path);
        assert_eq!(Some("http://localhost:5050".to_string()), config.http_proxy);
        assert_eq!(4, config.workers);
        assert!(config.url_rules().should_skip("https://youtube.com/watch?v=1"));
        assert!(!config.url_rules().should_skip("https://github.com/x"));
    }

    #[test]
    fn unknown_cache_backend_is_rejected() {
        let file: ConfigFile = toml::from_str("[cache]\nbackend = \"redis\"").unwrap();
        assert!(Config::from_file(file).is_err());
    }

    #[test]
    fn subreddit_list_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.txt");
        std::fs::write(&path, "Pics\n\n  aww  \nvideos\n").unwrap();

        let config = Config {
            subreddits_file: path,
            ..Config::default()
        };
        assert_eq!(vec!["pics", "aww", "videos"], config.load_subreddits().unwrap());
    }
}
