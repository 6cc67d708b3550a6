use std::collections::HashSet;
use std::process::{Command, Stdio};

use color_eyre::eyre::{self, Context};
use serde::Deserialize;

/// Expands gallery/album pages into their direct media URLs by shelling out
/// to gallery-dl. Opaque collaborator: any failure degrades to "no children".
pub struct Expander {
    proxy: Option<String>,
}

impl Expander {
    pub fn new(proxy: Option<String>) -> Self {
        Self { proxy }
    }

    pub fn expand(&self, url: &str) -> Vec<String> {
        let mut cmd = Command::new("gallery-dl");
        cmd.args(["-g", "-q"]);
        if let Some(proxy) = &self.proxy {
            cmd.args(["--proxy", proxy]);
        }
        cmd.args(["--no-check-certificate", "-R", "1", "--http-timeout", "600"]);
        cmd.arg(url);
        cmd.stdin(Stdio::null()).stderr(Stdio::null());

        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                log::error!("Failed to run gallery-dl on {url}: {e}");
                return Vec::new();
            }
        };
        if !output.status.success() {
            log::error!("gallery-dl failed on {url}: {}", output.status);
            return Vec::new();
        }

        let mut seen = HashSet::new();
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_string()))
            .map(String::from)
            .collect()
    }
}

#[derive(Deserialize)]
struct YtdlInfo {
    #[serde(default)]
    formats: Vec<YtdlFormat>,
}

#[derive(Deserialize)]
struct YtdlFormat {
    url: Option<String>,
    width: Option<u32>,
}

/// Resolve a v.redd.it page to the widest direct stream URL via yt-dlp.
pub fn resolve_reddit_video(url: &str) -> eyre::Result<String> {
    let output = Command::new("yt-dlp")
        .args(["-J", "--no-download"])
        .arg(url)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .wrap_err("failed to run yt-dlp")?;
    if !output.status.success() {
        eyre::bail!("yt-dlp failed on {url}: {}", output.status);
    }

    let info: YtdlInfo =
        serde_json::from_slice(&output.stdout).wrap_err("unparsable yt-dlp output")?;
    best_format(info).ok_or_else(|| eyre::eyre!("no downloadable format for {url}"))
}

fn best_format(info: YtdlInfo) -> Option<String> {
    info.formats
        .into_iter()
        .filter(|f| f.url.is_some())
        .max_by_key(|f| f.width.unwrap_or(0))
        .and_then(|f| f.url)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn widest_format_wins() {
        let info: YtdlInfo = serde_json::from_str(
            r#"{"formats": [
                {"url": "http://a/240", "width": 240},
                {"url": "http://a/1080", "width": 1080},
                {"url": "http://a/audio"},
                {"url": "http://a/720", "width": 720}
            ]}"#,
        )
        .unwrap();
        assert_eq!(Some("http://a/1080".to_string()), best_format(info));
    }

    #[test]
    fn no_formats_is_none() {
        let info: YtdlInfo = serde_json::from_str(r#"{"formats": []}"#).unwrap();
        assert_eq!(None, best_format(info));
    }
}
