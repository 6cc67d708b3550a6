use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "tiff", "bmp", "webp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["webm", "mp4"];

/// Default hosts/fragments that are never worth fetching. The list is
/// heuristic and can be replaced wholesale from the config file.
pub const DEFAULT_SKIP_SUBSTRINGS: &[&str] = &[
    "message/compose",
    "youtu.be",
    "youtube.com",
    "reddit.com/search?q=",
    "github.com",
    "wikipedia.org",
    "addons.mozilla.org",
];

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[.*\]\(([^)]+)\)").unwrap())
}

fn sub_root_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(https?://[^/]+)?/r/[A-Za-z0-9_+]+/?($|\?)").unwrap())
}

fn user_root_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(https?://[^/]+)?/(u|user)/[\w-]+/?$").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Directly fetchable still image.
    Image,
    /// Directly fetchable video container.
    Video,
    /// Hosted on v.redd.it, needs the external resolver first.
    RedditVideo,
    /// Unknown page, hand to the album expander.
    Indirect,
    Skip,
}

/// Skip rules for the classifier and the link extractor.
#[derive(Debug, Clone)]
pub struct UrlRules {
    skip_substrings: Vec<String>,
}

impl Default for UrlRules {
    fn default() -> Self {
        Self {
            skip_substrings: DEFAULT_SKIP_SUBSTRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl UrlRules {
    pub fn with_skip_substrings(skip_substrings: Vec<String>) -> Self {
        Self { skip_substrings }
    }

    pub fn should_skip(&self, url: &str) -> bool {
        let lower = url.to_lowercase();
        if self.skip_substrings.iter().any(|s| lower.contains(s)) {
            return true;
        }
        sub_root_re().is_match(&lower) || user_root_re().is_match(&lower)
    }

    pub fn classify(&self, url: &str) -> Classification {
        if self.should_skip(url) {
            return Classification::Skip;
        }
        if is_image_direct_link(url) {
            return Classification::Image;
        }
        if is_video_direct_link(url) {
            return Classification::Video;
        }
        if host_of(url).is_some_and(|h| h == "v.redd.it") {
            return Classification::RedditVideo;
        }
        Classification::Indirect
    }

    /// Markdown link targets in a post/comment body, skip-filtered and
    /// deduplicated in order of appearance.
    pub fn links_from_body(&self, body: &str) -> Vec<String> {
        let body = body.replace("\\)", "&#x28;");

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for caps in link_re().captures_iter(&body) {
            let url = caps[1].to_string();
            if self.should_skip(&url) {
                continue;
            }
            if seen.insert(url.clone()) {
                result.push(url);
            }
        }
        result
    }
}

fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().map(|h| h.to_lowercase())
}

/// The path portion used for extension matching: query and fragment dropped,
/// a Twitter CDN `:orig` suffix dropped, lowercased.
fn match_target(url: &str) -> String {
    let mut url = url;
    if let Some(i) = url.find('?') {
        url = &url[..i];
    }
    if let Some(i) = url.find('#') {
        url = &url[..i];
    }
    let lower = url.to_lowercase();
    match lower.strip_suffix(":orig") {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

pub fn is_image_direct_link(url: &str) -> bool {
    if host_of(url).is_some_and(|h| h == "i.reddituploads.com") {
        return true;
    }
    let target = match_target(url);
    IMAGE_EXTENSIONS
        .iter()
        .any(|ext| target.ends_with(&format!(".{ext}")))
}

pub fn is_video_direct_link(url: &str) -> bool {
    let target = match_target(url);
    VIDEO_EXTENSIONS
        .iter()
        .any(|ext| target.ends_with(&format!(".{ext}")))
}

/// The file extension a video URL advertises, with the `.gifv` alias
/// rewritten to the real container.
pub fn video_extension(url: &str) -> String {
    let target = match_target(url);
    match target.rfind('.') {
        Some(i) => target[i + 1..].replace("gifv", "mp4"),
        None => "mp4".to_string(),
    }
}

/// Canonical form of a URL, used as the dedup key in the store. Stable
/// contract: changing this requires a column backfill.
pub fn clean_url(url: &str) -> String {
    let mut url = url
        .replace('"', "%22")
        .replace('\'', "%27")
        .replace("http://", "")
        .replace("https://", "");

    if let Some(i) = url.find('?') {
        url.truncate(i);
    }
    if let Some(i) = url.find('#') {
        url.truncate(i);
    }
    while url.ends_with('/') {
        url.pop();
    }
    format!("http://{url}")
}
