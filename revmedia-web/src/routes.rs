use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{self, Context};
use image::GenericImageView;

use revmedia_common::fetch::Fetcher;
use revmedia_common::frames;
use revmedia_common::imghash::{self, hamming::Hamming};
use revmedia_common::results::{SearchHit, SearchResults};
use revmedia_common::store::similar::{clamp_distance, clamp_frame_matches};
use revmedia_common::store::{sha1_hex, Binding, MediaStore, NewImage, NewVideo};
use revmedia_common::thumbs;
use revmedia_common::urls;

use crate::cache::ResponseCache;
use crate::http::{Request, Response};

pub const SEARCH_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const STATUS_TTL: Duration = Duration::from_secs(10 * 60);
pub const LISTING_TTL: Duration = Duration::from_secs(60 * 60);
pub const THUMBS_TTL: Duration = Duration::from_secs(10 * 60);

const USERNAME_CHARSET: &str = "abcdefghijklmnopqrstuvwxyz0123456789_-";

/// Everything the handlers share. Cloning is cheap, the store pool and the
/// cache are behind Arcs.
#[derive(Clone)]
pub struct App {
    pub store: MediaStore,
    pub cache: ResponseCache,
    pub subreddits: Arc<Vec<String>>,
    pub proxy: Option<String>,
    pub tn_size: u32,
    pub nsfw: bool,
    pub static_root: PathBuf,
}

/// One per handler thread; owns its fetcher so HTTP connection pools stay
/// private, like the ingest workers do.
pub struct Handler {
    app: App,
    fetcher: Fetcher,
}

impl Handler {
    pub fn new(app: App) -> eyre::Result<Self> {
        let fetcher =
            Fetcher::new(app.proxy.as_deref()).wrap_err("failed to build the fetcher")?;
        Ok(Self { app, fetcher })
    }

    /// Per-request boundary: nothing below this returns an Err to the
    /// transport; failures become `{"error": ...}` with status 200.
    pub fn handle(&self, request: &Request) -> Response {
        let cache_key = if request.query.is_empty() {
            request.path.clone()
        } else {
            format!("{}?{}", request.path, request.query)
        };

        if request.method == "GET" {
            if let Some((body, content_type)) = self.app.cache.get(&cache_key) {
                return Response {
                    status: 200,
                    content_type,
                    body,
                };
            }
        }

        let (response, ttl) = self.dispatch(request);
        if let Some(ttl) = ttl {
            if response.status == 200 {
                self.app.cache.put(
                    cache_key,
                    response.body.clone(),
                    response.content_type,
                    ttl,
                );
            }
        }
        response
    }

    fn dispatch(&self, request: &Request) -> (Response, Option<Duration>) {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/search") => self.search(&request.query),
            ("POST", "/upload") => (self.upload(request), None),
            ("GET", "/status") => self.status(),
            ("GET", "/subreddits") => self.subreddits(),
            ("GET", path) if path.starts_with("/video_thumbs/") => {
                self.video_thumbs(&path["/video_thumbs/".len()..])
            }
            ("GET", "/favicon.ico") => (self.static_file("favicon.ico", "image/vnd.microsoft.icon"), Some(LISTING_TTL)),
            ("GET", "/") => (self.index(), Some(LISTING_TTL)),
            _ => (error_response("unknown route"), None),
        }
    }

    fn search(&self, query: &str) -> (Response, Option<Duration>) {
        let params = query_params(query);
        let d = clamp_distance(param_i64(&params, "d").unwrap_or(0));

        let results = if let Some(url) = params.get("img") {
            self.search_image(url, d)
        } else if let Some(url) = params.get("vid") {
            let f = clamp_frame_matches(param_i64(&params, "f"));
            self.search_video(url, d, f)
        } else if let Some(url) = params.get("album") {
            return self.search_album(url);
        } else if let Some(name) = params.get("user") {
            self.search_user(name)
        } else if let Some(text) = params.get("text") {
            self.search_text(text)
        } else {
            SearchResults::error("", "no query")
        };

        let cacheable = results.error.is_none();
        (
            json_response(&results),
            cacheable.then_some(SEARCH_TTL),
        )
    }

    fn search_image(&self, url: &str, d: u32) -> SearchResults {
        match self.image_hash_for_url(url) {
            Ok(hash) => match self.image_hits(hash, d) {
                Ok(hits) => SearchResults::hits(url, hits),
                Err(e) => SearchResults::error(url, e),
            },
            Err(e) => SearchResults::error(url, e),
        }
    }

    fn image_hits(&self, hash: Hamming, d: u32) -> eyre::Result<Vec<SearchHit>> {
        let ids = self.app.store.similar_images(hash, d)?;
        Ok(self.app.store.results_for_image_ids(&ids, self.app.nsfw)?)
    }

    /// Fingerprint lookup-or-compute for a URL. A computed fingerprint is
    /// written back (image row + bare url-binding) so the next query for
    /// the same URL is a plain lookup.
    fn image_hash_for_url(&self, url: &str) -> eyre::Result<Hamming> {
        let clean = urls::clean_url(url);
        if let Some(hash) = self.app.store.image_hash_by_clean_url(&clean)? {
            return Ok(hash);
        }

        let bytes = self
            .fetcher
            .download(url)
            .wrap_err_with(|| format!("unable to download image at {url}"))?;
        let img = image::load_from_memory(&bytes).wrap_err("not a decodable image")?;
        let hash = imghash::hash(&img.to_rgb8());

        let sha1 = sha1_hex(&bytes);
        let (image_id, _) = self.app.store.upsert_image(&NewImage {
            sha1: &sha1,
            hash,
            width: img.width(),
            height: img.height(),
            bytes: bytes.len() as i64,
        })?;
        self.app
            .store
            .bind_image_url(url, image_id, &Binding::default())?;
        Ok(hash)
    }

    fn search_video(&self, url: &str, d: u32, f: u32) -> SearchResults {
        match self.video_frames_for_url(url) {
            Ok(frames) => {
                match self
                    .app
                    .store
                    .similar_videos(&frames, d, f)
                    .map_err(eyre::Report::from)
                    .and_then(|ids| {
                        Ok(self.app.store.results_for_video_ids(&ids, self.app.nsfw)?)
                    }) {
                    Ok(hits) => SearchResults::hits(url, hits),
                    Err(e) => SearchResults::error(url, e),
                }
            }
            Err(e) => SearchResults::error(url, e),
        }
    }

    fn video_frames_for_url(&self, url: &str) -> eyre::Result<Vec<Hamming>> {
        let clean = urls::clean_url(url);
        if let Some(video_id) = self.app.store.video_id_by_clean_url(&clean)? {
            return Ok(self.app.store.video_frames(video_id)?);
        }

        let bytes = self
            .fetcher
            .download(url)
            .wrap_err_with(|| format!("unable to download video at {url}"))?;
        let sha1 = sha1_hex(&bytes);
        if let Some(video_id) = self.app.store.video_id_by_sha1(&sha1)? {
            return Ok(self.app.store.video_frames(video_id)?);
        }

        let extraction = frames::extract(&bytes, &urls::video_extension(url), self.app.tn_size)
            .wrap_err("frame extraction failed")?;
        if extraction.frames.is_empty() {
            eyre::bail!("no frames in the video at {url}");
        }
        let hashes: Vec<Hamming> = extraction.frames.iter().map(|f| f.hash).collect();

        let (video_id, created) = self.app.store.upsert_video(&NewVideo {
            sha1: &sha1,
            bytes: bytes.len() as i64,
            info: &extraction.info,
        })?;
        self.app
            .store
            .bind_video_url(url, video_id, &Binding::default())?;
        if created {
            self.app.store.insert_frames(video_id, &hashes)?;
        }
        Ok(hashes)
    }

    fn search_album(&self, url: &str) -> (Response, Option<Duration>) {
        let clean = urls::clean_url(url);
        match self.app.store.album_images_by_url(&clean) {
            Ok(images) => {
                let images: Vec<serde_json::Value> = images
                    .iter()
                    .map(|image| {
                        serde_json::json!({
                            "thumb": thumbs::web_path(image.image_id, thumbs::Kind::Image),
                            "url": image.url,
                            "width": image.width,
                            "height": image.height,
                        })
                    })
                    .collect();
                let body = serde_json::json!({ "url": url, "images": images });
                (
                    Response::json(serde_json::to_vec(&body).expect("serializable")),
                    Some(SEARCH_TTL),
                )
            }
            Err(e) => (error_response(&e.to_string()), None),
        }
    }

    fn search_user(&self, name: &str) -> SearchResults {
        let name = extract_username(name);
        if !is_username_valid(&name) {
            return SearchResults::error(format!("user:{name}"), "invalid username");
        }
        match self.app.store.results_for_author(&name, self.app.nsfw) {
            Ok(hits) => SearchResults::hits(format!("user:{name}"), hits),
            Err(e) => SearchResults::error(format!("user:{name}"), e),
        }
    }

    fn search_text(&self, text: &str) -> SearchResults {
        match self.app.store.results_for_text(text, self.app.nsfw) {
            Ok(hits) => SearchResults::hits(format!("text:{text}"), hits),
            Err(e) => SearchResults::error(format!("text:{text}"), e),
        }
    }

    fn upload(&self, request: &Request) -> Response {
        let params = query_params(&String::from_utf8_lossy(&request.body));
        let results = self.upload_results(&params);
        json_response(&results)
    }

    fn upload_results(&self, params: &HashMap<String, String>) -> SearchResults {
        if params.get("fname").map(String::as_str) != Some("image") {
            return SearchResults::error("", "missing image field");
        }
        let Some(data) = params.get("data") else {
            return SearchResults::error("", "missing data field");
        };
        // data-url: everything after the first comma is base64
        let Some((_, encoded)) = data.split_once(',') else {
            return SearchResults::error("", "not a data url");
        };

        let bytes = match base64::Engine::decode(
            &base64::prelude::BASE64_STANDARD,
            encoded.trim(),
        ) {
            Ok(bytes) => bytes,
            Err(e) => return SearchResults::error("", format!("undecodable upload: {e}")),
        };
        let img = match image::load_from_memory(&bytes) {
            Ok(img) => img,
            Err(e) => return SearchResults::error("", format!("not an image: {e}")),
        };

        let hash = imghash::hash(&img.to_rgb8());
        let d = clamp_distance(param_i64(params, "d").unwrap_or(0));
        let url = format!("hash:{hash}");
        match self.image_hits(hash, d) {
            Ok(hits) => SearchResults::hits(url, hits),
            Err(e) => SearchResults::error(url, e),
        }
    }

    fn status(&self) -> (Response, Option<Duration>) {
        match self.app.store.status(self.app.subreddits.len()) {
            Ok(status) => {
                let body = serde_json::json!({ "status": status });
                (
                    Response::json(serde_json::to_vec(&body).expect("serializable")),
                    Some(STATUS_TTL),
                )
            }
            Err(e) => (error_response(&e.to_string()), None),
        }
    }

    fn subreddits(&self) -> (Response, Option<Duration>) {
        let body = serde_json::json!({ "subreddits": self.app.subreddits.as_slice() });
        (
            Response::json(serde_json::to_vec(&body).expect("serializable")),
            Some(LISTING_TTL),
        )
    }

    fn video_thumbs(&self, raw_id: &str) -> (Response, Option<Duration>) {
        let Ok(video_id) = raw_id.parse::<i64>() else {
            return (error_response("bad video id"), None);
        };
        match self.app.store.frame_ids(video_id) {
            Ok(ids) => {
                let body = serde_json::json!({ "thumbs": ids });
                (
                    Response::json(serde_json::to_vec(&body).expect("serializable")),
                    Some(THUMBS_TTL),
                )
            }
            Err(e) => (error_response(&e.to_string()), None),
        }
    }

    fn static_file(&self, name: &str, content_type: &'static str) -> Response {
        match std::fs::read(self.app.static_root.join(name)) {
            Ok(bytes) => Response::bytes(content_type, bytes),
            Err(_) => Response::not_found(),
        }
    }

    fn index(&self) -> Response {
        match std::fs::read(self.app.static_root.join("index.html")) {
            Ok(bytes) => Response::bytes("text/html", bytes),
            Err(_) => Response::bytes(
                "text/html",
                b"<!doctype html><title>revmedia</title><p>reverse media search</p>".to_vec(),
            ),
        }
    }
}

fn query_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn param_i64(params: &HashMap<String, String>, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.parse().ok())
}

fn json_response<T: serde::Serialize>(value: &T) -> Response {
    Response::json(serde_json::to_vec(value).expect("serializable"))
}

fn error_response(message: &str) -> Response {
    json_response(&serde_json::json!({ "error": message }))
}

/// Accepts a bare name or a full `reddit.com/u/...` / `/user/...` URL.
fn extract_username(raw: &str) -> String {
    let raw = raw.trim().to_lowercase();
    let after = if let Some(i) = raw.find("/user/") {
        &raw[i + "/user/".len()..]
    } else if let Some(i) = raw.find("/u/") {
        &raw[i + "/u/".len()..]
    } else {
        &raw
    };
    after.trim_matches('/').to_string()
}

fn is_username_valid(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| USERNAME_CHARSET.contains(c))
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_app() -> (tempfile::TempDir, App) {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(&dir.path().join("test.db"), 2).unwrap();
        let app = App {
            store,
            cache: ResponseCache::new(),
            subreddits: Arc::new(vec!["pics".into(), "aww".into()]),
            proxy: None,
            tn_size: 300,
            nsfw: false,
            static_root: dir.path().join("static"),
        };
        (dir, app)
    }

    fn get(handler: &Handler, path: &str, query: &str) -> serde_json::Value {
        let request = Request {
            method: "GET".into(),
            path: path.into(),
            query: query.into(),
            content_type: String::new(),
            body: Vec::new(),
        };
        let response = handler.handle(&request);
        assert_eq!(200, response.status);
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn username_extraction() {
        assert_eq!("someone", extract_username("someone"));
        assert_eq!("someone", extract_username("https://reddit.com/u/Someone"));
        assert_eq!("some_one", extract_username("https://reddit.com/user/some_one/"));
        assert!(is_username_valid("a-b_c9"));
        assert!(!is_username_valid("bad name"));
        assert!(!is_username_valid(""));
    }

    #[test]
    fn unknown_route_is_a_json_error() {
        let (_dir, app) = test_app();
        let handler = Handler::new(app).unwrap();
        let json = get(&handler, "/nope", "");
        assert_eq!("unknown route", json["error"]);
    }

    #[test]
    fn invalid_username_is_an_error_with_status_200() {
        let (_dir, app) = test_app();
        let handler = Handler::new(app).unwrap();
        let json = get(&handler, "/search", "user=no%20spaces%21");
        assert!(json["error"].as_str().unwrap().contains("invalid username"));
        assert_eq!(0, json["result_count"]);
    }

    #[test]
    fn empty_user_search_has_no_hits() {
        let (_dir, app) = test_app();
        let handler = Handler::new(app).unwrap();
        let json = get(&handler, "/search", "user=nobody");
        assert!(json["error"].is_null());
        assert_eq!(0, json["result_count"]);
        assert_eq!("user:nobody", json["url"]);
    }

    #[test]
    fn status_and_subreddits() {
        let (_dir, app) = test_app();
        let handler = Handler::new(app).unwrap();

        let status = get(&handler, "/status", "");
        assert_eq!(0, status["status"]["posts"]);
        assert_eq!(2, status["status"]["subreddits"]);

        let subs = get(&handler, "/subreddits", "");
        assert_eq!("pics", subs["subreddits"][0]);
    }

    #[test]
    fn video_thumbs_of_unknown_video_is_empty() {
        let (_dir, app) = test_app();
        let handler = Handler::new(app).unwrap();
        let json = get(&handler, "/video_thumbs/999", "");
        assert_eq!(0, json["thumbs"].as_array().unwrap().len());

        let bad = get(&handler, "/video_thumbs/abc", "");
        assert!(bad["error"].is_string());
    }

    #[test]
    fn successful_responses_are_cached() {
        let (_dir, app) = test_app();
        let cache = app.cache.clone();
        let handler = Handler::new(app).unwrap();

        get(&handler, "/subreddits", "");
        assert!(cache.get("/subreddits").is_some());

        // errors never land in the cache
        get(&handler, "/search", "user=bad%20name");
        assert!(cache.get("/search?user=bad%20name").is_none());
    }

    #[test]
    fn upload_requires_the_image_form_shape() {
        let (_dir, app) = test_app();
        let handler = Handler::new(app).unwrap();

        let request = Request {
            method: "POST".into(),
            path: "/upload".into(),
            query: String::new(),
            content_type: "application/x-www-form-urlencoded".into(),
            body: b"fname=other&data=x,y".to_vec(),
        };
        let response = handler.handle(&request);
        let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("image"));
    }
}
