use color_eyre::eyre::{self, Context};
use image::GenericImageView;

use revmedia_common::envelope::{self, CommentEnvelope, Envelope, PostEnvelope};
use revmedia_common::expand::{resolve_reddit_video, Expander};
use revmedia_common::fetch::{FetchError, Fetcher};
use revmedia_common::frames;
use revmedia_common::imghash;
use revmedia_common::store::{
    sha1_hex, Binding, MediaStore, NewComment, NewImage, NewPost, NewVideo,
};
use revmedia_common::thumbs::{self, Kind, ThumbStore};
use revmedia_common::urls::{self, Classification, UrlRules};

/// One worker's view of the whole ingest path: envelope in, rows and
/// thumbnails out. The store is shared between workers, the fetcher is not.
pub struct Pipeline {
    store: MediaStore,
    thumbs: ThumbStore,
    rules: UrlRules,
    expander: Expander,
    fetcher: Fetcher,
    tn_size: u32,
}

impl Pipeline {
    pub fn new(
        store: MediaStore,
        thumbs: ThumbStore,
        rules: UrlRules,
        proxy: Option<String>,
        tn_size: u32,
    ) -> eyre::Result<Self> {
        let fetcher =
            Fetcher::new(proxy.as_deref()).wrap_err("failed to build the fetcher")?;
        Ok(Self {
            store,
            thumbs,
            rules,
            expander: Expander::new(proxy),
            fetcher,
            tn_size,
        })
    }

    /// Handle one bus message. Errors cross this boundary only as a return
    /// value; the worker logs them and moves on to the next envelope.
    pub fn process(&self, payload: &[u8]) -> eyre::Result<()> {
        match envelope::decode(payload).wrap_err("malformed envelope")? {
            Envelope::Post(post) => self.process_post(&post),
            Envelope::Comment(comment) => self.process_comment(&comment, 0),
        }
    }

    fn process_post(&self, post: &PostEnvelope) -> eyre::Result<()> {
        let new = NewPost {
            hexid: &post.id,
            title: &post.title,
            url: post.url.as_deref().unwrap_or(""),
            text: &post.selftext,
            author: &post.author,
            permalink: &post.permalink,
            subreddit: &post.subreddit,
            comments: post.num_comments,
            ups: post.ups,
            downs: post.downs,
            score: post.score,
            created: post.created(),
            is_self: post.is_self,
            over_18: post.over_18,
        };
        let Some(post_id) = self.store.insert_post(&new)? else {
            log::debug!("Ignoring post {} (already indexed)", post.id);
            return Ok(());
        };

        let binding = Binding {
            post_id: Some(post_id),
            ..Binding::default()
        };
        if !post.selftext.is_empty() {
            for url in self.rules.links_from_body(&post.selftext) {
                self.process_url(&url, binding);
            }
        } else if let Some(url) = &post.url {
            self.process_url(url, binding);
        }
        Ok(())
    }

    /// A comment only earns a row when its body links to something that
    /// classifies, and only when its parent post is already known.
    fn process_comment(&self, comment: &CommentEnvelope, depth: usize) -> eyre::Result<()> {
        if depth > envelope::MAX_COMMENT_DEPTH {
            log::warn!(
                "Dropping comment {} nested deeper than {}",
                comment.id,
                envelope::MAX_COMMENT_DEPTH
            );
            return Ok(());
        }

        let links = self.rules.links_from_body(&comment.body);
        if !links.is_empty() {
            if let Some(post_id) = self.store.post_id_by_hexid(comment.post_hexid())? {
                let comment_id = self.store.insert_comment(&NewComment {
                    post_id,
                    hexid: &comment.id,
                    author: &comment.author,
                    body: &comment.body,
                    ups: comment.ups,
                    downs: comment.downs,
                    created: comment.created(),
                })?;

                let binding = Binding {
                    comment_id: Some(comment_id),
                    ..Binding::default()
                };
                for url in links {
                    self.process_url(&url, binding);
                }
            }
        }

        for child in &comment.children {
            self.process_comment(child, depth + 1)?;
        }
        Ok(())
    }

    /// Best-effort per link: a failure here never stops the next URL of the
    /// same envelope.
    fn process_url(&self, url: &str, binding: Binding) {
        let result = match self.rules.classify(url) {
            Classification::Skip => {
                log::debug!("Skipping url {url}");
                Ok(())
            }
            Classification::Image => self.process_image(url, binding),
            Classification::Video => self.process_video(url, binding),
            Classification::RedditVideo => self.process_reddit_video(url, binding),
            Classification::Indirect => self.process_indirect(url, binding),
        };
        if let Err(e) = result {
            log::error!("Failed to process {url}: {e:?}");
        }
    }

    fn process_reddit_video(&self, url: &str, binding: Binding) -> eyre::Result<()> {
        let direct = resolve_reddit_video(url).wrap_err("could not resolve the video url")?;
        match self.rules.classify(&direct) {
            Classification::Image => self.process_image(&direct, binding),
            _ => self.process_video(&direct, binding),
        }
    }

    fn process_indirect(&self, url: &str, binding: Binding) -> eyre::Result<()> {
        let children = self.expander.expand(url);

        // Anything that expands to more than one child is an album
        let album_id = if children.len() > 1 {
            Some(self.store.get_or_create_album(&urls::clean_url(url))?)
        } else {
            None
        };

        for child in children {
            match self.rules.classify(&child) {
                Classification::Image => {
                    let binding = Binding { album_id, ..binding };
                    if let Err(e) = self.process_image(&child, binding) {
                        log::error!("Failed to process album image {child}: {e:?}");
                    }
                }
                Classification::Video => {
                    if let Err(e) = self.process_video(&child, binding) {
                        log::error!("Failed to process album video {child}: {e:?}");
                    }
                }
                _ => log::debug!("Skipping expanded url {child}"),
            }
        }
        Ok(())
    }

    fn download(&self, url: &str) -> eyre::Result<Option<Vec<u8>>> {
        match self.fetcher.download(url) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => {
                log::debug!("Gone: {url}");
                Ok(None)
            }
            Err(e @ FetchError::Status { .. }) => Err(e).wrap_err("download refused"),
            Err(e) => Err(e).wrap_err("download failed"),
        }
    }

    fn process_image(&self, url: &str, binding: Binding) -> eyre::Result<()> {
        let clean = urls::clean_url(url);
        if let Some(existing) = self.store.image_id_by_clean_url(&clean)? {
            self.store.bind_image_url(url, existing, &binding)?;
            return Ok(());
        }

        let Some(bytes) = self.download(url)? else {
            return Ok(());
        };

        let sha1 = sha1_hex(&bytes);
        if let Some(existing) = self.store.image_id_by_sha1(&sha1)? {
            self.store.bind_image_url(url, existing, &binding)?;
            return Ok(());
        }

        let img = image::load_from_memory(&bytes).wrap_err("undecodable image")?;
        let (width, height) = img.dimensions();
        let hash = imghash::hash(&img.to_rgb8());

        let (image_id, created) = self.store.upsert_image(&NewImage {
            sha1: &sha1,
            hash,
            width,
            height,
            bytes: bytes.len() as i64,
        })?;
        self.store.bind_image_url(url, image_id, &binding)?;

        if created {
            let thumb = frames::thumbnail(img, thumbs::IMAGE_THUMB_SIZE);
            if let Err(e) = self.thumbs.save(image_id, Kind::Image, &thumb) {
                log::warn!("Could not write the thumbnail for image {image_id}: {e}");
            }
            log::info!(
                "(+) Image ID({image_id}) [{width}x{height} {}B] #{hash}",
                bytes.len()
            );
        }
        Ok(())
    }

    fn process_video(&self, url: &str, binding: Binding) -> eyre::Result<()> {
        let clean = urls::clean_url(url);
        if let Some(existing) = self.store.video_id_by_clean_url(&clean)? {
            self.store.bind_video_url(url, existing, &binding)?;
            return Ok(());
        }

        let Some(bytes) = self.download(url)? else {
            return Ok(());
        };

        let sha1 = sha1_hex(&bytes);
        if let Some(existing) = self.store.video_id_by_sha1(&sha1)? {
            self.store.bind_video_url(url, existing, &binding)?;
            return Ok(());
        }

        let ext = urls::video_extension(url);
        let extraction = frames::extract(&bytes, &ext, self.tn_size)
            .wrap_err("frame extraction failed")?;
        if extraction.frames.is_empty() {
            log::error!("No frames {url}");
            return Ok(());
        }

        let (video_id, created) = self.store.upsert_video(&NewVideo {
            sha1: &sha1,
            bytes: bytes.len() as i64,
            info: &extraction.info,
        })?;
        self.store.bind_video_url(url, video_id, &binding)?;

        if created {
            let hashes: Vec<_> = extraction.frames.iter().map(|f| f.hash).collect();
            let frame_ids = self.store.insert_frames(video_id, &hashes)?;
            for (frame, frame_id) in extraction.frames.iter().zip(frame_ids) {
                if let Err(e) = self.thumbs.save(frame_id, Kind::Video, &frame.thumb) {
                    log::warn!("Could not write the thumbnail for frame {frame_id}: {e}");
                }
            }
            log::info!(
                "(+) Video ID({video_id}) [{}x{} {}B] {} frames",
                extraction.info.width,
                extraction.info.height,
                bytes.len(),
                extraction.frames.len()
            );
        }
        Ok(())
    }
}
