use std::collections::HashSet;

use rusqlite::types::Value;
use serde::Serialize;

use crate::store::{MediaStore, Result};
use crate::thumbs;

/// Hits returned per query, after merging and deduplication.
pub const RESULT_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum MediaItem {
    #[serde(rename = "image")]
    Image(ImageItem),
    #[serde(rename = "video")]
    Video(VideoItem),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageItem {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub size: i64,
    pub sha1: String,
    pub thumb: String,
    pub album_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VideoItem {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub size: i64,
    pub sha1: String,
    pub video_id: i64,
    pub bitrate: i64,
    pub codec: String,
    pub format: String,
    pub duration: i64,
    pub frames: i64,
}

impl MediaItem {
    fn url(&self) -> &str {
        match self {
            MediaItem::Image(item) => &item.url,
            MediaItem::Video(item) => &item.url,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PostSearchResult {
    pub hexid: String,
    pub title: String,
    pub text: String,
    pub author: String,
    pub permalink: String,
    pub subreddit: String,
    pub comments: i64,
    pub ups: i64,
    pub downs: i64,
    pub created: i64,
    pub item: MediaItem,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommentSearchResult {
    pub hexid: String,
    /// Hexid of the post this comment replies to.
    pub post_id: String,
    pub body: String,
    pub author: String,
    pub permalink: String,
    pub subreddit: String,
    pub ups: i64,
    pub downs: i64,
    pub created: i64,
    pub item: MediaItem,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SearchHit {
    #[serde(rename = "post")]
    Post(PostSearchResult),
    #[serde(rename = "comment")]
    Comment(CommentSearchResult),
}

impl SearchHit {
    fn ups(&self) -> i64 {
        match self {
            SearchHit::Post(p) => p.ups,
            SearchHit::Comment(c) => c.ups,
        }
    }

    fn dedup_key(&self) -> (String, String) {
        match self {
            SearchHit::Post(p) => (p.hexid.clone(), p.item.url().to_string()),
            SearchHit::Comment(c) => (c.hexid.clone(), c.item.url().to_string()),
        }
    }
}

/// The envelope every search endpoint answers with. Either `hits` is
/// populated and `error` is null, or the other way around.
#[derive(Debug, Serialize)]
pub struct SearchResults {
    pub url: String,
    pub result_count: usize,
    pub error: Option<String>,
    pub hits: Vec<SearchHit>,
}

impl SearchResults {
    pub fn hits(url: impl Into<String>, hits: Vec<SearchHit>) -> Self {
        Self {
            url: url.into(),
            result_count: hits.len(),
            error: None,
            hits,
        }
    }

    pub fn error(url: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            url: url.into(),
            result_count: 0,
            error: Some(error.to_string()),
            hits: Vec::new(),
        }
    }
}

// Columns shared by both joins, appended after the media-specific block:
// post (10), comment (6), then the comment's parent post (3).
const ORIGIN_COLUMNS: &str = "
  p.hexid, p.title, p.text, p.author, p.permalink, p.subreddit,
  p.comments, p.ups, p.downs, p.created,
  c.hexid, c.author, c.body, c.ups, c.downs, c.created,
  cp.hexid, cp.permalink, cp.subreddit";

fn origin_from_row(
    row: &rusqlite::Row,
    base: usize,
    item: MediaItem,
) -> rusqlite::Result<Option<SearchHit>> {
    let comment_hexid: Option<String> = row.get(base + 10)?;
    if let Some(hexid) = comment_hexid {
        return Ok(Some(SearchHit::Comment(CommentSearchResult {
            hexid,
            post_id: row.get::<_, Option<String>>(base + 16)?.unwrap_or_default(),
            body: row.get::<_, Option<String>>(base + 12)?.unwrap_or_default(),
            author: row.get::<_, Option<String>>(base + 11)?.unwrap_or_default(),
            permalink: row.get::<_, Option<String>>(base + 17)?.unwrap_or_default(),
            subreddit: row.get::<_, Option<String>>(base + 18)?.unwrap_or_default(),
            ups: row.get::<_, Option<i64>>(base + 13)?.unwrap_or(0),
            downs: row.get::<_, Option<i64>>(base + 14)?.unwrap_or(0),
            created: row.get::<_, Option<i64>>(base + 15)?.unwrap_or(0),
            item,
        })));
    }

    let post_hexid: Option<String> = row.get(base)?;
    let Some(hexid) = post_hexid else {
        return Ok(None);
    };
    Ok(Some(SearchHit::Post(PostSearchResult {
        hexid,
        title: row.get::<_, Option<String>>(base + 1)?.unwrap_or_default(),
        text: row.get::<_, Option<String>>(base + 2)?.unwrap_or_default(),
        author: row.get::<_, Option<String>>(base + 3)?.unwrap_or_default(),
        permalink: row.get::<_, Option<String>>(base + 4)?.unwrap_or_default(),
        subreddit: row.get::<_, Option<String>>(base + 5)?.unwrap_or_default(),
        comments: row.get::<_, Option<i64>>(base + 6)?.unwrap_or(0),
        ups: row.get::<_, Option<i64>>(base + 7)?.unwrap_or(0),
        downs: row.get::<_, Option<i64>>(base + 8)?.unwrap_or(0),
        created: row.get::<_, Option<i64>>(base + 9)?.unwrap_or(0),
        item,
    })))
}

fn merge_hits(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut hits = hits;
    hits.sort_by_key(|hit| std::cmp::Reverse(hit.ups()));

    let mut seen = HashSet::new();
    hits.retain(|hit| seen.insert(hit.dedup_key()));
    hits.truncate(RESULT_LIMIT);
    hits
}

/// Filter appended to every query unless NSFW content is configured in:
/// drops hits whose post (directly or through the comment) is over_18.
fn nsfw_filter(include_nsfw: bool) -> &'static str {
    if include_nsfw {
        ""
    } else {
        " AND COALESCE(p.over_18, cp.over_18, 0) = 0"
    }
}

impl MediaStore {
    /// The originating posts/comments of the given images, one hit per
    /// url-binding, best-voted first.
    pub fn results_for_image_ids(
        &self,
        ids: &[i64],
        include_nsfw: bool,
    ) -> Result<Vec<SearchHit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(ids.len());
        let where_sql = format!(
            "iu.imageid IN ({placeholders})
             AND (iu.postid IS NOT NULL OR iu.commentid IS NOT NULL){}",
            nsfw_filter(include_nsfw)
        );
        let values: Vec<Value> = ids.iter().map(|&id| Value::Integer(id)).collect();
        let hits = self.image_hits(&where_sql, &values)?;
        Ok(merge_hits(hits))
    }

    pub fn results_for_video_ids(
        &self,
        ids: &[i64],
        include_nsfw: bool,
    ) -> Result<Vec<SearchHit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(ids.len());
        let where_sql = format!(
            "vu.videoid IN ({placeholders})
             AND (vu.postid IS NOT NULL OR vu.commentid IS NOT NULL){}",
            nsfw_filter(include_nsfw)
        );
        let values: Vec<Value> = ids.iter().map(|&id| Value::Integer(id)).collect();
        let hits = self.video_hits(&where_sql, &values)?;
        Ok(merge_hits(hits))
    }

    /// Media posted or commented by the given author.
    pub fn results_for_author(
        &self,
        author: &str,
        include_nsfw: bool,
    ) -> Result<Vec<SearchHit>> {
        let values = vec![Value::Text(author.to_string())];
        let image_where = "
            (iu.postid IN (SELECT id FROM posts WHERE author = ?1 COLLATE NOCASE
                           ORDER BY ups DESC LIMIT 50)
             OR iu.commentid IN (SELECT id FROM comments WHERE author = ?1 COLLATE NOCASE
                                 ORDER BY ups DESC LIMIT 50))";
        let video_where = "
            (vu.postid IN (SELECT id FROM posts WHERE author = ?1 COLLATE NOCASE
                           ORDER BY ups DESC LIMIT 50)
             OR vu.commentid IN (SELECT id FROM comments WHERE author = ?1 COLLATE NOCASE
                                 ORDER BY ups DESC LIMIT 50))";

        let nsfw = nsfw_filter(include_nsfw);
        let mut hits = self.image_hits(&format!("{image_where}{nsfw}"), &values)?;
        hits.extend(self.video_hits(&format!("{video_where}{nsfw}"), &values)?);
        Ok(merge_hits(hits))
    }

    /// Media whose post title/selftext or comment body contains the needle.
    pub fn results_for_text(&self, needle: &str, include_nsfw: bool) -> Result<Vec<SearchHit>> {
        let pattern = format!("%{needle}%");
        let values = vec![Value::Text(pattern)];
        let image_where = "
            (iu.postid IN (SELECT id FROM posts WHERE title LIKE ?1 OR text LIKE ?1
                           ORDER BY ups DESC LIMIT 50)
             OR iu.commentid IN (SELECT id FROM comments WHERE body LIKE ?1
                                 ORDER BY ups DESC LIMIT 50))";
        let video_where = "
            (vu.postid IN (SELECT id FROM posts WHERE title LIKE ?1 OR text LIKE ?1
                           ORDER BY ups DESC LIMIT 50)
             OR vu.commentid IN (SELECT id FROM comments WHERE body LIKE ?1
                                 ORDER BY ups DESC LIMIT 50))";

        let nsfw = nsfw_filter(include_nsfw);
        let mut hits = self.image_hits(&format!("{image_where}{nsfw}"), &values)?;
        hits.extend(self.video_hits(&format!("{video_where}{nsfw}"), &values)?);
        Ok(merge_hits(hits))
    }

    fn image_hits(&self, where_sql: &str, values: &[Value]) -> Result<Vec<SearchHit>> {
        let sql = format!(
            "SELECT iu.imageid, iu.url, al.url, i.width, i.height, i.bytes, i.sha1,
                    {ORIGIN_COLUMNS}
             FROM imageurls iu
             JOIN images i        ON i.id = iu.imageid
             LEFT JOIN albums al  ON al.id = iu.albumid
             LEFT JOIN posts p    ON p.id = iu.postid
             LEFT JOIN comments c ON c.id = iu.commentid
             LEFT JOIN posts cp   ON cp.id = c.postid
             WHERE {where_sql}
             ORDER BY COALESCE(c.ups, p.ups) DESC
             LIMIT {RESULT_LIMIT}"
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
            let mut hits = Vec::new();
            while let Some(row) = rows.next()? {
                let image_id: i64 = row.get(0)?;
                let item = MediaItem::Image(ImageItem {
                    url: row.get(1)?,
                    album_url: row.get(2)?,
                    width: row.get::<_, Option<u32>>(3)?.unwrap_or(0),
                    height: row.get::<_, Option<u32>>(4)?.unwrap_or(0),
                    size: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    sha1: row.get(6)?,
                    thumb: thumbs::web_path(image_id, thumbs::Kind::Image),
                });
                if let Some(hit) = origin_from_row(row, 7, item)? {
                    hits.push(hit);
                }
            }
            Ok(hits)
        })
    }

    fn video_hits(&self, where_sql: &str, values: &[Value]) -> Result<Vec<SearchHit>> {
        let sql = format!(
            "SELECT vu.videoid, vu.url, v.width, v.height, v.bytes, v.sha1,
                    v.bitrate, v.codec, v.format, v.duration, v.frames,
                    {ORIGIN_COLUMNS}
             FROM videourls vu
             JOIN videos v        ON v.id = vu.videoid
             LEFT JOIN posts p    ON p.id = vu.postid
             LEFT JOIN comments c ON c.id = vu.commentid
             LEFT JOIN posts cp   ON cp.id = c.postid
             WHERE {where_sql}
             ORDER BY COALESCE(c.ups, p.ups) DESC
             LIMIT {RESULT_LIMIT}"
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
            let mut hits = Vec::new();
            while let Some(row) = rows.next()? {
                let video_id: i64 = row.get(0)?;
                let item = MediaItem::Video(VideoItem {
                    url: row.get(1)?,
                    width: row.get::<_, Option<u32>>(2)?.unwrap_or(0),
                    height: row.get::<_, Option<u32>>(3)?.unwrap_or(0),
                    size: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    sha1: row.get(5)?,
                    video_id,
                    bitrate: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                    codec: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    format: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                    duration: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
                    frames: row.get::<_, Option<i64>>(10)?.unwrap_or(0),
                });
                if let Some(hit) = origin_from_row(row, 11, item)? {
                    hits.push(hit);
                }
            }
            Ok(hits)
        })
    }
}

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod test {
    use crate::frames::VideoInfo;
    use crate::imghash::hamming::Hamming;
    use crate::store::test_support::{sample_post, temp_store};
    use crate::store::{Binding, MediaStore, NewComment, NewImage, NewVideo};

    use super::*;

    fn seed_image(store: &MediaStore, sha_tail: u8) -> i64 {
        let sha1 = format!("{:040x}", sha_tail as u128);
        let image = NewImage {
            sha1: &sha1,
            hash: Hamming([sha_tail; Hamming::BYTES]),
            width: 400,
            height: 300,
            bytes: 999,
        };
        store.upsert_image(&image).unwrap().0
    }

    #[test]
    fn post_hits_assemble() {
        let (_dir, store) = temp_store();
        let post_id = store
            .insert_post(&sample_post("abc123", "someone"))
            .unwrap()
            .unwrap();
        let image_id = seed_image(&store, 1);
        store
            .bind_image_url(
                "https://i.example.com/x.jpg?foo=1",
                image_id,
                &Binding {
                    post_id: Some(post_id),
                    ..Binding::default()
                },
            )
            .unwrap();

        let hits = store.results_for_image_ids(&[image_id], true).unwrap();
        assert_eq!(1, hits.len());
        match &hits[0] {
            SearchHit::Post(post) => {
                assert_eq!("abc123", post.hexid);
                assert_eq!("someone", post.author);
                match &post.item {
                    MediaItem::Image(item) => {
                        assert_eq!(400, item.width);
                        assert_eq!(
                            thumbs::web_path(image_id, thumbs::Kind::Image),
                            item.thumb
                        );
                        assert_eq!(None, item.album_url);
                    }
                    MediaItem::Video(_) => panic!("expected an image item"),
                }
            }
            SearchHit::Comment(_) => panic!("expected a post hit"),
        }
    }

    #[test]
    fn comment_hits_carry_parent_post() {
        let (_dir, store) = temp_store();
        let post_id = store
            .insert_post(&sample_post("abc123", "op"))
            .unwrap()
            .unwrap();
        let comment_id = store
            .insert_comment(&NewComment {
                post_id,
                hexid: "def456",
                author: "lurker",
                body: "[look](http://a/b.jpg)",
                ups: 5,
                downs: 1,
                created: 1_500_000_200,
            })
            .unwrap();
        let image_id = seed_image(&store, 2);
        store
            .bind_image_url(
                "http://a/b.jpg",
                image_id,
                &Binding {
                    comment_id: Some(comment_id),
                    ..Binding::default()
                },
            )
            .unwrap();

        let hits = store.results_for_image_ids(&[image_id], true).unwrap();
        assert_eq!(1, hits.len());
        match &hits[0] {
            SearchHit::Comment(comment) => {
                assert_eq!("def456", comment.hexid);
                assert_eq!("abc123", comment.post_id);
                assert_eq!("lurker", comment.author);
                assert_eq!("pics", comment.subreddit);
            }
            SearchHit::Post(_) => panic!("expected a comment hit"),
        }
    }

    #[test]
    fn video_hits_assemble() {
        let (_dir, store) = temp_store();
        let post_id = store
            .insert_post(&sample_post("vid111", "someone"))
            .unwrap()
            .unwrap();
        let info = VideoInfo {
            codec: "h264".into(),
            width: 1280,
            height: 720,
            bitrate: 1_000_000,
            duration: 5,
            total_frames: 150,
            format: "QuickTime / MOV".into(),
        };
        let (video_id, _) = store
            .upsert_video(&NewVideo {
                sha1: "00000000000000000000000000000000000000bb",
                bytes: 4321,
                info: &info,
            })
            .unwrap();
        store
            .bind_video_url(
                "http://a/clip.mp4",
                video_id,
                &Binding {
                    post_id: Some(post_id),
                    ..Binding::default()
                },
            )
            .unwrap();

        let hits = store.results_for_video_ids(&[video_id], true).unwrap();
        assert_eq!(1, hits.len());
        match &hits[0] {
            SearchHit::Post(post) => match &post.item {
                MediaItem::Video(item) => {
                    assert_eq!(video_id, item.video_id);
                    assert_eq!("h264", item.codec);
                    assert_eq!(150, item.frames);
                }
                MediaItem::Image(_) => panic!("expected a video item"),
            },
            SearchHit::Comment(_) => panic!("expected a post hit"),
        }
    }

    #[test]
    fn author_search_spans_images_and_videos() {
        let (_dir, store) = temp_store();
        let post_id = store
            .insert_post(&sample_post("abc123", "collector"))
            .unwrap()
            .unwrap();
        let binding = Binding {
            post_id: Some(post_id),
            ..Binding::default()
        };

        let image_id = seed_image(&store, 3);
        store
            .bind_image_url("http://a/i.jpg", image_id, &binding)
            .unwrap();

        let info = VideoInfo::default();
        let (video_id, _) = store
            .upsert_video(&NewVideo {
                sha1: "00000000000000000000000000000000000000cc",
                bytes: 1,
                info: &info,
            })
            .unwrap();
        store
            .bind_video_url("http://a/v.mp4", video_id, &binding)
            .unwrap();

        let hits = store.results_for_author("collector", true).unwrap();
        assert_eq!(2, hits.len());
        assert!(store.results_for_author("nobody", true).unwrap().is_empty());
    }

    #[test]
    fn text_search_matches_title() {
        let (_dir, store) = temp_store();
        let post_id = store
            .insert_post(&sample_post("abc123", "someone"))
            .unwrap()
            .unwrap();
        let image_id = seed_image(&store, 4);
        store
            .bind_image_url(
                "http://a/i.jpg",
                image_id,
                &Binding {
                    post_id: Some(post_id),
                    ..Binding::default()
                },
            )
            .unwrap();

        assert_eq!(1, store.results_for_text("a title", true).unwrap().len());
        assert!(store.results_for_text("nothing here", true).unwrap().is_empty());
    }

    #[test]
    fn nsfw_posts_are_filtered_unless_asked_for() {
        let (_dir, store) = temp_store();
        let mut post = sample_post("nsfw01", "someone");
        post.over_18 = true;
        let post_id = store.insert_post(&post).unwrap().unwrap();
        let image_id = seed_image(&store, 5);
        store
            .bind_image_url(
                "http://a/n.jpg",
                image_id,
                &Binding {
                    post_id: Some(post_id),
                    ..Binding::default()
                },
            )
            .unwrap();

        assert!(store.results_for_image_ids(&[image_id], false).unwrap().is_empty());
        assert_eq!(1, store.results_for_image_ids(&[image_id], true).unwrap().len());
    }

    #[test]
    fn hits_dedup_and_sort_by_ups() {
        let a = SearchHit::Post(PostSearchResult {
            hexid: "one".into(),
            title: String::new(),
            text: String::new(),
            author: String::new(),
            permalink: String::new(),
            subreddit: String::new(),
            comments: 0,
            ups: 3,
            downs: 0,
            created: 0,
            item: MediaItem::Image(ImageItem {
                url: "http://a".into(),
                width: 1,
                height: 1,
                size: 1,
                sha1: String::new(),
                thumb: String::new(),
                album_url: None,
            }),
        });
        let mut b = a.clone();
        if let SearchHit::Post(post) = &mut b {
            post.hexid = "two".into();
            post.ups = 9;
        }
        let duplicate = a.clone();

        let merged = merge_hits(vec![a, b, duplicate]);
        assert_eq!(2, merged.len());
        assert_eq!(9, merged[0].ups());
    }

    #[test]
    fn search_results_serialize_with_tags() {
        let hits = vec![SearchHit::Post(PostSearchResult {
            hexid: "abc".into(),
            title: "t".into(),
            text: String::new(),
            author: "a".into(),
            permalink: "/r/x".into(),
            subreddit: "x".into(),
            comments: 0,
            ups: 1,
            downs: 0,
            created: 2,
            item: MediaItem::Image(ImageItem {
                url: "http://a".into(),
                width: 1,
                height: 2,
                size: 3,
                sha1: "ff".into(),
                thumb: "static/thumbs/im/1/0/1.jpg".into(),
                album_url: None,
            }),
        })];
        let results = SearchResults::hits("http://a", hits);

        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(1, json["result_count"]);
        assert!(json["error"].is_null());
        assert_eq!("post", json["hits"][0]["type"]);
        assert_eq!("image", json["hits"][0]["item"]["type"]);
    }
}
