use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use sha1::{Digest, Sha1};

use crate::frames::VideoInfo;
use crate::imghash::hamming::Hamming;

use self::pool::Pool;

pub mod pool;
pub mod similar;

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error("a row that must exist is missing")]
    MissingRow,
    #[error("stored hash blob has length {0}, expected {}", Hamming::BYTES)]
    BadHash(usize),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SQL_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct NewPost<'a> {
    pub hexid: &'a str,
    pub title: &'a str,
    pub url: &'a str,
    pub text: &'a str,
    pub author: &'a str,
    pub permalink: &'a str,
    pub subreddit: &'a str,
    pub comments: i64,
    pub ups: i64,
    pub downs: i64,
    pub score: i64,
    pub created: i64,
    pub is_self: bool,
    pub over_18: bool,
}

#[derive(Debug)]
pub struct NewComment<'a> {
    pub post_id: i64,
    pub hexid: &'a str,
    pub author: &'a str,
    pub body: &'a str,
    pub ups: i64,
    pub downs: i64,
    pub created: i64,
}

#[derive(Debug)]
pub struct NewImage<'a> {
    pub sha1: &'a str,
    pub hash: Hamming,
    pub width: u32,
    pub height: u32,
    pub bytes: i64,
}

#[derive(Debug)]
pub struct NewVideo<'a> {
    pub sha1: &'a str,
    pub bytes: i64,
    pub info: &'a VideoInfo,
}

/// What a url-binding points back at. At most one of post/comment is set;
/// all three empty means a query-initiated, index-only insert.
#[derive(Debug, Default, Clone, Copy)]
pub struct Binding {
    pub album_id: Option<i64>,
    pub post_id: Option<i64>,
    pub comment_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Status {
    pub posts: i64,
    pub comments: i64,
    pub videos: i64,
    pub albums: i64,
    pub images: i64,
    pub subreddits: usize,
}

#[derive(Debug, Clone)]
pub struct AlbumImage {
    pub image_id: i64,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Deduplicating writer and lookup surface over the whole relational store.
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct MediaStore {
    pool: Pool,
}

impl MediaStore {
    pub fn open(path: &Path, connections: usize) -> Result<Self> {
        let pool = Pool::open(path, connections, |conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA busy_timeout=10000;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA foreign_keys=ON;",
            )?;
            similar::register_functions(conn)
        })?;

        let store = Self { pool };
        store.with_conn(|conn| conn.execute_batch(SCHEMA))?;
        Ok(store)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            let lease = self.pool.lease();
            match f(&lease) {
                Ok(v) => return Ok(v),
                Err(e) if attempt < SQL_ATTEMPTS && is_transient(&e) => {
                    log::warn!("Retrying after a transient database error: {e}");
                    if is_connection_error(&e) {
                        let _ = self.pool.replace(lease);
                    }
                    attempt += 1;
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Inserts a post, or returns `None` when its hexid is already indexed.
    /// Posts are immutable after first sight.
    pub fn insert_post(&self, post: &NewPost) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO posts(hexid, title, url, text, author, permalink, subreddit,
                                   comments, ups, downs, score, created, is_self, over_18)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(hexid) DO NOTHING
                 RETURNING id",
            )?;
            stmt.query_row(
                params![
                    post.hexid,
                    post.title,
                    post.url,
                    post.text,
                    post.author,
                    post.permalink,
                    post.subreddit,
                    post.comments,
                    post.ups,
                    post.downs,
                    post.score,
                    post.created,
                    post.is_self,
                    post.over_18,
                ],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn post_id_by_hexid(&self, hexid: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id FROM posts WHERE hexid = ?1")?;
            stmt.query_row([hexid], |row| row.get(0)).optional()
        })
    }

    /// Insert-or-lookup by hexid; redelivered comments resolve to the
    /// existing row.
    pub fn insert_comment(&self, comment: &NewComment) -> Result<i64> {
        let inserted = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO comments(postid, hexid, author, body, ups, downs, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(hexid) DO NOTHING
                 RETURNING id",
            )?;
            stmt.query_row(
                params![
                    comment.post_id,
                    comment.hexid,
                    comment.author,
                    comment.body,
                    comment.ups,
                    comment.downs,
                    comment.created,
                ],
                |row| row.get(0),
            )
            .optional()
        })?;
        match inserted {
            Some(id) => Ok(id),
            None => self
                .with_conn(|conn| {
                    let mut stmt =
                        conn.prepare_cached("SELECT id FROM comments WHERE hexid = ?1")?;
                    stmt.query_row([comment.hexid], |row| row.get(0)).optional()
                })?
                .ok_or(StoreError::MissingRow),
        }
    }

    /// Race-safe insert-or-lookup keyed on sha1. Returns the id and whether
    /// this call created the row. Two ingesters hashing the same bytes at
    /// once both end up with the same id.
    pub fn upsert_image(&self, image: &NewImage) -> Result<(i64, bool)> {
        let inserted = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO images(sha1, hash, width, height, bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(sha1) DO NOTHING
                 RETURNING id",
            )?;
            stmt.query_row(
                params![
                    image.sha1,
                    image.hash.as_bytes(),
                    image.width,
                    image.height,
                    image.bytes,
                ],
                |row| row.get(0),
            )
            .optional()
        })?;
        match inserted {
            Some(id) => Ok((id, true)),
            None => self
                .image_id_by_sha1(image.sha1)?
                .map(|id| (id, false))
                .ok_or(StoreError::MissingRow),
        }
    }

    pub fn upsert_video(&self, video: &NewVideo) -> Result<(i64, bool)> {
        let info = video.info;
        let inserted = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO videos(sha1, width, height, bitrate, codec, format,
                                    duration, frames, bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(sha1) DO NOTHING
                 RETURNING id",
            )?;
            stmt.query_row(
                params![
                    video.sha1,
                    info.width,
                    info.height,
                    info.bitrate,
                    info.codec,
                    info.format,
                    info.duration,
                    info.total_frames,
                    video.bytes,
                ],
                |row| row.get(0),
            )
            .optional()
        })?;
        match inserted {
            Some(id) => Ok((id, true)),
            None => self
                .video_id_by_sha1(video.sha1)?
                .map(|id| (id, false))
                .ok_or(StoreError::MissingRow),
        }
    }

    /// One multi-row insert; the returned frame ids are in input order so
    /// the caller can name thumbnails after them.
    pub fn insert_frames(&self, video_id: i64, hashes: &[Hamming]) -> Result<Vec<i64>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<String> = (0..hashes.len())
            .map(|i| format!("(?1, ?{})", i + 2))
            .collect();
        let sql = format!(
            "INSERT INTO videoframes(videoid, hash) VALUES {} RETURNING id",
            placeholders.join(", ")
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<rusqlite::types::Value> =
                vec![rusqlite::types::Value::Integer(video_id)];
            values.extend(
                hashes
                    .iter()
                    .map(|h| rusqlite::types::Value::Blob(h.as_bytes().to_vec())),
            );

            let mut rows = stmt.query(rusqlite::params_from_iter(values))?;
            let mut ids: Vec<i64> = Vec::with_capacity(hashes.len());
            while let Some(row) = rows.next()? {
                ids.push(row.get(0)?);
            }
            // RETURNING order is formally unspecified; rowids are assigned
            // in VALUES order, so sorting restores it
            ids.sort_unstable();
            Ok(ids)
        })
    }

    pub fn bind_image_url(&self, url: &str, image_id: i64, binding: &Binding) -> Result<()> {
        let clean = crate::urls::clean_url(url);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO imageurls(url, clean_url, imageid, albumid, postid, commentid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            stmt.execute(params![
                url,
                clean,
                image_id,
                binding.album_id,
                binding.post_id,
                binding.comment_id,
            ])?;
            Ok(())
        })
    }

    pub fn bind_video_url(&self, url: &str, video_id: i64, binding: &Binding) -> Result<()> {
        let clean = crate::urls::clean_url(url);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO videourls(url, clean_url, videoid, postid, commentid)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            stmt.execute(params![
                url,
                clean,
                video_id,
                binding.post_id,
                binding.comment_id,
            ])?;
            Ok(())
        })
    }

    /// `url` is expected in clean form already.
    pub fn get_or_create_album(&self, url: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.prepare_cached("INSERT OR IGNORE INTO albums(url) VALUES (?1)")?
                .execute([url])?;
            conn.prepare_cached("SELECT id FROM albums WHERE url = ?1")?
                .query_row([url], |row| row.get(0))
        })
    }

    pub fn image_id_by_clean_url(&self, clean_url: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT imageid FROM imageurls WHERE clean_url = ?1 LIMIT 1",
            )?;
            stmt.query_row([clean_url], |row| row.get(0)).optional()
        })
    }

    pub fn image_id_by_sha1(&self, sha1: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id FROM images WHERE sha1 = ?1")?;
            stmt.query_row([sha1], |row| row.get(0)).optional()
        })
    }

    pub fn image_hash_by_clean_url(&self, clean_url: &str) -> Result<Option<Hamming>> {
        let blob: Option<Vec<u8>> = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT i.hash FROM images i
                 JOIN imageurls iu ON iu.imageid = i.id
                 WHERE iu.clean_url = ?1 LIMIT 1",
            )?;
            stmt.query_row([clean_url], |row| row.get(0)).optional()
        })?;
        blob.map(|b| hash_from_blob(&b)).transpose()
    }

    pub fn video_id_by_clean_url(&self, clean_url: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT videoid FROM videourls WHERE clean_url = ?1 LIMIT 1",
            )?;
            stmt.query_row([clean_url], |row| row.get(0)).optional()
        })
    }

    pub fn video_id_by_sha1(&self, sha1: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id FROM videos WHERE sha1 = ?1")?;
            stmt.query_row([sha1], |row| row.get(0)).optional()
        })
    }

    /// Frame hashes of a video, in frame-id order.
    pub fn video_frames(&self, video_id: i64) -> Result<Vec<Hamming>> {
        let blobs: Vec<Vec<u8>> = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT hash FROM videoframes WHERE videoid = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([video_id], |row| row.get(0))?;
            rows.collect()
        })?;
        blobs.iter().map(|b| hash_from_blob(b)).collect()
    }

    pub fn frame_ids(&self, video_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT id FROM videoframes WHERE videoid = ?1 ORDER BY id")?;
            let rows = stmt.query_map([video_id], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn album_images_by_url(&self, clean_url: &str) -> Result<Vec<AlbumImage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT iu.imageid, iu.url, i.width, i.height
                 FROM imageurls iu
                 JOIN images i ON i.id = iu.imageid
                 WHERE iu.albumid = (SELECT id FROM albums WHERE url = ?1)
                 GROUP BY iu.imageid
                 ORDER BY iu.imageid",
            )?;
            let rows = stmt.query_map([clean_url], |row| {
                Ok(AlbumImage {
                    image_id: row.get(0)?,
                    url: row.get(1)?,
                    width: row.get(2)?,
                    height: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn status(&self, subreddits: usize) -> Result<Status> {
        self.with_conn(|conn| {
            let count = |table: &str| -> rusqlite::Result<i64> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
            };
            Ok(Status {
                posts: count("posts")?,
                comments: count("comments")?,
                videos: count("videos")?,
                albums: count("albums")?,
                images: count("images")?,
                subreddits,
            })
        })
    }
}

pub(crate) fn hash_from_blob(blob: &[u8]) -> Result<Hamming> {
    Hamming::try_from_slice(blob).ok_or(StoreError::BadHash(blob.len()))
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure)
    )
}

fn is_connection_error(e: &rusqlite::Error) -> bool {
    matches!(e.sqlite_error_code(), Some(ErrorCode::SystemIoFailure))
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS posts (
  id        INTEGER PRIMARY KEY,
  hexid     TEXT UNIQUE NOT NULL,
  title     TEXT,
  url       TEXT,
  text      TEXT,
  author    TEXT,
  permalink TEXT,
  subreddit TEXT,
  comments  INTEGER,
  ups       INTEGER,
  downs     INTEGER,
  score     INTEGER,
  created   INTEGER,
  is_self   INTEGER,
  over_18   INTEGER
);

CREATE TABLE IF NOT EXISTS comments (
  id      INTEGER PRIMARY KEY,
  postid  INTEGER NOT NULL,
  hexid   TEXT UNIQUE NOT NULL,
  author  TEXT,
  body    TEXT,
  ups     INTEGER,
  downs   INTEGER,
  created INTEGER,
  FOREIGN KEY(postid) REFERENCES posts(id)
);

CREATE TABLE IF NOT EXISTS images (
  id     INTEGER PRIMARY KEY,
  sha1   TEXT UNIQUE NOT NULL,
  hash   BLOB NOT NULL,
  width  INTEGER,
  height INTEGER,
  bytes  INTEGER
);

CREATE TABLE IF NOT EXISTS videos (
  id       INTEGER PRIMARY KEY,
  sha1     TEXT UNIQUE NOT NULL,
  width    INTEGER,
  height   INTEGER,
  bitrate  INTEGER,
  codec    TEXT,
  format   TEXT,
  duration INTEGER,
  frames   INTEGER,
  bytes    INTEGER
);

CREATE TABLE IF NOT EXISTS videoframes (
  id      INTEGER PRIMARY KEY,
  videoid INTEGER NOT NULL,
  hash    BLOB NOT NULL,
  FOREIGN KEY(videoid) REFERENCES videos(id)
);

CREATE TABLE IF NOT EXISTS albums (
  id  INTEGER PRIMARY KEY,
  url TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS imageurls (
  id        INTEGER PRIMARY KEY,
  url       TEXT NOT NULL,
  clean_url TEXT NOT NULL,
  imageid   INTEGER NOT NULL,
  albumid   INTEGER,
  postid    INTEGER,
  commentid INTEGER,
  FOREIGN KEY(imageid)   REFERENCES images(id),
  FOREIGN KEY(albumid)   REFERENCES albums(id),
  FOREIGN KEY(postid)    REFERENCES posts(id),
  FOREIGN KEY(commentid) REFERENCES comments(id)
);

CREATE TABLE IF NOT EXISTS videourls (
  id        INTEGER PRIMARY KEY,
  url       TEXT NOT NULL,
  clean_url TEXT NOT NULL,
  videoid   INTEGER NOT NULL,
  postid    INTEGER,
  commentid INTEGER,
  FOREIGN KEY(videoid)   REFERENCES videos(id),
  FOREIGN KEY(postid)    REFERENCES posts(id),
  FOREIGN KEY(commentid) REFERENCES comments(id)
);

CREATE INDEX IF NOT EXISTS idx_images_hash          ON images(hash);
CREATE INDEX IF NOT EXISTS idx_videoframes_videoid  ON videoframes(videoid);
CREATE INDEX IF NOT EXISTS idx_imageurls_clean_url  ON imageurls(clean_url);
CREATE INDEX IF NOT EXISTS idx_imageurls_imageid    ON imageurls(imageid);
CREATE INDEX IF NOT EXISTS idx_videourls_clean_url  ON videourls(clean_url);
CREATE INDEX IF NOT EXISTS idx_videourls_videoid    ON videourls(videoid);
CREATE INDEX IF NOT EXISTS idx_posts_author         ON posts(author);
CREATE INDEX IF NOT EXISTS idx_comments_author      ON comments(author);

CREATE UNIQUE INDEX IF NOT EXISTS idx_imageurls_binding
  ON imageurls(url, imageid, coalesce(albumid, 0), coalesce(postid, 0), coalesce(commentid, 0));
CREATE UNIQUE INDEX IF NOT EXISTS idx_videourls_binding
  ON videourls(url, videoid, coalesce(postid, 0), coalesce(commentid, 0));
";
