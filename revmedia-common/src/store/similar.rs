use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::imghash::hamming::{Distance, Hamming};

use super::{MediaStore, Result};

/// Ceiling for the search radius, tuned for the 144-bit hash width.
pub const MAX_DISTANCE: Distance = 30;
pub const MIN_FRAME_MATCHES: u32 = 1;
pub const MAX_FRAME_MATCHES: u32 = 30;
pub const DEFAULT_FRAME_MATCHES: u32 = 10;

/// Clamp a client-supplied radius, whatever it claims to be.
pub fn clamp_distance(d: i64) -> Distance {
    d.clamp(0, MAX_DISTANCE as i64) as Distance
}

/// Clamp the minimum-matching-frames parameter; absent or nonsensical
/// values fall back to the default rather than the floor.
pub fn clamp_frame_matches(f: Option<i64>) -> u32 {
    match f {
        None => DEFAULT_FRAME_MATCHES,
        Some(f) if f < MIN_FRAME_MATCHES as i64 => DEFAULT_FRAME_MATCHES,
        Some(f) => (f as u64).min(MAX_FRAME_MATCHES as u64) as u32,
    }
}

/// Query frame sets cross the SQL boundary as one blob of concatenated
/// 18-byte hashes.
pub fn pack_hashes(hashes: &[Hamming]) -> Vec<u8> {
    let mut packed = Vec::with_capacity(hashes.len() * Hamming::BYTES);
    for hash in hashes {
        packed.extend_from_slice(hash.as_bytes());
    }
    packed
}

fn blob_distance(a: &[u8], b: &[u8]) -> Option<Distance> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum())
}

/// The DB-side half of the similarity engine. Registered on every pooled
/// connection so plain SQL can filter by Hamming distance.
pub(crate) fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "hash_within_distance",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let hash: Vec<u8> = ctx.get(0)?;
            let target: Vec<u8> = ctx.get(1)?;
            let d: i64 = ctx.get(2)?;
            Ok(blob_distance(&hash, &target).is_some_and(|dist| i64::from(dist) <= d))
        },
    )?;

    conn.create_scalar_function(
        "hash_within_distance_any",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let hash: Vec<u8> = ctx.get(0)?;
            let packed: Vec<u8> = ctx.get(1)?;
            let d: i64 = ctx.get(2)?;
            Ok(packed
                .chunks(Hamming::BYTES)
                .any(|target| {
                    blob_distance(&hash, target).is_some_and(|dist| i64::from(dist) <= d)
                }))
        },
    )
}

impl MediaStore {
    /// Image ids whose hash is within `distance` of the target. Zero radius
    /// goes through the hash index instead of a scan.
    pub fn similar_images(&self, hash: Hamming, distance: Distance) -> Result<Vec<i64>> {
        let distance = distance.min(MAX_DISTANCE);
        self.with_conn(|conn| {
            if distance == 0 {
                let mut stmt =
                    conn.prepare_cached("SELECT id FROM images WHERE hash = ?1 ORDER BY id")?;
                let rows = stmt.query_map([hash.as_bytes()], |row| row.get(0))?;
                rows.collect()
            } else {
                let mut stmt = conn.prepare_cached(
                    "SELECT id FROM images
                     WHERE hash_within_distance(hash, ?1, ?2)
                     ORDER BY id",
                )?;
                let rows =
                    stmt.query_map(rusqlite::params![hash.as_bytes(), distance], |row| {
                        row.get(0)
                    })?;
                rows.collect()
            }
        })
    }

    /// Video ids where at least `min_frames` stored frames land within
    /// `distance` of some query frame.
    pub fn similar_videos(
        &self,
        frames: &[Hamming],
        distance: Distance,
        min_frames: u32,
    ) -> Result<Vec<i64>> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        let distance = distance.min(MAX_DISTANCE);
        let min_frames = min_frames.clamp(MIN_FRAME_MATCHES, MAX_FRAME_MATCHES);
        let packed = pack_hashes(frames);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT videoid FROM videoframes
                 WHERE hash_within_distance_any(hash, ?1, ?2)
                 GROUP BY videoid
                 HAVING COUNT(*) >= ?3
                 ORDER BY videoid",
            )?;
            let rows =
                stmt.query_map(rusqlite::params![packed, distance, min_frames], |row| {
                    row.get(0)
                })?;
            rows.collect()
        })
    }
}
