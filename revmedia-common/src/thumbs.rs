use std::path::{Path, PathBuf};

use color_eyre::eyre::{self, Context};
use image::RgbImage;

/// Long-edge cap for still-image thumbnails. Video frame thumbs are capped
/// by the extractor's `tn_size` instead.
pub const IMAGE_THUMB_SIZE: u32 = 500;

pub const WEB_ROOT: &str = "static/thumbs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Image,
    Video,
}

impl Kind {
    fn dir(self) -> &'static str {
        match self {
            Kind::Image => "im",
            Kind::Video => "vid",
        }
    }
}

/// Ids shard into two directory levels so no single directory collects
/// millions of files: first decimal digit, then second digit or "0".
fn shard(id: i64) -> (String, String) {
    let digits = id.to_string();
    let mut chars = digits.chars();
    let d1 = chars.next().expect("ids are positive").to_string();
    let d2 = chars.next().map(String::from).unwrap_or_else(|| "0".to_string());
    (d1, d2)
}

/// The URL path a browser uses for a thumbnail.
pub fn web_path(id: i64, kind: Kind) -> String {
    let (d1, d2) = shard(id);
    format!("{WEB_ROOT}/{}/{d1}/{d2}/{id}.jpg", kind.dir())
}

/// Writes thumbnails into the sharded on-disk layout.
#[derive(Debug, Clone)]
pub struct ThumbStore {
    root: PathBuf,
}

impl ThumbStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, id: i64, kind: Kind) -> PathBuf {
        let (d1, d2) = shard(id);
        self.root
            .join(kind.dir())
            .join(d1)
            .join(d2)
            .join(format!("{id}.jpg"))
    }

    pub fn save(&self, id: i64, kind: Kind, thumb: &RgbImage) -> eyre::Result<PathBuf> {
        let path = self.path_for(id, kind);
        let dir = path.parent().expect("sharded paths have parents");
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
        thumb
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sharding_rule() {
        assert_eq!("static/thumbs/im/7/0/7.jpg", web_path(7, Kind::Image));
        assert_eq!("static/thumbs/im/1/0/10.jpg", web_path(10, Kind::Image));
        assert_eq!("static/thumbs/vid/4/2/421.jpg", web_path(421, Kind::Video));
    }

    #[test]
    fn save_creates_shard_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThumbStore::new(dir.path());
        let img = RgbImage::new(20, 10);

        let path = store.save(123, Kind::Video, &img).unwrap();
        assert!(path.ends_with("vid/1/2/123.jpg"));
        assert!(path.exists());
    }
}
