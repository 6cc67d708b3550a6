use std::cell::OnceCell;

use self::hamming::Hamming;

pub mod hamming;

thread_local! {
    static HASHER: OnceCell<Hasher> = OnceCell::new();
}

/// Computes the 144-bit difference hash of an image: resample to 13x12
/// grayscale (Lanczos3), set a bit where a pixel is darker than its right
/// neighbour, pack row-major. Two re-encodings of the same picture usually
/// land within a distance of 10.
pub struct Hasher {
    hasher: image_hasher::Hasher,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            hasher: image_hasher::HasherConfig::new()
                .hash_size(12, 12)
                .hash_alg(image_hasher::HashAlg::Gradient)
                .resize_filter(image_hasher::FilterType::Lanczos3)
                .to_hasher(),
        }
    }

    pub fn hash<I>(&self, img: &I) -> Hamming
    where
        I: image_hasher::Image,
    {
        let hash = self.hasher.hash_image(img);
        Hamming::from_slice(hash.as_bytes())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hash<I>(img: &I) -> Hamming
where
    I: image_hasher::Image,
{
    HASHER.with(|h| h.get_or_init(Hasher::new).hash(img))
}
