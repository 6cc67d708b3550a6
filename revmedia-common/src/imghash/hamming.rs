pub type Distance = u32;

/// A 144-bit difference hash. The width is baked into every stored row, so
/// changing it means reindexing everything.
#[derive(
    Clone,
    Copy,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Ord,
    PartialOrd,
)]
pub struct Hamming(pub [u8; Hamming::BYTES]);

impl Hamming {
    pub const BYTES: usize = 18;
    pub const BITS: u32 = 8 * Hamming::BYTES as u32;
    pub const MIN_DIST: Distance = 0;
    pub const MAX_DIST: Distance = Hamming::BITS;

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::try_from_slice(bytes).expect("the slice is of the incorrect length")
    }

    /// Fallible variant for blobs read back from the database.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; Hamming::BYTES] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(self) -> String {
        base64::Engine::encode(&base64::prelude::BASE64_STANDARD_NO_PAD, self.0)
    }

    pub fn distance_to(self, other: Self) -> Distance {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl std::fmt::Display for Hamming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_base64().fmt(f)
    }
}

#[cfg(test)]
mod test {
    use rand::{distributions::Standard, prelude::Distribution, Rng};

    use super::*;

    impl Hamming {
        pub fn random_at_distance<R>(self, rng: &mut R, dist: Distance) -> Self
        where
            R: Rng + ?Sized,
        {
            assert!(dist >= Hamming::MIN_DIST && dist <= Hamming::MAX_DIST);

            let mut new_bytes = self.0;
            for i in rand::seq::index::sample(
                rng,
                Hamming::BITS.try_into().unwrap(),
                dist.try_into().unwrap(),
            ) {
                new_bytes[i / 8] ^= 1 << (i % 8);
            }
            Hamming(new_bytes)
        }

        pub fn random_within<R>(self, rng: &mut R, within: Distance) -> Self
        where
            R: Rng + ?Sized,
        {
            let dist = rng.gen_range(Hamming::MIN_DIST..=within);
            self.random_at_distance(rng, dist)
        }
    }

    impl Distribution<Hamming> for Standard {
        fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Hamming {
            Hamming(rng.gen())
        }
    }

    #[test]
    fn random_at_distance() {
        let h1 = Hamming([0b101010; Hamming::BYTES]);
        let h2 = h1.random_at_distance(&mut rand::thread_rng(), 3);
        assert_eq!(3, h1.distance_to(h2));
    }

    #[test]
    fn hamming_distances() {
        let zero = Hamming([0; Hamming::BYTES]);
        let ones = Hamming([u8::MAX; Hamming::BYTES]);
        assert_eq!(0, zero.distance_to(zero));
        assert_eq!(0, ones.distance_to(ones));
        assert_eq!(Hamming::MAX_DIST, zero.distance_to(ones));

        let mut a = [0u8; Hamming::BYTES];
        a[0] = 0b101;
        let mut b = [0u8; Hamming::BYTES];
        b[0] = 0b010;
        assert_eq!(3, Hamming(a).distance_to(Hamming(b)));
        assert_eq!(
            Hamming(a).distance_to(Hamming(b)),
            Hamming(b).distance_to(Hamming(a))
        );
    }

    #[test]
    fn slice_round_trip() {
        let h: Hamming = rand::random();
        assert_eq!(h, Hamming::from_slice(h.as_bytes()));
        assert_eq!(None, Hamming::try_from_slice(&[0u8; 8]));
    }
}
