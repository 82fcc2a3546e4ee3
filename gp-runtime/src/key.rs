//! Splittable PRNG keys.
//!
//! Randomness is threaded explicitly: a key is consumed by value when split or
//! turned into an RNG, so a used key cannot be drawn from twice. Two runs with
//! the same root key see identical random streams.

use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

/// Stable seed mixer (same as common SplitMix64).
pub fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// A splittable pseudorandom key.
///
/// Deliberately neither `Copy` nor `Clone`: every operation takes `self`, so
/// ownership transfer enforces single use.
#[derive(Debug)]
pub struct PrngKey(u64);

impl PrngKey {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Split into two independent child keys, consuming this one.
    pub fn split(self) -> (PrngKey, PrngKey) {
        let a = splitmix64(self.0);
        let b = splitmix64(self.0 ^ 0xA5A5_A5A5_A5A5_A5A5);
        (PrngKey(a), PrngKey(b))
    }

    /// Split into four child keys (one carried forward, three consumed).
    pub fn split4(self) -> (PrngKey, PrngKey, PrngKey, PrngKey) {
        let (a, rest) = self.split();
        let (b, rest) = rest.split();
        let (c, d) = rest.split();
        (a, b, c, d)
    }

    /// Consume the key into a seeded RNG for actual sampling.
    pub fn into_rng(self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.0)
    }

    /// Consume the key into its raw seed. Reconstructing from this seed
    /// replays the exact stream, which the gradient estimator needs to hold
    /// the randomness fixed across perturbed loss probes.
    pub fn into_seed(self) -> u64 {
        self.0
    }
}

/// Hands out a fresh key per draw inside a rollout, in evaluation order.
pub struct KeyStream {
    key: Option<PrngKey>,
}

impl KeyStream {
    pub fn new(key: PrngKey) -> Self {
        Self { key: Some(key) }
    }

    pub fn next_key(&mut self) -> PrngKey {
        // The stream key is always present; `take` only bridges the split.
        let cur = self.key.take().unwrap_or_else(|| PrngKey::new(0));
        let (carry, out) = cur.split();
        self.key = Some(carry);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn split_is_deterministic_and_diverging() {
        let (a1, b1) = PrngKey::new(7).split();
        let (a2, b2) = PrngKey::new(7).split();
        let mut ra1 = a1.into_rng();
        let mut ra2 = a2.into_rng();
        let mut rb1 = b1.into_rng();
        let x1: u64 = ra1.gen();
        let x2: u64 = ra2.gen();
        let y1: u64 = rb1.gen();
        assert_eq!(x1, x2);
        assert_ne!(x1, y1);
        let _ = b2;
    }

    #[test]
    fn key_stream_yields_distinct_keys() {
        let mut ks = KeyStream::new(PrngKey::new(42));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let k = ks.next_key();
            let mut rng = k.into_rng();
            let v: u64 = rng.gen();
            assert!(seen.insert(v), "key stream repeated a draw");
        }
    }
}
