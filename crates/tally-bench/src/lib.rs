//! Shared helpers for tally benchmarks: seeded RNG, input generators.

use tally_stats::{StatRecord, StatTuple};

/// Simple xoshiro256** PRNG for reproducible benchmarks (no rand dependency in lib).
pub struct Rng {
    s: [u64; 4],
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        // SplitMix64 to expand seed into state
        let mut z = seed;
        let mut s = [0u64; 4];
        for slot in &mut s {
            z = z.wrapping_add(0x9e3779b97f4a7c15);
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
            *slot = z ^ (z >> 31);
        }
        Self { s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.s[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);
        result
    }

    /// Uniform f64 in [-1, 1]
    pub fn f64(&mut self) -> f64 {
        (self.next_u64() as f64) / (u64::MAX as f64) * 2.0 - 1.0
    }
}

pub fn make_rng() -> Rng {
    Rng::new(0xDEAD_BEEF_CAFE_BABE)
}

/// `n` records, each accumulated from `samples` random values.
pub fn random_records(n: usize, samples: usize) -> Vec<StatRecord> {
    let mut rng = make_rng();
    (0..n)
        .map(|_| {
            let mut record = StatRecord::new();
            for _ in 0..samples {
                record.push(rng.f64() * 100.0);
            }
            record
        })
        .collect()
}

/// Flattened records as contributed by `rank`, ready to merge.
pub fn random_tuples(n: usize, rank: usize) -> Vec<StatTuple> {
    random_records(n, 4)
        .iter()
        .map(|r| StatTuple::from_record(r, rank))
        .collect()
}
