// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A seeded generator of Zipf-distributed key ranks.
///
/// Rank 0 is the hottest key. The probability of rank `k` is proportional to `1 / (k + 1)^s`.
///
/// # Example
///
/// ```
/// use testing_aids::ZipfKeys;
///
/// let mut keys = ZipfKeys::new(1_000, 0.99, 7);
/// let rank = keys.next_key();
/// assert!(rank < 1_000);
/// ```
#[derive(Debug)]
pub struct ZipfKeys {
    cdf: Vec<f64>,
    rng: StdRng,
}

impl ZipfKeys {
    /// # Panics
    ///
    /// Panics if `keys` is zero.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "key counts used in tests are far below 2^52")]
    pub fn new(keys: usize, exponent: f64, seed: u64) -> Self {
        assert!(keys > 0, "a Zipf distribution needs at least one key");

        let mut total = 0.0;
        let mut cdf: Vec<f64> = (0..keys)
            .map(|rank| {
                total += 1.0 / ((rank + 1) as f64).powf(exponent);
                total
            })
            .collect();
        for point in &mut cdf {
            *point /= total;
        }

        Self {
            cdf,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws the next key rank.
    pub fn next_key(&mut self) -> u64 {
        let sample: f64 = self.rng.random();
        let rank = self.cdf.partition_point(|&point| point < sample).min(self.cdf.len() - 1);
        rank as u64
    }
}
