//! Deterministic seed hierarchy for Monte Carlo runs.
//!
//! A master seed is expanded into one sub-seed per `(hypothesis, stream, run)`
//! via BLAKE3, so split `i` of a batch is reproducible no matter which worker
//! picks it up or in what order runs complete.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Stream name used for date-split draws.
pub const SPLIT_STREAM: &str = "split";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedHierarchy {
    master_seed: u64,
}

impl SeedHierarchy {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Sub-seed for one run of one stream. Independent of derivation order.
    pub fn sub_seed(&self, hypothesis_id: &str, stream: &str, run_index: u64) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.master_seed.to_le_bytes());
        hasher.update(hypothesis_id.as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update(&[0]);
        hasher.update(stream.as_bytes());
        hasher.update(&run_index.to_le_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Seed for the date split of run `run_index`.
    pub fn split_seed(&self, hypothesis_id: &str, run_index: u64) -> u64 {
        self.sub_seed(hypothesis_id, SPLIT_STREAM, run_index)
    }

    /// Split seed for run `run_index` of validation pass `pass`. Pass 0 is
    /// [`split_seed`](Self::split_seed); retried passes draw fresh splits.
    pub fn pass_split_seed(&self, hypothesis_id: &str, pass: u32, run_index: u64) -> u64 {
        if pass == 0 {
            return self.split_seed(hypothesis_id, run_index);
        }
        self.sub_seed(hypothesis_id, &format!("{SPLIT_STREAM}/{pass}"), run_index)
    }

    pub fn rng_for(&self, hypothesis_id: &str, stream: &str, run_index: u64) -> StdRng {
        StdRng::seed_from_u64(self.sub_seed(hypothesis_id, stream, run_index))
    }
}
