use rand::Rng;
use serde::Serialize;

use crate::request::RANDOM_SEED;
use crate::OrchestratorError;

/// Per-item seeds for one request, in generation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResolvedSeedSet(Vec<i64>);

impl ResolvedSeedSet {
    /// `seed == -1` draws `batch_size` independent seeds in `[0, seed_max]`
    /// (with replacement). Any other seed yields `seed, seed + 1, ...`.
    pub fn derive<R: Rng>(
        seed: i64,
        batch_size: usize,
        seed_max: i64,
        rng: &mut R,
    ) -> Result<Self, OrchestratorError> {
        if seed == RANDOM_SEED {
            let seeds = (0..batch_size)
                .map(|_| rng.gen_range(0..=seed_max))
                .collect();
            return Ok(Self(seeds));
        }

        (0..batch_size as i64)
            .map(|i| seed.checked_add(i))
            .collect::<Option<Vec<_>>>()
            .map(Self)
            .ok_or_else(|| {
                OrchestratorError::InvalidRequest(format!(
                    "seed {seed} overflows for a batch of {batch_size}"
                ))
            })
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<i64>> for ResolvedSeedSet {
    fn from(seeds: Vec<i64>) -> Self {
        Self(seeds)
    }
}
