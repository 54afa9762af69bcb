//! Seeded randomness for a run.
//!
//! A run owns exactly one root [`SimulationRng`], seeded once when the run
//! starts. The scheduler draws action choices and pacing delays from it in
//! submission order; every dispatched step gets a child generator derived
//! from the root seed and the step index, so the randomness an action
//! consumes does not depend on which pool thread happens to execute it.

use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, MutexGuard};
use rand::{
    distributions::uniform::{SampleRange, SampleUniform},
    rngs::SmallRng,
    Rng, SeedableRng,
};

/// Shared handle to one seeded generator. Clones draw from the same stream.
#[derive(Clone)]
pub struct SimulationRng {
    inner: Arc<Mutex<SmallRng>>,
    seed: u64,
}

impl SimulationRng {
    /// Creates a generator seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SmallRng::seed_from_u64(seed))),
            seed,
        }
    }

    /// The seed this generator was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// `true` with the given probability.
    pub fn gen_bool(&self, probability: f64) -> bool {
        self.inner.lock().gen_bool(probability)
    }

    /// Next raw `u64` from the stream.
    pub fn gen_u64(&self) -> u64 {
        self.inner.lock().gen()
    }

    /// Panics on an empty range, like [`Rng::gen_range`].
    pub fn gen_range<T, R>(&self, range: R) -> T
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        self.inner.lock().gen_range(range)
    }

    /// Uniform duration in `[min_ms, max_ms]` milliseconds.
    pub fn gen_millis(&self, min_ms: u64, max_ms: u64) -> Duration {
        Duration::from_millis(self.gen_range(min_ms..=max_ms))
    }

    /// Independent generator for `index`, a pure function of the root seed.
    /// Drawing from `self` does not change it.
    pub fn child_with_index(&self, index: u64) -> Self {
        Self::new(splitmix64(self.seed ^ splitmix64(index)))
    }

    /// Direct access for `rand` distributions. Do not hold the guard across
    /// blocking calls.
    pub fn lock(&self) -> MutexGuard<'_, SmallRng> {
        self.inner.lock()
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl std::fmt::Debug for SimulationRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SimulationRng").field(&self.seed).finish()
    }
}
