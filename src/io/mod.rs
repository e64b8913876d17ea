//! Randomness abstraction shared by production code and simulation.
//!
//! Backoff jitter in the ingress path and fault injection in the simulated
//! stores both draw from an [`Rng`]. Production uses OS entropy; tests and the
//! DST harness use a seeded ChaCha generator so a failing seed replays exactly.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Minimal random source used across the crate
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    /// Uniform value in `[min, max)`. Returns `min` when the range is empty.
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform float in `[0, 1)`
    fn gen_unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Entropy-seeded RNG for production use
#[derive(Debug)]
pub struct ProductionRng {
    inner: rand::rngs::StdRng,
}

impl ProductionRng {
    pub fn new() -> Self {
        ProductionRng {
            inner: rand::rngs::StdRng::from_entropy(),
        }
    }
}

impl Default for ProductionRng {
    fn default() -> Self {
        Self::new()
    }
}

impl Rng for ProductionRng {
    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng as _;
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng as _;
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }
}

/// Seeded RNG for deterministic simulation
#[derive(Debug, Clone)]
pub struct SimulatedRng {
    inner: ChaCha8Rng,
}

impl SimulatedRng {
    pub fn new(seed: u64) -> Self {
        SimulatedRng {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Derive an independent generator (for handing to a sub-component)
    pub fn fork(&mut self) -> Self {
        SimulatedRng::new(self.inner.next_u64())
    }
}

impl Rng for SimulatedRng {
    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng as _;
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng as _;
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }
}
