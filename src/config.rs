//! Simulation configuration and the injectable randomness seams

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::messages::ProcessId;

/// Probability that an armed process crashes at a handler entry (α).
pub const DEFAULT_CRASH_PROBABILITY: f64 = 0.1;

/// Crash coin drawn at each handler entry of an armed process.
///
/// A trait seam so the pure core never owns an RNG: the runtime supplies a
/// seeded Bernoulli coin, tests and the model checker supply deterministic
/// ones.
pub trait CrashCoin: Send + 'static {
    /// Draw the coin. `true` means the process crashes now.
    fn fires(&mut self) -> bool;
}

/// Coin that never fires. Used by deterministic tests and the model checker.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCrash;

impl CrashCoin for NeverCrash {
    fn fires(&mut self) -> bool {
        false
    }
}

/// Bernoulli coin with fixed probability, drawn from an owned RNG.
#[derive(Debug)]
pub struct RandomCoin<R = StdRng> {
    rng: R,
    probability: f64,
}

impl<R: Rng> RandomCoin<R> {
    /// Create a coin that fires with the given probability on each draw.
    ///
    /// # Panics
    ///
    /// Panics if `probability` is not in `[0, 1]`.
    pub fn new(rng: R, probability: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&probability),
            "crash probability must be within [0, 1]"
        );
        Self { rng, probability }
    }
}

impl<R: Rng + Send + 'static> CrashCoin for RandomCoin<R> {
    fn fires(&mut self) -> bool {
        self.rng.random_bool(self.probability)
    }
}

/// Configuration for a simulated cluster.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// Crash probability for armed processes.
    pub crash_probability: f64,
    /// Seed for all per-process RNG streams. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            crash_probability: DEFAULT_CRASH_PROBABILITY,
            seed: None,
        }
    }
}

impl SimulationConfig {
    /// Deterministic configuration: every RNG stream derives from `seed`.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    /// RNG used for a process's initial proposal draw.
    pub(crate) fn proposal_rng(&self, id: ProcessId) -> StdRng {
        self.stream_rng(id, 0)
    }

    /// Crash coin for one process, on an RNG stream distinct from the
    /// proposal stream.
    pub(crate) fn coin_for(&self, id: ProcessId) -> RandomCoin {
        RandomCoin::new(self.stream_rng(id, 1), self.crash_probability)
    }

    fn stream_rng(&self, id: ProcessId, stream: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ (id as u64).rotate_left(32) ^ stream),
            None => StdRng::from_os_rng(),
        }
    }
}
