//! BUGGIFY - FoundationDB-Style Fault Injection
//!
//! Deterministic, reproducible fault injection for the simulated log store
//! and the simulated content store. Every fault site is named (see
//! [`faults`]) and each check is counted per thread, so a DST run can report
//! which faults actually fired.
//!
//! ```ignore
//! use crate::buggify::faults::log_store as faults;
//!
//! if buggify!(&mut rng, faults::FSYNC_FAIL, 0.05) {
//!     return Err(io::Error::other("injected fsync failure"));
//! }
//! ```
//!
//! Given the same seed, faults fire at the same points.

pub mod faults;

use std::cell::RefCell;
use std::collections::HashMap;

/// Per-thread check and trigger counts, keyed by fault id
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    pub checks: HashMap<&'static str, u64>,
    pub triggers: HashMap<&'static str, u64>,
}

impl BuggifyStats {
    pub fn total_triggers(&self) -> u64 {
        self.triggers.values().sum()
    }

    pub fn summary(&self) -> String {
        let mut ids: Vec<_> = self.checks.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .map(|id| {
                let checks = self.checks.get(id).copied().unwrap_or(0);
                let triggers = self.triggers.get(id).copied().unwrap_or(0);
                format!("{}: {}/{}", id, triggers, checks)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

thread_local! {
    static STATS: RefCell<BuggifyStats> = RefCell::new(BuggifyStats::default());
}

/// Return and clear the current thread's counts
pub fn take_stats() -> BuggifyStats {
    STATS.with(|stats| std::mem::take(&mut *stats.borrow_mut()))
}

/// Roll against `probability`, recording the check
#[inline]
pub fn should_buggify<R: crate::io::Rng>(
    rng: &mut R,
    fault_id: &'static str,
    probability: f64,
) -> bool {
    // Always draw so the RNG stream does not depend on the probability
    let triggered = rng.gen_unit() < probability.clamp(0.0, 1.0);
    STATS.with(|stats| {
        let mut stats = stats.borrow_mut();
        *stats.checks.entry(fault_id).or_insert(0) += 1;
        if triggered {
            *stats.triggers.entry(fault_id).or_insert(0) += 1;
        }
    });
    triggered
}

#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id, $prob)
    };
}
