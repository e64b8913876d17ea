//! Simulated Content Store with Fault Injection
//!
//! DST wrapper that injects upload faults using buggify and tracks how many
//! uploads overlap, so tests can assert the at-most-one-in-flight rule.

use super::{ContentId, ContentStore, StoreError, StoreFuture};
use crate::buggify::faults::content_store as faults;
use crate::io::Rng;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedContentStoreConfig {
    pub add_fail_prob: f64,
    pub timeout_prob: f64,
    pub malformed_response_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedContentStoreConfig {
    fn default() -> Self {
        SimulatedContentStoreConfig {
            add_fail_prob: 0.05,
            timeout_prob: 0.02,
            malformed_response_prob: 0.01,
            latency_range_us: (100, 10_000),
        }
    }
}

impl SimulatedContentStoreConfig {
    pub fn no_faults() -> Self {
        SimulatedContentStoreConfig {
            add_fail_prob: 0.0,
            timeout_prob: 0.0,
            malformed_response_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedContentStoreConfig {
            add_fail_prob: 0.2,
            timeout_prob: 0.1,
            malformed_response_prob: 0.05,
            latency_range_us: (1_000, 50_000),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedContentStoreStats {
    pub add_attempts: u64,
    pub add_failures: u64,
    pub timeouts: u64,
    pub malformed_responses: u64,
    pub unreachable: u64,
    pub successes: u64,
    /// Highest number of concurrently running `add` calls seen
    pub max_in_flight: usize,
}

struct SimulatedContentStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedContentStoreStats,
}

/// Content store wrapper that injects faults
pub struct SimulatedContentStore<S: ContentStore + Clone, R: Rng> {
    inner_store: S,
    config: SimulatedContentStoreConfig,
    state: Arc<Mutex<SimulatedContentStoreInner<R>>>,
    reachable: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    /// Fixed latency added to every add (on top of the random range)
    hold: Arc<Mutex<Duration>>,
}

impl<S: ContentStore + Clone, R: Rng> Clone for SimulatedContentStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedContentStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            reachable: Arc::clone(&self.reachable),
            in_flight: Arc::clone(&self.in_flight),
            hold: Arc::clone(&self.hold),
        }
    }
}

impl<S: ContentStore + Clone, R: Rng> SimulatedContentStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedContentStoreConfig) -> Self {
        SimulatedContentStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedContentStoreInner {
                rng,
                stats: SimulatedContentStoreStats::default(),
            })),
            reachable: Arc::new(AtomicBool::new(true)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            hold: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn stats(&self) -> SimulatedContentStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedContentStoreStats::default();
    }

    /// Outage switch: while unreachable every add fails
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every subsequent add take at least `latency`
    pub fn set_hold(&self, latency: Duration) {
        *self.hold.lock() = latency;
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    fn roll(&self, fault_id: &'static str, probability: f64) -> bool {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        crate::buggify!(&mut s.rng, fault_id, probability)
    }

    fn record(&self, f: impl FnOnce(&mut SimulatedContentStoreStats)) {
        f(&mut self.state.lock().stats);
    }
}

/// Decrements the in-flight gauge even if the add future is dropped
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: ContentStore + Clone, R: Rng> ContentStore for SimulatedContentStore<S, R> {
    fn add<'a>(&'a self, name: &'a str, data: Bytes) -> StoreFuture<'a, ContentId> {
        Box::pin(async move {
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlightGuard(Arc::clone(&self.in_flight));
            self.record(|s| {
                s.add_attempts += 1;
                s.max_in_flight = s.max_in_flight.max(now_in_flight);
            });

            let (min, max) = self.config.latency_range_us;
            let latency_us = if max > min {
                self.state.lock().rng.gen_range(min, max)
            } else {
                min
            };
            let hold = *self.hold.lock();
            let latency = Duration::from_micros(latency_us) + hold;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            if !self.reachable.load(Ordering::SeqCst) {
                self.record(|s| s.unreachable += 1);
                return Err(StoreError::Unavailable("connection refused (simulated)".to_string()));
            }

            if self.roll(faults::TIMEOUT, self.config.timeout_prob) {
                self.record(|s| s.timeouts += 1);
                return Err(StoreError::Timeout(latency));
            }

            if self.roll(faults::ADD_FAIL, self.config.add_fail_prob) {
                self.record(|s| s.add_failures += 1);
                return Err(StoreError::Status {
                    code: 500,
                    body: "simulated add failure".to_string(),
                });
            }

            // The store kept the bytes but the reply was garbage
            let cid = self.inner_store.add(name, data).await?;
            if self.roll(faults::MALFORMED_RESPONSE, self.config.malformed_response_prob) {
                self.record(|s| s.malformed_responses += 1);
                return Err(StoreError::MalformedResponse(
                    "simulated truncated JSON".to_string(),
                ));
            }

            self.record(|s| s.successes += 1);
            Ok(cid)
        })
    }

    fn access_url(&self, cid: &ContentId) -> String {
        self.inner_store.access_url(cid)
    }

    fn describe(&self) -> String {
        format!("simulated({})", self.inner_store.describe())
    }
}
