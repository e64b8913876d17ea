//! Snapshot Uploader
//!
//! Timer-driven: every `interval` it snapshots the log and ships the bytes to
//! the content store.
//!
//! ## State Machine
//!
//! ```text
//!         tick (nothing in flight)
//! Idle ─────────────────────────► Snapshotting ──► Uploading ──┬──► Succeeded ──┐
//!  ▲                                   │                       └──► Failed ─────┤
//!  │                                   └── snapshot error ─────────► Failed ────┤
//!  └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - A tick while a cycle is running is skipped (at most one upload in flight)
//! - A failed cycle is not retried; the next tick snapshots a superset
//! - The log is never truncated after an upload

use crate::log::LogHandle;
use crate::store::{ContentId, ContentStore, StoreError};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Capacity of the results broadcast channel
const RESULTS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderState {
    Idle,
    Snapshotting,
    Uploading,
    Succeeded,
    Failed,
}

/// A finished upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub cycle: u64,
    pub content_id: ContentId,
    pub access_url: String,
    pub entry_count: u64,
    pub bytes: usize,
    pub taken_at: DateTime<Local>,
}

/// Which step of a cycle failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Snapshot,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub cycle: u64,
    pub stage: FailureStage,
    pub error: String,
}

pub type UploadOutcome = Result<UploadResult, UploadFailure>;

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Started { cycle: u64 },
    SkippedInFlight,
    SkippedShutdown,
}

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub interval: Duration,
    /// Upper bound on one `add` call
    pub timeout: Duration,
    /// Name the snapshot is uploaded under
    pub object_name: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        UploaderConfig {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            object_name: "mqtt_logs.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploaderStats {
    pub ticks: u64,
    pub skipped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_content_id: Option<ContentId>,
}

struct Shared {
    log: LogHandle,
    store: Arc<dyn ContentStore>,
    config: UploaderConfig,
    in_flight: AtomicBool,
    closed: AtomicBool,
    cycles: AtomicU64,
    ticks: AtomicU64,
    skipped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    last_content_id: Mutex<Option<ContentId>>,
    state_tx: watch::Sender<UploaderState>,
    results_tx: broadcast::Sender<UploadOutcome>,
    tracker: TaskTracker,
}

/// Cheap-to-clone uploader; every clone drives the same cycle state
#[derive(Clone)]
pub struct SnapshotUploader {
    shared: Arc<Shared>,
}

impl SnapshotUploader {
    pub fn new(log: LogHandle, store: Arc<dyn ContentStore>, config: UploaderConfig) -> Self {
        let (state_tx, _) = watch::channel(UploaderState::Idle);
        let (results_tx, _) = broadcast::channel(RESULTS_CHANNEL_CAPACITY);

        SnapshotUploader {
            shared: Arc::new(Shared {
                log,
                store,
                config,
                in_flight: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cycles: AtomicU64::new(0),
                ticks: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                last_content_id: Mutex::new(None),
                state_tx,
                results_tx,
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn state(&self) -> UploaderState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UploaderState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<UploadOutcome> {
        self.shared.results_tx.subscribe()
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> UploaderStats {
        let s = &self.shared;
        UploaderStats {
            ticks: s.ticks.load(Ordering::Relaxed),
            skipped: s.skipped.load(Ordering::Relaxed),
            succeeded: s.succeeded.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            last_content_id: s.last_content_id.lock().clone(),
        }
    }

    /// One timer tick: start a cycle unless one is already running
    pub fn tick(&self) -> TickOutcome {
        let s = &self.shared;
        s.ticks.fetch_add(1, Ordering::Relaxed);

        if s.closed.load(Ordering::SeqCst) {
            return TickOutcome::SkippedShutdown;
        }

        if s
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            s.skipped.fetch_add(1, Ordering::Relaxed);
            warn!("Previous upload still in flight, skipping tick");
            return TickOutcome::SkippedInFlight;
        }

        let cycle = s.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let this = self.clone();
        s.tracker.spawn(async move { this.run_cycle(cycle).await });
        TickOutcome::Started { cycle }
    }

    async fn run_cycle(&self, cycle: u64) {
        let s = &self.shared;
        s.state_tx.send_replace(UploaderState::Snapshotting);

        let outcome = match s.log.snapshot().await {
            Err(e) => {
                error!(cycle, error = %e, "Snapshot failed, skipping cycle");
                Err(UploadFailure {
                    cycle,
                    stage: FailureStage::Snapshot,
                    error: e.to_string(),
                })
            }
            Ok(snapshot) => {
                s.state_tx.send_replace(UploaderState::Uploading);
                let entry_count = snapshot.entry_count();
                let taken_at = snapshot.taken_at();
                let bytes = snapshot.len();

                let upload = tokio::time::timeout(
                    s.config.timeout,
                    s.store.add(&s.config.object_name, snapshot.into_bytes()),
                )
                .await
                .unwrap_or(Err(StoreError::Timeout(s.config.timeout)));

                match upload {
                    Ok(content_id) => {
                        let access_url = s.store.access_url(&content_id);
                        info!(
                            cycle,
                            cid = %content_id,
                            url = %access_url,
                            entries = entry_count,
                            bytes,
                            "Log uploaded"
                        );
                        Ok(UploadResult {
                            cycle,
                            content_id,
                            access_url,
                            entry_count,
                            bytes,
                            taken_at,
                        })
                    }
                    Err(e) => {
                        error!(
                            cycle,
                            store = %s.store.describe(),
                            error = %e,
                            "Upload failed, snapshot discarded"
                        );
                        Err(UploadFailure {
                            cycle,
                            stage: FailureStage::Upload,
                            error: e.to_string(),
                        })
                    }
                }
            }
        };

        match &outcome {
            Ok(result) => {
                s.succeeded.fetch_add(1, Ordering::Relaxed);
                *s.last_content_id.lock() = Some(result.content_id.clone());
                s.state_tx.send_replace(UploaderState::Succeeded);
            }
            Err(_) => {
                s.failed.fetch_add(1, Ordering::Relaxed);
                s.state_tx.send_replace(UploaderState::Failed);
            }
        }

        s.state_tx.send_replace(UploaderState::Idle);
        s.in_flight.store(false, Ordering::SeqCst);
        let _ = s.results_tx.send(outcome);
    }

    /// Drive ticks on the configured interval until `cancel` fires.
    /// The first tick comes one full interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.shared.config.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = interval.as_secs_f64(),
            store = %self.shared.store.describe(),
            "Snapshot uploader starting"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        info!("Upload timer stopped");
    }

    /// Refuse new cycles and wait for the running one (if any) to finish
    pub async fn wait_idle(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::log::{spawn_log_actor, InMemoryLogStore, LogConfig, LogEntry};
    use crate::store::{
        InMemoryContentStore, SimulatedContentStore, SimulatedContentStoreConfig,
    };

    fn config() -> UploaderConfig {
        UploaderConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
            object_name: "mqtt_logs.txt".to_string(),
        }
    }

    async fn next_outcome(rx: &mut broadcast::Receiver<UploadOutcome>) -> UploadOutcome {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("upload outcome within timeout")
            .expect("results channel open")
    }

    #[tokio::test]
    async fn test_tick_uploads_snapshot() {
        let (log, log_task) = spawn_log_actor(InMemoryLogStore::new(), LogConfig::test()).unwrap();
        log.append(LogEntry::new("sensors/temp", "21.5")).await.unwrap();
        log.append(LogEntry::new("sensors/humidity", "60")).await.unwrap();

        let store = InMemoryContentStore::new();
        let uploader = SnapshotUploader::new(log.clone(), Arc::new(store.clone()), config());
        let mut results = uploader.subscribe_results();

        assert_eq!(uploader.tick(), TickOutcome::Started { cycle: 1 });
        let result = next_outcome(&mut results).await.unwrap();
        assert_eq!(result.entry_count, 2);
        assert_eq!(
            result.access_url,
            format!("http://localhost:8080/ipfs/{}", result.content_id)
        );

        let uploaded = store.get(&result.content_id).unwrap();
        let text = String::from_utf8(uploaded.to_vec()).unwrap();
        assert!(text.contains("sensors/temp: 21.5\n"));
        assert!(text.contains("sensors/humidity: 60\n"));

        assert_eq!(uploader.state(), UploaderState::Idle);
        assert_eq!(uploader.stats().last_content_id, Some(result.content_id));

        log.shutdown().await;
        log_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let (log, log_task) = spawn_log_actor(InMemoryLogStore::new(), LogConfig::test()).unwrap();
        let store = SimulatedContentStore::new(
            InMemoryContentStore::new(),
            SimulatedRng::new(1),
            SimulatedContentStoreConfig::no_faults(),
        );
        store.set_hold(Duration::from_millis(100));
        let uploader = SnapshotUploader::new(log.clone(), Arc::new(store.clone()), config());
        let mut results = uploader.subscribe_results();

        assert_eq!(uploader.tick(), TickOutcome::Started { cycle: 1 });
        assert_eq!(uploader.tick(), TickOutcome::SkippedInFlight);
        assert_eq!(uploader.tick(), TickOutcome::SkippedInFlight);

        assert!(next_outcome(&mut results).await.is_ok());
        assert_eq!(uploader.tick(), TickOutcome::Started { cycle: 2 });
        assert!(next_outcome(&mut results).await.is_ok());

        let stats = uploader.stats();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(store.stats().max_in_flight, 1);

        log.shutdown().await;
        log_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_upload_reports_and_returns_idle() {
        let (log, log_task) = spawn_log_actor(InMemoryLogStore::new(), LogConfig::test()).unwrap();
        let store = SimulatedContentStore::new(
            InMemoryContentStore::new(),
            SimulatedRng::new(2),
            SimulatedContentStoreConfig::no_faults(),
        );
        store.set_reachable(false);
        let uploader = SnapshotUploader::new(log.clone(), Arc::new(store.clone()), config());
        let mut results = uploader.subscribe_results();
        let mut states = uploader.subscribe_state();

        uploader.tick();
        let failure = next_outcome(&mut results).await.unwrap_err();
        assert_eq!(failure.stage, FailureStage::Upload);
        assert_eq!(*states.borrow_and_update(), UploaderState::Idle);
        assert_eq!(uploader.stats().failed, 1);
        assert!(!uploader.is_in_flight());

        log.shutdown().await;
        log_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_failure_skips_cycle() {
        let (log, log_task) = spawn_log_actor(InMemoryLogStore::new(), LogConfig::test()).unwrap();
        log.shutdown().await;
        log_task.await.unwrap();

        let store = InMemoryContentStore::new();
        let uploader = SnapshotUploader::new(log, Arc::new(store.clone()), config());
        let mut results = uploader.subscribe_results();

        uploader.tick();
        let failure = next_outcome(&mut results).await.unwrap_err();
        assert_eq!(failure.stage, FailureStage::Snapshot);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_upload_timeout() {
        let (log, log_task) = spawn_log_actor(InMemoryLogStore::new(), LogConfig::test()).unwrap();
        let store = SimulatedContentStore::new(
            InMemoryContentStore::new(),
            SimulatedRng::new(3),
            SimulatedContentStoreConfig::no_faults(),
        );
        store.set_hold(Duration::from_secs(10));
        let uploader = SnapshotUploader::new(
            log.clone(),
            Arc::new(store),
            UploaderConfig {
                timeout: Duration::from_millis(30),
                ..config()
            },
        );
        let mut results = uploader.subscribe_results();

        uploader.tick();
        let failure = next_outcome(&mut results).await.unwrap_err();
        assert!(failure.error.contains("timed out"), "{}", failure.error);

        log.shutdown().await;
        log_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_ticks_on_interval_and_stops() {
        let (log, log_task) = spawn_log_actor(InMemoryLogStore::new(), LogConfig::test()).unwrap();
        let store = InMemoryContentStore::new();
        let uploader = SnapshotUploader::new(log.clone(), Arc::new(store.clone()), config());
        let mut results = uploader.subscribe_results();
        let cancel = CancellationToken::new();
        let timer = tokio::spawn(uploader.clone().run(cancel.clone()));

        // Empty log still uploads
        let first = next_outcome(&mut results).await.unwrap();
        assert_eq!(first.entry_count, 0);
        assert_eq!(first.bytes, 0);

        cancel.cancel();
        timer.await.unwrap();
        uploader.wait_idle().await;
        assert_eq!(uploader.tick(), TickOutcome::SkippedShutdown);

        log.shutdown().await;
        log_task.await.unwrap();
    }
}
