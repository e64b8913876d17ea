//! Pipeline Deterministic Simulation Testing Harness
//!
//! Drives the whole pipeline (log actor, ingress subscriber, uploader) against
//! simulated stores and an in-process broker, then checks:
//!
//! - **No loss**: every acknowledged append is in the log exactly once
//! - **Order**: entries from one producer appear in the order it appended them
//! - **Snapshots are prefixes**: every uploaded object is a prefix of the
//!   final log, and later uploads never hold fewer entries
//! - **One upload at a time**: the content store never sees two concurrent adds
//! - **Crash consistency**: a crash image taken mid-run, plus a torn tail,
//!   recovers to whole entries that include every append acknowledged before
//!   the image was taken
//!
//! ## DST Methodology
//!
//! 1. Seed one RNG; fork it for the log store, content store, backoff and
//!    producers, so a seed replays the same fault decisions
//! 2. Run concurrent producers plus broker traffic with random disconnects
//! 3. Capture a crash image once a random number of appends has been acked
//! 4. Shut down, then verify the final log, the uploads and the recovery

use crate::buggify::{self, BuggifyStats};
use crate::ingress::{BackoffConfig, ChannelBroker};
use crate::io::{Rng, SimulatedRng};
use crate::log::{
    decode_lines, FsyncPolicy, InMemoryLogStore, LogConfig, LogEntry, LogFile, SimulatedLogStore,
    SimulatedLogStoreConfig, SimulatedLogStoreStats,
};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::store::{
    InMemoryContentStore, SimulatedContentStore, SimulatedContentStoreConfig,
    SimulatedContentStoreStats,
};
use crate::uploader::{UploadOutcome, UploaderConfig};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const DST_LOG_NAME: &str = "dst_log.txt";
const PRODUCER_TOPIC_PREFIX: &str = "sensors/dst/p";
const BROKER_TOPIC: &str = "sensors/dst/broker";
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PUBLISH_PAUSE_US: u64 = 500;
const PRODUCER_YIELD_PROB: f64 = 0.3;
const TORN_TAIL_PROB: f64 = 0.5;
const MAX_REPORTED_VIOLATIONS: usize = 10;

/// Result of a single DST run
#[derive(Debug, Default)]
pub struct PipelineDSTResult {
    pub seed: u64,
    pub acknowledged_appends: usize,
    pub failed_appends: usize,
    pub broker_published: usize,
    pub broker_delivered: usize,
    pub final_entries: usize,
    pub uploads_succeeded: usize,
    pub uploads_failed: usize,
    pub max_uploads_in_flight: usize,
    pub recovered_entries: usize,
    pub log_store_stats: SimulatedLogStoreStats,
    pub content_store_stats: SimulatedContentStoreStats,
    /// Buggify checks and triggers recorded during the run
    pub fault_stats: BuggifyStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

impl PipelineDSTResult {
    fn setup_failure(seed: u64, message: String) -> Self {
        PipelineDSTResult {
            seed,
            passed: false,
            error_message: Some(message),
            ..Default::default()
        }
    }
}

/// Configuration for the pipeline DST harness
#[derive(Debug, Clone)]
pub struct PipelineDSTConfig {
    /// Tasks appending straight to the log
    pub producers: usize,
    pub messages_per_producer: usize,
    /// Messages routed through the broker and the subscriber
    pub broker_messages: usize,
    /// Chance per broker message of dropping every session first
    pub disconnect_prob: f64,
    pub upload_interval: Duration,
    pub log_store_config: SimulatedLogStoreConfig,
    pub content_store_config: SimulatedContentStoreConfig,
    pub simulate_crash: bool,
}

impl Default for PipelineDSTConfig {
    fn default() -> Self {
        PipelineDSTConfig {
            producers: 4,
            messages_per_producer: 25,
            broker_messages: 40,
            disconnect_prob: 0.05,
            upload_interval: Duration::from_millis(2),
            log_store_config: SimulatedLogStoreConfig::default(),
            content_store_config: SimulatedContentStoreConfig {
                latency_range_us: (100, 2_000),
                ..SimulatedContentStoreConfig::default()
            },
            simulate_crash: true,
        }
    }
}

impl PipelineDSTConfig {
    /// No faults, no crash
    pub fn baseline() -> Self {
        PipelineDSTConfig {
            disconnect_prob: 0.0,
            log_store_config: SimulatedLogStoreConfig::no_faults(),
            content_store_config: SimulatedContentStoreConfig::no_faults(),
            simulate_crash: false,
            ..Default::default()
        }
    }

    /// Crash image without faults
    pub fn crash_only() -> Self {
        PipelineDSTConfig {
            simulate_crash: true,
            ..Self::baseline()
        }
    }

    /// Storage faults, store faults, disconnects and a crash
    pub fn chaos() -> Self {
        PipelineDSTConfig {
            disconnect_prob: 0.1,
            log_store_config: SimulatedLogStoreConfig::high_chaos(),
            content_store_config: SimulatedContentStoreConfig {
                latency_range_us: (500, 5_000),
                ..SimulatedContentStoreConfig::high_chaos()
            },
            simulate_crash: true,
            ..Default::default()
        }
    }
}

/// What a crash at the capture point would have left behind
struct CrashCapture {
    acked: Vec<(usize, usize)>,
    image: Vec<u8>,
}

/// Pipeline DST Harness
pub struct PipelineDSTHarness {
    seed: u64,
    rng: SimulatedRng,
    config: PipelineDSTConfig,
}

impl PipelineDSTHarness {
    pub fn new(seed: u64, config: PipelineDSTConfig) -> Self {
        PipelineDSTHarness {
            seed,
            rng: SimulatedRng::new(seed),
            config,
        }
    }

    /// Run a single scenario on a fresh single-threaded runtime
    pub fn run(&mut self) -> PipelineDSTResult {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                return PipelineDSTResult::setup_failure(
                    self.seed,
                    format!("Failed to build runtime: {}", e),
                )
            }
        };
        let _ = buggify::take_stats();
        let mut result = runtime.block_on(self.run_scenario());
        result.fault_stats = buggify::take_stats();
        result
    }

    async fn run_scenario(&mut self) -> PipelineDSTResult {
        let log_store =
            SimulatedLogStore::new(self.rng.fork(), self.config.log_store_config.clone());
        let content = SimulatedContentStore::new(
            InMemoryContentStore::new(),
            self.rng.fork(),
            self.config.content_store_config.clone(),
        );
        let broker = ChannelBroker::new();

        let pipeline_config = PipelineConfig {
            topic_pattern: "sensors/#".to_string(),
            log: LogConfig {
                path: PathBuf::from(DST_LOG_NAME),
                fsync_policy: FsyncPolicy::Always,
                group_commit_max_entries: 8,
                ..LogConfig::default()
            },
            uploader: UploaderConfig {
                interval: self.config.upload_interval,
                timeout: Duration::from_secs(1),
                object_name: DST_LOG_NAME.to_string(),
            },
            backoff: BackoffConfig::fast(),
        };

        let pipeline = match Pipeline::start_with_rng(
            pipeline_config,
            broker.transport(),
            Arc::new(content.clone()),
            log_store.clone(),
            self.rng.fork(),
        ) {
            Ok(p) => p,
            Err(e) => {
                return PipelineDSTResult::setup_failure(
                    self.seed,
                    format!("Failed to start pipeline: {}", e),
                )
            }
        };

        let mut violations: Vec<String> = Vec::new();
        let collector = spawn_collector(pipeline.uploader().subscribe_results());

        if !broker.wait_for_subscribers(1, SETTLE_TIMEOUT).await {
            violations.push("subscriber never subscribed".to_string());
        }

        // Phase 1: concurrent producers, broker traffic, crash capture
        let acked: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let producers_done = CancellationToken::new();

        let crash_observer = if self.config.simulate_crash {
            let total = self.config.producers * self.config.messages_per_producer;
            let threshold = self.rng.gen_range(1, total as u64 + 1) as usize;
            let acked = Arc::clone(&acked);
            let inner = log_store.inner_store().clone();
            let done = producers_done.clone();
            Some(tokio::spawn(async move {
                loop {
                    let reached = acked.lock().len() >= threshold;
                    if reached || done.is_cancelled() {
                        // Acks first: anything acked by now is already synced
                        let acked = acked.lock().clone();
                        let image = inner.crash_image(DST_LOG_NAME).unwrap_or_default();
                        return CrashCapture { acked, image };
                    }
                    tokio::time::sleep(Duration::from_micros(200)).await;
                }
            }))
        } else {
            None
        };

        let mut producers = Vec::with_capacity(self.config.producers);
        for p in 0..self.config.producers {
            let log = pipeline.log().clone();
            let acked = Arc::clone(&acked);
            let mut rng = self.rng.fork();
            let count = self.config.messages_per_producer;
            producers.push(tokio::spawn(async move {
                let mut failed = 0usize;
                for i in 0..count {
                    let entry = LogEntry::new(
                        format!("{}{}", PRODUCER_TOPIC_PREFIX, p),
                        producer_payload(p, i),
                    );
                    match log.append(entry).await {
                        Ok(_) => acked.lock().push((p, i)),
                        Err(_) => failed += 1,
                    }
                    if rng.gen_bool(PRODUCER_YIELD_PROB) {
                        tokio::task::yield_now().await;
                    }
                }
                failed
            }));
        }

        let mut delivered: HashSet<usize> = HashSet::new();
        for i in 0..self.config.broker_messages {
            if self.rng.gen_bool(self.config.disconnect_prob) {
                broker.disconnect_all();
            }
            if broker.publish(BROKER_TOPIC, broker_payload(i)) > 0 {
                delivered.insert(i);
            }
            let pause = self.rng.gen_range(0, MAX_PUBLISH_PAUSE_US);
            tokio::time::sleep(Duration::from_micros(pause)).await;
        }

        let mut failed_appends = 0;
        for joined in futures::future::join_all(producers).await {
            match joined {
                Ok(failed) => failed_appends += failed,
                Err(e) => violations.push(format!("producer task panicked: {}", e)),
            }
        }
        producers_done.cancel();

        let delivered_count = delivered.len() as u64;
        if !wait_until(SETTLE_TIMEOUT, || {
            pipeline.subscriber_stats().received >= delivered_count
        })
        .await
        {
            violations.push(format!(
                "subscriber received {} of {} delivered messages",
                pipeline.subscriber_stats().received,
                delivered_count
            ));
        }
        wait_until(SETTLE_TIMEOUT, || {
            let stats = pipeline.uploader().stats();
            stats.succeeded + stats.failed >= 1
        })
        .await;

        // Phase 2: ordered shutdown
        let stats = pipeline.shutdown().await;

        let outcomes = match tokio::time::timeout(SETTLE_TIMEOUT, collector).await {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(e)) => {
                violations.push(format!("result collector panicked: {}", e));
                Vec::new()
            }
            Err(_) => {
                violations.push("results channel stayed open after shutdown".to_string());
                Vec::new()
            }
        };

        let crash = match crash_observer {
            Some(handle) => match handle.await {
                Ok(capture) => Some(capture),
                Err(e) => {
                    violations.push(format!("crash observer panicked: {}", e));
                    None
                }
            },
            None => None,
        };

        // Phase 3: verify
        let acked = acked.lock().clone();
        let data = log_store
            .inner_store()
            .get_file_data(DST_LOG_NAME)
            .unwrap_or_default();

        let final_entries = self.check_final_log(&data, &acked, &delivered, &mut violations);
        if let Some(log_stats) = &stats.log {
            if log_stats.entries as usize != final_entries {
                violations.push(format!(
                    "log reports {} entries, file holds {}",
                    log_stats.entries, final_entries
                ));
            }
        }

        let (uploads_succeeded, uploads_failed) =
            check_uploads(&data, &outcomes, &content, &mut violations);
        let content_store_stats = content.stats();
        if content_store_stats.max_in_flight > 1 {
            violations.push(format!(
                "{} uploads were in flight at once",
                content_store_stats.max_in_flight
            ));
        }

        let recovered_entries = match crash {
            Some(capture) => match self.check_recovery(capture) {
                Ok(n) => n,
                Err(msg) => {
                    violations.push(msg);
                    0
                }
            },
            None => 0,
        };

        let passed = violations.is_empty();
        let error_message = if passed {
            None
        } else {
            let shown: Vec<&str> = violations
                .iter()
                .take(MAX_REPORTED_VIOLATIONS)
                .map(String::as_str)
                .collect();
            Some(format!(
                "INVARIANT VIOLATION ({} total): {}",
                violations.len(),
                shown.join("; ")
            ))
        };

        PipelineDSTResult {
            seed: self.seed,
            acknowledged_appends: acked.len(),
            failed_appends,
            broker_published: self.config.broker_messages,
            broker_delivered: delivered.len(),
            final_entries,
            uploads_succeeded,
            uploads_failed,
            max_uploads_in_flight: content_store_stats.max_in_flight,
            recovered_entries,
            log_store_stats: log_store.stats(),
            content_store_stats,
            fault_stats: BuggifyStats::default(),
            passed,
            error_message,
        }
    }

    /// Whole entries only, no duplicates, per-source order, no acked loss.
    /// Returns the number of entries in the log.
    fn check_final_log(
        &self,
        data: &[u8],
        acked: &[(usize, usize)],
        delivered: &HashSet<usize>,
        violations: &mut Vec<String>,
    ) -> usize {
        let entries = decode_lines(data);
        let lines = data.iter().filter(|b| **b == b'\n').count();
        if entries.len() != lines || data.last().is_some_and(|b| *b != b'\n') {
            violations.push(format!(
                "log holds a partial or undecodable entry ({} lines, {} decoded)",
                lines,
                entries.len()
            ));
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());
        let mut last_by_producer: Vec<Option<usize>> = vec![None; self.config.producers];
        let mut last_broker: Option<usize> = None;

        for entry in &entries {
            let payload = entry.payload_text().into_owned();
            if let Some((p, i)) = parse_producer_payload(&payload) {
                match last_by_producer.get_mut(p) {
                    Some(last) => {
                        if last.is_some_and(|prev| prev >= i) {
                            violations.push(format!("producer {} entry {} out of order", p, i));
                        }
                        *last = Some(i);
                    }
                    None => violations.push(format!("entry from unknown producer {}", p)),
                }
            } else if let Some(i) = parse_broker_payload(&payload) {
                if last_broker.is_some_and(|prev| prev >= i) {
                    violations.push(format!("broker message {} out of order", i));
                }
                last_broker = Some(i);
                if !delivered.contains(&i) {
                    violations.push(format!("broker message {} logged but never delivered", i));
                }
            } else {
                violations.push(format!("unexpected payload '{}'", payload));
            }

            if !seen.insert(payload.clone()) {
                violations.push(format!("duplicate entry '{}'", payload));
            }
        }

        let missing: Vec<&(usize, usize)> = acked
            .iter()
            .filter(|(p, i)| !seen.contains(&producer_payload(*p, *i)))
            .collect();
        if !missing.is_empty() {
            violations.push(format!(
                "{} acknowledged appends missing (first: {:?})",
                missing.len(),
                missing.first()
            ));
        }

        entries.len()
    }

    /// Reopen a crash image (optionally with a torn tail appended) and check
    /// that every append acked before the image survives
    fn check_recovery(&mut self, capture: CrashCapture) -> Result<usize, String> {
        let mut image = capture.image;
        let intact_len = image.len();
        if self.rng.gen_bool(TORN_TAIL_PROB) {
            let torn = LogEntry::new(BROKER_TOPIC, "torn-write").encode_line();
            let cut = self.rng.gen_range(1, torn.len() as u64) as usize;
            image.extend_from_slice(&torn[..cut]);
        }

        let store = InMemoryLogStore::new();
        store.set_file_data(DST_LOG_NAME, image);
        let mut file = LogFile::open(store.clone(), DST_LOG_NAME)
            .map_err(|e| format!("Recovery failed: {}", e))?;
        let snapshot = file
            .snapshot()
            .map_err(|e| format!("Recovery snapshot failed: {}", e))?;

        if snapshot.len() != intact_len {
            return Err(format!(
                "recovery kept {} bytes, crash image had {} whole bytes",
                snapshot.len(),
                intact_len
            ));
        }

        let recovered = snapshot.entries();
        if recovered.len() as u64 != snapshot.entry_count() {
            return Err(format!(
                "recovered {} decodable entries, log counts {}",
                recovered.len(),
                snapshot.entry_count()
            ));
        }

        let payloads: HashSet<String> = recovered
            .iter()
            .map(|e| e.payload_text().into_owned())
            .collect();
        let missing = capture
            .acked
            .iter()
            .filter(|(p, i)| !payloads.contains(&producer_payload(*p, *i)))
            .count();
        if missing > 0 {
            return Err(format!(
                "{} appends acknowledged before the crash missing after recovery \
                 (acked: {}, recovered: {})",
                missing,
                capture.acked.len(),
                recovered.len()
            ));
        }

        Ok(recovered.len())
    }
}

/// Every successful upload is a prefix of the final log, and never shrinks
fn check_uploads(
    data: &[u8],
    outcomes: &[UploadOutcome],
    content: &SimulatedContentStore<InMemoryContentStore, SimulatedRng>,
    violations: &mut Vec<String>,
) -> (usize, usize) {
    let mut succeeded = 0;
    let mut failed = 0;
    let mut last_count = 0u64;

    let mut ordered: Vec<&UploadOutcome> = outcomes.iter().collect();
    ordered.sort_by_key(|o| match o {
        Ok(r) => r.cycle,
        Err(f) => f.cycle,
    });

    for outcome in ordered {
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        succeeded += 1;

        let Some(uploaded) = content.inner().get(&result.content_id) else {
            violations.push(format!(
                "upload {} reported {} but the store does not hold it",
                result.cycle, result.content_id
            ));
            continue;
        };
        if !data.starts_with(&uploaded) {
            violations.push(format!("upload {} is not a prefix of the log", result.cycle));
        }
        if decode_lines(&uploaded).len() as u64 != result.entry_count {
            violations.push(format!(
                "upload {} claims {} entries",
                result.cycle, result.entry_count
            ));
        }
        if result.entry_count < last_count {
            violations.push(format!(
                "upload {} holds {} entries, an earlier one held {}",
                result.cycle, result.entry_count, last_count
            ));
        }
        last_count = result.entry_count;
    }

    (succeeded, failed)
}

fn spawn_collector(
    mut rx: broadcast::Receiver<UploadOutcome>,
) -> tokio::task::JoinHandle<Vec<UploadOutcome>> {
    tokio::spawn(async move {
        let mut outcomes = Vec::new();
        loop {
            match rx.recv().await {
                Ok(outcome) => outcomes.push(outcome),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        outcomes
    })
}

async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    true
}

fn producer_payload(producer: usize, index: usize) -> String {
    format!("p{}-{:05}", producer, index)
}

fn parse_producer_payload(payload: &str) -> Option<(usize, usize)> {
    let (p, i) = payload.strip_prefix('p')?.split_once('-')?;
    Some((p.parse().ok()?, i.parse().ok()?))
}

fn broker_payload(index: usize) -> String {
    format!("b-{:05}", index)
}

fn parse_broker_payload(payload: &str) -> Option<usize> {
    payload.strip_prefix("b-")?.parse().ok()
}

/// Run a batch of DST scenarios across multiple seeds
pub fn run_pipeline_dst_batch(
    seeds: std::ops::Range<u64>,
    config: PipelineDSTConfig,
) -> Vec<PipelineDSTResult> {
    seeds
        .map(|seed| PipelineDSTHarness::new(seed, config.clone()).run())
        .collect()
}

/// Summarize batch results
pub fn summarize_pipeline_dst_batch(results: &[PipelineDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let acked: usize = results.iter().map(|r| r.acknowledged_appends).sum();
    let failed_appends: usize = results.iter().map(|r| r.failed_appends).sum();
    let uploads: usize = results.iter().map(|r| r.uploads_succeeded).sum();
    let upload_failures: usize = results.iter().map(|r| r.uploads_failed).sum();
    let recovered: usize = results.iter().map(|r| r.recovered_entries).sum();
    let faults: u64 = results.iter().map(|r| r.fault_stats.total_triggers()).sum();

    let mut summary = format!(
        "Pipeline DST Batch: {}/{} passed ({} failed)\n\
         Appends acked: {}, failed: {}; uploads ok: {}, failed: {}; recovered entries: {}\n\
         Faults injected: {}",
        passed,
        total,
        failed,
        acked,
        failed_appends,
        uploads,
        upload_failures,
        recovered,
        faults
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
            if !r.fault_stats.checks.is_empty() {
                summary.push_str(&format!("\n    faults: {}", r.fault_stats.summary()));
            }
        }
    }

    summary
}
