//! Log Actor - Group Commit and Snapshot Linearization
//!
//! One task owns the [`LogFile`]. Appends and snapshots are messages, so the
//! channel order is the log order and a snapshot can never interleave with an
//! append.
//!
//! ## Architecture
//!
//! ```text
//! Subscriber ──► Append ───┐
//! Subscriber ──► Append ───┤──► LogActor ──► write ──► fsync ──► resolve acks
//! Uploader ───► Snapshot ──┘         └──► flush pending batch ──► read committed prefix
//! ```
//!
//! ## Fsync Modes
//!
//! - **Always**: group commit. Drain up to `group_commit_max_entries`
//!   appends, fsync once, then resolve every ack. A failed fsync drops the
//!   whole batch from the file and fails every ack in it.
//! - **EverySecond**: write + ack immediately; fsync on a timer tick.
//! - **No**: write + ack immediately; OS decides when to flush.

use super::config::{FsyncPolicy, LogConfig};
use super::entry::LogEntry;
use super::file::{LogFile, LogStats, Snapshot};
use super::store::{LogError, LogStore};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Messages for the log actor
pub enum LogMessage {
    /// Append one entry. Acked with the entry's sequence number once the
    /// fsync policy is satisfied.
    Append {
        entry: LogEntry,
        ack_tx: oneshot::Sender<Result<u64, LogError>>,
    },
    /// Copy of the committed log
    Snapshot {
        response_tx: oneshot::Sender<Result<Snapshot, LogError>>,
    },
    /// Periodic fsync tick (EverySecond mode)
    SyncTick,
    Stats {
        response_tx: oneshot::Sender<LogStats>,
    },
    /// Final flush, then stop
    Shutdown { response_tx: oneshot::Sender<()> },
}

/// Actor that owns the log file and processes messages
pub struct LogActor<S: LogStore> {
    file: LogFile<S>,
    config: LogConfig,
    rx: mpsc::UnboundedReceiver<LogMessage>,
    /// Acks waiting on the next group-commit fsync (Always mode only)
    pending_acks: Vec<(u64, oneshot::Sender<Result<u64, LogError>>)>,
}

impl<S: LogStore> LogActor<S> {
    fn new(file: LogFile<S>, config: LogConfig, rx: mpsc::UnboundedReceiver<LogMessage>) -> Self {
        let capacity = config.group_commit_max_entries;
        LogActor {
            file,
            config,
            rx,
            pending_acks: Vec::with_capacity(capacity),
        }
    }

    /// Run the actor loop until shutdown (or until every handle is gone)
    pub async fn run(mut self) {
        loop {
            let msg = match self.rx.recv().await {
                Some(msg) => msg,
                None => break,
            };
            if self.handle_message(msg) {
                return;
            }

            // Drain whatever else is already queued into the same batch
            while self.pending_acks.len() < self.config.group_commit_max_entries {
                match self.rx.try_recv() {
                    Ok(msg) => {
                        if self.handle_message(msg) {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }

            self.flush_group_commit();
        }

        self.final_sync();
        info!(file = self.file.name(), "Log actor stopped (all handles dropped)");
    }

    /// Handle one message. Returns true on shutdown.
    fn handle_message(&mut self, msg: LogMessage) -> bool {
        match msg {
            LogMessage::Append { entry, ack_tx } => {
                self.handle_append(entry, ack_tx);
                false
            }
            LogMessage::Snapshot { response_tx } => {
                // Everything appended before this message belongs in the snapshot
                self.flush_group_commit();
                let result = self.file.snapshot();
                if let Err(e) = &result {
                    error!(file = self.file.name(), error = %e, "Log snapshot failed");
                }
                let _ = response_tx.send(result);
                false
            }
            LogMessage::SyncTick => {
                if self.config.fsync_policy == FsyncPolicy::EverySecond {
                    if let Err(e) = self.file.sync() {
                        error!(file = self.file.name(), error = %e, "Periodic log fsync failed");
                    }
                }
                false
            }
            LogMessage::Stats { response_tx } => {
                let _ = response_tx.send(self.file.stats());
                false
            }
            LogMessage::Shutdown { response_tx } => {
                self.flush_group_commit();
                self.final_sync();
                info!(
                    file = self.file.name(),
                    entries = self.file.committed_count(),
                    "Log actor shutting down"
                );
                let _ = response_tx.send(());
                true
            }
        }
    }

    fn handle_append(&mut self, entry: LogEntry, ack_tx: oneshot::Sender<Result<u64, LogError>>) {
        match self.file.write_entry(&entry) {
            Ok(seq) => match self.config.fsync_policy {
                FsyncPolicy::Always => self.pending_acks.push((seq, ack_tx)),
                FsyncPolicy::EverySecond | FsyncPolicy::No => {
                    self.file.commit();
                    let _ = ack_tx.send(Ok(seq));
                }
            },
            Err(e) => {
                let _ = ack_tx.send(Err(e));
            }
        }
    }

    /// Fsync and resolve all pending acks (group commit flush)
    fn flush_group_commit(&mut self) {
        if self.pending_acks.is_empty() {
            return;
        }

        let acks = std::mem::take(&mut self.pending_acks);
        match self.file.sync_and_commit() {
            Ok(()) => {
                debug!(batch = acks.len(), "Group commit flushed");
                for (seq, tx) in acks {
                    let _ = tx.send(Ok(seq));
                }
            }
            Err(e) => {
                // Nothing in this batch is durable; take it back out of the file
                let err_msg = e.to_string();
                error!(
                    file = self.file.name(),
                    batch = acks.len(),
                    error = %err_msg,
                    "Log fsync failed, dropping batch"
                );
                if let Err(rollback_err) = self.file.rollback_uncommitted() {
                    error!(
                        file = self.file.name(),
                        error = %rollback_err,
                        "Rollback of failed batch did not complete"
                    );
                }
                for (_, tx) in acks {
                    let _ = tx.send(Err(LogError::FsyncFailed(err_msg.clone())));
                }
            }
        }
    }

    fn final_sync(&mut self) {
        if let Err(e) = self.file.sync() {
            error!(file = self.file.name(), error = %e, "Final log fsync failed");
        }
    }
}

// ============================================================================
// LogHandle - public interface to the log actor
// ============================================================================

/// Cheap-to-clone handle to the log actor
#[derive(Clone)]
pub struct LogHandle {
    tx: mpsc::UnboundedSender<LogMessage>,
    fsync_policy: FsyncPolicy,
}

impl LogHandle {
    /// Append an entry. Resolves once the entry is written (and fsynced in
    /// Always mode). Returns the entry's sequence number.
    pub async fn append(&self, entry: LogEntry) -> Result<u64, LogError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(LogMessage::Append { entry, ack_tx })
            .map_err(|_| LogError::Closed)?;
        ack_rx.await.unwrap_or(Err(LogError::Closed))
    }

    /// Copy of the committed log, atomic with respect to concurrent appends
    pub async fn snapshot(&self) -> Result<Snapshot, LogError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(LogMessage::Snapshot { response_tx })
            .map_err(|_| LogError::Closed)?;
        response_rx.await.unwrap_or(Err(LogError::Closed))
    }

    pub async fn stats(&self) -> Result<LogStats, LogError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(LogMessage::Stats { response_tx })
            .map_err(|_| LogError::Closed)?;
        response_rx.await.map_err(|_| LogError::Closed)
    }

    /// Send a periodic sync tick. Returns false once the actor is gone.
    pub fn sync_tick(&self) -> bool {
        self.tx.send(LogMessage::SyncTick).is_ok()
    }

    /// Graceful shutdown: waits for the final flush
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(LogMessage::Shutdown { response_tx }).is_ok() {
            let _ = response_rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn fsync_policy(&self) -> FsyncPolicy {
        self.fsync_policy
    }
}

/// Open the log (recovering a torn tail), spawn its actor, and return the
/// handle plus the actor's join handle.
pub fn spawn_log_actor<S: LogStore>(
    store: S,
    config: LogConfig,
) -> Result<(LogHandle, tokio::task::JoinHandle<()>), LogError> {
    let file = LogFile::open(store, &config.file_name())?;
    let (tx, rx) = mpsc::unbounded_channel();

    let fsync_policy = config.fsync_policy;
    let sync_interval = config.sync_interval;
    info!(
        file = file.name(),
        entries = file.committed_count(),
        fsync = %fsync_policy,
        "Log opened"
    );

    if fsync_policy == FsyncPolicy::EverySecond {
        // Weak sender: the ticker alone must not keep the actor alive
        let weak_tx = tx.downgrade();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sync_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(tx) = weak_tx.upgrade() else {
                    break;
                };
                if tx.send(LogMessage::SyncTick).is_err() {
                    break;
                }
            }
        });
    }

    let actor = LogActor::new(file, config, rx);
    let task = tokio::spawn(actor.run());

    Ok((LogHandle { tx, fsync_policy }, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::log::store::{InMemoryLogStore, SimulatedLogStore, SimulatedLogStoreConfig};
    use std::time::Duration;

    #[tokio::test]
    async fn test_log_actor_always_mode() {
        let store = InMemoryLogStore::new();
        let (handle, task) =
            spawn_log_actor(store.clone(), LogConfig::with_policy(FsyncPolicy::Always)).unwrap();

        for i in 0..10 {
            let seq = handle
                .append(LogEntry::new(format!("sensors/{}", i), "v"))
                .await
                .unwrap();
            assert_eq!(seq, i + 1);
        }

        // Acked entries are already durable in Always mode
        let data = store.get_file_data("mqtt_logs.txt").unwrap();
        assert_eq!(store.synced_len("mqtt_logs.txt"), Some(data.len()));

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_log_actor_everysec_mode() {
        let store = InMemoryLogStore::new();
        let (handle, task) =
            spawn_log_actor(store.clone(), LogConfig::with_policy(FsyncPolicy::EverySecond))
                .unwrap();

        for _ in 0..5 {
            handle.append(LogEntry::new("sensors/temp", "21.5")).await.unwrap();
        }

        assert!(handle.sync_tick());
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.entries, 5);
        assert!(stats.fsyncs >= 1);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_log_actor_no_mode_snapshot_sees_acked() {
        let (handle, task) =
            spawn_log_actor(InMemoryLogStore::new(), LogConfig::with_policy(FsyncPolicy::No))
                .unwrap();

        handle.append(LogEntry::new("a", "1")).await.unwrap();
        handle.append(LogEntry::new("b", "2")).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.entry_count(), 2);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_group_commit_concurrent_appends() {
        let store = InMemoryLogStore::new();
        let (handle, task) =
            spawn_log_actor(store.clone(), LogConfig::with_policy(FsyncPolicy::Always)).unwrap();

        let mut join_handles = Vec::new();
        for i in 0..50 {
            let h = handle.clone();
            join_handles.push(tokio::spawn(async move {
                h.append(LogEntry::new(format!("sensors/{}", i), i.to_string()))
                    .await
            }));
        }

        let mut seqs = Vec::new();
        for jh in join_handles {
            seqs.push(jh.await.unwrap().unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=50).collect::<Vec<u64>>());

        let snapshot = handle.snapshot().await.unwrap();
        let mut topics: Vec<String> = snapshot.entries().into_iter().map(|e| e.topic).collect();
        topics.sort();
        topics.dedup();
        assert_eq!(topics.len(), 50);

        // Batching means fewer fsyncs than appends is possible, never more
        let stats = handle.stats().await.unwrap();
        assert!(stats.fsyncs <= 50);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_fsync_failure_fails_batch() {
        let store = SimulatedLogStore::new(
            SimulatedRng::new(9),
            SimulatedLogStoreConfig {
                fsync_fail_prob: 1.0,
                ..SimulatedLogStoreConfig::no_faults()
            },
        );
        let (handle, task) =
            spawn_log_actor(store.clone(), LogConfig::with_policy(FsyncPolicy::Always)).unwrap();

        let result = handle.append(LogEntry::new("a", "1")).await;
        assert!(matches!(result, Err(LogError::FsyncFailed(_))));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.entry_count(), 0);
        assert!(store
            .inner_store()
            .get_file_data("mqtt_logs.txt")
            .unwrap()
            .is_empty());

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_closed() {
        let (handle, task) =
            spawn_log_actor(InMemoryLogStore::new(), LogConfig::test()).unwrap();
        handle.shutdown().await;
        task.await.unwrap();

        assert!(matches!(
            handle.append(LogEntry::new("a", "1")).await,
            Err(LogError::Closed)
        ));
        assert!(matches!(handle.snapshot().await, Err(LogError::Closed)));
        assert!(matches!(handle.stats().await, Err(LogError::Closed)));
        assert!(!handle.sync_tick());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_actor_stops_when_handles_dropped() {
        let (handle, task) = spawn_log_actor(
            InMemoryLogStore::new(),
            LogConfig::with_policy(FsyncPolicy::EverySecond),
        )
        .unwrap();
        handle.append(LogEntry::new("a", "1")).await.unwrap();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("actor should stop once every handle is dropped")
            .unwrap();
    }
}
