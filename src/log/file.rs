//! Log File - Recovery, Append With Rollback, Snapshot
//!
//! ```text
//! 0                       committed_len        written_len
//! ├── committed entries ──────┤── pending batch ──┤
//!                             └ rollback target on failure
//! ```
//!
//! Only the committed prefix is ever handed out as a snapshot. A failed write
//! cuts the file back to `written_len`; a failed group-commit fsync cuts it
//! back to `committed_len`. Either way the file always ends on a line
//! boundary once the failing call returns.

use super::entry::LogEntry;
use super::store::{LogError, LogFileReader, LogFileWriter, LogStore};
use bytes::Bytes;
use chrono::{DateTime, Local};
use std::io::{Error as IoError, ErrorKind};
use tracing::{error, warn};

/// Immutable byte-exact copy of the committed log
#[derive(Debug, Clone)]
pub struct Snapshot {
    data: Bytes,
    entry_count: u64,
    taken_at: DateTime<Local>,
}

impl Snapshot {
    pub fn new(data: Bytes, entry_count: u64, taken_at: DateTime<Local>) -> Self {
        Snapshot {
            data,
            entry_count,
            taken_at,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn taken_at(&self) -> DateTime<Local> {
        self.taken_at
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode the snapshot back into entries
    pub fn entries(&self) -> Vec<LogEntry> {
        super::entry::decode_lines(&self.data)
    }
}

/// Counters kept by the log file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Entries in the committed prefix
    pub entries: u64,
    /// Bytes in the committed prefix
    pub bytes: u64,
    pub fsyncs: u64,
    pub fsync_failures: u64,
    pub write_failures: u64,
    /// Truncations performed to drop torn or uncommitted data
    pub rollbacks: u64,
    /// Bytes of torn tail dropped when the file was opened
    pub recovered_tail_bytes: u64,
    pub snapshots: u64,
}

/// Single append-only log file on top of a [`LogStore`]
pub struct LogFile<S: LogStore> {
    store: S,
    name: String,
    writer: S::Writer,
    written_len: u64,
    written_count: u64,
    committed_len: u64,
    committed_count: u64,
    /// Set when a rollback truncate failed; the next write retries it first
    needs_repair: bool,
    stats: LogStats,
}

impl<S: LogStore> LogFile<S> {
    /// Open (or create) the log, dropping any torn tail left by a crash.
    pub fn open(store: S, name: &str) -> Result<Self, LogError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let mut writer = store.open_append(name)?;
        let mut stats = LogStats::default();
        let mut len = writer.size();
        let mut count = 0u64;

        if len > 0 {
            let data = store.open_read(name)?.read_all()?;
            let keep = data
                .iter()
                .rposition(|b| *b == b'\n')
                .map(|pos| pos + 1)
                .unwrap_or(0);

            if keep < data.len() {
                let dropped = (data.len() - keep) as u64;
                warn!(
                    file = name,
                    dropped_bytes = dropped,
                    "Truncating torn tail left by an interrupted append"
                );
                writer.truncate(keep as u64)?;
                writer.sync()?;
                stats.recovered_tail_bytes = dropped;
                stats.rollbacks = 1;
            }

            count = data[..keep].iter().filter(|b| **b == b'\n').count() as u64;
            len = keep as u64;
        }

        stats.entries = count;
        stats.bytes = len;

        Ok(LogFile {
            store,
            name: name.to_string(),
            writer,
            written_len: len,
            written_count: count,
            committed_len: len,
            committed_count: count,
            needs_repair: false,
            stats,
        })
    }

    /// Write one entry through to the file. Returns its 1-based sequence.
    ///
    /// On error nothing of the entry remains in the file.
    pub fn write_entry(&mut self, entry: &LogEntry) -> Result<u64, LogError> {
        if self.needs_repair {
            self.rollback_to(self.written_len)?;
        }

        let line = entry.encode_line();
        match self.writer.append(&line) {
            Ok(size) => {
                debug_assert_eq!(
                    size,
                    self.written_len + line.len() as u64,
                    "Postcondition: file grows by exactly one line"
                );
                self.written_len = size;
                self.written_count += 1;
                Ok(self.written_count)
            }
            Err(e) => {
                self.stats.write_failures += 1;
                if let Err(rollback_err) = self.rollback_to(self.written_len) {
                    error!(
                        file = %self.name,
                        error = %rollback_err,
                        "Rollback after failed append did not complete"
                    );
                }
                Err(e)
            }
        }
    }

    /// Fsync everything written so far and mark it committed.
    pub fn sync_and_commit(&mut self) -> Result<(), LogError> {
        match self.writer.sync() {
            Ok(()) => {
                self.stats.fsyncs += 1;
                self.commit();
                Ok(())
            }
            Err(e) => {
                self.stats.fsync_failures += 1;
                Err(e)
            }
        }
    }

    /// Fsync without touching the committed boundary (periodic sync).
    pub fn sync(&mut self) -> Result<(), LogError> {
        match self.writer.sync() {
            Ok(()) => {
                self.stats.fsyncs += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.fsync_failures += 1;
                Err(e)
            }
        }
    }

    /// Mark everything written so far as committed (no fsync).
    pub fn commit(&mut self) {
        self.committed_len = self.written_len;
        self.committed_count = self.written_count;
        self.stats.entries = self.committed_count;
        self.stats.bytes = self.committed_len;
    }

    /// Drop every entry written since the last commit.
    /// Returns how many entries were dropped.
    pub fn rollback_uncommitted(&mut self) -> Result<u64, LogError> {
        let dropped = self.written_count - self.committed_count;
        self.written_len = self.committed_len;
        self.written_count = self.committed_count;
        self.rollback_to(self.committed_len)?;
        Ok(dropped)
    }

    fn rollback_to(&mut self, len: u64) -> Result<(), LogError> {
        if self.writer.size() == len && !self.needs_repair {
            return Ok(());
        }
        match self.writer.truncate(len) {
            Ok(()) => {
                self.needs_repair = false;
                self.stats.rollbacks += 1;
                Ok(())
            }
            Err(e) => {
                self.needs_repair = true;
                Err(e)
            }
        }
    }

    /// Byte-exact copy of the committed prefix
    pub fn snapshot(&mut self) -> Result<Snapshot, LogError> {
        let mut data = self.store.open_read(&self.name)?.read_all()?;
        let committed = self.committed_len as usize;
        if data.len() < committed {
            return Err(LogError::Io(IoError::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "log shorter than committed length: {} < {}",
                    data.len(),
                    committed
                ),
            )));
        }
        data.truncate(committed);
        self.stats.snapshots += 1;

        Ok(Snapshot::new(
            Bytes::from(data),
            self.committed_count,
            Local::now(),
        ))
    }

    pub fn has_uncommitted(&self) -> bool {
        self.written_count > self.committed_count
    }

    pub fn committed_count(&self) -> u64 {
        self.committed_count
    }

    pub fn stats(&self) -> LogStats {
        self.stats.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::log::store::{InMemoryLogStore, SimulatedLogStore, SimulatedLogStoreConfig};

    fn entry(topic: &str, payload: &str) -> LogEntry {
        LogEntry::new(topic, payload.to_string())
    }

    #[test]
    fn test_write_commit_snapshot() {
        let store = InMemoryLogStore::new();
        let mut log = LogFile::open(store.clone(), "log.txt").unwrap();

        assert_eq!(log.write_entry(&entry("sensors/temp", "21.5")).unwrap(), 1);
        assert_eq!(log.write_entry(&entry("sensors/humidity", "60")).unwrap(), 2);
        log.sync_and_commit().unwrap();

        let snapshot = log.snapshot().unwrap();
        assert_eq!(snapshot.entry_count(), 2);
        let entries = snapshot.entries();
        assert_eq!(entries[0].topic, "sensors/temp");
        assert_eq!(entries[1].topic, "sensors/humidity");
        assert_eq!(store.synced_len("log.txt"), Some(snapshot.len()));
    }

    #[test]
    fn test_snapshot_excludes_uncommitted() {
        let mut log = LogFile::open(InMemoryLogStore::new(), "log.txt").unwrap();
        log.write_entry(&entry("a", "1")).unwrap();
        log.commit();
        log.write_entry(&entry("b", "2")).unwrap();

        let snapshot = log.snapshot().unwrap();
        assert_eq!(snapshot.entry_count(), 1);
        assert_eq!(snapshot.entries().len(), 1);
        assert!(log.has_uncommitted());
    }

    #[test]
    fn test_empty_log_snapshot() {
        let mut log = LogFile::open(InMemoryLogStore::new(), "log.txt").unwrap();
        let snapshot = log.snapshot().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.entry_count(), 0);
    }

    #[test]
    fn test_open_truncates_torn_tail() {
        let store = InMemoryLogStore::new();
        let whole = entry("s/a", "1").encode_line();
        let mut data = whole.clone();
        data.extend_from_slice(b"[2026-10-16 12:00:0");
        store.set_file_data("log.txt", data);

        let mut log = LogFile::open(store.clone(), "log.txt").unwrap();
        assert_eq!(log.committed_count(), 1);
        assert_eq!(log.stats().recovered_tail_bytes, 19);
        assert_eq!(store.get_file_data("log.txt").unwrap(), whole);

        log.write_entry(&entry("s/b", "2")).unwrap();
        log.commit();
        assert_eq!(log.snapshot().unwrap().entries().len(), 2);
    }

    #[test]
    fn test_open_without_any_newline_drops_everything() {
        let store = InMemoryLogStore::new();
        store.set_file_data("log.txt", b"[2026-10-16 12:0".to_vec());

        let log = LogFile::open(store.clone(), "log.txt").unwrap();
        assert_eq!(log.committed_count(), 0);
        assert!(store.get_file_data("log.txt").unwrap().is_empty());
    }

    #[test]
    fn test_partial_write_rolled_back() {
        let store = SimulatedLogStore::new(
            SimulatedRng::new(3),
            SimulatedLogStoreConfig {
                partial_write_prob: 1.0,
                ..SimulatedLogStoreConfig::no_faults()
            },
        );
        let mut log = LogFile::open(store.clone(), "log.txt").unwrap();

        let result = log.write_entry(&entry("s/a", "payload"));
        assert!(matches!(result, Err(LogError::PartialWrite { .. })));
        assert!(store.inner_store().get_file_data("log.txt").unwrap().is_empty());
        assert_eq!(log.stats().write_failures, 1);
        assert_eq!(log.stats().rollbacks, 1);
    }

    #[test]
    fn test_rollback_uncommitted_after_fsync_failure() {
        let store = SimulatedLogStore::new(
            SimulatedRng::new(5),
            SimulatedLogStoreConfig {
                fsync_fail_prob: 1.0,
                ..SimulatedLogStoreConfig::no_faults()
            },
        );
        let mut log = LogFile::open(store.clone(), "log.txt").unwrap();
        log.write_entry(&entry("s/a", "1")).unwrap();
        log.write_entry(&entry("s/b", "2")).unwrap();

        assert!(log.sync_and_commit().is_err());
        assert_eq!(log.rollback_uncommitted().unwrap(), 2);
        assert_eq!(log.committed_count(), 0);
        assert!(store.inner_store().get_file_data("log.txt").unwrap().is_empty());

        // Sequence numbers restart after the dropped batch
        assert_eq!(log.write_entry(&entry("s/c", "3")).unwrap(), 1);
    }

    #[test]
    fn test_crash_after_sync_recovers_synced_entries() {
        let store = InMemoryLogStore::new();
        {
            let mut log = LogFile::open(store.clone(), "log.txt").unwrap();
            log.write_entry(&entry("s/a", "1")).unwrap();
            log.sync_and_commit().unwrap();
            log.write_entry(&entry("s/b", "2")).unwrap();
        }
        store.simulate_crash();

        let mut log = LogFile::open(store, "log.txt").unwrap();
        let entries = log.snapshot().unwrap().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].topic, "s/a");
    }
}
