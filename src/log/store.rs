//! Log Storage Abstraction
//!
//! Trait-based file operations for the durable log. The actor only ever talks
//! to a [`LogStore`], so the same append/recovery code runs against the real
//! filesystem, an in-memory buffer, or a fault-injecting simulation.
//!
//! ## Implementations
//!
//! - `InMemoryLogStore`: unit tests and DST (tracks the synced position so a
//!   crash can be simulated)
//! - `LocalLogStore`: production (std::fs::File in append mode + sync_all)
//! - `SimulatedLogStore`: DST with buggify fault injection

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Error type for log operations
#[derive(Debug)]
pub enum LogError {
    /// I/O error
    Io(IoError),
    /// Log file not found
    NotFound(String),
    /// Disk full
    DiskFull,
    /// Fsync failed
    FsyncFailed(String),
    /// Write stopped part-way through an entry
    PartialWrite { expected: usize, actual: usize },
    /// The log actor is no longer running
    Closed,
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Io(e) => write!(f, "log I/O error: {}", e),
            LogError::NotFound(name) => write!(f, "log file not found: {}", name),
            LogError::DiskFull => write!(f, "log disk full"),
            LogError::FsyncFailed(msg) => write!(f, "log fsync failed: {}", msg),
            LogError::PartialWrite { expected, actual } => {
                write!(
                    f,
                    "log partial write: expected {} bytes, wrote {}",
                    expected, actual
                )
            }
            LogError::Closed => write!(f, "log is closed"),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for LogError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => LogError::NotFound(e.to_string()),
            _ if e.to_string().contains("No space left") => LogError::DiskFull,
            _ => LogError::Io(e),
        }
    }
}

/// Writer half of a log file
pub trait LogFileWriter: Send {
    /// Append bytes at the end of the file. Returns the size after the write.
    fn append(&mut self, data: &[u8]) -> Result<u64, LogError>;
    /// Fsync the file to durable storage.
    fn sync(&mut self) -> Result<(), LogError>;
    /// Cut the file back to `len` bytes (torn-write rollback and recovery).
    fn truncate(&mut self, len: u64) -> Result<(), LogError>;
    /// Current size of the file in bytes.
    fn size(&self) -> u64;
}

/// Reader half of a log file
pub trait LogFileReader: Send {
    /// Read the entire file contents.
    fn read_all(&mut self) -> Result<Vec<u8>, LogError>;
}

/// Storage backend for the log
pub trait LogStore: Send + Sync + 'static {
    type Writer: LogFileWriter;
    type Reader: LogFileReader;

    /// Open a log file for appending, creating it if missing.
    /// Existing content is kept.
    fn open_append(&self, name: &str) -> Result<Self::Writer, LogError>;
    /// Open an existing log file for reading.
    fn open_read(&self, name: &str) -> Result<Self::Reader, LogError>;
    /// Check if a log file exists.
    fn exists(&self, name: &str) -> Result<bool, LogError>;
}

// ============================================================================
// InMemoryLogStore - For unit tests and DST
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InMemoryFile {
    data: Vec<u8>,
    /// Position up to which data is "synced" (durable)
    synced_pos: usize,
}

/// In-memory log store for unit tests and deterministic simulation
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStore {
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of a file
    pub fn get_file_data(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|f| f.data.clone())
    }

    /// Replace the raw bytes of a file (creating it). The new content counts
    /// as synced.
    pub fn set_file_data(&self, name: &str, data: Vec<u8>) {
        let synced_pos = data.len();
        self.files
            .lock()
            .insert(name.to_string(), InMemoryFile { data, synced_pos });
    }

    /// Number of bytes that would survive a crash
    pub fn synced_len(&self, name: &str) -> Option<usize> {
        self.files.lock().get(name).map(|f| f.synced_pos)
    }

    /// What a crash right now would leave of `name`, without disturbing the
    /// live file
    pub fn crash_image(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .get(name)
            .map(|f| f.data[..f.synced_pos].to_vec())
    }

    /// Simulate a crash: truncate all files to their synced position.
    /// Un-synced data is lost (as it would be in a real crash).
    pub fn simulate_crash(&self) {
        for file in self.files.lock().values_mut() {
            file.data.truncate(file.synced_pos);
        }
    }
}

/// In-memory log file writer
pub struct InMemoryLogWriter {
    name: String,
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
    current_size: u64,
}

impl InMemoryLogWriter {
    fn with_file<T>(&self, f: impl FnOnce(&mut InMemoryFile) -> T) -> Result<T, LogError> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| LogError::NotFound(self.name.clone()))?;
        Ok(f(file))
    }
}

impl LogFileWriter for InMemoryLogWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, LogError> {
        debug_assert!(!data.is_empty(), "Precondition: data must not be empty");

        let len = self.with_file(|file| {
            file.data.extend_from_slice(data);
            file.data.len()
        })?;
        self.current_size = len as u64;
        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), LogError> {
        self.with_file(|file| file.synced_pos = file.data.len())
    }

    fn truncate(&mut self, len: u64) -> Result<(), LogError> {
        let len = len as usize;
        let new_size = self.with_file(|file| {
            file.data.truncate(len);
            file.synced_pos = file.synced_pos.min(file.data.len());
            file.data.len()
        })?;
        self.current_size = new_size as u64;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

/// In-memory log file reader
pub struct InMemoryLogReader {
    data: Vec<u8>,
}

impl LogFileReader for InMemoryLogReader {
    fn read_all(&mut self) -> Result<Vec<u8>, LogError> {
        Ok(std::mem::take(&mut self.data))
    }
}

impl LogStore for InMemoryLogStore {
    type Writer = InMemoryLogWriter;
    type Reader = InMemoryLogReader;

    fn open_append(&self, name: &str) -> Result<Self::Writer, LogError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let mut files = self.files.lock();
        let file = files.entry(name.to_string()).or_default();
        let current_size = file.data.len() as u64;

        Ok(InMemoryLogWriter {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            current_size,
        })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, LogError> {
        let files = self.files.lock();
        let file = files
            .get(name)
            .ok_or_else(|| LogError::NotFound(name.to_string()))?;
        Ok(InMemoryLogReader {
            data: file.data.clone(),
        })
    }

    fn exists(&self, name: &str) -> Result<bool, LogError> {
        Ok(self.files.lock().contains_key(name))
    }
}

// ============================================================================
// LocalLogStore - For production
// ============================================================================

/// Local filesystem log store using std::fs::File + sync_all()
#[derive(Debug, Clone)]
pub struct LocalLogStore {
    dir: PathBuf,
}

impl LocalLogStore {
    /// Create a store rooted at `dir`. Creates the directory if it doesn't exist.
    pub fn new(dir: PathBuf) -> Result<Self, LogError> {
        std::fs::create_dir_all(&dir)?;
        Ok(LocalLogStore { dir })
    }

    /// Split a log file path into a store for its directory plus the file name.
    pub fn for_file(path: &Path) -> Result<(Self, String), LogError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LogError::NotFound(path.display().to_string()))?
            .to_string();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((Self::new(dir)?, name))
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Local filesystem log file writer
pub struct LocalLogWriter {
    file: std::fs::File,
    current_size: u64,
}

impl LogFileWriter for LocalLogWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, LogError> {
        debug_assert!(!data.is_empty(), "Precondition: data must not be empty");

        if let Err(e) = self.file.write_all(data) {
            // Unknown how much landed; the caller rolls back to its committed length
            if let Ok(meta) = self.file.metadata() {
                self.current_size = meta.len();
            }
            return Err(e.into());
        }
        self.current_size = self.current_size.saturating_add(data.len() as u64);

        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), LogError> {
        self.file
            .sync_all()
            .map_err(|e| LogError::FsyncFailed(e.to_string()))
    }

    fn truncate(&mut self, len: u64) -> Result<(), LogError> {
        self.file.set_len(len)?;
        self.current_size = len;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

/// Local filesystem log file reader
pub struct LocalLogReader {
    path: PathBuf,
}

impl LogFileReader for LocalLogReader {
    fn read_all(&mut self) -> Result<Vec<u8>, LogError> {
        std::fs::read(&self.path).map_err(LogError::from)
    }
}

impl LogStore for LocalLogStore {
    type Writer = LocalLogWriter;
    type Reader = LocalLogReader;

    fn open_append(&self, name: &str) -> Result<Self::Writer, LogError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(name))?;
        let current_size = file.metadata()?.len();
        Ok(LocalLogWriter { file, current_size })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, LogError> {
        let path = self.file_path(name);
        if !path.exists() {
            return Err(LogError::NotFound(name.to_string()));
        }
        Ok(LocalLogReader { path })
    }

    fn exists(&self, name: &str) -> Result<bool, LogError> {
        Ok(self.file_path(name).exists())
    }
}

// ============================================================================
// SimulatedLogStore - For DST with buggify fault injection
// ============================================================================

use crate::buggify::faults::log_store as log_faults;
use crate::io::Rng;

/// Configuration for simulated log fault injection
#[derive(Debug, Clone)]
pub struct SimulatedLogStoreConfig {
    pub write_fail_prob: f64,
    pub partial_write_prob: f64,
    pub fsync_fail_prob: f64,
    pub disk_full_prob: f64,
    pub read_fail_prob: f64,
}

impl Default for SimulatedLogStoreConfig {
    fn default() -> Self {
        SimulatedLogStoreConfig {
            write_fail_prob: 0.01,
            partial_write_prob: 0.005,
            fsync_fail_prob: 0.005,
            disk_full_prob: 0.001,
            read_fail_prob: 0.01,
        }
    }
}

impl SimulatedLogStoreConfig {
    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedLogStoreConfig {
            write_fail_prob: 0.0,
            partial_write_prob: 0.0,
            fsync_fail_prob: 0.0,
            disk_full_prob: 0.0,
            read_fail_prob: 0.0,
        }
    }

    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedLogStoreConfig {
            write_fail_prob: 0.05,
            partial_write_prob: 0.03,
            fsync_fail_prob: 0.02,
            disk_full_prob: 0.005,
            read_fail_prob: 0.05,
        }
    }
}

/// Statistics for log fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedLogStoreStats {
    pub write_attempts: u64,
    pub write_failures: u64,
    pub partial_writes: u64,
    pub sync_attempts: u64,
    pub sync_failures: u64,
    pub read_attempts: u64,
    pub read_failures: u64,
    pub disk_full_errors: u64,
}

struct SimulatedLogStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedLogStoreStats,
}

/// Simulated log store wrapping InMemoryLogStore with fault injection
pub struct SimulatedLogStore<R: Rng> {
    inner: InMemoryLogStore,
    config: SimulatedLogStoreConfig,
    state: Arc<Mutex<SimulatedLogStoreInner<R>>>,
}

impl<R: Rng> SimulatedLogStore<R> {
    pub fn new(rng: R, config: SimulatedLogStoreConfig) -> Self {
        SimulatedLogStore {
            inner: InMemoryLogStore::new(),
            config,
            state: Arc::new(Mutex::new(SimulatedLogStoreInner {
                rng,
                stats: SimulatedLogStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedLogStoreStats {
        self.state.lock().stats.clone()
    }

    /// Underlying in-memory store (for crash simulation)
    pub fn inner_store(&self) -> &InMemoryLogStore {
        &self.inner
    }
}

impl<R: Rng> Clone for SimulatedLogStore<R> {
    fn clone(&self) -> Self {
        SimulatedLogStore {
            inner: self.inner.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Simulated log file writer with fault injection
pub struct SimulatedLogWriter<R: Rng> {
    inner: InMemoryLogWriter,
    config: SimulatedLogStoreConfig,
    state: Arc<Mutex<SimulatedLogStoreInner<R>>>,
}

impl<R: Rng> LogFileWriter for SimulatedLogWriter<R> {
    fn append(&mut self, data: &[u8]) -> Result<u64, LogError> {
        {
            let mut guard = self.state.lock();
            let s = &mut *guard;
            s.stats.write_attempts = s.stats.write_attempts.saturating_add(1);

            if crate::buggify!(&mut s.rng, log_faults::DISK_FULL, self.config.disk_full_prob) {
                s.stats.disk_full_errors = s.stats.disk_full_errors.saturating_add(1);
                return Err(LogError::DiskFull);
            }

            if crate::buggify!(&mut s.rng, log_faults::WRITE_FAIL, self.config.write_fail_prob) {
                s.stats.write_failures = s.stats.write_failures.saturating_add(1);
                return Err(LogError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated write failure",
                )));
            }

            // Partial write: a prefix lands, then the write errors out
            if data.len() > 1
                && crate::buggify!(
                    &mut s.rng,
                    log_faults::PARTIAL_WRITE,
                    self.config.partial_write_prob
                )
            {
                s.stats.partial_writes = s.stats.partial_writes.saturating_add(1);
                let partial_len = s.rng.gen_range(1, data.len() as u64) as usize;
                let _ = self.inner.append(&data[..partial_len]);
                return Err(LogError::PartialWrite {
                    expected: data.len(),
                    actual: partial_len,
                });
            }
        }

        self.inner.append(data)
    }

    fn sync(&mut self) -> Result<(), LogError> {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        s.stats.sync_attempts = s.stats.sync_attempts.saturating_add(1);

        if crate::buggify!(&mut s.rng, log_faults::FSYNC_FAIL, self.config.fsync_fail_prob) {
            s.stats.sync_failures = s.stats.sync_failures.saturating_add(1);
            return Err(LogError::FsyncFailed("simulated fsync failure".to_string()));
        }

        drop(guard);
        self.inner.sync()
    }

    fn truncate(&mut self, len: u64) -> Result<(), LogError> {
        self.inner.truncate(len)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

/// Simulated log file reader with fault injection
pub struct SimulatedLogReader<R: Rng> {
    inner: InMemoryLogReader,
    config: SimulatedLogStoreConfig,
    state: Arc<Mutex<SimulatedLogStoreInner<R>>>,
}

impl<R: Rng> LogFileReader for SimulatedLogReader<R> {
    fn read_all(&mut self) -> Result<Vec<u8>, LogError> {
        {
            let mut guard = self.state.lock();
            let s = &mut *guard;
            s.stats.read_attempts = s.stats.read_attempts.saturating_add(1);

            if crate::buggify!(&mut s.rng, log_faults::READ_FAIL, self.config.read_fail_prob) {
                s.stats.read_failures = s.stats.read_failures.saturating_add(1);
                return Err(LogError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated read failure",
                )));
            }
        }

        self.inner.read_all()
    }
}

impl<R: Rng> LogStore for SimulatedLogStore<R> {
    type Writer = SimulatedLogWriter<R>;
    type Reader = SimulatedLogReader<R>;

    fn open_append(&self, name: &str) -> Result<Self::Writer, LogError> {
        Ok(SimulatedLogWriter {
            inner: self.inner.open_append(name)?,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, LogError> {
        Ok(SimulatedLogReader {
            inner: self.inner.open_read(name)?,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        })
    }

    fn exists(&self, name: &str) -> Result<bool, LogError> {
        self.inner.exists(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;

    #[test]
    fn test_inmemory_append_read() {
        let store = InMemoryLogStore::new();

        let mut writer = store.open_append("mqtt_logs.txt").unwrap();
        writer.append(b"hello").unwrap();
        writer.append(b" world").unwrap();
        assert_eq!(writer.size(), 11);

        let mut reader = store.open_read("mqtt_logs.txt").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn test_inmemory_open_append_keeps_content() {
        let store = InMemoryLogStore::new();
        store.set_file_data("log.txt", b"existing\n".to_vec());

        let mut writer = store.open_append("log.txt").unwrap();
        assert_eq!(writer.size(), 9);
        writer.append(b"more\n").unwrap();
        assert_eq!(
            store.get_file_data("log.txt").unwrap(),
            b"existing\nmore\n".to_vec()
        );
    }

    #[test]
    fn test_inmemory_not_found() {
        let store = InMemoryLogStore::new();
        assert!(matches!(
            store.open_read("missing.txt"),
            Err(LogError::NotFound(_))
        ));
        assert!(!store.exists("missing.txt").unwrap());
    }

    #[test]
    fn test_inmemory_crash_drops_unsynced() {
        let store = InMemoryLogStore::new();
        let mut writer = store.open_append("log.txt").unwrap();
        writer.append(b"durable\n").unwrap();
        writer.sync().unwrap();
        writer.append(b"volatile\n").unwrap();

        store.simulate_crash();

        assert_eq!(store.get_file_data("log.txt").unwrap(), b"durable\n".to_vec());
    }

    #[test]
    fn test_inmemory_truncate_clamps_synced() {
        let store = InMemoryLogStore::new();
        let mut writer = store.open_append("log.txt").unwrap();
        writer.append(b"0123456789").unwrap();
        writer.sync().unwrap();
        writer.truncate(4).unwrap();

        assert_eq!(writer.size(), 4);
        assert_eq!(store.synced_len("log.txt"), Some(4));
    }

    #[test]
    fn test_local_log_store() {
        let dir = tempfile::tempdir().unwrap();
        let (store, name) = LocalLogStore::for_file(&dir.path().join("mqtt_logs.txt")).unwrap();
        assert_eq!(name, "mqtt_logs.txt");

        let mut writer = store.open_append(&name).unwrap();
        writer.append(b"hello\n").unwrap();
        writer.append(b"world\npartial").unwrap();
        writer.sync().unwrap();
        writer.truncate(12).unwrap();
        assert_eq!(writer.size(), 12);
        drop(writer);

        // Reopening appends after the existing content
        let mut writer = store.open_append(&name).unwrap();
        assert_eq!(writer.size(), 12);
        writer.append(b"again\n").unwrap();

        let mut reader = store.open_read(&name).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"hello\nworld\nagain\n");
        assert!(store.exists(&name).unwrap());
    }

    #[test]
    fn test_local_for_file_without_parent() {
        let (store, name) = LocalLogStore::for_file(Path::new("mqtt_logs.txt")).unwrap();
        assert_eq!(name, "mqtt_logs.txt");
        assert_eq!(store.file_path(&name), PathBuf::from("./mqtt_logs.txt"));
    }

    #[test]
    fn test_simulated_store_no_faults() {
        let store =
            SimulatedLogStore::new(SimulatedRng::new(42), SimulatedLogStoreConfig::no_faults());

        let mut writer = store.open_append("log.txt").unwrap();
        writer.append(b"hello").unwrap();
        writer.sync().unwrap();

        let mut reader = store.open_read("log.txt").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"hello");

        let stats = store.stats();
        assert_eq!(stats.write_attempts, 1);
        assert_eq!(stats.write_failures, 0);
        assert_eq!(stats.sync_attempts, 1);
        assert_eq!(stats.read_attempts, 1);
    }

    #[test]
    fn test_simulated_partial_write_leaves_prefix() {
        let store = SimulatedLogStore::new(
            SimulatedRng::new(7),
            SimulatedLogStoreConfig {
                partial_write_prob: 1.0,
                ..SimulatedLogStoreConfig::no_faults()
            },
        );

        let mut writer = store.open_append("log.txt").unwrap();
        let err = writer.append(b"0123456789").unwrap_err();
        let LogError::PartialWrite { expected, actual } = err else {
            panic!("expected partial write, got {:?}", err);
        };
        assert_eq!(expected, 10);
        assert!(actual >= 1 && actual < 10);
        assert_eq!(store.inner_store().get_file_data("log.txt").unwrap().len(), actual);
    }

    #[test]
    fn test_simulated_fsync_failure() {
        let store = SimulatedLogStore::new(
            SimulatedRng::new(42),
            SimulatedLogStoreConfig {
                fsync_fail_prob: 1.0,
                ..SimulatedLogStoreConfig::no_faults()
            },
        );

        let mut writer = store.open_append("log.txt").unwrap();
        writer.append(b"data").unwrap();
        assert!(matches!(writer.sync(), Err(LogError::FsyncFailed(_))));
        assert_eq!(store.stats().sync_failures, 1);
        assert_eq!(store.inner_store().synced_len("log.txt"), Some(0));
    }

    #[test]
    fn test_simulated_store_deterministic() {
        let config = SimulatedLogStoreConfig {
            write_fail_prob: 0.3,
            fsync_fail_prob: 0.2,
            ..SimulatedLogStoreConfig::no_faults()
        };

        let run = |seed: u64| {
            let store = SimulatedLogStore::new(SimulatedRng::new(seed), config.clone());
            let mut writer = store.open_append("log.txt").unwrap();
            (0..20)
                .map(|_| writer.append(b"data").is_ok())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(12345), run(12345));
    }
}
