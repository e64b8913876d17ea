//! Durable Log
//!
//! Append-only, crash-consistent record of every received message, one line
//! per entry in a single text file.
//!
//! ## Architecture
//!
//! ```text
//! LogHandle (clone per producer)
//!      │  mpsc
//!      ▼
//! LogActor ──► LogFile ──► LogStore (Local | InMemory | Simulated)
//!                 │
//!                 └── recovery on open: drop torn tail, count lines
//! ```
//!
//! ## Guarantees
//!
//! - Appends are totally ordered by the actor's channel; none are lost or
//!   duplicated
//! - An acknowledged append has reached the file (and the disk, with
//!   `FsyncPolicy::Always`)
//! - A snapshot holds exactly the committed prefix, never a partial entry

pub mod actor;
pub mod config;
pub mod entry;
pub mod file;
pub mod store;

pub use actor::{spawn_log_actor, LogActor, LogHandle, LogMessage};
pub use config::{FsyncPolicy, LogConfig};
pub use entry::{decode_lines, LogEntry, TIMESTAMP_FORMAT};
pub use file::{LogFile, LogStats, Snapshot};
pub use store::{
    InMemoryLogStore, LocalLogStore, LogError, LogFileReader, LogFileWriter, LogStore,
    SimulatedLogStore, SimulatedLogStoreConfig, SimulatedLogStoreStats,
};
