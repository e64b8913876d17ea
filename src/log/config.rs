//! Log Configuration
//!
//! Three fsync policies mirror Redis AOF `appendfsync`. Every policy survives a
//! process crash (each append reaches the OS before it is acknowledged); they
//! differ only in what a power loss can take.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Fsync policy for log durability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// Group commit: batch entries + fsync before acknowledging any writer.
    /// RPO = 0 even across power loss.
    #[default]
    Always,
    /// Append + acknowledge immediately; fsync on a 1-second timer.
    #[serde(alias = "everysec")]
    EverySecond,
    /// Append + acknowledge immediately; OS decides when to flush.
    No,
}

impl FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysecond" | "everysec" => Ok(FsyncPolicy::EverySecond),
            "no" | "none" => Ok(FsyncPolicy::No),
            other => Err(format!(
                "unknown fsync policy '{}' (expected always, everysec or no)",
                other
            )),
        }
    }
}

impl std::fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsyncPolicy::Always => write!(f, "always"),
            FsyncPolicy::EverySecond => write!(f, "everysec"),
            FsyncPolicy::No => write!(f, "no"),
        }
    }
}

/// Configuration for the durable log
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Path of the log file
    pub path: PathBuf,
    pub fsync_policy: FsyncPolicy,
    /// Maximum appends folded into one group commit (default: 64)
    pub group_commit_max_entries: usize,
    /// Fsync tick for EverySecond mode (default: 1s)
    pub sync_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            path: PathBuf::from("mqtt_logs.txt"),
            fsync_policy: FsyncPolicy::Always,
            group_commit_max_entries: 64,
            sync_interval: Duration::from_secs(1),
        }
    }
}

impl LogConfig {
    /// Small batches, for tests
    pub fn test() -> Self {
        LogConfig {
            group_commit_max_entries: 8,
            sync_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    pub fn with_policy(fsync_policy: FsyncPolicy) -> Self {
        LogConfig {
            fsync_policy,
            ..Self::test()
        }
    }

    /// File name component of `path`
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mqtt_logs.txt".to_string())
    }
}
