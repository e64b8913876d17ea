//! MQTT → IPFS telemetry bridge
//!
//! Subscribes to a wildcard topic, appends every message to a durable
//! append-only log, and periodically uploads the whole log to a
//! content-addressed store, reporting the resulting content identifier.
//!
//! ```text
//! broker ──► ingress ──► log ◄── uploader ──► content store ──► CID + URL
//! ```

pub mod io;
pub mod buggify;
pub mod log;
pub mod ingress;
pub mod store;
pub mod uploader;
pub mod pipeline;
pub mod config;
pub mod observability;
pub mod dst;

pub use config::{BridgeConfig, ConfigError, LogFormat};
pub use ingress::{ChannelBroker, IngressSubscriber, MqttTransport, Transport, TransportError};
pub use log::{spawn_log_actor, FsyncPolicy, LogEntry, LogError, LogHandle, Snapshot};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineStats};
pub use store::{ContentId, ContentStore, IpfsHttpStore, StoreError};
pub use uploader::{SnapshotUploader, UploadOutcome, UploadResult, UploaderState};
