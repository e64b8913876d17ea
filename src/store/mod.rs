//! Content Store Abstraction
//!
//! Content-addressed storage for log snapshots. `add` returns the identifier
//! the store derived from the bytes; the same bytes always map to the same
//! identifier.
//!
//! Implementations:
//! - `IpfsHttpStore`: production (IPFS Kubo HTTP API over reqwest)
//! - `InMemoryContentStore`: unit tests and DST
//! - `SimulatedContentStore`: DST wrapper with buggify fault injection

pub mod ipfs;
pub mod memory;
pub mod simulated;

pub use ipfs::IpfsHttpStore;
pub use memory::InMemoryContentStore;
pub use simulated::{SimulatedContentStore, SimulatedContentStoreConfig, SimulatedContentStoreStats};

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Identifier returned by the content store (an IPFS CID)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        ContentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error type for content store operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network or HTTP client failure
    Http(String),
    /// Non-2xx response
    Status { code: u16, body: String },
    /// Response body could not be understood
    MalformedResponse(String),
    Timeout(Duration),
    /// Store refused or could not be reached
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Http(msg) => write!(f, "content store request failed: {}", msg),
            StoreError::Status { code, body } => {
                write!(f, "content store returned status {}: {}", code, body)
            }
            StoreError::MalformedResponse(msg) => {
                write!(f, "content store response malformed: {}", msg)
            }
            StoreError::Timeout(after) => {
                write!(f, "content store timed out after {:?}", after)
            }
            StoreError::Unavailable(msg) => write!(f, "content store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Content-addressed store
pub trait ContentStore: Send + Sync + 'static {
    /// Store `data` under a display `name`; returns its content identifier
    fn add<'a>(&'a self, name: &'a str, data: Bytes) -> StoreFuture<'a, ContentId>;

    /// Human-readable URL for retrieving `cid`
    fn access_url(&self, cid: &ContentId) -> String;

    /// Endpoint description, for logs
    fn describe(&self) -> String;
}

/// `{gateway}/ipfs/{cid}`
pub fn gateway_url(gateway: &str, cid: &ContentId) -> String {
    format!("{}/ipfs/{}", gateway.trim_end_matches('/'), cid)
}
