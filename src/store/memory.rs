//! In-memory content store
//!
//! Identifiers are CIDv1 (raw codec, sha2-256) in base16 multibase form:
//! `f` + `01` (version) + `55` (raw) + `12 20` (sha2-256, 32 bytes) + digest.

use super::{gateway_url, ContentId, ContentStore, StoreFuture};
use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CID_PREFIX: &str = "f01551220";

/// Content identifier for `data` as computed by this store
pub fn content_id_for(data: &[u8]) -> ContentId {
    let digest = Sha256::digest(data);
    let mut id = String::with_capacity(CID_PREFIX.len() + digest.len() * 2);
    id.push_str(CID_PREFIX);
    for byte in digest.iter() {
        let _ = write!(id, "{:02x}", byte);
    }
    ContentId::new(id)
}

#[derive(Debug, Clone)]
pub struct InMemoryContentStore {
    objects: Arc<RwLock<HashMap<ContentId, Bytes>>>,
    adds: Arc<AtomicU64>,
    gateway: String,
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::with_gateway("http://localhost:8080")
    }

    pub fn with_gateway(gateway: impl Into<String>) -> Self {
        InMemoryContentStore {
            objects: Arc::new(RwLock::new(HashMap::new())),
            adds: Arc::new(AtomicU64::new(0)),
            gateway: gateway.into(),
        }
    }

    pub fn get(&self, cid: &ContentId) -> Option<Bytes> {
        self.objects.read().get(cid).cloned()
    }

    /// Distinct objects held
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Total successful `add` calls (including duplicates)
    pub fn add_count(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }
}

impl ContentStore for InMemoryContentStore {
    fn add<'a>(&'a self, _name: &'a str, data: Bytes) -> StoreFuture<'a, ContentId> {
        Box::pin(async move {
            let cid = content_id_for(&data);
            self.objects.write().insert(cid.clone(), data);
            self.adds.fetch_add(1, Ordering::Relaxed);
            Ok(cid)
        })
    }

    fn access_url(&self, cid: &ContentId) -> String {
        gateway_url(&self.gateway, cid)
    }

    fn describe(&self) -> String {
        "memory://content-store".to_string()
    }
}
