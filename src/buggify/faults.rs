//! Named fault sites, `<component>.<fault>`

/// Faults injected by `SimulatedLogStore`
pub mod log_store {
    pub const WRITE_FAIL: &str = "log_store.write_fail";
    pub const PARTIAL_WRITE: &str = "log_store.partial_write";
    pub const FSYNC_FAIL: &str = "log_store.fsync_fail";
    pub const DISK_FULL: &str = "log_store.disk_full";
    pub const READ_FAIL: &str = "log_store.read_fail";
}

/// Faults injected by `SimulatedContentStore`
pub mod content_store {
    pub const ADD_FAIL: &str = "content_store.add_fail";
    pub const TIMEOUT: &str = "content_store.timeout";
    pub const MALFORMED_RESPONSE: &str = "content_store.malformed_response";
}
