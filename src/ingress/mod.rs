//! Ingress Subscriber
//!
//! Owns one transport connection, subscribes to the configured topic filter
//! and turns every inbound message into exactly one log append.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────── reconnect (backoff) ◄────────────┐
//!            ▼                                              │
//! connect ──► subscribe ──► recv ──► LogEntry ──► LogHandle::append
//!                            │
//!                            └── TransportError ────────────┘
//! ```
//!
//! Delivery is at-most-once: whatever is published while the session is down
//! is lost. A failed append is logged and the message dropped; the
//! subscriber keeps running.

pub mod backoff;
pub mod channel;
pub mod mqtt;
pub mod topic;

pub use backoff::{Backoff, BackoffConfig};
pub use channel::{ChannelBroker, ChannelTransport};
pub use mqtt::{MqttTransport, MqttTransportConfig};
pub use topic::{matches as topic_matches, validate_filter, TopicFilterError};

use crate::io::Rng;
use crate::log::{LogEntry, LogHandle};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A message as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Error type for transport operations. Any of these ends the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    ConnectFailed(String),
    SubscribeFailed(String),
    ConnectionLost(String),
    /// Operation needs a session and there is none
    NotConnected,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            TransportError::SubscribeFailed(msg) => write!(f, "subscribe failed: {}", msg),
            TransportError::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            TransportError::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for TransportError {}

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Pub/sub transport owned by a single subscriber
pub trait Transport: Send + 'static {
    /// Establish a fresh session, replacing any previous one
    fn connect(&mut self) -> TransportFuture<'_, ()>;

    /// Subscribe the current session to `filter`
    fn subscribe<'a>(&'a mut self, filter: &'a str) -> TransportFuture<'a, ()>;

    /// Next inbound message. An error means the session is gone.
    fn recv(&mut self) -> TransportFuture<'_, InboundMessage>;

    /// Human-readable endpoint, for logs
    fn describe(&self) -> String;
}

/// Final subscriber counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub received: u64,
    pub appended: u64,
    /// Messages lost to a failed append
    pub dropped: u64,
    /// Sessions established after the first one
    pub reconnects: u64,
    pub connect_failures: u64,
}

/// Live counters, shared with whoever wants to watch the subscriber
#[derive(Debug, Default)]
pub struct SubscriberCounters {
    received: AtomicU64,
    appended: AtomicU64,
    dropped: AtomicU64,
    sessions: AtomicU64,
    connect_failures: AtomicU64,
}

impl SubscriberCounters {
    pub fn snapshot(&self) -> SubscriberStats {
        SubscriberStats {
            received: self.received.load(Ordering::Relaxed),
            appended: self.appended.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.sessions.load(Ordering::Relaxed).saturating_sub(1),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}

/// Subscriber task: transport → log
pub struct IngressSubscriber<T: Transport, R: Rng> {
    transport: T,
    log: LogHandle,
    topic_pattern: String,
    backoff: Backoff<R>,
    counters: Arc<SubscriberCounters>,
}

impl<T: Transport, R: Rng> IngressSubscriber<T, R> {
    pub fn new(
        transport: T,
        log: LogHandle,
        topic_pattern: impl Into<String>,
        backoff: Backoff<R>,
    ) -> Self {
        IngressSubscriber {
            transport,
            log,
            topic_pattern: topic_pattern.into(),
            backoff,
            counters: Arc::new(SubscriberCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<SubscriberCounters> {
        Arc::clone(&self.counters)
    }

    /// Run until `cancel` fires. An append already handed to the log is
    /// always awaited, so cancellation never leaves a message half-handled.
    pub async fn run(mut self, cancel: CancellationToken) -> SubscriberStats {
        let endpoint = self.transport.describe();
        info!(
            endpoint = %endpoint,
            topic = %self.topic_pattern,
            "Ingress subscriber starting"
        );

        'session: loop {
            let established = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                result = Self::establish(&mut self.transport, &self.topic_pattern) => result,
            };

            if let Err(e) = established {
                self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                if !self.wait_before_retry(&cancel, &e).await {
                    break 'session;
                }
                continue 'session;
            }

            self.counters.sessions.fetch_add(1, Ordering::Relaxed);
            self.backoff.reset();
            info!(endpoint = %endpoint, topic = %self.topic_pattern, "Subscribed");

            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'session,
                    msg = self.transport.recv() => msg,
                };

                match received {
                    Ok(msg) => self.handle_message(msg).await,
                    Err(e) => {
                        if !self.wait_before_retry(&cancel, &e).await {
                            break 'session;
                        }
                        continue 'session;
                    }
                }
            }
        }

        let stats = self.counters.snapshot();
        info!(
            received = stats.received,
            appended = stats.appended,
            dropped = stats.dropped,
            reconnects = stats.reconnects,
            "Ingress subscriber stopped"
        );
        stats
    }

    async fn establish(transport: &mut T, topic_pattern: &str) -> Result<(), TransportError> {
        transport.connect().await?;
        transport.subscribe(topic_pattern).await
    }

    /// Sleep out the next backoff delay. Returns false if cancelled meanwhile.
    async fn wait_before_retry(&mut self, cancel: &CancellationToken, cause: &TransportError) -> bool {
        let delay = self.backoff.next_delay();
        warn!(
            error = %cause,
            attempt = self.backoff.attempt(),
            retry_in_ms = delay.as_millis() as u64,
            "Transport unavailable, reconnecting"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn handle_message(&mut self, msg: InboundMessage) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let topic = msg.topic.clone();
        let entry = LogEntry::new(msg.topic, msg.payload);

        match self.log.append(entry).await {
            Ok(seq) => {
                self.counters.appended.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %topic, seq, "Message appended");
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(topic = %topic, error = %e, "Log append failed, message dropped");
            }
        }
    }
}
