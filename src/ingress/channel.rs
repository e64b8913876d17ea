//! In-process broker and transport
//!
//! Stands in for the MQTT broker in tests and simulation. The broker routes
//! published messages to every session with a matching filter, and can be
//! taken offline (dropping every session and refusing connects).

use super::topic;
use super::{InboundMessage, Transport, TransportError, TransportFuture};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Session {
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

struct BrokerState {
    online: bool,
    next_session_id: u64,
    sessions: HashMap<u64, Session>,
    connect_attempts: u64,
    delivered: u64,
}

/// Shared in-process broker
#[derive(Clone)]
pub struct ChannelBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    pub fn new() -> Self {
        ChannelBroker {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                next_session_id: 0,
                sessions: HashMap::new(),
                connect_attempts: 0,
                delivered: 0,
            })),
        }
    }

    /// A new, unconnected transport bound to this broker
    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport {
            broker: self.clone(),
            session: None,
        }
    }

    /// Route a message to every matching session. Returns how many sessions
    /// received it.
    pub fn publish(&self, topic_name: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut state = self.state.lock();
        if !state.online {
            return 0;
        }

        let mut delivered = 0;
        for session in state.sessions.values() {
            if session
                .filters
                .iter()
                .any(|filter| topic::matches(filter, topic_name))
            {
                let msg = InboundMessage::new(topic_name, payload.clone());
                if session.tx.send(msg).is_ok() {
                    delivered += 1;
                }
            }
        }
        state.delivered += delivered as u64;
        delivered
    }

    /// Drop every session (clients see a lost connection)
    pub fn disconnect_all(&self) {
        self.state.lock().sessions.clear();
    }

    /// Going offline drops every session and refuses new connects
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        state.online = online;
        if !online {
            state.sessions.clear();
        }
    }

    /// Sessions holding at least one subscription
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| !s.filters.is_empty())
            .count()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    /// Poll until at least `n` subscribed sessions exist or `timeout` passes
    pub async fn wait_for_subscribers(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.subscriber_count() >= n {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn open_session(&self) -> Result<(u64, mpsc::UnboundedReceiver<InboundMessage>), TransportError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if !state.online {
            return Err(TransportError::ConnectFailed("broker offline".to_string()));
        }

        let id = state.next_session_id;
        state.next_session_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            Session {
                filters: Vec::new(),
                tx,
            },
        );
        Ok((id, rx))
    }

    fn add_filter(&self, id: u64, filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| TransportError::ConnectionLost("session dropped by broker".to_string()))?;
        session.filters.push(filter.to_string());
        Ok(())
    }

    fn close_session(&self, id: u64) {
        self.state.lock().sessions.remove(&id);
    }
}

/// Transport end of a [`ChannelBroker`] session
pub struct ChannelTransport {
    broker: ChannelBroker,
    session: Option<(u64, mpsc::UnboundedReceiver<InboundMessage>)>,
}

impl ChannelTransport {
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn drop_session(&mut self) {
        if let Some((id, _)) = self.session.take() {
            self.broker.close_session(id);
        }
    }
}

impl Transport for ChannelTransport {
    fn connect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.drop_session();
            self.session = Some(self.broker.open_session()?);
            Ok(())
        })
    }

    fn subscribe<'a>(&'a mut self, filter: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            topic::validate_filter(filter)
                .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
            let (id, _) = self.session.as_ref().ok_or(TransportError::NotConnected)?;
            let id = *id;
            if let Err(e) = self.broker.add_filter(id, filter) {
                self.session = None;
                return Err(e);
            }
            Ok(())
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, InboundMessage> {
        Box::pin(async move {
            let (_, rx) = self.session.as_mut().ok_or(TransportError::NotConnected)?;
            match rx.recv().await {
                Some(msg) => Ok(msg),
                None => {
                    self.session = None;
                    Err(TransportError::ConnectionLost(
                        "session dropped by broker".to_string(),
                    ))
                }
            }
        })
    }

    fn describe(&self) -> String {
        "channel://in-process".to_string()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.drop_session();
    }
}
