//! MQTT 3.1.1 transport over rumqttc
//!
//! Every `connect` builds a fresh client/event loop pair and polls it until
//! the broker acknowledges the session. Reconnect policy lives in the
//! subscriber; rumqttc's own automatic reconnect is never exercised because
//! a poll error always ends the session here.

use super::{InboundMessage, Transport, TransportError, TransportFuture};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Request channel depth between `AsyncClient` and its event loop
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Smallest keep-alive rumqttc accepts
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        MqttTransportConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "telemetry-bridge".to_string(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

/// rumqttc-backed transport. Subscriptions use QoS 0 (at-most-once).
pub struct MqttTransport {
    config: MqttTransportConfig,
    session: Option<MqttSession>,
    /// Publishes that arrived while waiting for a SubAck
    buffered: VecDeque<InboundMessage>,
}

impl MqttTransport {
    pub fn new(config: MqttTransportConfig) -> Self {
        MqttTransport {
            config,
            session: None,
            buffered: VecDeque::new(),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        options
    }

    fn lost(&mut self, cause: impl std::fmt::Display) -> TransportError {
        self.session = None;
        TransportError::ConnectionLost(cause.to_string())
    }
}

impl Transport for MqttTransport {
    fn connect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.session = None;
            self.buffered.clear();

            let (client, mut eventloop) = AsyncClient::new(self.options(), CLIENT_CHANNEL_CAPACITY);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            return Err(TransportError::ConnectFailed(format!(
                                "broker refused connection: {:?}",
                                ack.code
                            )));
                        }
                        break;
                    }
                    Ok(event) => debug!(?event, "MQTT event before ConnAck"),
                    Err(e) => return Err(TransportError::ConnectFailed(e.to_string())),
                }
            }

            self.session = Some(MqttSession { client, eventloop });
            Ok(())
        })
    }

    fn subscribe<'a>(&'a mut self, filter: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
            if let Err(e) = session.client.subscribe(filter, QoS::AtMostOnce).await {
                return Err(TransportError::SubscribeFailed(e.to_string()));
            }

            loop {
                let polled = match self.session.as_mut() {
                    Some(session) => session.eventloop.poll().await,
                    None => return Err(TransportError::NotConnected),
                };
                match polled {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        if ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure))
                        {
                            return Err(TransportError::SubscribeFailed(format!(
                                "broker rejected filter {}",
                                filter
                            )));
                        }
                        return Ok(());
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.buffered
                            .push_back(InboundMessage::new(publish.topic, publish.payload));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(self.lost(e)),
                }
            }
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, InboundMessage> {
        Box::pin(async move {
            if let Some(msg) = self.buffered.pop_front() {
                return Ok(msg);
            }

            loop {
                let polled = match self.session.as_mut() {
                    Some(session) => session.eventloop.poll().await,
                    None => return Err(TransportError::NotConnected),
                };
                match polled {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        return Ok(InboundMessage::new(publish.topic, publish.payload));
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        return Err(self.lost("broker sent DISCONNECT"));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(self.lost(e)),
                }
            }
        })
    }

    fn describe(&self) -> String {
        format!("mqtt://{}:{}", self.config.host, self.config.port)
    }
}
