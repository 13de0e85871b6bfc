//! Publish/subscribe transport.
//!
//! The controller talks to the broker through the [`Transport`] trait. It
//! covers exactly what the bridge needs: one session, one topic, and a
//! polling primitive that hands back whatever messages arrived while it
//! waited.
//!
//! Two implementations are provided:
//!
//! - [`MqttTransport`]: an MQTT 3.1.1 session via `rumqttc`
//! - [`LoopbackTransport`]: an in-process broker that redelivers its own
//!   publishes, for tests and dry runs

pub mod loopback;
pub mod mqtt;

pub use loopback::{LoopbackHandle, LoopbackTransport};
pub use mqtt::{MqttConfig, MqttTransport};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Delivery guarantee of a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged, possibly duplicated.
    AtLeastOnce = 1,
    /// Four-way handshake, delivered once.
    ExactlyOnce = 2,
}

impl QoS {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS {}", self.level())
    }
}

/// A message delivered through the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub qos: QoS,
    pub retained: bool,
    pub duplicate: bool,
    /// Packet identifier; zero for QoS 0 deliveries.
    pub id: u16,
    pub payload: Bytes,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub qos: QoS,
    pub retained: bool,
    pub duplicate: bool,
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Fresh, non-retained message.
    pub fn new(qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            qos,
            retained: false,
            duplicate: false,
            payload: payload.into(),
        }
    }
}

/// Errors reported by a transport. None of them are fatal to the bridge.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,
}

/// Session with a publish/subscribe broker.
#[async_trait]
pub trait Transport: Send {
    /// Open the network connection and establish the session.
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&mut self, topic: &str, message: OutboundMessage)
        -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// End the session politely.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Tear down the underlying network connection. Idempotent.
    async fn close(&mut self);

    /// Wait up to `timeout` for inbound messages.
    ///
    /// Returns as soon as at least one message is available, together with
    /// everything else already queued. An empty vector means the timeout
    /// elapsed quietly.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<InboundMessage>, TransportError>;
}
