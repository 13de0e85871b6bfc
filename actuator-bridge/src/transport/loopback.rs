//! In-process broker.
//!
//! Everything published on a topic the transport is subscribed to comes back
//! through [`Transport::poll`], the way a real broker echoes a client's own
//! publishes. Other "clients" can feed messages in through a
//! [`LoopbackHandle`], which is how tests and the `--loopback` dry run inject
//! commands.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{InboundMessage, OutboundMessage, QoS, Transport, TransportError};
use crate::tracing::prelude::*;

/// A publish waiting to be routed to subscribers.
#[derive(Debug)]
struct Routed {
    topic: String,
    message: OutboundMessage,
}

/// Injects messages into a [`LoopbackTransport`] from anywhere.
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    tx: mpsc::UnboundedSender<Routed>,
}

impl LoopbackHandle {
    /// Publish `payload` on `topic` at the given QoS.
    ///
    /// Returns false once the transport has been dropped.
    pub fn publish(&self, topic: &str, qos: QoS, payload: impl Into<Bytes>) -> bool {
        self.tx
            .send(Routed {
                topic: topic.to_string(),
                message: OutboundMessage::new(qos, payload),
            })
            .is_ok()
    }
}

/// Loopback [`Transport`] with failure injection for tests.
#[derive(Debug)]
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Routed>,
    rx: mpsc::UnboundedReceiver<Routed>,
    subscriptions: HashMap<String, QoS>,
    connected: bool,
    closed: bool,
    next_id: u16,
    fail_connect: bool,
    fail_subscribe: bool,
    fail_publish: bool,
    published: Vec<(String, OutboundMessage)>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            subscriptions: HashMap::new(),
            connected: false,
            closed: false,
            next_id: 1,
            fail_connect: false,
            fail_subscribe: false,
            fail_publish: false,
            published: Vec::new(),
        }
    }

    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            tx: self.tx.clone(),
        }
    }

    /// Queue a message from another client. Shorthand for the handle.
    pub fn inject(&self, topic: &str, qos: QoS, payload: impl Into<Bytes>) {
        self.handle().publish(topic, qos, payload);
    }

    /// Make every subsequent `connect` fail, leaving the transport
    /// disconnected.
    pub fn set_connect_failure(&mut self, fail: bool) {
        self.fail_connect = fail;
    }

    /// Make every subsequent `subscribe` fail without subscribing.
    pub fn set_subscribe_failure(&mut self, fail: bool) {
        self.fail_subscribe = fail;
    }

    /// Make every subsequent `publish` fail without routing anything.
    pub fn set_publish_failure(&mut self, fail: bool) {
        self.fail_publish = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    /// Messages accepted by `publish`, in order.
    pub fn published(&self) -> &[(String, OutboundMessage)] {
        &self.published
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_id;
        // Packet identifiers are non-zero.
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Turn a routed publish into a delivery, if anyone is listening.
    fn deliver(&mut self, routed: Routed) -> Option<InboundMessage> {
        let Some(&granted) = self.subscriptions.get(&routed.topic) else {
            trace!(topic = %routed.topic, "Dropping message for unsubscribed topic");
            return None;
        };

        let qos = routed.message.qos.min(granted);
        let id = if qos == QoS::AtMostOnce {
            0
        } else {
            self.next_packet_id()
        };

        Some(InboundMessage {
            topic: routed.topic,
            qos,
            retained: routed.message.retained,
            duplicate: routed.message.duplicate,
            id,
            payload: routed.message.payload,
        })
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.fail_connect {
            return Err(TransportError::Connect("injected failure".into()));
        }
        self.connected = true;
        debug!("Loopback connected");
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.fail_subscribe {
            return Err(TransportError::Subscribe("injected failure".into()));
        }
        self.subscriptions.insert(topic.to_string(), qos);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        if self.fail_publish {
            return Err(TransportError::Publish("injected failure".into()));
        }
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        self.published.push((topic.to_string(), message.clone()));
        self.tx
            .send(Routed {
                topic: topic.to_string(),
                message,
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        match self.subscriptions.remove(topic) {
            Some(_) => Ok(()),
            None => Err(TransportError::Unsubscribe(format!(
                "not subscribed to {}",
                topic
            ))),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.connected = false;
        self.subscriptions.clear();
        debug!("Loopback disconnected");
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
        self.closed = true;
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<InboundMessage>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut delivered = Vec::new();

        // Drain what is already queued before deciding to wait.
        while let Ok(routed) = self.rx.try_recv() {
            delivered.extend(self.deliver(routed));
        }
        if !delivered.is_empty() {
            return Ok(delivered);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while delivered.is_empty() {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                // The transport holds a sender itself, so the channel never
                // reports closed while we are alive.
                Ok(Some(routed)) => delivered.extend(self.deliver(routed)),
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => break,
            }
        }
        while let Ok(routed) = self.rx.try_recv() {
            delivered.extend(self.deliver(routed));
        }

        Ok(delivered)
    }
}
