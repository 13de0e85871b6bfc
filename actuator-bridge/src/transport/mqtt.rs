//! MQTT transport built on `rumqttc`.
//!
//! rumqttc splits a session into a request handle ([`AsyncClient`]) and an
//! [`EventLoop`] that has to be polled for anything to happen on the wire.
//! The event loop runs in its own task and forwards incoming publishes over
//! a bounded channel; [`Transport::poll`] reads from that channel. Only the
//! channel crosses the task boundary.
//!
//! The event loop reconnects by itself after network errors, so a failed
//! [`Transport::connect`] leaves the session retrying in the background
//! rather than dead. Sessions are clean, so a broker that reconnects us
//! without a stored session has forgotten our subscriptions; the event loop
//! re-issues every subscription recorded by [`Transport::subscribe`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{InboundMessage, OutboundMessage, QoS, Transport, TransportError};
use crate::tracing::prelude::*;

/// Depth of the request and inbound message queues.
const QUEUE_DEPTH: usize = 64;

/// Pause between reconnection attempts after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long `close` lets the event loop flush pending requests.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// How long `connect` waits for the broker's CONNACK.
    pub connect_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            client_id: "mbed-icraggs".to_string(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Live session state, present between `connect` and `close`.
struct Session {
    client: AsyncClient,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    event_loop: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Topic filters we are subscribed to, with their requested QoS.
type Subscriptions = HashMap<String, QoS>;

/// [`Transport`] over an MQTT broker.
pub struct MqttTransport {
    config: MqttConfig,
    session: Option<Session>,
    /// Shared with the event loop, which replays it after a reconnect.
    subscriptions: watch::Sender<Subscriptions>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        let (subscriptions, _) = watch::channel(Subscriptions::new());
        Self {
            config,
            session: None,
            subscriptions,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.session
            .as_ref()
            .map(|s| &s.client)
            .ok_or(TransportError::NotConnected)
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            qos: publish.qos.into(),
            retained: publish.retain,
            duplicate: publish.dup,
            id: publish.pkid,
            payload: publish.payload,
        }
    }
}

/// Re-request every recorded subscription.
///
/// Runs on the event loop task, which is the only thing draining the request
/// queue, so it must not wait for queue space.
fn resubscribe(client: &AsyncClient, subscriptions: &Subscriptions) {
    for (topic, &qos) in subscriptions {
        match client.try_subscribe(topic, qos.into()) {
            Ok(()) => info!(
                topic = %topic,
                qos = qos.level(),
                "Resubscribing after reconnect"
            ),
            Err(e) => warn!(topic = %topic, error = %e, "Resubscribe failed"),
        }
    }
}

/// Drive the rumqttc event loop until cancelled or disconnected.
///
/// The first CONNACK (or the first connection error, whichever comes first)
/// is reported through `connack_tx`. Later CONNACKs without a stored session
/// trigger a [`resubscribe`].
async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: watch::Receiver<Subscriptions>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    connack_tx: oneshot::Sender<Result<(), String>>,
    cancel: CancellationToken,
) {
    let mut connack_tx = Some(connack_tx);

    loop {
        let event = tokio::select! {
            event = event_loop.poll() => event,
            _ = cancel.cancelled() => break,
        };

        match event {
            // rumqttc reports refused connections as errors, so every CONNACK
            // seen here is a successful one.
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(session_present = ack.session_present, "MQTT connected");
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Ok(()));
                } else if !ack.session_present {
                    resubscribe(&client, &subscriptions.borrow());
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if inbound_tx.send(publish.into()).await.is_err() {
                    debug!("Inbound receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(
                    pkid = ack.pkid,
                    return_codes = ?ack.return_codes,
                    "Subscription acknowledged"
                );
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(event) => {
                trace!(?event, "MQTT event");
            }
            Err(e) => {
                warn!(error = %e, "MQTT connection error");
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Err(e.to_string()));
                }
                // The next poll reconnects.
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    trace!("MQTT event loop exiting");
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Ok(());
        }

        info!(host = %self.config.host, port = self.config.port, "Connecting to broker");

        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);

        let (client, event_loop) = AsyncClient::new(options, QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (connack_tx, connack_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            self.subscriptions.subscribe(),
            inbound_tx,
            connack_tx,
            cancel.clone(),
        ));

        self.session = Some(Session {
            client,
            inbound_rx,
            event_loop: handle,
            cancel,
        });

        match tokio::time::timeout(self.config.connect_timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::Connect(reason)),
            Ok(Err(_)) => Err(TransportError::Connect("event loop exited".into())),
            Err(_) => Err(TransportError::Connect(format!(
                "no CONNACK within {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        self.subscriptions.send_modify(|subs| {
            subs.insert(topic.to_string(), qos);
        });
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        if message.duplicate {
            // rumqttc owns the DUP flag and sets it on retransmission.
            trace!("Ignoring caller-supplied duplicate flag");
        }
        self.client()?
            .publish_bytes(topic, message.qos.into(), message.retained, message.payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))?;

        self.subscriptions.send_modify(|subs| {
            subs.remove(topic);
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client()?
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))
    }

    async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let Session {
            client,
            inbound_rx,
            mut event_loop,
            cancel,
        } = session;
        drop(inbound_rx);
        self.subscriptions.send_modify(Subscriptions::clear);

        // Give queued unsubscribe/disconnect requests a chance to reach the
        // broker before the socket goes away.
        if tokio::time::timeout(CLOSE_GRACE, &mut event_loop)
            .await
            .is_err()
        {
            debug!("MQTT event loop still running after grace period, cancelling");
            cancel.cancel();
            if let Err(e) = event_loop.await {
                warn!(error = %e, "MQTT event loop task failed");
            }
        }
        drop(client);

        info!("Broker connection closed");
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<InboundMessage>, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        let mut delivered = Vec::new();

        match tokio::time::timeout(timeout, session.inbound_rx.recv()).await {
            Ok(Some(message)) => delivered.push(message),
            Ok(None) => return Err(TransportError::Closed),
            Err(_) => return Ok(delivered),
        }
        while let Ok(message) = session.inbound_rx.try_recv() {
            delivered.push(message);
        }

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn qos_maps_both_ways() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            let wire: rumqttc::QoS = qos.into();
            assert_eq!(QoS::from(wire), qos);
        }
    }

    #[test]
    fn publish_packet_becomes_inbound_message() {
        let mut publish = Publish::new("2ELE069", rumqttc::QoS::AtLeastOnce, "1 0 150");
        publish.pkid = 7;
        publish.dup = true;
        publish.retain = true;

        let message = InboundMessage::from(publish);
        assert_eq!(message.topic, "2ELE069");
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert_eq!(message.id, 7);
        assert!(message.duplicate);
        assert!(message.retained);
        assert_eq!(message.payload, Bytes::from_static(b"1 0 150"));
    }

    #[tokio::test]
    async fn requests_before_connect_fail() {
        let mut transport = MqttTransport::new(MqttConfig::default());
        assert!(matches!(
            transport.subscribe("t", QoS::AtMostOnce).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.poll(Duration::from_millis(1)).await,
            Err(TransportError::NotConnected)
        ));
        // Closing an unopened transport is a no-op.
        transport.close().await;
    }

    const CONNECT: u8 = 1;
    const SUBSCRIBE: u8 = 8;

    /// CONNACK, accepted, no stored session.
    const CONNACK_CLEAN: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Read one MQTT control packet: (packet type, variable header + payload).
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        (header >> 4, body)
    }

    /// Topic filter and requested QoS of a single-topic SUBSCRIBE body.
    fn subscribe_topic(body: &[u8]) -> (String, u8) {
        let len = usize::from(u16::from_be_bytes([body[2], body[3]]));
        let topic = String::from_utf8(body[4..4 + len].to_vec()).unwrap();
        (topic, body[4 + len])
    }

    /// Accept a client and acknowledge its CONNECT.
    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (kind, _) = read_packet(&mut stream).await;
        assert_eq!(kind, CONNECT);
        stream.write_all(&CONNACK_CLEAN).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn subscriptions_survive_a_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Scripted broker: acknowledge the first SUBSCRIBE, drop the
        // connection, then report what the client sends after reconnecting
        // to a broker that kept no session.
        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener).await;
            let (kind, body) = read_packet(&mut stream).await;
            assert_eq!(kind, SUBSCRIBE);
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x02])
                .await
                .unwrap();
            stream.flush().await.unwrap();
            drop(stream);

            let mut stream = accept_session(&listener).await;
            read_packet(&mut stream).await
        });

        let mut transport = MqttTransport::new(MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "actuator-bridge-reconnect".to_string(),
            ..MqttConfig::default()
        });
        transport.connect().await.unwrap();
        transport.subscribe("2ELE069", QoS::ExactlyOnce).await.unwrap();

        let (kind, body) = tokio::time::timeout(Duration::from_secs(10), broker)
            .await
            .expect("client reconnected")
            .unwrap();
        assert_eq!(kind, SUBSCRIBE);
        assert_eq!(subscribe_topic(&body), ("2ELE069".to_string(), 2));

        transport.close().await;
    }

    /// Round trip through a public broker.
    ///
    /// Ignored by default because it needs network access. Run with:
    ///   cargo test -p actuator-bridge mqtt::tests::public_broker_echo -- --ignored
    #[tokio::test]
    #[ignore]
    async fn public_broker_echo() {
        let config = MqttConfig {
            client_id: format!("actuator-bridge-test-{}", std::process::id()),
            ..MqttConfig::default()
        };
        let topic = format!("actuator-bridge/test/{}", std::process::id());
        let mut transport = MqttTransport::new(config);

        transport.connect().await.expect("connect");
        transport
            .subscribe(&topic, QoS::ExactlyOnce)
            .await
            .expect("subscribe");
        transport
            .publish(&topic, OutboundMessage::new(QoS::AtLeastOnce, "1 2 3"))
            .await
            .expect("publish");

        let mut received = Vec::new();
        for _ in 0..50 {
            received.extend(transport.poll(Duration::from_millis(200)).await.unwrap());
            if !received.is_empty() {
                break;
            }
        }
        assert_eq!(received[0].payload, Bytes::from_static(b"1 2 3"));

        transport.unsubscribe(&topic).await.unwrap();
        transport.disconnect().await.unwrap();
        transport.close().await;
    }
}
