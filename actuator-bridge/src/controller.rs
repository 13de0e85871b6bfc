//! Bridge lifecycle.
//!
//! The controller owns everything mutable about a running bridge: the
//! lifecycle state, the arrival counter and the serial sink. It never blocks
//! on anything but [`Transport::poll`]; each call to [`BridgeController::step`]
//! does one bounded unit of work, and [`BridgeController::run`] simply steps
//! until the bridge has terminated.
//!
//! # Lifecycle
//!
//! ```text
//!  SelfTestQoS0 --(1 arrival)--> SelfTestQoS1 --(2)--> SelfTestQoS2 --(3)--> SteadyState
//!                                                                              |
//!                                                                       "quit" | signal
//!                                                                              v
//!                                                    Terminated <------- ShuttingDown
//! ```
//!
//! Each self-test phase publishes one greeting at its QoS level and waits
//! for its own message to come back through the subscription. There is no
//! timeout on that wait; [`BridgeController::request_shutdown`] is the way
//! out.
//!
//! Commands are forwarded to the actuator in every state, including during
//! the self-test. A `quit` seen during the self-test is remembered and acted
//! on as soon as the bridge reaches steady state.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::actuator::ActuatorFrame;
use crate::command::{self, Command, ParseResult};
use crate::gate::ConfirmationGate;
use crate::serial::SerialSink;
use crate::tracing::prelude::*;
use crate::transport::{InboundMessage, OutboundMessage, QoS, Transport};

/// Where the bridge is in its life.
///
/// Variants are declared in lifecycle order; states only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    SelfTestQoS0,
    SelfTestQoS1,
    SelfTestQoS2,
    SteadyState,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    /// QoS level exercised by a self-test phase.
    pub fn self_test_qos(self) -> Option<QoS> {
        match self {
            Self::SelfTestQoS0 => Some(QoS::AtMostOnce),
            Self::SelfTestQoS1 => Some(QoS::AtLeastOnce),
            Self::SelfTestQoS2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    pub fn is_self_test(self) -> bool {
        self.self_test_qos().is_some()
    }

    pub fn is_terminated(self) -> bool {
        self == Self::Terminated
    }

    fn next(self) -> Self {
        match self {
            Self::SelfTestQoS0 => Self::SelfTestQoS1,
            Self::SelfTestQoS1 => Self::SelfTestQoS2,
            Self::SelfTestQoS2 => Self::SteadyState,
            Self::SteadyState => Self::ShuttingDown,
            Self::ShuttingDown | Self::Terminated => Self::Terminated,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SelfTestQoS0 => "self-test (QoS 0)",
            Self::SelfTestQoS1 => "self-test (QoS 1)",
            Self::SelfTestQoS2 => "self-test (QoS 2)",
            Self::SteadyState => "steady state",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Controller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// The one topic the bridge subscribes and publishes to.
    pub topic: String,

    /// Version string quoted in the self-test greetings.
    pub app_version: String,

    /// Poll timeout while waiting for a self-test message to come back.
    pub self_test_poll: Duration,

    /// Poll timeout while listening for commands.
    pub steady_poll: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            topic: "2ELE069".to_string(),
            app_version: "0.300000".to_string(),
            self_test_poll: Duration::from_millis(100),
            steady_poll: Duration::from_millis(100),
        }
    }
}

/// Totals reported when the bridge terminates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub arrivals: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
}

/// Drives one bridge from self-test to termination.
pub struct BridgeController<S> {
    config: ControllerConfig,
    sink: S,
    state: LifecycleState,
    gate: ConfirmationGate,
    /// Whether the current self-test phase has published its greeting.
    phase_published: bool,
    /// A `quit` arrived before steady state.
    quit_pending: bool,
    frames_sent: u64,
    send_failures: u64,
}

impl<S: SerialSink> BridgeController<S> {
    pub fn new(config: ControllerConfig, sink: S) -> Self {
        Self {
            config,
            sink,
            state: LifecycleState::SelfTestQoS0,
            gate: ConfirmationGate::new(),
            phase_published: false,
            quit_pending: false,
            frames_sent: 0,
            send_failures: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn arrivals(&self) -> u64 {
        self.gate.count()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            arrivals: self.gate.count(),
            frames_sent: self.frames_sent,
            send_failures: self.send_failures,
        }
    }

    /// Connect and subscribe. Failures are logged and startup continues.
    pub async fn start<T: Transport>(&mut self, transport: &mut T) {
        if let Err(e) = transport.connect().await {
            error!(error = %e, "Broker connection failed, continuing");
        }

        match transport.subscribe(&self.config.topic, QoS::ExactlyOnce).await {
            Ok(()) => info!(topic = %self.config.topic, "Subscribed"),
            Err(e) => error!(
                topic = %self.config.topic,
                error = %e,
                "Subscribe failed, continuing"
            ),
        }
    }

    /// Leave for ShuttingDown at the next step, from whatever state we are in.
    pub fn request_shutdown(&mut self) {
        if self.state < LifecycleState::ShuttingDown {
            info!(state = %self.state, "Shutdown requested");
            self.transition(LifecycleState::ShuttingDown);
        }
    }

    /// Step until terminated, honouring `shutdown` between steps.
    pub async fn run<T: Transport>(
        &mut self,
        transport: &mut T,
        shutdown: &CancellationToken,
    ) -> RunSummary {
        while !self.state.is_terminated() {
            if shutdown.is_cancelled() {
                self.request_shutdown();
            }
            self.step(transport).await;
        }
        self.summary()
    }

    /// Do one unit of work for the current state and return the new state.
    pub async fn step<T: Transport>(&mut self, transport: &mut T) -> LifecycleState {
        match self.state {
            LifecycleState::SelfTestQoS0
            | LifecycleState::SelfTestQoS1
            | LifecycleState::SelfTestQoS2 => self.self_test_step(transport).await,
            LifecycleState::SteadyState => {
                if self.quit_pending {
                    info!("Acting on shutdown received during self-test");
                    self.transition(LifecycleState::ShuttingDown);
                } else {
                    self.poll_and_dispatch(transport, self.config.steady_poll)
                        .await;
                }
            }
            LifecycleState::ShuttingDown => self.shut_down(transport).await,
            LifecycleState::Terminated => {}
        }
        self.state
    }

    /// Handle one inbound message: count it, classify it, act on it.
    pub async fn handle_message(&mut self, message: &InboundMessage) -> ParseResult {
        let arrival = self.gate.observe();
        info!(
            arrival,
            qos = message.qos.level(),
            retained = message.retained,
            dup = message.duplicate,
            id = message.id,
            payload = %String::from_utf8_lossy(command::payload_text(&message.payload)),
            "Message arrived"
        );

        let result = command::classify(&message.payload);
        match result {
            ParseResult::Command(command) if !self.state.is_terminated() => {
                self.dispatch(command).await;
            }
            ParseResult::Shutdown => self.on_shutdown_token(),
            _ => {}
        }
        result
    }

    async fn self_test_step<T: Transport>(&mut self, transport: &mut T) {
        let Some(qos) = self.state.self_test_qos() else {
            return;
        };
        let threshold = u64::from(qos.level());

        if !self.phase_published {
            let message = OutboundMessage::new(qos, self.greeting(qos));
            match transport.publish(&self.config.topic, message).await {
                Ok(()) => debug!(qos = qos.level(), "Self-test message published"),
                Err(e) => warn!(qos = qos.level(), error = %e, "Self-test publish failed"),
            }
            self.phase_published = true;
        }

        if !self.gate.reached(threshold) {
            self.poll_and_dispatch(transport, self.config.self_test_poll)
                .await;
        }

        // Dispatching may have moved us on (a shutdown request, say).
        if self.state.self_test_qos() == Some(qos) && self.gate.reached(threshold) {
            info!(qos = qos.level(), "Self-test message confirmed");
            self.phase_published = false;
            self.transition(self.state.next());
        }
    }

    async fn shut_down<T: Transport>(&mut self, transport: &mut T) {
        if let Err(e) = transport.unsubscribe(&self.config.topic).await {
            warn!(error = %e, "Unsubscribe failed");
        }
        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }
        transport.close().await;

        self.transition(LifecycleState::Terminated);
        info!(
            frames_sent = self.frames_sent,
            send_failures = self.send_failures,
            "Finishing with {} messages received",
            self.gate.count()
        );
    }

    async fn poll_and_dispatch<T: Transport>(&mut self, transport: &mut T, timeout: Duration) {
        match transport.poll(timeout).await {
            Ok(messages) => {
                for message in &messages {
                    self.handle_message(message).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Transport poll failed");
                // Don't spin on a transport that fails immediately.
                tokio::time::sleep(timeout).await;
            }
        }
    }

    async fn dispatch(&mut self, command: Command) {
        let frame = ActuatorFrame::encode(&command);
        info!(command = %command, frame = %frame, "Sending frame");
        match self.sink.send(&frame).await {
            Ok(()) => self.frames_sent += 1,
            Err(e) => {
                self.send_failures += 1;
                error!(error = %e, "Failed to send frame");
            }
        }
    }

    fn on_shutdown_token(&mut self) {
        match self.state {
            LifecycleState::SteadyState => {
                info!("Shutdown token received");
                self.transition(LifecycleState::ShuttingDown);
            }
            state if state.is_self_test() => {
                info!("Shutdown token received during self-test, deferring");
                self.quit_pending = true;
            }
            _ => {}
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        debug_assert!(next > self.state, "{} -> {} goes backwards", self.state, next);
        info!(from = %self.state, to = %next, "State change");
        self.state = next;
    }

    /// Self-test greeting, NUL-terminated.
    fn greeting(&self, qos: QoS) -> Bytes {
        let text = format!(
            "Hello World!  QoS {} message from app version {}",
            qos.level(),
            self.config.app_version
        );
        let mut buf = BytesMut::with_capacity(text.len() + 1);
        buf.put_slice(text.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }
}
