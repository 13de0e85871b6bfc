//! Configuration.
//!
//! Every setting has a default (see the `Default` impls of the component
//! configs) and can be overridden by a command-line flag or the matching
//! `ACTUATOR_BRIDGE_*` environment variable. Flags win over the environment.

use std::time::Duration;

use clap::Parser;

use crate::controller::ControllerConfig;
use crate::error::{Error, Result};
use crate::serial::SerialConfig;
use crate::transport::MqttConfig;

/// Bridge MQTT command messages to a serial-attached actuator.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Broker host name [default: broker.hivemq.com]
    #[arg(long, env = "ACTUATOR_BRIDGE_HOST")]
    pub host: Option<String>,

    /// Broker port [default: 1883]
    #[arg(long, env = "ACTUATOR_BRIDGE_PORT")]
    pub port: Option<u16>,

    /// MQTT client identifier [default: mbed-icraggs]
    #[arg(long, env = "ACTUATOR_BRIDGE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// MQTT keep-alive interval in seconds [default: 60]
    #[arg(long, env = "ACTUATOR_BRIDGE_KEEP_ALIVE")]
    pub keep_alive: Option<u64>,

    /// Seconds to wait for the broker to accept the connection [default: 10]
    #[arg(long, env = "ACTUATOR_BRIDGE_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<u64>,

    /// Topic carrying commands [default: 2ELE069]
    #[arg(short, long, env = "ACTUATOR_BRIDGE_TOPIC")]
    pub topic: Option<String>,

    /// Serial device of the actuator [default: /dev/ttyUSB0]
    #[arg(short, long, env = "ACTUATOR_BRIDGE_SERIAL")]
    pub serial: Option<String>,

    /// Serial baud rate [default: 9600]
    #[arg(short, long, env = "ACTUATOR_BRIDGE_BAUD")]
    pub baud: Option<u32>,

    /// Version quoted in self-test messages [default: 0.300000]
    #[arg(long, env = "ACTUATOR_BRIDGE_APP_VERSION")]
    pub app_version: Option<String>,

    /// Poll timeout in milliseconds during the self-test [default: 100]
    #[arg(long, env = "ACTUATOR_BRIDGE_SELF_TEST_POLL_MS")]
    pub self_test_poll_ms: Option<u64>,

    /// Poll timeout in milliseconds while listening [default: 100]
    #[arg(long, env = "ACTUATOR_BRIDGE_POLL_MS")]
    pub poll_ms: Option<u64>,

    /// Use an in-process broker fed from stdin instead of the network
    #[arg(long)]
    pub loopback: bool,

    /// Log frames instead of writing them to the serial port
    #[arg(long)]
    pub no_serial: bool,
}

/// Complete, validated bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub broker: MqttConfig,
    pub serial: SerialConfig,
    pub controller: ControllerConfig,

    /// Replace the broker with the loopback transport.
    pub loopback: bool,

    /// Write frames to the serial port (otherwise only log them).
    pub serial_enabled: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: MqttConfig::default(),
            serial: SerialConfig::default(),
            controller: ControllerConfig::default(),
            loopback: false,
            serial_enabled: true,
        }
    }
}

impl Cli {
    /// Apply the command line over the defaults and validate the result.
    pub fn into_config(self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::default();

        if let Some(host) = self.host {
            config.broker.host = host;
        }
        if let Some(port) = self.port {
            config.broker.port = port;
        }
        if let Some(client_id) = self.client_id {
            config.broker.client_id = client_id;
        }
        if let Some(secs) = self.keep_alive {
            config.broker.keep_alive = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout {
            config.broker.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(topic) = self.topic {
            config.controller.topic = topic;
        }
        if let Some(path) = self.serial {
            config.serial.path = path;
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        if let Some(version) = self.app_version {
            config.controller.app_version = version;
        }
        if let Some(ms) = self.self_test_poll_ms {
            config.controller.self_test_poll = Duration::from_millis(ms);
        }
        if let Some(ms) = self.poll_ms {
            config.controller.steady_poll = Duration::from_millis(ms);
        }
        config.loopback = self.loopback;
        config.serial_enabled = !self.no_serial;

        config.validate()?;
        Ok(config)
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        let topic = &self.controller.topic;
        if topic.is_empty() {
            return Err(Error::Config("topic must not be empty".into()));
        }
        if topic.contains(['+', '#']) {
            return Err(Error::Config(format!(
                "topic {:?} contains wildcards; the bridge publishes to it",
                topic
            )));
        }
        if self.broker.client_id.is_empty() {
            return Err(Error::Config("client id must not be empty".into()));
        }
        if self.broker.port == 0 {
            return Err(Error::Config("broker port must not be zero".into()));
        }
        if self.broker.keep_alive < Duration::from_secs(1) {
            return Err(Error::Config("keep-alive must be at least one second".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(Error::Config("baud rate must not be zero".into()));
        }
        if self.controller.self_test_poll.is_zero() || self.controller.steady_poll.is_zero() {
            return Err(Error::Config("poll timeouts must not be zero".into()));
        }
        Ok(())
    }
}
