//! Serial output to the actuator.
//!
//! The port is opened raw (8N1, no flow control) at the configured baud rate
//! and frames are written through a [`FramedWrite`] with [`ActuatorCodec`].
//! Anything implementing [`SerialSink`] can stand in for the port.

use async_trait::async_trait;
use futures::sink::SinkExt;
use tokio::io::AsyncWrite;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::codec::FramedWrite;

use crate::actuator::{ActuatorCodec, ActuatorFrame};
use crate::tracing::prelude::*;

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device node, e.g. `/dev/ttyUSB0`.
    pub path: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("serial port {0} is not available")]
    Unavailable(String),
}

/// Destination for actuator frames.
#[async_trait]
pub trait SerialSink: Send {
    /// Write one frame. Returns once the bytes are handed to the device.
    async fn send(&mut self, frame: &ActuatorFrame) -> Result<(), SerialError>;
}

#[async_trait]
impl<S: SerialSink + ?Sized> SerialSink for Box<S> {
    async fn send(&mut self, frame: &ActuatorFrame) -> Result<(), SerialError> {
        (**self).send(frame).await
    }
}

/// Frame writer over any byte stream.
pub struct FramedSink<W> {
    writer: FramedWrite<W, ActuatorCodec>,
}

impl<W: AsyncWrite + Unpin> FramedSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: FramedWrite::new(inner, ActuatorCodec),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> SerialSink for FramedSink<W> {
    async fn send(&mut self, frame: &ActuatorFrame) -> Result<(), SerialError> {
        // `send` flushes, so the frame is on its way when this returns.
        self.writer.send(*frame).await?;
        Ok(())
    }
}

/// Open the actuator's serial port.
pub fn open(config: &SerialConfig) -> Result<FramedSink<SerialStream>, SerialError> {
    let port = tokio_serial::new(&config.path, config.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|source| SerialError::Open {
            path: config.path.clone(),
            source,
        })?;

    info!(path = %config.path, baud = config.baud_rate, "Serial port open");
    Ok(FramedSink::new(port))
}

/// Sink used when the port could not be opened: every send fails.
///
/// Keeps the bridge running so broker traffic and shutdown still work.
#[derive(Debug)]
pub struct UnavailableSink {
    path: String,
}

impl UnavailableSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SerialSink for UnavailableSink {
    async fn send(&mut self, _frame: &ActuatorFrame) -> Result<(), SerialError> {
        Err(SerialError::Unavailable(self.path.clone()))
    }
}

/// Sink that only logs, for running without hardware.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SerialSink for LogSink {
    async fn send(&mut self, frame: &ActuatorFrame) -> Result<(), SerialError> {
        info!(
            frame = %frame,
            a = frame.flag_a(),
            b = frame.flag_b(),
            level = frame.level(),
            "Frame (not written, serial disabled)"
        );
        Ok(())
    }
}
