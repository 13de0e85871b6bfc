//! Daemon lifecycle.
//!
//! Wires the configured transport and serial sink to a
//! [`BridgeController`], installs signal handlers, and runs the controller
//! until it terminates.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::BridgeConfig;
use crate::controller::{BridgeController, RunSummary};
use crate::error::Result;
use crate::serial::{self, LogSink, SerialSink, UnavailableSink};
use crate::tracing::prelude::*;
use crate::transport::{LoopbackHandle, LoopbackTransport, MqttTransport, QoS, Transport};

/// The main daemon.
pub struct Daemon {
    config: BridgeConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the bridge until it terminates, by "quit" or by signal.
    pub async fn run(self) -> Result<RunSummary> {
        let sink = self.open_sink();

        if self.config.loopback {
            let transport = LoopbackTransport::new();
            self.spawn_stdin_feeder(transport.handle());
            self.drive(transport, sink).await
        } else {
            let transport = MqttTransport::new(self.config.broker.clone());
            self.drive(transport, sink).await
        }
    }

    /// Serial sink per configuration. A port that fails to open is logged
    /// and replaced by a sink that rejects every frame.
    fn open_sink(&self) -> Box<dyn SerialSink> {
        if !self.config.serial_enabled {
            info!("Serial output disabled; frames will only be logged");
            return Box::new(LogSink::new());
        }

        match serial::open(&self.config.serial) {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                error!(error = %e, "Failed to open serial port, continuing without it");
                Box::new(UnavailableSink::new(self.config.serial.path.clone()))
            }
        }
    }

    async fn drive<T: Transport>(
        &self,
        mut transport: T,
        sink: Box<dyn SerialSink>,
    ) -> Result<RunSummary> {
        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                tokio::select! {
                    _ = sigint.recv() => {
                        info!("Received SIGINT.");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM.");
                    }
                    _ = shutdown.cancelled() => return,
                }
                shutdown.cancel();
            }
        });

        let mut controller = BridgeController::new(self.config.controller.clone(), sink);
        controller.start(&mut transport).await;

        info!("Started.");
        info!("For debugging, set RUST_LOG=actuator_bridge=debug or trace.");

        let summary = controller.run(&mut transport, &self.shutdown).await;

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(summary)
    }

    /// Publish each stdin line on the bridge topic (loopback mode).
    fn spawn_stdin_feeder(&self, handle: LoopbackHandle) {
        let topic = self.config.controller.topic.clone();
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            info!(topic = %topic, "Loopback mode: each line of stdin is published");
            let mut lines = BufReader::new(tokio::io::stdin()).lines();

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !handle.publish(&topic, QoS::AtMostOnce, line) {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("stdin closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read stdin");
                            break;
                        }
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}
