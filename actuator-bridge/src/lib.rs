//! Bridge between an MQTT topic and a serial-attached actuator.
//!
//! Text commands of the form `"<a> <b> <level>"` published on a topic are
//! translated into five-byte actuator frames and written to a serial port.
//! On startup the bridge proves the broker round trip works at QoS 0, 1 and
//! 2 before it starts listening; the payload `quit` shuts it down.

pub mod actuator;
pub mod command;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod gate;
pub mod serial;
pub mod tracing;
pub mod transport;
