//! Crate-level error type.
//!
//! Transport and serial failures have their own types
//! ([`crate::transport::TransportError`], [`crate::serial::SerialError`]) and
//! are logged where they happen rather than propagated; the bridge keeps
//! going. What remains here are the errors that stop it from starting.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
