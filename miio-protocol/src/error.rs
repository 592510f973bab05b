use std::io;

use thiserror::Error;

use crate::transient;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Call to device timed out")]
    Timeout,

    #[error("Could not connect to device, token could not be auto-discovered")]
    MissingToken,

    #[error("Could not connect to device")]
    ConnectionFailure,

    /// An I/O failure with its canonicalized symbolic code.
    #[error("{message}")]
    Socket {
        code: String,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// A structured error reply from the device, numeric code preserved.
    #[error("{message}")]
    Device { code: i64, message: String },

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Build a `Socket` error from a raw code string. The code is stored in
    /// canonical form so classification stays idempotent.
    pub fn socket_code(code: &str, message: impl Into<String>) -> Self {
        ProtocolError::Socket {
            code: transient::canonical_code(code),
            message: message.into(),
            source: None,
        }
    }

    /// Build a `Socket` error from an I/O error, translating the OS error
    /// number into its symbolic name.
    pub fn socket_io(err: io::Error) -> Self {
        ProtocolError::Socket {
            code: transient::code_for_io(&err),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// The shared socket is gone or being replaced. Surfaces as `ENOTCONN`
    /// so callers classify it as transient and retry.
    pub fn not_connected(message: impl Into<String>) -> Self {
        ProtocolError::Socket {
            code: "ENOTCONN".to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Stable symbolic code used by the transient classifier and surfaced to
    /// callers alongside the message.
    pub fn code(&self) -> Option<&str> {
        match self {
            ProtocolError::Timeout => Some("timeout"),
            ProtocolError::MissingToken => Some("missing-token"),
            ProtocolError::ConnectionFailure => Some("connection-failure"),
            ProtocolError::Socket { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Numeric device error code, for `Device` errors.
    pub fn device_code(&self) -> Option<i64> {
        match self {
            ProtocolError::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}
