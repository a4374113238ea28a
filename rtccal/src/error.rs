//! Error types for rtccal.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for rtccal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for rtccal operations.
///
/// Every variant is fatal to a calibration run: the wire protocol has no
/// resynchronization primitive, so nothing is retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device path is unusable or cannot be opened at the requested rate.
    #[error("Cannot open {port}: {reason}")]
    Connection {
        /// Port name/path.
        port: String,
        /// Underlying failure.
        reason: String,
    },

    /// Clear-to-send was not asserted when the session started.
    #[error("Device not ready: {0}")]
    DeviceNotReady(String),

    /// The reset/boot/escape/echo sequence did not complete.
    #[error("Handshake failed during {stage}: {reason}")]
    HandshakeFailed {
        /// Handshake stage that failed.
        stage: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// An expected marker never arrived within the deadline.
    #[error("Timed out after {:.1}s waiting for {marker:?}", waited.as_secs_f64())]
    ProtocolTimeout {
        /// Marker that was being waited for.
        marker: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The transport did not accept written bytes in time.
    #[error("Write timed out: {0}")]
    WriteTimeout(String),

    /// The host clock moved in a way that would stall a timing-critical spin.
    #[error("Clock skew: {0}")]
    ClockSkew(String),

    /// The device replied with something the protocol does not allow.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The embedding application requested cancellation.
    #[error("Interrupted")]
    Interrupted,

    /// Invalid calibration parameters.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Map a marker timeout into a handshake failure for the given stage.
    ///
    /// Other errors (I/O, interruption) pass through unchanged.
    pub(crate) fn into_handshake(self, stage: &'static str) -> Self {
        match self {
            Self::ProtocolTimeout { .. } => Self::HandshakeFailed {
                stage,
                reason: self.to_string(),
            },
            other => other,
        }
    }
}
