//! Error types shared across the device core.

use thiserror::Error;

/// Session protocol failures, surfaced to the user as non-fatal alerts.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport could not be established
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// No hello response within the handshake window
    #[error("server timeout")]
    ServerTimeout,

    /// Send failed on an open channel
    #[error("server error: {0}")]
    Server(String),

    /// Inbound payload could not be parsed
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Short user-facing text for the alert line.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ServerNotFound(_) => "Server not found",
            Self::ServerTimeout => "Server timeout",
            Self::Server(_) | Self::Malformed(_) => "Server error",
        }
    }
}

/// Firmware update failures. Every variant leaves the running image untouched.
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("network error: {0}")]
    Network(String),

    /// The manifest was fetched but is not usable
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// Downloaded image carries the version already running
    #[error("firmware version {0} is already running")]
    SameVersion(String),

    #[error("image validation failed: {0}")]
    Validation(String),

    #[error("partition write failed: {0}")]
    Write(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("opus error: {0}")]
    Opus(#[from] opus::Error),

    #[error("resampler setup failed: {0}")]
    ResamplerSetup(#[from] rubato::ResamplerConstructionError),

    #[error("resample failed: {0}")]
    Resample(#[from] rubato::ResampleError),

    /// A prompt sound record claims more bytes than remain
    #[error("truncated sound record at offset {offset}: need {needed} bytes, {available} left")]
    TruncatedSound {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Session transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_alert_text() {
        assert_eq!(ProtocolError::ServerTimeout.user_message(), "Server timeout");
        assert_eq!(
            ProtocolError::ServerNotFound("refused".into()).user_message(),
            "Server not found"
        );
        assert_eq!(ProtocolError::Server("x".into()).user_message(), "Server error");
    }

    #[test]
    fn truncated_sound_reports_offsets() {
        let err = CodecError::TruncatedSound {
            offset: 4,
            needed: 10,
            available: 3,
        };
        assert!(err.to_string().contains("offset 4"));
    }
}
