//! Error types for the gateway
//!
//! Only `ConfigError` is fatal. Transport errors are absorbed by the connection
//! supervisor, provider errors skip the affected operation, and protocol parse
//! errors skip the offending telemetry field.

use thiserror::Error;

/// Invalid or incomplete configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("com_port cannot be empty")]
    EmptyPort,

    #[error("baud_rate must be greater than zero")]
    InvalidBaudRate,

    #[error("slider_mapping must list at least one slider")]
    NoSliders,

    #[error("slider {0} has an empty id")]
    EmptySliderId(usize),

    #[error("slider id '{0}' is configured more than once")]
    DuplicateSlider(String),

    #[error("group '{0}' contains an empty keyword")]
    EmptyKeyword(String),

    #[error("tuning.{field} is out of range: {reason}")]
    Tuning { field: &'static str, reason: String },
}

/// Serial link failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port is not open")]
    NotConnected,

    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial link closed")]
    Closed,
}

/// Failures reported by the audio mixer, media provider or image codec
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("audio mixer: {0}")]
    Mixer(String),

    #[error("media session: {0}")]
    Media(String),

    #[error("cover image: {0}")]
    Image(String),
}

/// A telemetry field that could not be turned into a slider reading
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolParseError {
    #[error("empty field")]
    EmptyField,

    #[error("not a number: '{0}'")]
    InvalidNumber(String),

    #[error("reading {0} is negative")]
    OutOfRange(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_readable() {
        let err = ConfigError::DuplicateSlider("spotify".to_string());
        assert_eq!(err.to_string(), "slider id 'spotify' is configured more than once");

        let err = ConfigError::Tuning {
            field: "image_chunk_size",
            reason: "must be greater than zero".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "tuning.image_chunk_size is out of range: must be greater than zero"
        );

        let err = ProtocolParseError::InvalidNumber("abc".to_string());
        assert_eq!(err.to_string(), "not a number: 'abc'");
    }

    #[test]
    fn test_io_error_converts_to_transport_error() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "stalled");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
