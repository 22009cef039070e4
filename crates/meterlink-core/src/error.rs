//! Error types for meterlink

use thiserror::Error;

use crate::channel::ChannelError;
use crate::protocol::ErrorCode;
use crate::schema::SchemaError;

/// Result type alias for meterlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in meterlink
#[derive(Debug, Error)]
pub enum Error {
    /// No channel to the engine is available right now
    #[error("Not connected to the engine")]
    NotConnected,

    /// Transport failure while calling the engine
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The engine's reply did not have the expected layout
    #[error("Malformed reply: {0}")]
    Malformed(#[from] SchemaError),

    /// The engine answered with a non-Ok status
    #[error("Remote error {code}{}", message_suffix(.message))]
    Remote {
        code: ErrorCode,
        message: Option<String>,
    },

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

fn message_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {}", m))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = Error::Remote {
            code: ErrorCode::NotFound,
            message: Some("no such meter".into()),
        };
        assert_eq!(err.to_string(), "Remote error NotFound: no such meter");

        let err = Error::Remote {
            code: ErrorCode::Error,
            message: None,
        };
        assert_eq!(err.to_string(), "Remote error Error");
    }

    #[test]
    fn test_conversions_keep_cause() {
        let err = Error::from(ChannelError::ConnectionLost("gone".into()));
        assert!(matches!(err, Error::Channel(ChannelError::ConnectionLost(_))));
        assert_eq!(err.to_string(), "Channel error: Connection lost: gone");

        let err = Error::from(SchemaError::Empty);
        assert!(matches!(err, Error::Malformed(SchemaError::Empty)));
    }
}
