//! Common error types for Ocellus.

use thiserror::Error;

/// Result type alias using Ocellus's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for ambient (non-device) failures.
///
/// Device-call failures never reach this type; they are swallowed at the
/// component boundary and surface as state flags.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (config file, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_keep_message() {
        assert_eq!(
            Error::config("near clip must be positive").to_string(),
            "configuration error: near clip must be positive"
        );
        assert_eq!(
            Error::serialization("trailing comma").to_string(),
            "serialization error: trailing comma"
        );
    }

    #[test]
    fn test_every_variant_has_a_producer() {
        let produced = [
            Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "hmd.json")),
            Error::from(serde_json::from_str::<u32>("{").unwrap_err()),
            Error::config("far clip below near clip"),
        ];
        for err in produced {
            // Exhaustive on purpose: a new variant needs a producer here.
            match err {
                Error::Io(_) | Error::Serialization(_) | Error::Config(_) => {}
            }
        }
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(matches!(Error::from(err), Error::Serialization(_)));
    }
}
