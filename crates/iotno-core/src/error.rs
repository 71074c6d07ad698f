//! Error types for the orchestration domain.

/// The result type used throughout the iotno crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in domain operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request or payload failed validation.
    #[error("validation error: {message}")]
    Validation {
        /// Description of what failed validation.
        message: String,
    },

    /// An identifier could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of the malformed identifier.
        message: String,
    },

    /// A configuration value is missing or malformed.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// A serialization or deserialization failure.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = Error::validation("devices list cannot be empty");
        assert!(err.to_string().contains("devices list cannot be empty"));
    }

    #[test]
    fn serde_error_converts() {
        let bad: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
