//! Unified error type for the app-ops workspace
//!
//! Untrusted callers never see most of these: malformed requests on the
//! check/note/start path are answered with a rejection [`Mode`](crate::Mode).
//! Errors are reserved for authorization faults, administrative misuse,
//! configuration and storage problems.

use serde::{Deserialize, Serialize};

/// Unified error type for all app-ops operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum AppOpsError {
    /// Caller lacks the privilege required for the request
    #[error("Security fault: {message}")]
    SecurityFault {
        /// Description of the missing privilege
        message: String,
    },

    /// Malformed administrative request (unknown op, unknown package)
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected argument
        message: String,
    },

    /// Configuration or catalog could not be loaded or validated
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem
        message: String,
    },

    /// Persistent state could not be read or written
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure
        message: String,
    },

    /// Snapshot or config encoding failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the encoding failure
        message: String,
    },

    /// Internal inconsistency
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the inconsistency
        message: String,
    },
}

impl AppOpsError {
    /// Create a security fault
    pub fn security(message: impl Into<String>) -> Self {
        Self::SecurityFault {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is an authorization failure
    pub fn is_security_fault(&self) -> bool {
        matches!(self, Self::SecurityFault { .. })
    }
}

/// Standard Result type for app-ops operations
pub type Result<T> = std::result::Result<T, AppOpsError>;

impl From<std::io::Error> for AppOpsError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppOpsError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<toml::de::Error> for AppOpsError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppOpsError::security("uid 10001 cannot manage modes");
        assert!(err.is_security_fault());
        assert_eq!(
            err.to_string(),
            "Security fault: uid 10001 cannot manage modes"
        );
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = AppOpsError::from(io_err);
        assert!(matches!(err, AppOpsError::Storage { .. }));
    }

    #[test]
    fn test_toml_error_maps_to_config() {
        let err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        assert!(matches!(AppOpsError::from(err), AppOpsError::Config { .. }));
    }
}
