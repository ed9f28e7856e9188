//! Error types for directory operations.
//!
//! The variants fall into the groups the retry layer cares about: transient server failures
//! (recorded and retried elsewhere), the terminal [`Error::ServerUnavailable`], caller mistakes
//! ([`Error::InvalidArgument`]), per-entry materialization faults, and everything else, which is
//! surfaced unchanged.

use thiserror::Error;

/// Main error type for directory operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A directory server could not be reached or reported that it is unavailable.
    ///
    /// Produced by session opening and by operation bodies; the retry orchestrator records it
    /// against `endpoint` and moves on to the next candidate.
    #[error("Transient failure on {endpoint}: {message}")]
    Transient {
        /// Endpoint the failure was observed on
        endpoint: String,
        /// Error message
        message: String,
    },

    /// Every attempt allowed by the configuration failed with a transient error.
    #[error("Directory server unavailable: {0}")]
    ServerUnavailable(String),

    /// A required argument was empty or otherwise unusable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A directory record could not be converted into a principal.
    #[error("Cannot materialize entry `{dn}`: {reason}")]
    Materialization {
        /// Distinguished name of the offending entry
        dn: String,
        /// Why the entry was rejected
        reason: String,
    },

    /// The directory rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid distinguished name
    #[error("Invalid distinguished name: {0}")]
    InvalidDistinguishedName(String),

    /// Invalid security identifier
    #[error("Invalid security identifier: {0}")]
    InvalidSid(String),

    /// Invalid GUID
    #[error("Invalid GUID: {0}")]
    InvalidGuid(String),

    /// Invalid endpoint
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Name resolution failed
    #[error("Name resolution failed: {0}")]
    ResolutionFailed(String),

    /// Failed to parse settings
    #[error("Failed to parse settings: {0}")]
    SettingsParseError(String),

    /// Error reported by the directory server or the protocol library
    #[error("External service error: {service}: {message}")]
    ExternalServiceError {
        /// Service name that failed
        service: String,
        /// Error message
        message: String,
    },
}

/// Specialized result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a transient error for the given endpoint.
    #[must_use]
    pub fn transient(endpoint: impl ToString, message: impl Into<String>) -> Self {
        Self::Transient {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Creates a materialization fault for the entry `dn`.
    #[must_use]
    pub fn materialization(dn: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Materialization {
            dn: dn.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the failure means "try another server".
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "TRANSIENT",
            Self::ServerUnavailable(_) => "SERVER_UNAVAILABLE",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Materialization { .. } => "MATERIALIZATION_FAULT",
            Self::Authentication(_) => "AUTHENTICATION_FAILED",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::InvalidDistinguishedName(_) => "INVALID_DN",
            Self::InvalidSid(_) => "INVALID_SID",
            Self::InvalidGuid(_) => "INVALID_GUID",
            Self::InvalidEndpoint(_) => "INVALID_ENDPOINT",
            Self::ResolutionFailed(_) => "RESOLUTION_FAILED",
            Self::SettingsParseError(_) => "SETTINGS_PARSE_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::ServerUnavailable(_)
                | Self::ConfigError(_)
                | Self::InvalidEndpoint(_)
                | Self::ExternalServiceError { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::SettingsParseError(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Self::InvalidGuid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::transient("ldap://10.0.0.1:389", "refused").error_code(),
            "TRANSIENT"
        );
        assert_eq!(
            Error::ServerUnavailable("dc".to_string()).error_code(),
            "SERVER_UNAVAILABLE"
        );
        assert_eq!(
            Error::InvalidArgument("pattern".to_string()).error_code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            Error::materialization("cn=x", "bad sid").error_code(),
            "MATERIALIZATION_FAULT"
        );
        assert_eq!(
            Error::InvalidSid("S-1".to_string()).error_code(),
            "INVALID_SID"
        );
        assert_eq!(
            Error::ExternalServiceError {
                service: "ldap".to_string(),
                message: "msg".to_string()
            }
            .error_code(),
            "EXTERNAL_SERVICE_ERROR"
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::transient("ldap://10.0.0.1:389", "connection refused");
        assert_eq!(
            err.to_string(),
            "Transient failure on ldap://10.0.0.1:389: connection refused"
        );

        let err = Error::materialization("cn=broken,dc=example,dc=com", "truncated objectSid");
        assert_eq!(
            err.to_string(),
            "Cannot materialize entry `cn=broken,dc=example,dc=com`: truncated objectSid"
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(Error::transient("x", "y").is_transient());
        assert!(!Error::ServerUnavailable("x".to_string()).is_transient());
        assert!(!Error::Authentication("x".to_string()).is_transient());
        assert!(!Error::InvalidGuid("x".to_string()).is_transient());
    }

    #[test]
    fn test_should_log() {
        assert!(Error::ServerUnavailable("dc".to_string()).should_log());
        assert!(Error::ConfigError("test".to_string()).should_log());
        assert!(!Error::InvalidArgument("test".to_string()).should_log());
        assert!(!Error::materialization("cn=x", "y").should_log());
    }

    #[test]
    fn test_from_uuid_error() {
        let err = uuid::Uuid::parse_str("not-a-uuid").unwrap_err();
        let converted: Error = err.into();
        assert_eq!(converted.error_code(), "INVALID_GUID");
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{invalid json}").unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::SettingsParseError(_)));
    }
}
