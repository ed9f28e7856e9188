//! Settings for directory clients.
//!
//! [`DirectorySettings`] is the serializable, validated form of a client configuration, suitable
//! for loading from a settings file. Client crates turn it into their own runtime configuration.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Default LDAP port.
pub const DEFAULT_LDAP_PORT: u16 = 389;

/// Default LDAPS port.
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// Default number of attempts the retry orchestrator makes per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default number of entries requested per paged-search round trip.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Default connection timeout (seconds).
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Default operation timeout (seconds).
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

/// Kind of directory store a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    /// Local machine account store.
    Machine,
    /// Directory-wide (domain) store.
    #[default]
    Domain,
    /// Application-specific directory partition.
    ApplicationDirectory,
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Machine => "machine",
            Self::Domain => "domain",
            Self::ApplicationDirectory => "application_directory",
        })
    }
}

/// Attribute used to look a principal up by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityType {
    /// Pre-Windows 2000 logon name.
    #[default]
    SamAccountName,
    /// Common name.
    Name,
    /// `user@realm` style logon name.
    UserPrincipalName,
    /// Full distinguished name.
    DistinguishedName,
    /// Security identifier in `S-1-...` form.
    Sid,
    /// Object GUID.
    Guid,
}

impl IdentityType {
    /// Returns true for keys stored as octet strings rather than text.
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(self, Self::Sid | Self::Guid)
    }
}

/// SASL mechanism used when no explicit credentials are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaslMechanism {
    /// Kerberos with the calling process's ticket; the service name is `ldap/<server>`.
    #[default]
    Gssapi,
    /// Identity established by the transport (TLS client certificate or local socket).
    External,
}

/// Serializable directory client settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DirectorySettings {
    /// Logical server name; empty means the local default directory.
    #[serde(default)]
    pub server: String,

    /// Port override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Whether to use LDAPS.
    #[serde(default)]
    pub secure: bool,

    /// Bind identity for explicit-credential sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Bind password for explicit-credential sessions.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Bind mechanism for sessions without explicit credentials.
    #[serde(default)]
    pub sasl_mechanism: SaslMechanism,

    /// Search base (container) distinguished name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Kind of directory store.
    #[serde(default)]
    pub context_type: ContextType,

    /// Default key kind used for principal lookups.
    #[serde(default)]
    pub identity_type: IdentityType,

    /// Attempt ceiling for the retry orchestrator.
    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Entries per paged-search round trip.
    #[validate(range(min = 1, max = 100_000))]
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Connection timeout in seconds.
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Operation timeout in seconds.
    #[validate(range(min = 1, max = 3600))]
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Whether to verify TLS certificates
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,

    /// Optional path to a custom CA certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca_cert: Option<PathBuf>,
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

const fn default_connection_timeout_secs() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_SECS
}

const fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_SECS
}

const fn default_tls_verify() -> bool {
    true
}

impl DirectorySettings {
    /// Creates validated settings for the given logical server name.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn new(server: impl Into<String>) -> Result<Self, Error> {
        Self {
            server: server.into(),
            ..Self::default()
        }
        .validated()
    }

    /// Parses and validates settings from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_json(input: &str) -> Result<Self, Error> {
        let settings: Self = serde_json::from_str(input)?;
        settings.validated()
    }

    /// Runs field validation and cross-field checks.
    ///
    /// Blank usernames and empty passwords count as absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] when a field is out of range or the credential pair is
    /// half-specified.
    pub fn validated(mut self) -> Result<Self, Error> {
        self.username = self.username.filter(|username| !username.trim().is_empty());
        self.password = self.password.filter(|password| !password.is_empty());

        self.validate()
            .map_err(|e| Error::ConfigError(format!("Invalid configuration: {e}")))?;

        if self.username.is_some() != self.password.is_some() {
            return Err(Error::ConfigError(
                "username and password must be supplied together".to_string(),
            ));
        }

        Ok(self)
    }

    /// Set explicit bind credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the search container.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Set the attempt ceiling.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Returns true when no server name is configured.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.server.trim().is_empty()
    }

    /// Port to connect to, honoring the `secure` flag when no override is set.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.secure {
            DEFAULT_LDAPS_PORT
        } else {
            DEFAULT_LDAP_PORT
        })
    }

    /// Connection timeout as a [`Duration`].
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Operation timeout as a [`Duration`].
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: None,
            secure: false,
            username: None,
            password: None,
            sasl_mechanism: SaslMechanism::default(),
            container: None,
            context_type: ContextType::default(),
            identity_type: IdentityType::default(),
            max_attempts: default_max_attempts(),
            page_size: default_page_size(),
            connection_timeout_secs: default_connection_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            tls_verify: default_tls_verify(),
            tls_ca_cert: None,
        }
    }
}
