//! Runtime configuration for [`crate::DirectoryClient`].

use crate::{dn::DistinguishedName, Result};
use directory_core::config::{
    DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_LDAPS_PORT, DEFAULT_LDAP_PORT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_OPERATION_TIMEOUT_SECS, DEFAULT_PAGE_SIZE,
};
use directory_core::{ContextType, DirectorySettings, IdentityType, SaslMechanism};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::time::Duration;

/// Explicit bind credentials.
#[derive(Debug)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates a credential pair.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Bind identity.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Bind secret.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

/// Configuration for a directory client.
#[derive(Debug)]
pub struct DirectoryConfig {
    server: String,
    port: Option<u16>,
    secure: bool,
    credentials: Option<Credentials>,
    sasl_mechanism: SaslMechanism,
    container: Option<DistinguishedName>,
    context_type: ContextType,
    identity_type: IdentityType,
    max_attempts: u32,
    page_size: u32,
    connection_timeout_secs: u64,
    operation_timeout_secs: u64,
    tls_verify: bool,
    tls_ca_cert: Option<PathBuf>,
}

impl DirectoryConfig {
    /// Creates a configuration for the logical server `server`.
    ///
    /// An empty name selects the local default directory, which is used without failover.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into().trim().to_string(),
            port: None,
            secure: false,
            credentials: None,
            sasl_mechanism: SaslMechanism::default(),
            container: None,
            context_type: ContextType::default(),
            identity_type: IdentityType::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            page_size: DEFAULT_PAGE_SIZE,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            tls_verify: true,
            tls_ca_cert: None,
        }
    }

    /// Builds a configuration from validated settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings fail validation or the container is not a valid
    /// distinguished name.
    pub fn from_settings(settings: DirectorySettings) -> Result<Self> {
        let settings = settings.validated()?;

        let mut config = Self::new(settings.server)
            .with_secure(settings.secure)
            .with_context_type(settings.context_type)
            .with_identity_type(settings.identity_type)
            .with_max_attempts(settings.max_attempts)
            .with_page_size(settings.page_size)
            .with_connection_timeout_secs(settings.connection_timeout_secs)
            .with_operation_timeout_secs(settings.operation_timeout_secs)
            .with_tls_verification(settings.tls_verify)
            .with_sasl_mechanism(settings.sasl_mechanism);

        config.port = settings.port;
        config.tls_ca_cert = settings.tls_ca_cert;
        if let Some(container) = settings.container.as_deref() {
            config.container = Some(DistinguishedName::parse(container)?);
        }
        if let (Some(username), Some(password)) = (settings.username, settings.password) {
            config = config.with_credentials(username, password);
        }

        Ok(config)
    }

    /// SASL mechanism used when no explicit credentials are configured.
    #[must_use]
    pub const fn sasl_mechanism(&self) -> SaslMechanism {
        self.sasl_mechanism
    }

    /// Logical server name (empty for the local directory).
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Returns true when no server name is configured.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.server.is_empty()
    }

    /// Port to connect to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.secure {
            DEFAULT_LDAPS_PORT
        } else {
            DEFAULT_LDAP_PORT
        })
    }

    /// Whether connections use LDAPS.
    #[must_use]
    pub const fn secure(&self) -> bool {
        self.secure
    }

    /// Explicit bind credentials; `None` means the process's own identity is used.
    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Configured search container.
    #[must_use]
    pub const fn container(&self) -> Option<&DistinguishedName> {
        self.container.as_ref()
    }

    /// Kind of directory store.
    #[must_use]
    pub const fn context_type(&self) -> ContextType {
        self.context_type
    }

    /// Default identity key kind.
    #[must_use]
    pub const fn identity_type(&self) -> IdentityType {
        self.identity_type
    }

    /// Attempt ceiling of the retry orchestrator (at least 1).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Entries per paged-search round trip.
    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Returns the connection timeout duration.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Returns the operation timeout duration.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Returns whether TLS certificate verification is enabled.
    #[must_use]
    pub const fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    /// Optional custom CA certificate path.
    #[must_use]
    pub fn tls_ca_cert(&self) -> Option<&PathBuf> {
        self.tls_ca_cert.as_ref()
    }

    /// Sets explicit bind credentials.
    ///
    /// A blank username or an empty password clears them instead, since binding with an empty
    /// password is an unauthenticated bind.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let (username, password) = (username.into(), password.into());
        self.credentials = if username.trim().is_empty() || password.is_empty() {
            None
        } else {
            Some(Credentials::new(username, password))
        };
        self
    }

    /// Sets the SASL mechanism for sessions without explicit credentials.
    #[must_use]
    pub const fn with_sasl_mechanism(mut self, mechanism: SaslMechanism) -> Self {
        self.sasl_mechanism = mechanism;
        self
    }

    /// Sets the search container.
    #[must_use]
    pub fn with_container(mut self, container: DistinguishedName) -> Self {
        self.container = Some(container);
        self
    }

    /// Overrides the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables or disables LDAPS.
    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the kind of directory store.
    #[must_use]
    pub const fn with_context_type(mut self, context_type: ContextType) -> Self {
        self.context_type = context_type;
        self
    }

    /// Sets the default identity key kind.
    #[must_use]
    pub const fn with_identity_type(mut self, identity_type: IdentityType) -> Self {
        self.identity_type = identity_type;
        self
    }

    /// Sets the attempt ceiling; values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the transport page size; values below 1 are raised to 1.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Overrides the connection timeout in seconds.
    #[must_use]
    pub const fn with_connection_timeout_secs(mut self, seconds: u64) -> Self {
        self.connection_timeout_secs = seconds;
        self
    }

    /// Overrides the operation timeout in seconds.
    #[must_use]
    pub const fn with_operation_timeout_secs(mut self, seconds: u64) -> Self {
        self.operation_timeout_secs = seconds;
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub const fn with_tls_verification(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Sets the custom CA certificate path for TLS verification.
    #[must_use]
    pub fn with_tls_ca_cert(mut self, path: PathBuf) -> Self {
        self.tls_ca_cert = Some(path);
        self
    }
}
