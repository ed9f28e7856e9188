//! `ldap3`-backed implementation of the session traits.

use crate::{
    config::DirectoryConfig,
    resolver::Endpoint,
    session::{
        Connector, DirectorySession, EntryCursor, LdapEntry, SearchRequest, SearchScope, SortKey,
    },
    Result,
};
use async_trait::async_trait;
use directory_core::{Error, SaslMechanism};
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::controls::RawControl;
use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Scope, SearchEntry, SearchStream,
};
use native_tls::{Certificate, TlsConnector};
use std::fs;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Server-side sort request control (RFC 2891).
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";

const RC_AUTH_METHOD_NOT_SUPPORTED: u32 = 7;
const RC_INAPPROPRIATE_AUTHENTICATION: u32 = 48;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;
const RC_SERVER_DOWN: u32 = 81;
const RC_TIMEOUT: u32 = 85;
const RC_CONNECT_ERROR: u32 = 91;

impl From<SearchScope> for Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }
}

/// Connects to directory endpoints with `ldap3`.
#[derive(Debug, Clone)]
pub struct LdapConnector {
    connection_timeout: Duration,
    operation_timeout: Duration,
    tls_verify: bool,
    ca_certificate: Option<Vec<u8>>,
    mechanism: SaslMechanism,
}

impl LdapConnector {
    /// Creates a connector with the transport settings of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the configured CA certificate cannot be read or parsed,
    /// or if sessions would need a GSSAPI bind and the crate was built without the `gssapi`
    /// feature.
    pub fn new(config: &DirectoryConfig) -> Result<Self> {
        let mechanism = config.sasl_mechanism();
        if config.credentials().is_none()
            && !config.is_local()
            && mechanism == SaslMechanism::Gssapi
            && !cfg!(feature = "gssapi")
        {
            return Err(Error::ConfigError(
                "binding without credentials uses GSSAPI, which needs the `gssapi` feature; \
                 configure credentials or the EXTERNAL mechanism"
                    .to_string(),
            ));
        }

        let ca_certificate = match config.tls_ca_cert() {
            Some(path) => {
                let pem = fs::read(path).map_err(|err| {
                    Error::ConfigError(format!(
                        "failed to read directory CA certificate {}: {err}",
                        path.display()
                    ))
                })?;
                Certificate::from_pem(&pem).map_err(|err| {
                    Error::ConfigError(format!("invalid directory CA certificate: {err}"))
                })?;
                Some(pem)
            }
            None => None,
        };

        Ok(Self {
            connection_timeout: config.connection_timeout(),
            operation_timeout: config.operation_timeout(),
            tls_verify: config.tls_verify(),
            ca_certificate,
            mechanism,
        })
    }

    fn ldap_settings(&self) -> Result<LdapConnSettings> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.connection_timeout);

        // Endpoints are addressed by IP, so certificates are checked against the chain only.
        let mut builder = TlsConnector::builder();
        builder.danger_accept_invalid_hostnames(true);
        if !self.tls_verify {
            builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &self.ca_certificate {
            let certificate = Certificate::from_pem(pem).map_err(|err| {
                Error::ConfigError(format!("invalid directory CA certificate: {err}"))
            })?;
            builder.add_root_certificate(certificate);
        }
        let connector = builder.build().map_err(|err| {
            Error::ConfigError(format!("failed to construct TLS connector: {err}"))
        })?;

        Ok(settings
            .set_connector(connector)
            .set_no_tls_verify(!self.tls_verify))
    }
}

#[async_trait]
impl Connector for LdapConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DirectorySession>> {
        let settings = self.ldap_settings()?;
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &endpoint.url())
            .await
            .map_err(|err| connect_error(endpoint, err))?;

        let driven = endpoint.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.drive().await {
                warn!(endpoint = %driven, error = %err, "directory connection closed with error");
            }
        });
        debug!(%endpoint, "connected to directory endpoint");

        Ok(Box::new(LdapSession {
            inner: ldap,
            endpoint: endpoint.clone(),
            operation_timeout: self.operation_timeout,
            mechanism: self.mechanism,
        }))
    }
}

/// One bound (or bindable) connection. Dropping it closes the connection.
struct LdapSession {
    inner: Ldap,
    endpoint: Endpoint,
    operation_timeout: Duration,
    mechanism: SaslMechanism,
}

impl LdapSession {
    /// Kerberos bind for the service `ldap/<server>`; the logical name, not the address.
    #[cfg(feature = "gssapi")]
    async fn gssapi_bind(&mut self) -> Result<LdapResult> {
        let server = self.endpoint.server().to_string();
        bounded(
            &self.endpoint,
            self.operation_timeout,
            "bind",
            self.inner.sasl_gssapi_bind(&server),
        )
        .await
    }

    #[cfg(not(feature = "gssapi"))]
    async fn gssapi_bind(&mut self) -> Result<LdapResult> {
        Err(Error::ConfigError(
            "GSSAPI bind requires the `gssapi` feature".to_string(),
        ))
    }
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let result = bounded(
            &self.endpoint,
            self.operation_timeout,
            "bind",
            self.inner.simple_bind(dn, password),
        )
        .await?;
        result
            .success()
            .map_err(|err| classify_error(&self.endpoint, err))?;
        Ok(())
    }

    async fn ambient_bind(&mut self) -> Result<()> {
        // The local directory has no service name to request a ticket for.
        let result = match self.mechanism {
            SaslMechanism::Gssapi if !self.endpoint.server().is_empty() => {
                self.gssapi_bind().await?
            }
            _ => {
                bounded(
                    &self.endpoint,
                    self.operation_timeout,
                    "bind",
                    self.inner.sasl_external_bind(),
                )
                .await?
            }
        };
        result
            .success()
            .map_err(|err| classify_error(&self.endpoint, err))?;
        Ok(())
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Box<dyn EntryCursor>> {
        if let Some(sort) = &request.sort {
            self.inner.with_controls(vec![sort_control(sort)]);
        }

        let mut adapters: Vec<Box<dyn Adapter<'static, String, Vec<String>>>> =
            vec![Box::new(EntriesOnly::new())];
        if let Some(size) = request.page_size {
            let size = i32::try_from(size).unwrap_or(i32::MAX);
            adapters.push(Box::new(PagedResults::new(size)));
        }

        let stream = bounded(
            &self.endpoint,
            self.operation_timeout,
            "search",
            self.inner.streaming_search_with(
                adapters,
                &request.base,
                request.scope.into(),
                &request.filter,
                request.attributes.clone(),
            ),
        )
        .await?;

        Ok(Box::new(LdapCursor {
            stream,
            endpoint: self.endpoint.clone(),
            operation_timeout: self.operation_timeout,
        }))
    }

    async fn unbind(&mut self) -> Result<()> {
        bounded(
            &self.endpoint,
            self.operation_timeout,
            "unbind",
            self.inner.unbind(),
        )
        .await
    }
}

struct LdapCursor {
    stream: SearchStream<'static, String, Vec<String>>,
    endpoint: Endpoint,
    operation_timeout: Duration,
}

#[async_trait]
impl EntryCursor for LdapCursor {
    async fn next_entry(&mut self) -> Result<Option<LdapEntry>> {
        let raw = bounded(
            &self.endpoint,
            self.operation_timeout,
            "search",
            self.stream.next(),
        )
        .await?;

        Ok(raw.map(|raw| {
            let entry = SearchEntry::construct(raw);
            LdapEntry::new(entry.dn, entry.attrs, entry.bin_attrs)
        }))
    }

    async fn finish(&mut self) -> Result<()> {
        let result = timeout(self.operation_timeout, self.stream.finish())
            .await
            .map_err(|_| Error::transient(&self.endpoint, "search completion timed out"))?;
        result
            .success()
            .map_err(|err| classify_error(&self.endpoint, err))?;
        Ok(())
    }
}

async fn bounded<T, F>(
    endpoint: &Endpoint,
    limit: Duration,
    operation: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = ldap3::result::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(|err| classify_error(endpoint, err)),
        Err(_) => Err(Error::transient(
            endpoint,
            format!("{operation} timed out after {}s", limit.as_secs()),
        )),
    }
}

/// Encodes a server-side sort request control for a single key.
///
/// ```text
/// SortKeyList ::= SEQUENCE OF SEQUENCE {
///     attributeType   AttributeDescription,
///     orderingRule    [0] MatchingRuleId OPTIONAL,
///     reverseOrder    [1] BOOLEAN DEFAULT FALSE }
/// ```
#[must_use]
pub fn sort_control(key: &SortKey) -> RawControl {
    RawControl {
        ctype: SORT_REQUEST_OID.to_string(),
        crit: false,
        val: Some(encode_sort_keys(std::slice::from_ref(key))),
    }
}

fn encode_sort_keys(keys: &[SortKey]) -> Vec<u8> {
    let mut list = Vec::new();
    for key in keys {
        let mut fields = Vec::new();
        ber_element(0x04, key.attribute.as_bytes(), &mut fields);
        if key.reverse {
            ber_element(0x81, &[0xff], &mut fields);
        }
        ber_element(0x30, &fields, &mut list);
    }
    let mut encoded = Vec::with_capacity(list.len() + 4);
    ber_element(0x30, &list, &mut encoded);
    encoded
}

fn ber_element(tag: u8, content: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|byte| **byte == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
}

/// Classifies an error raised while connecting.
///
/// Anything short of a malformed URL means the endpoint could not be reached.
pub(crate) fn connect_error(endpoint: &Endpoint, err: LdapError) -> Error {
    match err {
        LdapError::UrlParsing { .. } => Error::InvalidEndpoint(format!("{endpoint}: {err}")),
        other => Error::transient(endpoint, other.to_string()),
    }
}

/// Classifies an error raised by an operation on an open session.
pub(crate) fn classify_error(endpoint: &Endpoint, err: LdapError) -> Error {
    match err {
        LdapError::LdapResult { result } => classify_result(endpoint, result.rc, &result.text),
        LdapError::Io { .. }
        | LdapError::EndOfStream { .. }
        | LdapError::Timeout { .. }
        | LdapError::OpSend { .. }
        | LdapError::ResultRecv { .. } => Error::transient(endpoint, err.to_string()),
        other => Error::ExternalServiceError {
            service: "ldap".to_string(),
            message: other.to_string(),
        },
    }
}

/// Maps a non-success LDAP result code.
pub(crate) fn classify_result(endpoint: &Endpoint, rc: u32, text: &str) -> Error {
    match rc {
        RC_INVALID_CREDENTIALS => Error::Authentication(format!("invalid credentials: {text}")),
        RC_AUTH_METHOD_NOT_SUPPORTED | RC_INAPPROPRIATE_AUTHENTICATION => {
            Error::Authentication(format!("bind mechanism rejected ({rc}): {text}"))
        }
        RC_BUSY | RC_UNAVAILABLE | RC_SERVER_DOWN | RC_TIMEOUT | RC_CONNECT_ERROR => {
            Error::transient(endpoint, format!("result code {rc}: {text}"))
        }
        _ => Error::ExternalServiceError {
            service: "ldap".to_string(),
            message: format!("result code {rc}: {text}"),
        },
    }
}
