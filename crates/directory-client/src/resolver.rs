//! Endpoint resolution.
//!
//! A logical server name resolves to one or more addresses; [`EndpointResolver`] ranks them
//! with the [`FailureCache`] so that the retry loop reaches healthy servers first.

use crate::{failure_cache::FailureCache, Result};
use async_trait::async_trait;
use directory_core::Error;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

/// One resolved network address of a logical server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    server: String,
    address: IpAddr,
    port: u16,
    secure: bool,
}

impl Endpoint {
    /// Creates an endpoint for `server` at `address`.
    #[must_use]
    pub fn new(server: impl Into<String>, address: IpAddr, port: u16, secure: bool) -> Self {
        Self {
            server: server.into(),
            address,
            port,
            secure,
        }
    }

    /// The local default directory (used when no server name is configured).
    #[must_use]
    pub fn local(port: u16, secure: bool) -> Self {
        Self::new("", IpAddr::V4(Ipv4Addr::LOCALHOST), port, secure)
    }

    /// Logical server name this endpoint was resolved from.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Resolved address.
    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    /// Port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Connection URL bound to the address rather than the logical name.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.secure { "ldaps" } else { "ldap" };
        format!("{scheme}://{}", SocketAddr::new(self.address, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Host name to address lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Returns every address `host` resolves to.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// DNS lookups backed by [`hickory_resolver`].
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    /// Creates a resolver from the system configuration, falling back to public defaults when
    /// the system configuration cannot be read.
    #[must_use]
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            warn!(error = %err, "cannot read system DNS configuration, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|err| Error::ResolutionFailed(format!("{host}: {err}")))?;
        Ok(lookup.iter().collect())
    }
}

/// Candidate endpoints in preference order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedEndpoints {
    endpoints: Vec<Endpoint>,
}

impl RankedEndpoints {
    /// Picks the candidate at `offset`, wrapping around the list.
    #[must_use]
    pub fn select(&self, offset: usize) -> &Endpoint {
        &self.endpoints[offset % self.endpoints.len()]
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Returns true if there are no candidates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Candidates in preference order.
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }
}

/// Resolves logical server names to ranked endpoints.
pub struct EndpointResolver {
    hosts: Arc<dyn HostResolver>,
    cache: Arc<FailureCache>,
    port: u16,
    secure: bool,
}

impl EndpointResolver {
    /// Creates a resolver that ranks candidates with `cache`.
    #[must_use]
    pub fn new(
        hosts: Arc<dyn HostResolver>,
        cache: Arc<FailureCache>,
        port: u16,
        secure: bool,
    ) -> Self {
        Self {
            hosts,
            cache,
            port,
            secure,
        }
    }

    /// The failure cache consulted by this resolver.
    #[must_use]
    pub fn cache(&self) -> &Arc<FailureCache> {
        &self.cache
    }

    /// Resolves `server` and ranks its addresses.
    ///
    /// IP literals are used as-is; other names go through DNS on every call (the DNS layer
    /// caches by TTL), so address changes are picked up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResolutionFailed`] if the name cannot be resolved or has no addresses.
    pub async fn rank(&self, server: &str) -> Result<RankedEndpoints> {
        let server = server.trim();
        let literal = server
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>();

        let mut addresses = match literal {
            Ok(address) => vec![address],
            Err(_) => self.hosts.lookup(server).await?,
        };
        let mut seen = Vec::with_capacity(addresses.len());
        addresses.retain(|address| {
            let fresh = !seen.contains(address);
            seen.push(*address);
            fresh
        });

        if addresses.is_empty() {
            return Err(Error::ResolutionFailed(format!(
                "{server}: no addresses returned"
            )));
        }

        let endpoints = self
            .cache
            .rank(server, &addresses)
            .into_iter()
            .map(|address| Endpoint::new(server, address, self.port, self.secure))
            .collect::<Vec<_>>();
        debug!(server, candidates = endpoints.len(), "ranked directory endpoints");

        Ok(RankedEndpoints { endpoints })
    }

    /// Resolves `server` and picks the candidate at `offset` in preference order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResolutionFailed`] if the name cannot be resolved.
    pub async fn resolve(&self, server: &str, offset: usize) -> Result<Endpoint> {
        Ok(self.rank(server).await?.select(offset).clone())
    }

    /// Records a failure against the endpoint that was actually contacted.
    pub fn record_failure(&self, endpoint: &Endpoint) {
        self.cache.record_failure(endpoint.server(), endpoint.address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    fn resolver_for(addresses: Vec<IpAddr>, cache: Arc<FailureCache>) -> EndpointResolver {
        let mut hosts = MockHostResolver::new();
        hosts
            .expect_lookup()
            .returning(move |_| Ok(addresses.clone()));
        EndpointResolver::new(Arc::new(hosts), cache, 389, false)
    }

    #[tokio::test]
    async fn least_failed_endpoint_is_selected_first() {
        let cache = Arc::new(FailureCache::new());
        let (e1, e2, e3) = (addr(1), addr(2), addr(3));
        let resolver = resolver_for(vec![e1, e2, e3], Arc::clone(&cache));

        resolver.rank("dc.corp.example").await.unwrap();
        cache.record_failure("dc.corp.example", e1);
        cache.record_failure("dc.corp.example", e1);
        cache.record_failure("dc.corp.example", e3);

        let first = resolver.resolve("dc.corp.example", 0).await.unwrap();
        assert_eq!(first.address(), e2);
        assert_eq!(
            resolver.resolve("dc.corp.example", 1).await.unwrap().address(),
            e3
        );
        assert_eq!(
            resolver.resolve("dc.corp.example", 2).await.unwrap().address(),
            e1
        );
    }

    #[tokio::test]
    async fn offset_wraps_around_candidates() {
        let resolver = resolver_for(vec![addr(1), addr(2)], Arc::new(FailureCache::new()));
        let ranked = resolver.rank("dc.corp.example").await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked.select(0), ranked.select(2));
        assert_eq!(ranked.select(1).address(), addr(2));
    }

    #[tokio::test]
    async fn ip_literal_skips_dns() {
        let mut hosts = MockHostResolver::new();
        hosts.expect_lookup().never();
        let resolver =
            EndpointResolver::new(Arc::new(hosts), Arc::new(FailureCache::new()), 636, true);

        let endpoint = resolver.resolve("10.1.2.3", 5).await.unwrap();
        assert_eq!(endpoint.url(), "ldaps://10.1.2.3:636");

        let endpoint = resolver.resolve("[2001:db8::1]", 0).await.unwrap();
        assert_eq!(endpoint.url(), "ldaps://[2001:db8::1]:636");
    }

    #[tokio::test]
    async fn duplicate_addresses_are_collapsed() {
        let resolver = resolver_for(
            vec![addr(1), addr(1), addr(2)],
            Arc::new(FailureCache::new()),
        );
        let ranked = resolver.rank("dc.corp.example").await.unwrap();
        let addresses = ranked.iter().map(Endpoint::address).collect::<Vec<_>>();
        assert_eq!(addresses, vec![addr(1), addr(2)]);
    }

    #[tokio::test]
    async fn empty_answer_is_a_resolution_failure() {
        let resolver = resolver_for(Vec::new(), Arc::new(FailureCache::new()));
        let err = resolver.rank("dc.corp.example").await.unwrap_err();
        assert!(matches!(err, Error::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn recorded_failure_targets_the_contacted_endpoint() {
        let cache = Arc::new(FailureCache::new());
        let resolver = resolver_for(vec![addr(1), addr(2)], Arc::clone(&cache));

        let endpoint = resolver.resolve("dc.corp.example", 1).await.unwrap();
        resolver.record_failure(&endpoint);

        assert_eq!(cache.failure("dc.corp.example", addr(2)).unwrap().count, 1);
        assert!(cache.failure("dc.corp.example", addr(1)).is_none());
    }
}
