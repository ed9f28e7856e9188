//! Directory client with failover across the servers behind one logical name.

use crate::{
    config::{Credentials, DirectoryConfig},
    factory::{release, SessionFactory},
    failure_cache::FailureCache,
    ldap::LdapConnector,
    membership::MembershipResolver,
    principal::{Principal, PrincipalKind},
    resolver::{DnsResolver, Endpoint, EndpointResolver, HostResolver},
    retry::{Operation, RetryOrchestrator},
    schema::{AttributeSchema, MAIL_ATTRIBUTE},
    search::{PageWindow, SearchCriteria, SearchEngine, SortSpec},
    session::{Connector, DirectorySession},
    Result,
};
use async_trait::async_trait;
use directory_core::{Error, IdentityType, SecurityIdentifier};
use std::sync::Arc;
use tracing::debug;

/// Client for user and group lookups against a directory service.
///
/// Every call runs through the retry orchestrator: endpoints behind the configured server name
/// are tried in failure-cache order until one answers or the attempt budget is spent.
pub struct DirectoryClient {
    config: DirectoryConfig,
    orchestrator: RetryOrchestrator,
    engine: SearchEngine,
    cache: Arc<FailureCache>,
}

impl DirectoryClient {
    /// Creates a client that talks LDAP and resolves names through the system DNS settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the TLS settings cannot be loaded, or if the configured
    /// ambient bind mechanism is not available in this build.
    pub fn new(config: DirectoryConfig) -> Result<Self> {
        Self::with_failure_cache(config, Arc::new(FailureCache::new()))
    }

    /// Like [`DirectoryClient::new`], sharing `cache` with other clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] under the same conditions as [`DirectoryClient::new`].
    pub fn with_failure_cache(config: DirectoryConfig, cache: Arc<FailureCache>) -> Result<Self> {
        let connector = LdapConnector::new(&config)?;
        Ok(Self::with_backends(
            config,
            Arc::new(connector),
            Arc::new(DnsResolver::new()),
            cache,
        ))
    }

    /// Creates a client over explicit connection and name-resolution backends.
    #[must_use]
    pub fn with_backends(
        config: DirectoryConfig,
        connector: Arc<dyn Connector>,
        hosts: Arc<dyn HostResolver>,
        cache: Arc<FailureCache>,
    ) -> Self {
        let credentials = config.credentials().map(|credentials| {
            Arc::new(Credentials::new(
                credentials.username(),
                credentials.password(),
            ))
        });
        let resolver =
            EndpointResolver::new(hosts, Arc::clone(&cache), config.port(), config.secure());
        let orchestrator = RetryOrchestrator::new(
            resolver,
            SessionFactory::new(connector, credentials),
            config.server(),
            config.max_attempts(),
            Endpoint::local(config.port(), config.secure()),
        );
        let engine = SearchEngine::new(
            AttributeSchema::new(config.context_type()),
            config.identity_type(),
            config.page_size(),
            config.container().cloned(),
        );

        Self {
            config,
            orchestrator,
            engine,
            cache,
        }
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Failure cache shared by every call of this client.
    #[must_use]
    pub fn failure_cache(&self) -> &Arc<FailureCache> {
        &self.cache
    }

    /// Checks `password` for the user identified by `user`.
    ///
    /// Returns `false` for unknown users, rejected passwords and empty passwords (which
    /// directory servers would otherwise accept as an anonymous bind).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn validate_credentials(&self, user: &str, password: &str) -> Result<bool> {
        if user.trim().is_empty() || password.is_empty() {
            return Ok(false);
        }
        self.orchestrator
            .execute(&ValidateCredentials {
                engine: &self.engine,
                factory: self.orchestrator.factory(),
                user,
                password,
            })
            .await
    }

    /// Finds a user by the configured identity kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn find_user(&self, key: &str) -> Result<Option<Principal>> {
        self.find(PrincipalKind::User, self.engine.identity(), key)
            .await
    }

    /// Finds a user by security identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn find_user_by_sid(&self, sid: &SecurityIdentifier) -> Result<Option<Principal>> {
        self.find(PrincipalKind::User, IdentityType::Sid, &sid.to_string())
            .await
    }

    /// Finds a group by the configured identity kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn find_group(&self, key: &str) -> Result<Option<Principal>> {
        self.find(PrincipalKind::Group, self.engine.identity(), key)
            .await
    }

    /// Users whose name contains `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a blank pattern, before contacting any server.
    pub async fn search_users_by_name(
        &self,
        pattern: &str,
        page: Option<PageWindow>,
        sort: &SortSpec,
    ) -> Result<Vec<Principal>> {
        let criteria = SearchCriteria::new(PrincipalKind::User)
            .matching(self.engine.schema().name_attribute(), pattern)?;
        self.search(criteria, page, sort).await
    }

    /// Users whose e-mail address contains `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a blank pattern, before contacting any server.
    pub async fn search_users_by_email(
        &self,
        pattern: &str,
        page: Option<PageWindow>,
        sort: &SortSpec,
    ) -> Result<Vec<Principal>> {
        let criteria = SearchCriteria::new(PrincipalKind::User).matching(MAIL_ATTRIBUTE, pattern)?;
        self.search(criteria, page, sort).await
    }

    /// All users.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn list_users(
        &self,
        page: Option<PageWindow>,
        sort: &SortSpec,
    ) -> Result<Vec<Principal>> {
        self.search(SearchCriteria::new(PrincipalKind::User), page, sort)
            .await
    }

    /// All groups.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn list_groups(
        &self,
        page: Option<PageWindow>,
        sort: &SortSpec,
    ) -> Result<Vec<Principal>> {
        self.search(SearchCriteria::new(PrincipalKind::Group), page, sort)
            .await
    }

    /// Members of the group identified by `group`; empty if the group does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn members_of_group(&self, group: &str, recursive: bool) -> Result<Vec<Principal>> {
        if group.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.orchestrator
            .execute(&MembersOfGroup {
                engine: &self.engine,
                group,
                recursive,
            })
            .await
    }

    /// Groups of the user identified by `user`; empty if the user does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn groups_of_user(&self, user: &str, recursive: bool) -> Result<Vec<Principal>> {
        if user.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.orchestrator
            .execute(&GroupsOfUser {
                engine: &self.engine,
                user,
                recursive,
            })
            .await
    }

    /// Returns true if `user` belongs to `group`; false if either does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] if no server answers.
    pub async fn is_member_of(&self, group: &str, user: &str, recursive: bool) -> Result<bool> {
        if group.trim().is_empty() || user.trim().is_empty() {
            return Ok(false);
        }
        self.orchestrator
            .execute(&IsMemberOf {
                engine: &self.engine,
                group,
                user,
                recursive,
            })
            .await
    }

    async fn find(
        &self,
        kind: PrincipalKind,
        identity: IdentityType,
        key: &str,
    ) -> Result<Option<Principal>> {
        if key.trim().is_empty() {
            return Ok(None);
        }
        self.orchestrator
            .execute(&FindPrincipal {
                engine: &self.engine,
                kind,
                identity,
                key,
            })
            .await
    }

    async fn search(
        &self,
        criteria: SearchCriteria,
        window: Option<PageWindow>,
        sort: &SortSpec,
    ) -> Result<Vec<Principal>> {
        self.orchestrator
            .execute(&SearchPrincipals {
                engine: &self.engine,
                criteria,
                window,
                sort,
            })
            .await
    }
}

struct FindPrincipal<'a> {
    engine: &'a SearchEngine,
    kind: PrincipalKind,
    identity: IdentityType,
    key: &'a str,
}

#[async_trait]
impl Operation for FindPrincipal<'_> {
    type Output = Option<Principal>;

    fn name(&self) -> &'static str {
        "find_principal"
    }

    async fn run(
        &self,
        session: &mut dyn DirectorySession,
        _endpoint: &Endpoint,
    ) -> Result<Self::Output> {
        self.engine
            .find(session, self.kind, self.identity, self.key)
            .await
    }
}

struct SearchPrincipals<'a> {
    engine: &'a SearchEngine,
    criteria: SearchCriteria,
    window: Option<PageWindow>,
    sort: &'a SortSpec,
}

#[async_trait]
impl Operation for SearchPrincipals<'_> {
    type Output = Vec<Principal>;

    fn name(&self) -> &'static str {
        "search_principals"
    }

    async fn run(
        &self,
        session: &mut dyn DirectorySession,
        _endpoint: &Endpoint,
    ) -> Result<Self::Output> {
        let outcome = self
            .engine
            .search(session, &self.criteria, self.window, self.sort)
            .await?;
        Ok(outcome.principals)
    }
}

struct ValidateCredentials<'a> {
    engine: &'a SearchEngine,
    factory: &'a SessionFactory,
    user: &'a str,
    password: &'a str,
}

#[async_trait]
impl Operation for ValidateCredentials<'_> {
    type Output = bool;

    fn name(&self) -> &'static str {
        "validate_credentials"
    }

    async fn run(
        &self,
        session: &mut dyn DirectorySession,
        endpoint: &Endpoint,
    ) -> Result<Self::Output> {
        let Some(user) = self
            .engine
            .find(session, PrincipalKind::User, self.engine.identity(), self.user)
            .await?
        else {
            debug!(user = self.user, "credential check for unknown user");
            return Ok(false);
        };

        // Bind on the endpoint that returned the entry.
        match self
            .factory
            .open_as(endpoint, user.dn.as_str(), self.password)
            .await
        {
            Ok(mut user_session) => {
                release(user_session.as_mut(), endpoint).await;
                Ok(true)
            }
            Err(Error::Authentication(reason)) => {
                debug!(user = %user.dn, %reason, "credentials rejected");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

struct MembersOfGroup<'a> {
    engine: &'a SearchEngine,
    group: &'a str,
    recursive: bool,
}

#[async_trait]
impl Operation for MembersOfGroup<'_> {
    type Output = Vec<Principal>;

    fn name(&self) -> &'static str {
        "members_of_group"
    }

    async fn run(
        &self,
        session: &mut dyn DirectorySession,
        _endpoint: &Endpoint,
    ) -> Result<Self::Output> {
        let Some(group) = self
            .engine
            .find(session, PrincipalKind::Group, self.engine.identity(), self.group)
            .await?
        else {
            return Ok(Vec::new());
        };
        let outcome = MembershipResolver::new(self.engine)
            .members_of_group(session, &group, self.recursive)
            .await?;
        Ok(outcome.principals)
    }
}

struct GroupsOfUser<'a> {
    engine: &'a SearchEngine,
    user: &'a str,
    recursive: bool,
}

#[async_trait]
impl Operation for GroupsOfUser<'_> {
    type Output = Vec<Principal>;

    fn name(&self) -> &'static str {
        "groups_of_user"
    }

    async fn run(
        &self,
        session: &mut dyn DirectorySession,
        _endpoint: &Endpoint,
    ) -> Result<Self::Output> {
        let Some(user) = self
            .engine
            .find(session, PrincipalKind::User, self.engine.identity(), self.user)
            .await?
        else {
            return Ok(Vec::new());
        };
        let outcome = MembershipResolver::new(self.engine)
            .groups_of_user(session, &user, self.recursive)
            .await?;
        Ok(outcome.principals)
    }
}

struct IsMemberOf<'a> {
    engine: &'a SearchEngine,
    group: &'a str,
    user: &'a str,
    recursive: bool,
}

#[async_trait]
impl Operation for IsMemberOf<'_> {
    type Output = bool;

    fn name(&self) -> &'static str {
        "is_member_of"
    }

    async fn run(
        &self,
        session: &mut dyn DirectorySession,
        _endpoint: &Endpoint,
    ) -> Result<Self::Output> {
        let identity = self.engine.identity();
        let Some(group) = self
            .engine
            .find(session, PrincipalKind::Group, identity, self.group)
            .await?
        else {
            return Ok(false);
        };
        let Some(user) = self
            .engine
            .find(session, PrincipalKind::User, identity, self.user)
            .await?
        else {
            return Ok(false);
        };

        let groups = MembershipResolver::new(self.engine)
            .groups_of_user(session, &user, self.recursive)
            .await?;
        Ok(MembershipResolver::contains(&groups.principals, &group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MockHostResolver;
    use crate::session::{
        testing::ScriptedCursor, LdapEntry, MockConnector, MockDirectorySession, SearchScope,
    };
    use std::collections::HashMap;
    use std::net::IpAddr;

    const USER_DN: &str = "CN=Jane Doe,OU=Staff,DC=corp";
    const GROUP_DN: &str = "CN=Admins,OU=Groups,DC=corp";

    fn sid(rid: u32) -> SecurityIdentifier {
        SecurityIdentifier::parse(&format!("S-1-5-21-7-8-9-{rid}")).unwrap()
    }

    fn user_entry() -> LdapEntry {
        LdapEntry::new(USER_DN, HashMap::new(), HashMap::new())
            .with_values("objectClass", ["user"])
            .with_values("sAMAccountName", ["jdoe"])
            .with_binary("objectSid", vec![sid(1106).to_bytes()])
    }

    fn group_entry() -> LdapEntry {
        LdapEntry::new(GROUP_DN, HashMap::new(), HashMap::new())
            .with_values("objectClass", ["group"])
            .with_values("sAMAccountName", ["Admins"])
            .with_binary("objectSid", vec![sid(512).to_bytes()])
    }

    fn config() -> DirectoryConfig {
        DirectoryConfig::new("dc.corp.example")
            .with_credentials("svc-lookup", "lookup-secret")
            .with_container(crate::dn::DistinguishedName::parse("DC=corp").unwrap())
            .with_max_attempts(3)
    }

    fn hosts() -> Arc<dyn HostResolver> {
        let mut hosts = MockHostResolver::new();
        hosts
            .expect_lookup()
            .returning(|_| Ok(vec![IpAddr::from([192, 0, 2, 1]), IpAddr::from([192, 0, 2, 2])]));
        Arc::new(hosts)
    }

    /// Session that answers lookups from a small in-memory directory.
    fn directory_session(users: bool, groups: bool) -> MockDirectorySession {
        let mut session = MockDirectorySession::new();
        session.expect_simple_bind().returning(|dn, password| match (dn, password) {
            ("svc-lookup", "lookup-secret") | (USER_DN, "correct horse") => Ok(()),
            _ => Err(Error::Authentication("invalid credentials".into())),
        });
        session.expect_unbind().returning(|| Ok(()));
        session.expect_search().returning(move |request| {
            let entries = if request.scope == SearchScope::Base {
                vec![LdapEntry::default().with_binary("tokenGroups", vec![sid(512).to_bytes()])]
            } else if request.filter.contains("(objectClass=group)") && groups {
                vec![group_entry()]
            } else if request.filter.contains("(objectClass=user)") && users {
                vec![user_entry()]
            } else {
                Vec::new()
            };
            Ok(Box::new(ScriptedCursor::new(entries)))
        });
        session
    }

    fn client_with(connector: MockConnector, cache: Arc<FailureCache>) -> DirectoryClient {
        DirectoryClient::with_backends(config(), Arc::new(connector), hosts(), cache)
    }

    fn healthy_connector(users: bool, groups: bool) -> MockConnector {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(move |_| Ok(Box::new(directory_session(users, groups))));
        connector
    }

    #[tokio::test]
    async fn blank_search_patterns_fail_before_any_connection() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();
        let client = client_with(connector, Arc::new(FailureCache::new()));

        let err = client
            .search_users_by_name("  ", None, &SortSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = client
            .search_users_by_email("", None, &SortSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn blank_keys_find_nothing_without_connecting() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();
        let client = client_with(connector, Arc::new(FailureCache::new()));

        assert!(client.find_user(" ").await.unwrap().is_none());
        assert!(client.find_group("").await.unwrap().is_none());
        assert!(!client.validate_credentials("", "pw").await.unwrap());
        assert!(!client.validate_credentials("jdoe", "").await.unwrap());
    }

    #[tokio::test]
    async fn validate_credentials_is_idempotent_and_leaves_the_cache_alone() {
        let cache = Arc::new(FailureCache::new());
        let client = client_with(healthy_connector(true, true), Arc::clone(&cache));

        let first = client.validate_credentials("jdoe", "correct horse").await.unwrap();
        let second = client.validate_credentials("jdoe", "correct horse").await.unwrap();
        assert!(first);
        assert_eq!(first, second);
        assert!(!client.validate_credentials("jdoe", "wrong").await.unwrap());
        assert!(cache.snapshot().is_empty());
    }

    #[tokio::test]
    async fn validate_credentials_for_unknown_user_is_false() {
        let client = client_with(healthy_connector(false, true), Arc::new(FailureCache::new()));
        assert!(!client.validate_credentials("ghost", "correct horse").await.unwrap());
    }

    #[tokio::test]
    async fn is_member_of_is_false_when_either_side_is_missing() {
        let client = client_with(healthy_connector(false, true), Arc::new(FailureCache::new()));
        assert!(!client.is_member_of("Admins", "ghost", true).await.unwrap());

        let client = client_with(healthy_connector(true, false), Arc::new(FailureCache::new()));
        assert!(!client.is_member_of("Ghosts", "jdoe", true).await.unwrap());
    }

    #[tokio::test]
    async fn is_member_of_through_token_groups() {
        let client = client_with(healthy_connector(true, true), Arc::new(FailureCache::new()));
        assert!(client.is_member_of("Admins", "jdoe", true).await.unwrap());
    }

    #[tokio::test]
    async fn lookups_fail_over_to_the_next_endpoint() {
        let cache = Arc::new(FailureCache::new());
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|endpoint| {
            if endpoint.address() == IpAddr::from([192, 0, 2, 1]) {
                Err(Error::transient(endpoint, "connection refused"))
            } else {
                Ok(Box::new(directory_session(true, true)))
            }
        });
        let client = client_with(connector, Arc::clone(&cache));

        let user = client.find_user("jdoe").await.unwrap().unwrap();
        assert_eq!(user.account_name.as_deref(), Some("jdoe"));
        assert_eq!(
            cache
                .failure("dc.corp.example", IpAddr::from([192, 0, 2, 1]))
                .unwrap()
                .count,
            1
        );

        // The failed endpoint now ranks last, so the next call goes straight to the healthy one.
        client.find_user("jdoe").await.unwrap();
        assert_eq!(cache.total_failures("dc.corp.example"), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_server_unavailable() {
        let cache = Arc::new(FailureCache::new());
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(3)
            .returning(|endpoint| Err(Error::transient(endpoint, "connection refused")));
        let client = client_with(connector, Arc::clone(&cache));

        let err = client.list_users(None, &SortSpec::default()).await.unwrap_err();
        assert!(matches!(err, Error::ServerUnavailable(_)));
        assert_eq!(cache.total_failures("dc.corp.example"), 3);
    }

    #[tokio::test]
    async fn membership_listings() {
        let client = client_with(healthy_connector(true, true), Arc::new(FailureCache::new()));

        let groups = client.groups_of_user("jdoe", true).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].dn.as_str(), GROUP_DN);

        assert!(client.groups_of_user("", true).await.unwrap().is_empty());
        assert!(client.members_of_group(" ", false).await.unwrap().is_empty());
    }
}
