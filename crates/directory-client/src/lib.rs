//! Failover-aware directory client.
//!
//! This crate looks up users and groups in an LDAP directory (Active Directory or an
//! application directory) that is served by several machines behind one DNS name. Each call
//! resolves the name, ranks the addresses by recent failures, and fails over between them on
//! transient errors.

#![deny(missing_docs)]

mod client;
mod config;
mod dn;
mod factory;
mod failure_cache;
mod ldap;
mod membership;
mod principal;
mod resolver;
mod retry;
mod schema;
mod search;
mod session;

pub use client::DirectoryClient;
pub use config::{Credentials, DirectoryConfig};
pub use dn::{DistinguishedName, DistinguishedNameError, RelativeDistinguishedName};
pub use factory::SessionFactory;
pub use failure_cache::{FailureCache, FailureRecord, FailureSnapshot};
pub use ldap::{sort_control, LdapConnector, SORT_REQUEST_OID};
pub use membership::{MembershipResolver, IN_CHAIN_RULE_OID};
pub use principal::{Principal, PrincipalBuilder, PrincipalKind};
pub use resolver::{DnsResolver, Endpoint, EndpointResolver, HostResolver, RankedEndpoints};
pub use retry::{Operation, RetryOrchestrator};
pub use schema::{escape_bytes, escape_pattern, escape_value, AttributeSchema, MAIL_ATTRIBUTE};
pub use search::{PageWindow, SearchCriteria, SearchEngine, SearchOutcome, SortSpec};
pub use session::{
    Connector, DirectorySession, EntryCursor, LdapEntry, SearchRequest, SearchScope, SortKey,
};

pub use directory_core::{
    ContextType, DirectorySettings, Error, IdentityType, SaslMechanism, SecurityIdentifier,
};

/// Convenient result alias that reuses the core error type.
pub type Result<T> = directory_core::Result<T>;
