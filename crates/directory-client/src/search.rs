//! Paged, sorted and fault-tolerant principal searches.
//!
//! Two kinds of paging meet here. The transport page size only controls how many entries the
//! server sends per round trip. The logical [`PageWindow`] selects which principals the caller
//! gets back and is applied after materialization, so entries that fail to materialize never
//! occupy a position in the window.

use crate::{
    dn::DistinguishedName,
    principal::{Principal, PrincipalKind},
    schema::AttributeSchema,
    session::{search_all, DirectorySession, SearchRequest, SearchScope, SortKey},
    Result,
};
use directory_core::{Error, IdentityType};
use tracing::{debug, warn};

/// Logical page of results: zero-based page `index` of `size` principals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    index: u64,
    size: u64,
}

impl PageWindow {
    /// Creates a window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `size` is zero.
    pub fn new(index: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("page size must be positive".to_string()));
        }
        Ok(Self { index, size })
    }

    /// Builds a window only when both parts are present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `size` is zero.
    pub fn from_parts(index: Option<u64>, size: Option<u64>) -> Result<Option<Self>> {
        match (index, size) {
            (Some(index), Some(size)) => Self::new(index, size).map(Some),
            _ => Ok(None),
        }
    }

    /// Page index.
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Page size.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// First position inside the window.
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.index.saturating_mul(self.size)
    }

    /// First position past the window.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start().saturating_add(self.size)
    }

    /// Returns true if `position` falls inside the window.
    #[must_use]
    pub const fn contains(&self, position: u64) -> bool {
        position >= self.start() && position < self.end()
    }
}

/// Requested result ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    attribute: Option<String>,
    descending: bool,
}

impl SortSpec {
    /// Ascending order on `attribute`.
    #[must_use]
    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            descending: false,
        }
    }

    /// Descending order on `attribute`.
    #[must_use]
    pub fn descending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            descending: true,
        }
    }

    /// Explicit sort attribute, if any.
    #[must_use]
    pub fn attribute(&self) -> Option<&str> {
        self.attribute.as_deref()
    }

    /// Returns true for descending order.
    #[must_use]
    pub const fn is_descending(&self) -> bool {
        self.descending
    }
}

/// Template principal plus substring conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    kind: PrincipalKind,
    conditions: Vec<(String, String)>,
}

impl SearchCriteria {
    /// Matches every principal of `kind`.
    #[must_use]
    pub const fn new(kind: PrincipalKind) -> Self {
        Self {
            kind,
            conditions: Vec::new(),
        }
    }

    /// Adds a substring condition on `attribute`.
    ///
    /// The pattern is wrapped as `*pattern*`; `*` inside it stays a wildcard.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `pattern` is empty or blank.
    pub fn matching(mut self, attribute: &str, pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "search pattern for `{attribute}` cannot be empty"
            )));
        }
        let core = pattern.trim_matches('*');
        let wrapped = if core.is_empty() {
            "*".to_string()
        } else {
            format!("*{core}*")
        };
        self.conditions.push((attribute.to_string(), wrapped));
        Ok(self)
    }

    /// Principal kind searched for.
    #[must_use]
    pub const fn kind(&self) -> PrincipalKind {
        self.kind
    }

    /// `(attribute, wrapped pattern)` pairs.
    #[must_use]
    pub fn conditions(&self) -> &[(String, String)] {
        &self.conditions
    }

    /// Renders the filter under `schema`.
    #[must_use]
    pub fn filter(&self, schema: &AttributeSchema) -> String {
        schema.conditions_filter(self.kind, &self.conditions)
    }
}

/// Principals returned by a search plus the number of entries skipped as unreadable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    /// Principals inside the window, in server order.
    pub principals: Vec<Principal>,
    /// Entries that could not be materialized.
    pub skipped: usize,
}

/// Runs principal searches against a bound session.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    schema: AttributeSchema,
    identity: IdentityType,
    page_size: u32,
    container: Option<DistinguishedName>,
}

impl SearchEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        schema: AttributeSchema,
        identity: IdentityType,
        page_size: u32,
        container: Option<DistinguishedName>,
    ) -> Self {
        Self {
            schema,
            identity,
            page_size: page_size.max(1),
            container,
        }
    }

    /// Attribute schema in use.
    #[must_use]
    pub const fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    /// Default identity key kind.
    #[must_use]
    pub const fn identity(&self) -> IdentityType {
        self.identity
    }

    /// Search base: the configured container, or the server's default naming context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if no container is configured and the server does not
    /// publish `defaultNamingContext`.
    pub async fn base(&self, session: &mut dyn DirectorySession) -> Result<String> {
        if let Some(container) = &self.container {
            return Ok(container.to_string());
        }

        let request = SearchRequest::new("", SearchScope::Base, "(objectClass=*)")
            .attributes(["defaultNamingContext"]);
        let base = search_all(session, &request)
            .await?
            .iter()
            .find_map(|entry| entry.first("defaultNamingContext").map(str::to_string))
            .ok_or_else(|| {
                Error::ConfigError(
                    "no search container configured and the server publishes no \
                     defaultNamingContext"
                        .to_string(),
                )
            })?;
        debug!(%base, "using default naming context as search base");
        Ok(base)
    }

    /// Attribute sorted on when `sort` names none.
    fn sort_attribute<'a>(&self, sort: &'a SortSpec) -> &'a str {
        sort.attribute().unwrap_or_else(|| {
            if self.identity.is_binary() {
                self.schema.account_attribute()
            } else {
                self.schema.identity_attribute(self.identity)
            }
        })
    }

    /// Builds a paged, sorted subtree request for `filter`.
    #[must_use]
    pub fn request(&self, base: &str, filter: &str, sort: &SortSpec) -> SearchRequest {
        let sort_attribute = self.sort_attribute(sort);
        SearchRequest::new(base, SearchScope::Subtree, filter)
            .attributes(self.schema.principal_attributes())
            .with_attribute(self.schema.identity_attribute(self.identity))
            .with_attribute(sort_attribute)
            .sorted_by(SortKey {
                attribute: sort_attribute.to_string(),
                reverse: sort.is_descending(),
            })
            .paged(self.page_size)
    }

    /// Builds a paged, unsorted subtree request for `filter`.
    #[must_use]
    pub fn lookup_request(&self, base: &str, filter: &str) -> SearchRequest {
        SearchRequest::new(base, SearchScope::Subtree, filter)
            .attributes(self.schema.principal_attributes())
            .paged(self.page_size)
    }

    /// Searches for principals matching `criteria`.
    ///
    /// # Errors
    ///
    /// Returns transport and protocol errors; unreadable entries are skipped, not reported.
    pub async fn search(
        &self,
        session: &mut dyn DirectorySession,
        criteria: &SearchCriteria,
        window: Option<PageWindow>,
        sort: &SortSpec,
    ) -> Result<SearchOutcome> {
        let base = self.base(session).await?;
        let request = self.request(&base, &criteria.filter(&self.schema), sort);
        self.collect(session, &request, window).await
    }

    /// Runs `request` and materializes every entry, keeping those inside `window`.
    ///
    /// # Errors
    ///
    /// Returns transport and protocol errors; unreadable entries are skipped, not reported.
    pub async fn collect(
        &self,
        session: &mut dyn DirectorySession,
        request: &SearchRequest,
        window: Option<PageWindow>,
    ) -> Result<SearchOutcome> {
        let mut cursor = session.search(request).await?;
        let mut outcome = SearchOutcome::default();
        let mut position: u64 = 0;

        while let Some(entry) = cursor.next_entry().await? {
            match Principal::from_entry(&entry, &self.schema) {
                Ok(principal) => {
                    if window.map_or(true, |window| window.contains(position)) {
                        outcome.principals.push(principal);
                    }
                    position += 1;
                }
                Err(err) => {
                    warn!(dn = %entry.dn, error = %err, "skipping unreadable directory entry");
                    outcome.skipped += 1;
                }
            }
        }
        cursor.finish().await?;

        debug!(
            filter = %request.filter,
            returned = outcome.principals.len(),
            matched = position,
            skipped = outcome.skipped,
            "directory search complete"
        );
        Ok(outcome)
    }

    /// Finds the first principal of `kind` whose `identity` equals `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is malformed for `identity`, or on transport failure.
    pub async fn find(
        &self,
        session: &mut dyn DirectorySession,
        kind: PrincipalKind,
        identity: IdentityType,
        key: &str,
    ) -> Result<Option<Principal>> {
        if key.trim().is_empty() {
            return Ok(None);
        }
        let filter = self.schema.identity_filter(kind, identity, key)?;
        let base = self.base(session).await?;
        let request = self.lookup_request(&base, &filter);
        let outcome = self.collect(session, &request, None).await?;
        if outcome.principals.len() > 1 {
            debug!(
                %key,
                matches = outcome.principals.len(),
                "identity matched several principals, using the first"
            );
        }
        Ok(outcome.principals.into_iter().next())
    }
}
