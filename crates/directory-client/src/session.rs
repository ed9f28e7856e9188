//! Directory session abstractions.
//!
//! The resilience layer only talks to these traits; `ldap.rs` provides the `ldap3`-backed
//! implementation and tests plug in mocks.

use crate::{resolver::Endpoint, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Search scope for directory queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// One level below the base.
    OneLevel,
    /// Entire subtree.
    Subtree,
}

/// A single search to run against a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base distinguished name (empty for the RootDSE).
    pub base: String,
    /// Search scope.
    pub scope: SearchScope,
    /// RFC 4515 filter.
    pub filter: String,
    /// Attributes to return.
    pub attributes: Vec<String>,
    /// Server-side sort key, if any.
    pub sort: Option<SortKey>,
    /// Entries per round trip; `None` disables the paged-results control.
    pub page_size: Option<u32>,
}

impl SearchRequest {
    /// Creates an unsorted, unpaged request.
    #[must_use]
    pub fn new(base: impl Into<String>, scope: SearchScope, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
            sort: None,
            page_size: None,
        }
    }

    /// Sets the requested attributes.
    #[must_use]
    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an attribute unless it is already requested (case-insensitive).
    #[must_use]
    pub fn with_attribute(mut self, attribute: &str) -> Self {
        if !self
            .attributes
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(attribute))
        {
            self.attributes.push(attribute.to_string());
        }
        self
    }

    /// Requests server-side sorting.
    #[must_use]
    pub fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Requests paged transport with the given batch size.
    #[must_use]
    pub const fn paged(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Server-side sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Attribute to sort on.
    pub attribute: String,
    /// Whether to reverse the order.
    pub reverse: bool,
}

/// Raw directory entry as returned by a search.
///
/// Attribute names are stored lowercased so lookups do not depend on how the server spells them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    attributes: HashMap<String, Vec<String>>,
    binary_attributes: HashMap<String, Vec<Vec<u8>>>,
}

impl LdapEntry {
    /// Builds an entry from text and binary attribute maps.
    #[must_use]
    pub fn new(
        dn: impl Into<String>,
        attributes: HashMap<String, Vec<String>>,
        binary_attributes: HashMap<String, Vec<Vec<u8>>>,
    ) -> Self {
        Self {
            dn: dn.into(),
            attributes: attributes
                .into_iter()
                .map(|(name, values)| (name.to_ascii_lowercase(), values))
                .collect(),
            binary_attributes: binary_attributes
                .into_iter()
                .map(|(name, values)| (name.to_ascii_lowercase(), values))
                .collect(),
        }
    }

    /// Adds text values for `attribute`.
    #[must_use]
    pub fn with_values<I, S>(mut self, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .entry(attribute.to_ascii_lowercase())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Adds binary values for `attribute`.
    #[must_use]
    pub fn with_binary<I>(mut self, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.binary_attributes
            .entry(attribute.to_ascii_lowercase())
            .or_default()
            .extend(values);
        self
    }

    /// Returns the first text value of the attribute if present.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .get(&attribute.to_ascii_lowercase())
            .and_then(|values| values.first().map(String::as_str))
    }

    /// Returns all text values for the attribute.
    #[must_use]
    pub fn values(&self, attribute: &str) -> &[String] {
        self.attributes
            .get(&attribute.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns all octet-string values of the attribute.
    ///
    /// Values that happened to be valid UTF-8 are delivered as text by the protocol layer, so
    /// both maps are consulted.
    #[must_use]
    pub fn binary_values(&self, attribute: &str) -> Vec<&[u8]> {
        let key = attribute.to_ascii_lowercase();
        let binary = self
            .binary_attributes
            .get(&key)
            .into_iter()
            .flatten()
            .map(Vec::as_slice);
        let text = self
            .attributes
            .get(&key)
            .into_iter()
            .flatten()
            .map(String::as_bytes);
        binary.chain(text).collect()
    }

    /// Returns the first octet-string value of the attribute.
    #[must_use]
    pub fn first_binary(&self, attribute: &str) -> Option<&[u8]> {
        self.binary_values(attribute).into_iter().next()
    }
}

/// Lazily enumerated search results.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntryCursor: Send {
    /// Fetches the next entry, or `None` once the result set is exhausted.
    async fn next_entry(&mut self) -> Result<Option<LdapEntry>>;

    /// Completes the search and checks its final result code.
    async fn finish(&mut self) -> Result<()>;
}

/// A connection to one directory endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectorySession: Send {
    /// Binds with an explicit identity and secret.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Binds with the identity of the calling process (SASL, no password).
    async fn ambient_bind(&mut self) -> Result<()>;

    /// Starts a search.
    async fn search(&mut self, request: &SearchRequest) -> Result<Box<dyn EntryCursor>>;

    /// Releases the connection.
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens sessions to concrete endpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `endpoint` without binding.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DirectorySession>>;
}

/// Runs `request` and drains the cursor.
///
/// Meant for small, bounded result sets (RootDSE reads, base-scope lookups).
pub(crate) async fn search_all(
    session: &mut dyn DirectorySession,
    request: &SearchRequest,
) -> Result<Vec<LdapEntry>> {
    let mut cursor = session.search(request).await?;
    let mut entries = Vec::new();
    while let Some(entry) = cursor.next_entry().await? {
        entries.push(entry);
    }
    cursor.finish().await?;
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted cursors for tests.

    use super::*;
    use std::collections::VecDeque;

    /// Cursor that replays a fixed list of results.
    pub(crate) struct ScriptedCursor {
        items: VecDeque<Result<LdapEntry>>,
    }

    impl ScriptedCursor {
        pub(crate) fn new(entries: Vec<LdapEntry>) -> Self {
            Self {
                items: entries.into_iter().map(Ok).collect(),
            }
        }

        pub(crate) fn with_results(items: Vec<Result<LdapEntry>>) -> Self {
            Self {
                items: items.into(),
            }
        }
    }

    #[async_trait]
    impl EntryCursor for ScriptedCursor {
        async fn next_entry(&mut self) -> Result<Option<LdapEntry>> {
            self.items.pop_front().transpose()
        }

        async fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
