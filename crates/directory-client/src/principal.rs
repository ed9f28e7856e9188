//! Directory principals (users, groups, computers).

use crate::{dn::DistinguishedName, schema::AttributeSchema, session::LdapEntry, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use directory_core::{Error, IdentityType, SecurityIdentifier};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of security principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// User account.
    User,
    /// Security or distribution group.
    Group,
    /// Computer account.
    Computer,
    /// Anything else.
    Unknown,
}

impl PrincipalKind {
    /// Derives the kind from `objectClass` values.
    ///
    /// Computer accounts also carry the `user` class, so `computer` is checked first.
    #[must_use]
    pub fn from_object_classes(classes: &[String]) -> Self {
        let has = |name: &str| classes.iter().any(|class| class.eq_ignore_ascii_case(name));
        if has("computer") {
            Self::Computer
        } else if has("group") {
            Self::Group
        } else if has("user") || has("inetOrgPerson") {
            Self::User
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Computer => "computer",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A security principal read from the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Principal kind.
    pub kind: PrincipalKind,
    /// Distinguished name of the entry.
    pub dn: DistinguishedName,
    /// Security identifier (`objectSid`).
    #[serde(default)]
    pub sid: Option<SecurityIdentifier>,
    /// Object GUID (`objectGUID`).
    #[serde(default)]
    pub guid: Option<Uuid>,
    /// Logon name (`sAMAccountName`, or `name` in application directories).
    #[serde(default)]
    pub account_name: Option<String>,
    /// User principal name.
    #[serde(default)]
    pub user_principal_name: Option<String>,
    /// Common name.
    #[serde(default)]
    pub name: Option<String>,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Primary e-mail address.
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Principal {
    /// Creates a builder for a principal.
    #[must_use]
    pub fn builder(kind: PrincipalKind, dn: DistinguishedName) -> PrincipalBuilder {
        PrincipalBuilder {
            principal: Self {
                kind,
                dn,
                sid: None,
                guid: None,
                account_name: None,
                user_principal_name: None,
                name: None,
                display_name: None,
                email: None,
                description: None,
                created_at: None,
            },
        }
    }

    /// Materializes a raw entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Materialization`] if the entry's distinguished name, `objectSid` or
    /// `objectGUID` cannot be decoded. Missing optional attributes are not an error.
    pub fn from_entry(entry: &LdapEntry, schema: &AttributeSchema) -> Result<Self> {
        let dn = DistinguishedName::parse(&entry.dn)
            .map_err(|err| Error::materialization(&entry.dn, err.to_string()))?;
        let kind = PrincipalKind::from_object_classes(entry.values("objectClass"));

        let sid = entry
            .first_binary("objectSid")
            .map(SecurityIdentifier::from_bytes)
            .transpose()
            .map_err(|err| Error::materialization(&entry.dn, err.to_string()))?;

        let guid = entry
            .first_binary("objectGUID")
            .map(|bytes| {
                <[u8; 16]>::try_from(bytes).map(Uuid::from_bytes_le).map_err(|_| {
                    Error::materialization(
                        &entry.dn,
                        format!("objectGUID is {} bytes, expected 16", bytes.len()),
                    )
                })
            })
            .transpose()?;

        let text = |attribute: &str| entry.first(attribute).map(str::to_string);
        let mut builder = Self::builder(kind, dn)
            .account_name(text(schema.account_attribute()))
            .user_principal_name(text("userPrincipalName"))
            .name(text("cn").or_else(|| text("name")))
            .display_name(text("displayName"))
            .email(text("mail"))
            .description(text("description"))
            .created_at(entry.first("whenCreated").and_then(parse_generalized_time));
        if let Some(sid) = sid {
            builder = builder.sid(sid);
        }
        if let Some(guid) = guid {
            builder = builder.guid(guid);
        }

        Ok(builder.build())
    }

    /// Value of the identity of the given kind, rendered as text.
    #[must_use]
    pub fn identity_value(&self, identity: IdentityType) -> Option<String> {
        match identity {
            IdentityType::SamAccountName => self.account_name.clone(),
            IdentityType::Name => self.name.clone(),
            IdentityType::UserPrincipalName => self.user_principal_name.clone(),
            IdentityType::DistinguishedName => Some(self.dn.to_string()),
            IdentityType::Sid => self.sid.as_ref().map(ToString::to_string),
            IdentityType::Guid => self.guid.map(|guid| guid.to_string()),
        }
    }

    /// Returns true if both values denote the same directory object.
    ///
    /// Security identifiers are compared when both sides carry one; otherwise distinguished
    /// names are.
    #[must_use]
    pub fn same_principal(&self, other: &Self) -> bool {
        match (&self.sid, &other.sid) {
            (Some(a), Some(b)) => a == b,
            _ => self.dn == other.dn,
        }
    }

    /// Preferred human-readable name.
    #[must_use]
    pub fn display(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.name.as_deref())
            .or(self.account_name.as_deref())
            .unwrap_or_else(|| self.dn.as_str())
    }
}

/// Builder for [`Principal`].
#[derive(Debug, Clone)]
pub struct PrincipalBuilder {
    principal: Principal,
}

impl PrincipalBuilder {
    /// Sets the security identifier.
    #[must_use]
    pub fn sid(mut self, sid: SecurityIdentifier) -> Self {
        self.principal.sid = Some(sid);
        self
    }

    /// Sets the object GUID.
    #[must_use]
    pub fn guid(mut self, guid: Uuid) -> Self {
        self.principal.guid = Some(guid);
        self
    }

    /// Sets the logon name.
    #[must_use]
    pub fn account_name(mut self, value: Option<String>) -> Self {
        self.principal.account_name = value;
        self
    }

    /// Sets the user principal name.
    #[must_use]
    pub fn user_principal_name(mut self, value: Option<String>) -> Self {
        self.principal.user_principal_name = value;
        self
    }

    /// Sets the common name.
    #[must_use]
    pub fn name(mut self, value: Option<String>) -> Self {
        self.principal.name = value;
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn display_name(mut self, value: Option<String>) -> Self {
        self.principal.display_name = value;
        self
    }

    /// Sets the e-mail address.
    #[must_use]
    pub fn email(mut self, value: Option<String>) -> Self {
        self.principal.email = value;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, value: Option<String>) -> Self {
        self.principal.description = value;
        self
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub fn created_at(mut self, value: Option<DateTime<Utc>>) -> Self {
        self.principal.created_at = value;
        self
    }

    /// Finalizes the principal.
    #[must_use]
    pub fn build(self) -> Principal {
        self.principal
    }
}

/// Parses an LDAP GeneralizedTime (`20240131123045.0Z`).
fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim().trim_end_matches('Z');
    let seconds = value.split_once('.').map_or(value, |(seconds, _)| seconds);
    NaiveDateTime::parse_from_str(seconds, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
