//! Attribute names and filters per kind of directory store.

use crate::{dn::DistinguishedName, principal::PrincipalKind, Result};
use directory_core::{ContextType, IdentityType, SecurityIdentifier};
use std::fmt::Write as _;
use uuid::Uuid;

/// Attributes fetched for every principal.
const PRINCIPAL_ATTRIBUTES: &[&str] = &[
    "objectClass",
    "distinguishedName",
    "objectSid",
    "objectGUID",
    "sAMAccountName",
    "userPrincipalName",
    "cn",
    "name",
    "displayName",
    "mail",
    "description",
    "whenCreated",
];

/// Attribute used for e-mail searches.
pub const MAIL_ATTRIBUTE: &str = "mail";

/// Attribute naming conventions of one kind of directory store.
///
/// Active Directory domains (and the local machine store) identify accounts by
/// `sAMAccountName`; application directories (AD LDS) have no such attribute and use `name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSchema {
    context: ContextType,
}

impl AttributeSchema {
    /// Creates the schema for `context`.
    #[must_use]
    pub const fn new(context: ContextType) -> Self {
        Self { context }
    }

    /// Kind of directory store.
    #[must_use]
    pub const fn context_type(&self) -> ContextType {
        self.context
    }

    /// Logon name attribute.
    #[must_use]
    pub const fn account_attribute(&self) -> &'static str {
        match self.context {
            ContextType::ApplicationDirectory => "name",
            ContextType::Machine | ContextType::Domain => "sAMAccountName",
        }
    }

    /// Attribute holding identities of the given kind.
    #[must_use]
    pub const fn identity_attribute(&self, identity: IdentityType) -> &'static str {
        match identity {
            IdentityType::SamAccountName => self.account_attribute(),
            IdentityType::Name => "cn",
            IdentityType::UserPrincipalName => "userPrincipalName",
            IdentityType::DistinguishedName => "distinguishedName",
            IdentityType::Sid => "objectSid",
            IdentityType::Guid => "objectGUID",
        }
    }

    /// Attribute matched by name searches.
    #[must_use]
    pub const fn name_attribute(&self) -> &'static str {
        "cn"
    }

    /// Filter selecting principals of `kind`.
    #[must_use]
    pub const fn kind_filter(&self, kind: PrincipalKind) -> &'static str {
        match (kind, self.context) {
            (PrincipalKind::User, ContextType::ApplicationDirectory) => "(objectClass=user)",
            (PrincipalKind::User, _) => "(&(objectCategory=person)(objectClass=user))",
            (PrincipalKind::Group, _) => "(objectClass=group)",
            (PrincipalKind::Computer, _) => "(objectClass=computer)",
            (PrincipalKind::Unknown, _) => "(objectClass=*)",
        }
    }

    /// Attributes requested for principal searches.
    #[must_use]
    pub fn principal_attributes(&self) -> Vec<&'static str> {
        PRINCIPAL_ATTRIBUTES.to_vec()
    }

    /// Filter matching principals of `kind` whose `identity` equals `key`.
    ///
    /// Binary identities are encoded as escaped octet strings; everything else is escaped
    /// literally.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is not a valid SID, GUID or distinguished name for those
    /// identity kinds.
    pub fn identity_filter(
        &self,
        kind: PrincipalKind,
        identity: IdentityType,
        key: &str,
    ) -> Result<String> {
        let key = key.trim();
        let value = match identity {
            IdentityType::Sid => SecurityIdentifier::parse(key)?.to_filter_value(),
            IdentityType::Guid => {
                let guid = Uuid::parse_str(key)?;
                escape_bytes(&guid.to_bytes_le())
            }
            IdentityType::DistinguishedName => {
                escape_value(DistinguishedName::parse(key)?.as_str())
            }
            IdentityType::SamAccountName
            | IdentityType::Name
            | IdentityType::UserPrincipalName => escape_value(key),
        };

        Ok(format!(
            "(&{}({}={value}))",
            self.kind_filter(kind),
            self.identity_attribute(identity)
        ))
    }

    /// Filter matching principals of `kind` by every `(attribute, pattern)` condition.
    #[must_use]
    pub fn conditions_filter(
        &self,
        kind: PrincipalKind,
        conditions: &[(String, String)],
    ) -> String {
        let mut filter = format!("(&{}", self.kind_filter(kind));
        for (attribute, pattern) in conditions {
            let _ = write!(filter, "({attribute}={})", escape_pattern(pattern));
        }
        filter.push(')');
        filter
    }
}

impl Default for AttributeSchema {
    fn default() -> Self {
        Self::new(ContextType::default())
    }
}

/// Escapes an assertion value (RFC 4515).
#[must_use]
pub fn escape_value(value: &str) -> String {
    escape(value, false)
}

/// Escapes an assertion value but keeps `*` as a wildcard.
#[must_use]
pub fn escape_pattern(pattern: &str) -> String {
    escape(pattern, true)
}

/// Encodes raw octets as `\xx` pairs.
#[must_use]
pub fn escape_bytes(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 3), |mut out, byte| {
        let _ = write!(out, "\\{byte:02x}");
        out
    })
}

fn escape(value: &str, keep_wildcard: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' if keep_wildcard => escaped.push('*'),
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use directory_core::Error;

    #[test]
    fn escaping() {
        assert_eq!(escape_value("a*(b)\\c\0"), "a\\2a\\28b\\29\\5cc\\00");
        assert_eq!(escape_pattern("*jo(h)n*"), "*jo\\28h\\29n*");
        assert_eq!(escape_bytes(&[0x01, 0xab]), "\\01\\ab");
    }

    #[test]
    fn account_attribute_depends_on_context() {
        assert_eq!(
            AttributeSchema::new(ContextType::Domain).account_attribute(),
            "sAMAccountName"
        );
        assert_eq!(
            AttributeSchema::new(ContextType::ApplicationDirectory)
                .identity_attribute(IdentityType::SamAccountName),
            "name"
        );
    }

    #[test]
    fn identity_filter_for_text_keys() {
        let schema = AttributeSchema::default();
        let filter = schema
            .identity_filter(PrincipalKind::User, IdentityType::SamAccountName, " j*doe ")
            .unwrap();
        assert_eq!(
            filter,
            "(&(&(objectCategory=person)(objectClass=user))(sAMAccountName=j\\2adoe))"
        );
    }

    #[test]
    fn identity_filter_for_sid() {
        let schema = AttributeSchema::default();
        let filter = schema
            .identity_filter(PrincipalKind::Group, IdentityType::Sid, "S-1-5-32-544")
            .unwrap();
        assert_eq!(
            filter,
            "(&(objectClass=group)(objectSid=\\01\\02\\00\\00\\00\\00\\00\\05\\20\\00\\00\\00\\20\\02\\00\\00))"
        );
    }

    #[test]
    fn identity_filter_for_guid_uses_mixed_endian_bytes() {
        let schema = AttributeSchema::default();
        let filter = schema
            .identity_filter(
                PrincipalKind::User,
                IdentityType::Guid,
                "00112233-4455-6677-8899-aabbccddeeff",
            )
            .unwrap();
        assert!(filter.ends_with(
            "(objectGUID=\\33\\22\\11\\00\\55\\44\\77\\66\\88\\99\\aa\\bb\\cc\\dd\\ee\\ff))"
        ));
    }

    #[test]
    fn identity_filter_for_dn_is_escaped() {
        let schema = AttributeSchema::default();
        let filter = schema
            .identity_filter(
                PrincipalKind::User,
                IdentityType::DistinguishedName,
                "CN=Smith\\, John,DC=corp",
            )
            .unwrap();
        assert!(filter.ends_with("(distinguishedName=CN=Smith\\5c, John,DC=corp))"));
    }

    #[test]
    fn malformed_binary_keys_are_rejected() {
        let schema = AttributeSchema::default();
        assert!(matches!(
            schema.identity_filter(PrincipalKind::User, IdentityType::Guid, "nope"),
            Err(Error::InvalidGuid(_))
        ));
        assert!(schema
            .identity_filter(PrincipalKind::User, IdentityType::Sid, "S-x")
            .is_err());
    }

    #[test]
    fn conditions_keep_wildcards() {
        let schema = AttributeSchema::new(ContextType::ApplicationDirectory);
        let filter = schema.conditions_filter(
            PrincipalKind::User,
            &[("mail".to_string(), "*@corp(1)*".to_string())],
        );
        assert_eq!(filter, "(&(objectClass=user)(mail=*@corp\\281\\29*))");
    }
}
