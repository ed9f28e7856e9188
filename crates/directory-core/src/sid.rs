//! Security identifiers.
//!
//! Directory servers hand SIDs out in their binary wire form (`objectSid`, `tokenGroups`), while
//! callers usually know them in the `S-1-5-21-...` string form. Both are parsed strictly: a
//! truncated or inconsistent binary SID is how a corrupt directory entry typically shows up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum number of sub-authorities a SID may carry.
pub const MAX_SUB_AUTHORITIES: usize = 15;

const HEADER_LEN: usize = 8;

/// A parsed security identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecurityIdentifier {
    revision: u8,
    authority: u64,
    sub_authorities: Vec<u32>,
}

impl SecurityIdentifier {
    /// Parses the binary wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSid`] when the buffer is truncated, has trailing bytes, uses an
    /// unknown revision or declares too many sub-authorities.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidSid(format!(
                "binary SID is {} bytes, shorter than its header",
                bytes.len()
            )));
        }

        let revision = bytes[0];
        if revision != 1 {
            return Err(Error::InvalidSid(format!("unsupported revision {revision}")));
        }

        let count = usize::from(bytes[1]);
        if count > MAX_SUB_AUTHORITIES {
            return Err(Error::InvalidSid(format!(
                "{count} sub-authorities exceeds the maximum of {MAX_SUB_AUTHORITIES}"
            )));
        }

        let expected = HEADER_LEN + count * 4;
        if bytes.len() != expected {
            return Err(Error::InvalidSid(format!(
                "binary SID declares {count} sub-authorities but is {} bytes (expected {expected})",
                bytes.len()
            )));
        }

        let authority = bytes[2..HEADER_LEN]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));

        let sub_authorities = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self {
            revision,
            authority,
            sub_authorities,
        })
    }

    /// Parses the `S-R-I-S-S...` string representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSid`] if the string is not a well-formed SID.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidSid(input.to_string());
        let trimmed = input.trim();
        let mut parts = trimmed.split('-');

        match parts.next() {
            Some(prefix) if prefix.eq_ignore_ascii_case("S") => {}
            _ => return Err(invalid()),
        }

        let revision = parts
            .next()
            .and_then(|value| value.parse::<u8>().ok())
            .filter(|revision| *revision == 1)
            .ok_or_else(invalid)?;

        let authority = parts
            .next()
            .and_then(parse_authority)
            .filter(|authority| *authority < (1 << 48))
            .ok_or_else(invalid)?;

        let sub_authorities = parts
            .map(|value| value.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;

        if sub_authorities.len() > MAX_SUB_AUTHORITIES {
            return Err(invalid());
        }

        Ok(Self {
            revision,
            authority,
            sub_authorities,
        })
    }

    /// Encodes the SID in its binary wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.sub_authorities.len() * 4);
        bytes.push(self.revision);
        // Bounded by MAX_SUB_AUTHORITIES on every constructor.
        bytes.push(self.sub_authorities.len() as u8);
        bytes.extend_from_slice(&self.authority.to_be_bytes()[2..]);
        for sub in &self.sub_authorities {
            bytes.extend_from_slice(&sub.to_le_bytes());
        }
        bytes
    }

    /// Renders the SID as an LDAP filter value (every octet hex-escaped).
    #[must_use]
    pub fn to_filter_value(&self) -> String {
        self.to_bytes()
            .iter()
            .map(|byte| format!("\\{byte:02x}"))
            .collect()
    }

    /// Identifier authority (5 for `SECURITY_NT_AUTHORITY`).
    #[must_use]
    pub const fn authority(&self) -> u64 {
        self.authority
    }

    /// Sub-authorities in order.
    #[must_use]
    pub fn sub_authorities(&self) -> &[u32] {
        &self.sub_authorities
    }

    /// Relative identifier (the last sub-authority), if any.
    #[must_use]
    pub fn rid(&self) -> Option<u32> {
        self.sub_authorities.last().copied()
    }
}

fn parse_authority(value: &str) -> Option<u64> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse::<u64>().ok(),
    }
}

impl fmt::Display for SecurityIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}-", self.revision)?;
        if self.authority >= (1 << 32) {
            write!(f, "0x{:012X}", self.authority)?;
        } else {
            write!(f, "{}", self.authority)?;
        }
        for sub in &self.sub_authorities {
            write!(f, "-{sub}")?;
        }
        Ok(())
    }
}

impl FromStr for SecurityIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SecurityIdentifier {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SecurityIdentifier> for String {
    fn from(value: SecurityIdentifier) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_USER: &str = "S-1-5-21-3623811015-3361044348-30300820-1013";

    #[test]
    fn string_roundtrip() {
        let sid = SecurityIdentifier::parse(DOMAIN_USER).unwrap();
        assert_eq!(sid.authority(), 5);
        assert_eq!(sid.sub_authorities().len(), 5);
        assert_eq!(sid.rid(), Some(1013));
        assert_eq!(sid.to_string(), DOMAIN_USER);
    }

    #[test]
    fn binary_layout_matches_wire_format() {
        let sid = SecurityIdentifier::parse("S-1-5-32-544").unwrap();
        assert_eq!(
            sid.to_bytes(),
            vec![1, 2, 0, 0, 0, 0, 0, 5, 32, 0, 0, 0, 0x20, 0x02, 0, 0]
        );
        assert_eq!(
            SecurityIdentifier::from_bytes(&sid.to_bytes()).unwrap(),
            sid
        );
    }

    #[test]
    fn filter_value_escapes_every_octet() {
        let sid = SecurityIdentifier::parse("S-1-1-0").unwrap();
        assert_eq!(
            sid.to_filter_value(),
            "\\01\\01\\00\\00\\00\\00\\00\\01\\00\\00\\00\\00"
        );
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let mut bytes = SecurityIdentifier::parse(DOMAIN_USER).unwrap().to_bytes();
        bytes.truncate(bytes.len() - 3);
        let err = SecurityIdentifier::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::InvalidSid(_)));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(SecurityIdentifier::from_bytes(&[1, 0, 0]).is_err());
        assert!(SecurityIdentifier::from_bytes(&[2, 0, 0, 0, 0, 0, 0, 5]).is_err());
        assert!(SecurityIdentifier::from_bytes(&[1, 16, 0, 0, 0, 0, 0, 5]).is_err());
    }

    #[test]
    fn malformed_strings_are_rejected() {
        for input in ["", "S-1", "X-1-5-21", "S-2-5-21", "S-1-5-abc", "S-1-5-21-"] {
            assert!(
                SecurityIdentifier::parse(input).is_err(),
                "`{input}` should not parse"
            );
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let sid = SecurityIdentifier::parse(DOMAIN_USER).unwrap();
        let json = serde_json::to_string(&sid).unwrap();
        assert_eq!(json, format!("\"{DOMAIN_USER}\""));
        let back: SecurityIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sid);
    }
}
