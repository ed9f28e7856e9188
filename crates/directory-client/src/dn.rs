//! Distinguished name handling for directory entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use directory_core::error::Error as CoreError;

/// Errors produced while parsing distinguished names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistinguishedNameError {
    /// The distinguished name was empty.
    #[error("distinguished name cannot be empty")]
    Empty,
    /// A component was not of the form `attribute=value`.
    #[error("invalid distinguished name component: {0}")]
    InvalidComponent(String),
    /// A component had an empty value.
    #[error("distinguished name component missing value for attribute {0}")]
    MissingValue(String),
    /// An escape sequence was cut short or used invalid hex digits.
    #[error("distinguished name contains a malformed escape sequence")]
    BadEscape,
}

impl From<DistinguishedNameError> for CoreError {
    fn from(err: DistinguishedNameError) -> Self {
        CoreError::InvalidDistinguishedName(err.to_string())
    }
}

/// One `attribute=value` pair of a distinguished name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeDistinguishedName {
    attribute: String,
    value: String,
}

impl RelativeDistinguishedName {
    /// Create a new relative distinguished name.
    #[must_use]
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Attribute portion (e.g. `CN`).
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Unescaped value portion.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Parsed distinguished name.
///
/// Values are stored unescaped; [`DistinguishedName::as_str`] returns a canonical re-escaped
/// form, which is what gets sent back to the server in filters and bind requests. Directory
/// servers compare DNs case-insensitively, so equality here does too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DistinguishedName {
    raw: String,
    rdns: Vec<Vec<RelativeDistinguishedName>>,
}

impl DistinguishedName {
    /// Parses a distinguished name.
    ///
    /// Both backslash-character escapes (`\,`) and hex-pair escapes (`\2C`) are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`DistinguishedNameError`] if the name is empty or syntactically invalid.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, DistinguishedNameError> {
        let raw = trim_unescaped(input.as_ref());
        if raw.is_empty() {
            return Err(DistinguishedNameError::Empty);
        }

        let rdns = split_unescaped(raw, ',')?
            .into_iter()
            .map(|component| {
                split_unescaped(component, '+')?
                    .into_iter()
                    .map(parse_pair)
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: render(&rdns),
            rdns,
        })
    }

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// All relative distinguished names, leaf first.
    pub fn components(&self) -> impl Iterator<Item = &RelativeDistinguishedName> + '_ {
        self.rdns.iter().flatten()
    }

    /// Value of the first component with the given attribute (case-insensitive).
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.components()
            .find(|rdn| rdn.attribute.eq_ignore_ascii_case(attribute))
            .map(RelativeDistinguishedName::value)
    }

    /// Value of the leaf (left-most) component.
    #[must_use]
    pub fn leaf_value(&self) -> Option<&str> {
        self.rdns
            .first()
            .and_then(|rdn| rdn.first())
            .map(RelativeDistinguishedName::value)
    }

    /// The distinguished name of the containing entry, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.rdns.len() < 2 {
            return None;
        }
        let rdns = self.rdns[1..].to_vec();
        Some(Self {
            raw: render(&rdns),
            rdns,
        })
    }

    /// Returns true if `self` equals `ancestor` or lies beneath it.
    #[must_use]
    pub fn is_within(&self, ancestor: &Self) -> bool {
        let own = self.raw.to_ascii_lowercase();
        let other = ancestor.raw.to_ascii_lowercase();
        own == other || own.ends_with(&format!(",{other}"))
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.raw.eq_ignore_ascii_case(&other.raw)
    }
}

impl Eq for DistinguishedName {}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for DistinguishedName {
    type Err = DistinguishedNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DistinguishedName {
    type Error = DistinguishedNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<DistinguishedName> for String {
    fn from(value: DistinguishedName) -> Self {
        value.raw
    }
}

/// Splits on `delimiter` outside of escapes, returning the still-escaped parts.
fn split_unescaped(input: &str, delimiter: char) -> Result<Vec<&str>, DistinguishedNameError> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;

    for (idx, ch) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == delimiter {
            parts.push(trim_unescaped(&input[start..idx]));
            start = idx + ch.len_utf8();
        }
    }

    if escaped {
        return Err(DistinguishedNameError::BadEscape);
    }
    parts.push(trim_unescaped(&input[start..]));

    if parts.iter().any(|part| part.is_empty()) {
        return Err(DistinguishedNameError::InvalidComponent(input.to_string()));
    }
    Ok(parts)
}

/// Trims surrounding whitespace, keeping a trailing space that is escaped (`\ `).
fn trim_unescaped(input: &str) -> &str {
    let start = input.trim_start();
    let trimmed = start.trim_end();
    let backslashes = trimmed.chars().rev().take_while(|ch| *ch == '\\').count();
    if backslashes % 2 == 0 {
        return trimmed;
    }
    match start[trimmed.len()..].chars().next() {
        Some(ch) => &start[..trimmed.len() + ch.len_utf8()],
        None => trimmed,
    }
}

fn parse_pair(component: &str) -> Result<RelativeDistinguishedName, DistinguishedNameError> {
    let (attribute, value) = component
        .split_once('=')
        .ok_or_else(|| DistinguishedNameError::InvalidComponent(component.to_string()))?;
    let attribute = attribute.trim();
    let value = trim_unescaped(value);

    if attribute.is_empty() || attribute.contains('\\') {
        return Err(DistinguishedNameError::InvalidComponent(
            component.to_string(),
        ));
    }
    if value.is_empty() {
        return Err(DistinguishedNameError::MissingValue(attribute.to_string()));
    }

    Ok(RelativeDistinguishedName::new(attribute, unescape(value)?))
}

fn unescape(value: &str) -> Result<String, DistinguishedNameError> {
    let mut bytes = Vec::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }

        let first = chars.next().ok_or(DistinguishedNameError::BadEscape)?;
        if first.is_ascii_hexdigit() {
            let second = chars
                .next()
                .filter(char::is_ascii_hexdigit)
                .ok_or(DistinguishedNameError::BadEscape)?;
            let pair = [first, second].iter().collect::<String>();
            let byte =
                u8::from_str_radix(&pair, 16).map_err(|_| DistinguishedNameError::BadEscape)?;
            bytes.push(byte);
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(first.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8(bytes).map_err(|_| DistinguishedNameError::BadEscape)
}

fn escape(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut escaped = String::with_capacity(value.len());

    for (idx, ch) in value.chars().enumerate() {
        let needs_escape = matches!(ch, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (idx == 0 && (ch == ' ' || ch == '#'))
            || (idx == last && ch == ' ');
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(ch);
    }

    escaped
}

fn render(rdns: &[Vec<RelativeDistinguishedName>]) -> String {
    rdns.iter()
        .map(|rdn| {
            rdn.iter()
                .map(|pair| format!("{}={}", pair.attribute, escape(&pair.value)))
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect::<Vec<_>>()
        .join(",")
}
