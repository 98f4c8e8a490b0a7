//! Validation for key names and search patterns
//!
//! Key names form a global hierarchical namespace. A name is a sequence of
//! Path Directory Entries (PDEs) separated by `.`; each PDE is a name
//! optionally followed by one or more bracketed list indices:
//!
//! ```text
//! com.arm.mbed.wifi.accesspoint[5].essid
//! yotta.hello-world.animal[dog][foot][3]
//! ```
//!
//! The `*` character never appears in a stored key. It is reserved for
//! search and delete patterns, where it may occur at most once.

use crate::error::{CfstoreError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Maximum key name length, excluding the terminator
pub const KEY_NAME_MAX_LENGTH: usize = 220;

/// Wildcard character allowed in patterns only
pub const WILDCARD: char = '*';

const SEGMENT_PATTERN: &str = r"^[A-Za-z0-9-]+(\[[A-Za-z0-9-]+\])*$";
const QUERY_PATTERN: &str = r"^[A-Za-z0-9.\[\]*-]+$";

fn segment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SEGMENT_PATTERN).expect("segment pattern is a valid regex"))
}

fn query_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(QUERY_PATTERN).expect("query pattern is a valid regex"))
}

/// A validated key name
///
/// # Examples
///
/// ```
/// use cfstore::KeyName;
///
/// let key = KeyName::new("com.arm.mbed.wifi.accesspoint[5].essid").unwrap();
/// assert_eq!(key.segments().len(), 6);
///
/// assert!(KeyName::new("com.arm.*").is_err()); // wildcard
/// assert!(KeyName::new("com..arm").is_err()); // empty PDE
/// assert!(KeyName::new("com.arm[").is_err()); // unbalanced list index
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyName(String);

impl KeyName {
    /// Create a new validated key name
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeySyntax` for an empty or overlong name, a
    /// disallowed character, an empty PDE or a malformed list index.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::validate_name(&name)?;
        Ok(KeyName(name))
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CfstoreError::InvalidKeySyntax(
                "key name cannot be empty".to_string(),
            ));
        }

        if name.len() > KEY_NAME_MAX_LENGTH {
            return Err(CfstoreError::InvalidKeySyntax(format!(
                "key name too long ({} > {} characters)",
                name.len(),
                KEY_NAME_MAX_LENGTH
            )));
        }

        if name.contains(WILDCARD) {
            return Err(CfstoreError::InvalidKeySyntax(format!(
                "'{}' contains the reserved wildcard character",
                name
            )));
        }

        let re = segment_regex();
        for segment in name.split('.') {
            if !re.is_match(segment) {
                return Err(CfstoreError::InvalidKeySyntax(format!(
                    "'{}' has malformed path entry '{}'",
                    name, segment
                )));
            }
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Split the name into its Path Directory Entries
    pub fn segments(&self) -> Vec<Pde<'_>> {
        self.0.split('.').map(Pde::parse).collect()
    }

    /// True if `prefix` matches the leading PDEs of this key
    ///
    /// `com.arm` owns `com.arm` and `com.arm.tls`, but not `com.armv7` or
    /// `com.arm[1]`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        has_leading_segments(&self.0, prefix)
    }
}

impl AsRef<str> for KeyName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for KeyName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for KeyName {
    type Error = CfstoreError;

    fn try_from(value: String) -> Result<Self> {
        KeyName::new(value)
    }
}

impl From<KeyName> for String {
    fn from(key: KeyName) -> String {
        key.0
    }
}

/// Leading-segment match of a dotted prefix against a dotted key
pub fn has_leading_segments(key: &str, prefix: &str) -> bool {
    let mut key_parts = key.split('.');
    prefix
        .split('.')
        .all(|p| key_parts.next().map_or(false, |k| k == p))
}

/// One Path Directory Entry of a key name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pde<'a> {
    /// Entry name without list indices
    pub name: &'a str,
    /// List item specifiers, in order (`animal[dog][foot]` -> `dog`, `foot`)
    pub indices: Vec<&'a str>,
}

impl<'a> Pde<'a> {
    fn parse(segment: &'a str) -> Self {
        let (name, rest) = match segment.find('[') {
            Some(pos) => segment.split_at(pos),
            None => (segment, ""),
        };
        let indices = rest
            .split(']')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_start_matches('['))
            .collect();
        Pde { name, indices }
    }
}

/// Validate a search/delete pattern
///
/// Patterns use the key character set plus at most one `*`. Bracket
/// balance is not checked because `*` may stand in for part of a list
/// index (`animal[dog*3]`).
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(CfstoreError::InvalidKeySyntax(
            "pattern cannot be empty".to_string(),
        ));
    }

    if pattern.len() > KEY_NAME_MAX_LENGTH {
        return Err(CfstoreError::InvalidKeySyntax(format!(
            "pattern too long ({} > {} characters)",
            pattern.len(),
            KEY_NAME_MAX_LENGTH
        )));
    }

    if !query_regex().is_match(pattern) {
        return Err(CfstoreError::InvalidKeySyntax(format!(
            "pattern '{}' contains a disallowed character",
            pattern
        )));
    }

    if pattern.matches(WILDCARD).count() > 1 {
        return Err(CfstoreError::InvalidKeySyntax(format!(
            "pattern '{}' contains more than one wildcard",
            pattern
        )));
    }

    Ok(())
}
