//! Key pattern matching for find and delete
//!
//! A pattern is a key string with at most one `*`. The wildcard stands for
//! any substring of the raw key, including the empty string and including
//! `.`, `[` and `]`:
//!
//! - `com.arm.*` matches `com.arm.x` and `com.arm.x.y`
//! - `com.*.essid` matches `com.arm.wifi.essid`
//! - `animal[dog*]` matches `animal[dog]` and `animal[dogfoot]`
//!
//! Because the literal text before the wildcard is a plain prefix, every
//! match lies in one contiguous range of a lexicographically ordered index.

use crate::error::Result;
use crate::validation::{validate_pattern, WILDCARD};

/// A parsed, validated key pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    prefix: String,
    /// Literal text after the wildcard; `None` for an exact name
    suffix: Option<String>,
}

impl KeyPattern {
    /// Parse and validate a pattern
    ///
    /// # Examples
    /// ```
    /// use cfstore::KeyPattern;
    ///
    /// let pattern = KeyPattern::parse("a.b.*").unwrap();
    /// assert!(pattern.matches("a.b.c"));
    /// assert!(!pattern.matches("a.bc"));
    /// assert!(KeyPattern::parse("a.*.*").is_err());
    /// ```
    pub fn parse(pattern: &str) -> Result<Self> {
        validate_pattern(pattern)?;

        Ok(match pattern.split_once(WILDCARD) {
            Some((prefix, suffix)) => KeyPattern {
                prefix: prefix.to_string(),
                suffix: Some(suffix.to_string()),
            },
            None => KeyPattern {
                prefix: pattern.to_string(),
                suffix: None,
            },
        })
    }

    /// Literal text every match starts with
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_exact(&self) -> bool {
        self.suffix.is_none()
    }

    /// Check a key against the pattern
    pub fn matches(&self, key: &str) -> bool {
        match &self.suffix {
            None => key == self.prefix,
            Some(suffix) => {
                key.len() >= self.prefix.len() + suffix.len()
                    && key.starts_with(self.prefix.as_str())
                    && key.ends_with(suffix.as_str())
            }
        }
    }

    /// True once an ordered scan has moved past every possible match
    pub fn is_past(&self, key: &str) -> bool {
        !key.starts_with(self.prefix.as_str()) && key > self.prefix.as_str()
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.suffix {
            Some(suffix) => write!(f, "{}{}{}", self.prefix, WILDCARD, suffix),
            None => write!(f, "{}", self.prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let pattern = KeyPattern::parse("a.b.c").unwrap();
        assert!(pattern.is_exact());
        assert!(pattern.matches("a.b.c"));
        assert!(!pattern.matches("a.b.cd"));
        assert!(!pattern.matches("a.b"));
    }

    #[test]
    fn test_trailing_wildcard_matches_subtree() {
        let pattern = KeyPattern::parse("com.arm.*").unwrap();
        assert!(pattern.matches("com.arm.x"));
        assert!(pattern.matches("com.arm.x.y[3]"));
        assert!(pattern.matches("com.arm."));
        assert!(!pattern.matches("com.arm"));
        assert!(!pattern.matches("com.armv7.x"));
    }

    #[test]
    fn test_mid_segment_wildcard() {
        let pattern = KeyPattern::parse("com.arm.wifi*point").unwrap();
        assert!(pattern.matches("com.arm.wifipoint"));
        assert!(pattern.matches("com.arm.wifi.access.point"));
        assert!(!pattern.matches("com.arm.wifi.points"));
    }

    #[test]
    fn test_wildcard_inside_list_index() {
        let pattern = KeyPattern::parse("yotta.animal[dog*]").unwrap();
        assert!(pattern.matches("yotta.animal[dog]"));
        assert!(pattern.matches("yotta.animal[dogfoot]"));
        assert!(pattern.matches("yotta.animal[dog][foot]"));
        assert!(!pattern.matches("yotta.animal[cat]"));
    }

    #[test]
    fn test_prefix_and_suffix_must_not_overlap() {
        let pattern = KeyPattern::parse("ab*ba").unwrap();
        assert!(pattern.matches("abba"));
        assert!(pattern.matches("ab.ba"));
        assert!(!pattern.matches("aba"));
    }

    #[test]
    fn test_bare_wildcard_matches_everything() {
        let pattern = KeyPattern::parse("*").unwrap();
        assert_eq!(pattern.prefix(), "");
        assert!(pattern.matches("a"));
        assert!(pattern.matches("z.y.x"));
    }

    #[test]
    fn test_is_past() {
        let pattern = KeyPattern::parse("b.*").unwrap();
        assert!(!pattern.is_past("a.z"));
        assert!(!pattern.is_past("b.a"));
        assert!(pattern.is_past("c"));
        assert!(pattern.is_past("b/"));
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["a.b.*", "*", "a*b", "a.b"] {
            assert_eq!(KeyPattern::parse(text).unwrap().to_string(), text);
        }
    }
}
