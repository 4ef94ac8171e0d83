//! Fractional z-order keys.
//!
//! Keys have the form `<prefix>|<suffix>` where the prefix is a decimal
//! integer and the suffix is a non-empty run of `a-z`. New keys are always
//! rendered with a zero-padded prefix so plain string order agrees with
//! numeric order; comparison itself is numeric on the prefix so keys written
//! without padding still sort correctly.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Digits used when rendering the integer prefix.
pub const PREFIX_WIDTH: usize = 12;

/// Suffix given to freshly minted keys.
const BASE_SUFFIX: &str = "a";

/// A validated paint-order key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortKey {
    raw: String,
    prefix: u64,
    split: usize,
}

impl SortKey {
    /// Key that orders after `max`, or the first key when the table is empty.
    #[must_use]
    pub fn after(max: Option<&SortKey>) -> Self {
        let prefix = max.map_or(0, |key| key.prefix).saturating_add(1);
        Self::from_parts(prefix, BASE_SUFFIX)
    }

    fn from_parts(prefix: u64, suffix: &str) -> Self {
        let raw = format!("{prefix:0width$}|{suffix}", width = PREFIX_WIDTH);
        let split = raw.len() - suffix.len() - 1;
        Self { raw, prefix, split }
    }

    /// Numeric value of the prefix.
    #[must_use]
    pub fn prefix(&self) -> u64 {
        self.prefix
    }

    /// Letter suffix.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    /// The stored string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl Hash for SortKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.prefix.hash(state);
        self.suffix().hash(state);
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then_with(|| self.suffix().cmp(other.suffix()))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for SortKey {
    type Err = SortKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, suffix) = s
            .split_once('|')
            .ok_or_else(|| SortKeyError::MissingSeparator(s.to_string()))?;

        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SortKeyError::InvalidPrefix(s.to_string()));
        }
        let numeric = prefix
            .parse::<u64>()
            .map_err(|_| SortKeyError::InvalidPrefix(s.to_string()))?;

        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(SortKeyError::InvalidSuffix(s.to_string()));
        }

        Ok(Self {
            raw: s.to_string(),
            prefix: numeric,
            split: prefix.len(),
        })
    }
}

impl TryFrom<String> for SortKey {
    type Error = SortKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SortKey> for String {
    fn from(key: SortKey) -> Self {
        key.raw
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Errors parsing a sort key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SortKeyError {
    /// No `|` between prefix and suffix
    #[error("sort key {0:?} has no '|' separator")]
    MissingSeparator(String),
    /// Prefix is empty, non-numeric, or out of range
    #[error("sort key {0:?} has an invalid integer prefix")]
    InvalidPrefix(String),
    /// Suffix is empty or not lowercase ASCII letters
    #[error("sort key {0:?} has an invalid letter suffix")]
    InvalidSuffix(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SortKey {
        s.parse().unwrap()
    }

    #[test]
    fn first_key_is_padded() {
        assert_eq!(SortKey::after(None).as_str(), "000000000001|a");
    }

    #[test]
    fn after_increments_the_prefix() {
        let next = SortKey::after(Some(&key("41|zz")));
        assert_eq!(next.prefix(), 42);
        assert_eq!(next.suffix(), "a");
        assert!(next > key("41|zz"));
    }

    #[test]
    fn numeric_order_survives_digit_width_changes() {
        // plain string comparison would put "10|a" before "9|a"
        assert!(key("9|a") < key("10|a"));
        assert!(key("000000000009|a") < key("10|a"));

        let mut previous = SortKey::after(None);
        for _ in 0..1_200 {
            let next = SortKey::after(Some(&previous));
            assert!(next > previous);
            assert!(next.as_str() > previous.as_str());
            previous = next;
        }
    }

    #[test]
    fn padding_does_not_affect_identity() {
        assert_eq!(key("7|c"), key("000000000007|c"));
    }

    #[test]
    fn suffix_breaks_prefix_ties() {
        assert!(key("5|a") < key("5|an"));
        assert!(key("5|an") < key("5|b"));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!("5a".parse::<SortKey>(), Err(SortKeyError::MissingSeparator(_))));
        assert!(matches!("x|a".parse::<SortKey>(), Err(SortKeyError::InvalidPrefix(_))));
        assert!(matches!("|a".parse::<SortKey>(), Err(SortKeyError::InvalidPrefix(_))));
        assert!(matches!("5|".parse::<SortKey>(), Err(SortKeyError::InvalidSuffix(_))));
        assert!(matches!("5|A".parse::<SortKey>(), Err(SortKeyError::InvalidSuffix(_))));
    }

    #[test]
    fn serde_uses_the_string_form() {
        let value = serde_json::to_value(key("7|c")).unwrap();
        assert_eq!(value, serde_json::json!("7|c"));
        let back: SortKey = serde_json::from_value(value).unwrap();
        assert_eq!(back, key("7|c"));
        assert!(serde_json::from_value::<SortKey>(serde_json::json!("nope")).is_err());
    }
}
