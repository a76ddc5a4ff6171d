//! Core types for errlens

use serde::{Deserialize, Serialize};
use std::fmt;

/// A classification rule as served by the rule store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Text, exact value, or regular expression source to match
    pub pattern: String,

    /// Category assigned to messages matching this rule
    pub category: String,

    /// Matching strategy
    #[serde(alias = "matchType")]
    pub match_type: MatchType,

    /// Optional operator-facing description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Rule {
    /// Create a new rule
    pub fn new(
        pattern: impl Into<String>,
        category: impl Into<String>,
        match_type: MatchType,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            category: category.into(),
            match_type,
            description: None,
        }
    }

    /// Create a containment rule
    pub fn contains(pattern: impl Into<String>, category: impl Into<String>) -> Self {
        Self::new(pattern, category, MatchType::Contains)
    }

    /// Create an exact-match rule
    pub fn exact(pattern: impl Into<String>, category: impl Into<String>) -> Self {
        Self::new(pattern, category, MatchType::Exact)
    }

    /// Create a regular expression rule
    pub fn regex(pattern: impl Into<String>, category: impl Into<String>) -> Self {
        Self::new(pattern, category, MatchType::Regex)
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Match strategy of a rule
///
/// Unknown strategies are kept as `Other` so a single bad row never fails a
/// whole fetch; the detector skips them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchType {
    /// Substring containment
    Contains,
    /// Whole-message equality
    Exact,
    /// Regular expression search
    Regex,
    /// Unrecognised strategy name
    Other(String),
}

impl MatchType {
    /// Canonical lowercase name
    pub fn as_str(&self) -> &str {
        match self {
            Self::Contains => "contains",
            Self::Exact => "exact",
            Self::Regex => "regex",
            Self::Other(raw) => raw,
        }
    }
}

impl From<&str> for MatchType {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "contains" => Self::Contains,
            "exact" => Self::Exact,
            "regex" => Self::Regex,
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl From<String> for MatchType {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<MatchType> for String {
    fn from(match_type: MatchType) -> Self {
        match_type.as_str().to_string()
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying a single message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Whether any rule matched
    pub matched: bool,

    /// Category of the winning rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Normalized containment/exact text, or the regex source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Tier that produced the match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<MatchType>,

    /// Description of the winning rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DetectionResult {
    /// Result for a message no rule matched
    pub fn not_matched() -> Self {
        Self::default()
    }

    /// Result for a rule match
    pub fn matched(
        category: impl Into<String>,
        pattern: impl Into<String>,
        match_type: MatchType,
        description: Option<String>,
    ) -> Self {
        Self {
            matched: true,
            category: Some(category.into()),
            pattern: Some(pattern.into()),
            match_type: Some(match_type),
            description,
        }
    }
}
