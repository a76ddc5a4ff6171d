//! Rule store boundary
//!
//! The detector never owns rule definitions; it reads them through
//! [`RuleStore`]. Implementations must report a missing backing table as
//! [`StoreError::MissingRelation`] so callers can treat a pending migration
//! as a transitional state rather than an outage.

use async_trait::async_trait;

use crate::types::Rule;

/// Failure fetching rules from a store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backing table/relation does not exist yet
    #[error("rule relation not provisioned: {0}")]
    MissingRelation(String),

    /// Any other failure (connectivity, permissions, malformed data)
    #[error("rule store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Classify a raw driver or I/O message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_missing_relation_message(&message) {
            Self::MissingRelation(message)
        } else {
            Self::Unavailable(message)
        }
    }

    /// Whether this is the transitional missing-table state
    pub fn is_missing_relation(&self) -> bool {
        matches!(self, Self::MissingRelation(_))
    }
}

/// Heuristic match for "relation does not exist" style messages
pub fn is_missing_relation_message(message: &str) -> bool {
    let lower = message.to_lowercase();

    if lower.contains("42p01") || lower.contains("undefined_table") || lower.contains("no such table") {
        return true;
    }

    let names_relation = lower.contains("relation") || lower.contains("table");
    let missing = lower.contains("does not exist")
        || lower.contains("doesn't exist")
        || lower.contains("not found");

    names_relation && missing
}

/// Source of the authoritative rule set
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Fetch every active rule, in priority (load) order
    async fn fetch_rules(&self) -> Result<Vec<Rule>, StoreError>;

    /// Store name for logs
    fn name(&self) -> &str;
}
