//! Error types for errlens

use crate::store::StoreError;

/// Result type alias using errlens' Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for errlens operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rule store failures (fetch, connectivity, missing schema)
    #[error("rule store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error is the transitional "rule table not provisioned" state
    pub fn is_missing_relation(&self) -> bool {
        matches!(self, Self::Store(StoreError::MissingRelation(_)))
    }
}
