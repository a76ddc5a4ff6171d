//! errlens Core
//!
//! Core types, traits, and utilities shared across errlens components.
//!
//! This crate provides:
//! - Rule and detection result types
//! - Error types and result handling
//! - The `RuleStore` boundary the detector loads rules through
//! - The rule-change event bus used to trigger reloads

pub mod error;
pub mod events;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use events::{RuleEvent, RuleEventBus, RULES_UPDATED_EVENT};
pub use store::{RuleStore, StoreError};
pub use types::{DetectionResult, MatchType, Rule};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::events::{RuleEvent, RuleEventBus};
    pub use crate::store::{RuleStore, StoreError};
    pub use crate::types::{DetectionResult, MatchType, Rule};
}
