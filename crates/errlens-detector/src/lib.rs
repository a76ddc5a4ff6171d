//! errlens Detector
//!
//! Classifies free-text error messages into operator-defined categories.
//!
//! Rules are compiled into three tiers, evaluated cheapest first:
//! - Containment: substring search over the lowercased message
//! - Exact: hash lookup of the lowercased, trimmed message
//! - Regex: case-insensitive regular expressions, screened for ReDoS risk
//!
//! The first matching rule wins. The engine reloads its indices from a
//! [`RuleStore`](errlens_core::RuleStore) on demand or when a rule-change
//! event arrives, and keeps serving the previous rules if a reload fails.

pub mod config;
pub mod engine;
pub mod safety;
pub mod snapshot;

pub use config::DetectorConfig;
pub use engine::{DetectionEngine, EngineStats, ReloadOutcome, RuleSubscription};
pub use safety::{SafetyScreen, UnsafePattern};
pub use snapshot::{ReloadReport, RuleSnapshot};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::DetectorConfig;
    pub use crate::engine::{DetectionEngine, EngineStats, ReloadOutcome};
    pub use errlens_core::{DetectionResult, MatchType, Rule, RuleEventBus, RuleStore};
}
