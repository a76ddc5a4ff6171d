//! errlens Stores
//!
//! Concrete [`RuleStore`](errlens_core::RuleStore) implementations:
//! - `MemoryRuleStore` for embedding and tests
//! - `YamlRuleStore` for file-managed rule sets, with `YamlRuleWatcher`
//!   publishing an update whenever the file changes
//! - `PgRuleStore` for PostgreSQL-backed rule tables, with `PgRuleListener`
//!   bridging `NOTIFY` messages onto the rule event bus

pub mod memory;
pub mod postgres;
pub mod watcher;
pub mod yaml;

pub use memory::MemoryRuleStore;
pub use postgres::{PgRuleListener, PgRuleStore, PgStoreConfig};
pub use watcher::YamlRuleWatcher;
pub use yaml::{RuleFile, YamlRuleStore};
