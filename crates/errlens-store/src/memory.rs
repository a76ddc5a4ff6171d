//! In-memory rule store

use async_trait::async_trait;
use errlens_core::{Rule, RuleStore, StoreError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rule store backed by a vector in memory
///
/// Fetches return a clone of the current rule list. A failure can be
/// injected with [`fail_with`](Self::fail_with) to simulate an outage or a
/// pending migration.
pub struct MemoryRuleStore {
    name: String,
    rules: RwLock<Vec<Rule>>,
    failure: RwLock<Option<StoreError>>,
    fetch_count: AtomicU64,
}

impl MemoryRuleStore {
    /// Create a store holding the given rules
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            name: "memory".to_string(),
            rules: RwLock::new(rules),
            failure: RwLock::new(None),
            fetch_count: AtomicU64::new(0),
        }
    }

    /// Set the store name used in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the whole rule set
    pub fn set_rules(&self, rules: Vec<Rule>) {
        *self.rules.write() = rules;
    }

    /// Append a rule at the lowest priority
    pub fn push_rule(&self, rule: Rule) {
        self.rules.write().push(rule);
    }

    /// Make subsequent fetches fail (`Some`) or succeed again (`None`)
    pub fn fail_with(&self, failure: Option<StoreError>) {
        *self.failure.write() = failure;
    }

    /// Number of fetches served, including failed ones
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, StoreError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = self.failure.read().clone() {
            return Err(failure);
        }

        Ok(self.rules.read().clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
