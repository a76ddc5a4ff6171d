//! Compiled rule indices
//!
//! A [`RuleSnapshot`] is an immutable, fully-built projection of one rule
//! set. The engine swaps whole snapshots, so the three tiers a lookup sees
//! always come from the same load.

use aho_corasick::AhoCorasick;
use chrono::{DateTime, Utc};
use errlens_core::{DetectionResult, MatchType, Rule};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::safety::SafetyScreen;

/// Counts produced by compiling one rule set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// Containment rules installed
    pub contains: usize,
    /// Distinct exact keys installed
    pub exact: usize,
    /// Regex rules installed
    pub regex: usize,
    /// Regex rules rejected by the safety screen
    pub rejected_unsafe: usize,
    /// Rules skipped as malformed (empty pattern, unknown type, bad regex)
    pub invalid: usize,
    /// Wall time of the fetch and compile, in milliseconds
    pub duration_ms: u64,
}

impl ReloadReport {
    /// Rules installed across all tiers
    pub fn total(&self) -> usize {
        self.contains + self.exact + self.regex
    }
}

#[derive(Debug)]
struct ContainsEntry {
    text: String,
    category: String,
    description: Option<String>,
}

#[derive(Debug)]
struct ExactEntry {
    category: String,
    description: Option<String>,
}

#[derive(Debug)]
struct RegexEntry {
    regex: Regex,
    category: String,
    description: Option<String>,
}

/// Immutable containment/exact/regex indices
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    contains: Vec<ContainsEntry>,
    contains_matcher: Option<AhoCorasick>,
    exact: HashMap<String, ExactEntry>,
    regexes: Vec<RegexEntry>,
    report: ReloadReport,
    loaded_at: Option<DateTime<Utc>>,
}

impl RuleSnapshot {
    /// Snapshot that matches nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a rule set
    ///
    /// Individual bad rules are skipped and counted; building never fails.
    pub fn build(rules: Vec<Rule>, screen: &SafetyScreen, config: &DetectorConfig) -> Self {
        let mut snapshot = Self::default();

        for rule in rules {
            if rule.pattern.is_empty() {
                warn!("Skipping rule with empty pattern (category '{}')", rule.category);
                snapshot.report.invalid += 1;
                continue;
            }

            match &rule.match_type {
                MatchType::Contains => snapshot.contains.push(ContainsEntry {
                    text: rule.pattern.to_lowercase(),
                    category: rule.category,
                    description: rule.description,
                }),
                MatchType::Exact => {
                    if config.warn_on_padded_exact && rule.pattern.trim() != rule.pattern {
                        // Lookups trim the message but keys are stored as-is
                        warn!(
                            "Exact rule '{}' has surrounding whitespace and can never match",
                            rule.pattern
                        );
                    }
                    snapshot.exact.insert(
                        rule.pattern.to_lowercase(),
                        ExactEntry {
                            category: rule.category,
                            description: rule.description,
                        },
                    );
                }
                MatchType::Regex => snapshot.add_regex(rule, screen, config),
                MatchType::Other(kind) => {
                    warn!("Skipping rule '{}' with unknown match type '{}'", rule.pattern, kind);
                    snapshot.report.invalid += 1;
                }
            }
        }

        snapshot.contains_matcher = build_contains_matcher(&snapshot.contains);
        snapshot.report.contains = snapshot.contains.len();
        snapshot.report.exact = snapshot.exact.len();
        snapshot.report.regex = snapshot.regexes.len();
        snapshot
    }

    fn add_regex(&mut self, rule: Rule, screen: &SafetyScreen, config: &DetectorConfig) {
        if let Err(reason) = screen.check(&rule.pattern) {
            warn!(
                "Rejected potentially unsafe regex '{}' (category '{}'): {}",
                rule.pattern, rule.category, reason
            );
            metrics::counter!("errlens_rules_rejected_total", "reason" => reason.reason())
                .increment(1);
            self.report.rejected_unsafe += 1;
            return;
        }

        match RegexBuilder::new(&rule.pattern)
            .case_insensitive(true)
            .size_limit(config.regex_size_limit)
            .build()
        {
            Ok(regex) => self.regexes.push(RegexEntry {
                regex,
                category: rule.category,
                description: rule.description,
            }),
            Err(e) => {
                warn!("Skipping invalid regex '{}': {}", rule.pattern, e);
                metrics::counter!("errlens_rules_rejected_total", "reason" => "invalid_regex")
                    .increment(1);
                self.report.invalid += 1;
            }
        }
    }

    /// Stamp the snapshot with its load time and duration
    pub(crate) fn finish(mut self, loaded_at: DateTime<Utc>, duration_ms: u64) -> Self {
        self.loaded_at = Some(loaded_at);
        self.report.duration_ms = duration_ms;
        self
    }

    /// Classify a message against the three tiers in order
    ///
    /// Containment is checked first, then exact, then regex; within a tier
    /// the earliest-loaded matching rule wins.
    pub fn detect(&self, message: &str) -> DetectionResult {
        if message.is_empty() {
            return DetectionResult::not_matched();
        }

        let lowered = message.to_lowercase();

        if let Some(entry) = self.first_contains(&lowered) {
            return DetectionResult::matched(
                &entry.category,
                &entry.text,
                MatchType::Contains,
                entry.description.clone(),
            );
        }

        if let Some((key, entry)) = self.exact.get_key_value(lowered.trim()) {
            return DetectionResult::matched(
                &entry.category,
                key,
                MatchType::Exact,
                entry.description.clone(),
            );
        }

        for entry in &self.regexes {
            if entry.regex.is_match(message) {
                return DetectionResult::matched(
                    &entry.category,
                    entry.regex.as_str(),
                    MatchType::Regex,
                    entry.description.clone(),
                );
            }
        }

        DetectionResult::not_matched()
    }

    /// Lowest load index among all containment rules present in `lowered`
    fn first_contains(&self, lowered: &str) -> Option<&ContainsEntry> {
        let index = match &self.contains_matcher {
            Some(matcher) => matcher
                .find_overlapping_iter(lowered)
                .map(|m| m.pattern().as_usize())
                .min()?,
            None => self
                .contains
                .iter()
                .position(|entry| lowered.contains(entry.text.as_str()))?,
        };
        self.contains.get(index)
    }

    /// Number of containment rules
    pub fn contains_count(&self) -> usize {
        self.contains.len()
    }

    /// Number of distinct exact keys
    pub fn exact_count(&self) -> usize {
        self.exact.len()
    }

    /// Number of compiled regex rules
    pub fn regex_count(&self) -> usize {
        self.regexes.len()
    }

    /// Rules installed across all tiers
    pub fn total_count(&self) -> usize {
        self.contains_count() + self.exact_count() + self.regex_count()
    }

    /// True iff all three tiers are empty
    pub fn is_empty(&self) -> bool {
        self.contains.is_empty() && self.exact.is_empty() && self.regexes.is_empty()
    }

    /// Report of the load that produced this snapshot
    pub fn report(&self) -> &ReloadReport {
        &self.report
    }

    /// When this snapshot was installed, `None` for the initial empty one
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    /// Source text of the installed regex rules, in evaluation order
    pub fn regex_patterns(&self) -> impl Iterator<Item = &str> {
        self.regexes.iter().map(|entry| entry.regex.as_str())
    }
}

/// Build the containment automaton, falling back to a linear scan on failure
fn build_contains_matcher(entries: &[ContainsEntry]) -> Option<AhoCorasick> {
    if entries.is_empty() {
        return None;
    }

    match AhoCorasick::new(entries.iter().map(|entry| entry.text.as_str())) {
        Ok(matcher) => Some(matcher),
        Err(e) => {
            debug!("Containment automaton unavailable, using linear scan: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(rules: Vec<Rule>) -> RuleSnapshot {
        RuleSnapshot::build(rules, &SafetyScreen::default(), &DetectorConfig::default())
    }

    #[test]
    fn test_empty_snapshot_matches_nothing() {
        let snapshot = RuleSnapshot::empty();
        assert!(snapshot.is_empty());
        assert!(!snapshot.detect("anything at all").matched);
        assert!(snapshot.loaded_at().is_none());
    }

    #[test]
    fn test_contains_beats_regex() {
        let snapshot = build(vec![
            Rule::regex(r"connection \w+", "regex-category"),
            Rule::contains("connection", "contains-category"),
        ]);

        let result = snapshot.detect("connection refused by peer");
        assert_eq!(result.match_type, Some(MatchType::Contains));
        assert_eq!(result.category.as_deref(), Some("contains-category"));
    }

    #[test]
    fn test_exact_beats_regex() {
        let snapshot = build(vec![
            Rule::regex("disk", "regex-category"),
            Rule::exact("disk full", "exact-category"),
        ]);

        let result = snapshot.detect("Disk Full");
        assert_eq!(result.match_type, Some(MatchType::Exact));
        assert_eq!(result.pattern.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_first_loaded_containment_wins() {
        let snapshot = build(vec![
            Rule::contains("error", "first"),
            Rule::contains("error: timeout", "second"),
        ]);

        let result = snapshot.detect("fatal error: timeout while reading");
        assert_eq!(result.pattern.as_deref(), Some("error"));
        assert_eq!(result.category.as_deref(), Some("first"));
    }

    #[test]
    fn test_load_order_not_text_position_decides() {
        // "timeout" appears later in the message but was loaded first
        let snapshot = build(vec![
            Rule::contains("timeout", "timeouts"),
            Rule::contains("socket", "sockets"),
        ]);

        let result = snapshot.detect("socket read timeout");
        assert_eq!(result.category.as_deref(), Some("timeouts"));
    }

    #[test]
    fn test_case_insensitive_containment() {
        let snapshot = build(vec![Rule::contains("Timeout", "network")]);

        let result = snapshot.detect("Connection TIMEOUT occurred");
        assert!(result.matched);
        assert_eq!(result.pattern.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_exact_match_trims_and_ignores_case() {
        let snapshot = build(vec![Rule::exact("out of memory", "resources")]);

        assert!(snapshot.detect("  Out Of Memory  ").matched);
        assert!(!snapshot.detect("out of memory error").matched);
    }

    #[test]
    fn test_padded_exact_key_is_unreachable() {
        let snapshot = build(vec![Rule::exact(" out of memory ", "resources")]);

        assert_eq!(snapshot.exact_count(), 1);
        assert!(!snapshot.detect(" out of memory ").matched);
    }

    #[test]
    fn test_duplicate_exact_key_last_wins() {
        let snapshot = build(vec![
            Rule::exact("Disk Full", "first"),
            Rule::exact("disk full", "second"),
        ]);

        assert_eq!(snapshot.exact_count(), 1);
        assert_eq!(snapshot.detect("disk full").category.as_deref(), Some("second"));
    }

    #[test]
    fn test_regex_is_case_insensitive_and_reports_source() {
        let snapshot = build(vec![Rule::regex(r"deadlock detected on \w+", "database")
            .with_description("Lock ordering problem")]);

        let result = snapshot.detect("DEADLOCK DETECTED ON relation_42");
        assert_eq!(result.match_type, Some(MatchType::Regex));
        assert_eq!(result.pattern.as_deref(), Some(r"deadlock detected on \w+"));
        assert_eq!(result.description.as_deref(), Some("Lock ordering problem"));
    }

    #[test]
    fn test_unsafe_and_invalid_rules_are_skipped() {
        let snapshot = build(vec![
            Rule::regex(r"(a+)+$", "redos"),
            Rule::regex(r"unclosed (group", "broken"),
            Rule::new("x", "unknown", MatchType::Other("glob".into())),
            Rule::contains("", "empty"),
            Rule::regex(r"panic: .*", "panics"),
        ]);

        let report = snapshot.report();
        assert_eq!(report.rejected_unsafe, 1);
        assert_eq!(report.invalid, 3);
        assert_eq!(report.regex, 1);
        assert_eq!(snapshot.regex_patterns().collect::<Vec<_>>(), vec![r"panic: .*"]);

        let input = format!("{}!", "a".repeat(64));
        assert!(!snapshot.detect(&input).matched);
    }

    #[test]
    fn test_counts() {
        let snapshot = build(vec![
            Rule::contains("a", "c"),
            Rule::contains("b", "c"),
            Rule::exact("c", "c"),
            Rule::regex("d+", "c"),
        ]);

        assert_eq!(snapshot.contains_count(), 2);
        assert_eq!(snapshot.exact_count(), 1);
        assert_eq!(snapshot.regex_count(), 1);
        assert_eq!(snapshot.total_count(), 4);
        assert_eq!(snapshot.report().total(), 4);
        assert!(!snapshot.is_empty());
    }
}
