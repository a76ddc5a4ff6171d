//! Detector configuration

use serde::{Deserialize, Serialize};

use crate::safety::{SafetyScreen, DEFAULT_MAX_REPETITIONS};

/// Tunables for rule compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Maximum repetition operators a regex rule may use
    #[serde(default = "default_max_repetitions")]
    pub max_repetitions: usize,

    /// Compiled program size limit per regex, in bytes
    #[serde(default = "default_regex_size_limit")]
    pub regex_size_limit: usize,

    /// Log exact rules whose pattern carries surrounding whitespace
    #[serde(default = "default_true")]
    pub warn_on_padded_exact: bool,
}

impl DetectorConfig {
    /// Build the safety screen for these settings
    pub fn safety_screen(&self) -> SafetyScreen {
        SafetyScreen::new(self.max_repetitions)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_repetitions: default_max_repetitions(),
            regex_size_limit: default_regex_size_limit(),
            warn_on_padded_exact: default_true(),
        }
    }
}

fn default_max_repetitions() -> usize {
    DEFAULT_MAX_REPETITIONS
}

fn default_regex_size_limit() -> usize {
    1024 * 1024 // 1MB
}

fn default_true() -> bool {
    true
}
