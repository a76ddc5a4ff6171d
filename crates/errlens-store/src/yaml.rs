//! YAML file rule store

use async_trait::async_trait;
use errlens_core::{Rule, RuleStore, StoreError};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// On-disk layout of a rule file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    /// Rules in priority order
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleFile {
    /// Parse a rule file from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// Rule store reading a YAML file on every fetch
///
/// A missing file is the file-backed equivalent of an unmigrated table and
/// is reported as [`StoreError::MissingRelation`].
pub struct YamlRuleStore {
    name: String,
    path: PathBuf,
}

impl YamlRuleStore {
    /// Create a store for the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("yaml:{}", path.display()),
            path,
        }
    }

    /// Path of the rule file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleStore for YamlRuleStore {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::MissingRelation(format!(
                    "rule file {} not found",
                    self.path.display()
                )));
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let file = RuleFile::from_yaml(&content).map_err(|e| {
            StoreError::Unavailable(format!("failed to parse {}: {}", self.path.display(), e))
        })?;

        Ok(file.rules)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
