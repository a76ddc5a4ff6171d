//! Server configuration

use errlens_detector::DetectorConfig;
use errlens_store::PgStoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Where rules are loaded from
    #[serde(default)]
    pub store: StoreConfig,

    /// Rule compilation settings
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Load rules during startup instead of on the first lookup
    #[serde(default)]
    pub warm_start: bool,
}

impl ServerConfig {
    /// Load configuration from file and CLI overrides
    pub fn load(config_path: &str, cli: &crate::Cli) -> anyhow::Result<Self> {
        // A missing file means defaults
        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            Self::from_yaml(&content)?
        } else {
            Self::default()
        };

        if let Some(listen) = &cli.listen {
            config.listen = listen.clone();
        }

        if let Some(port) = cli.port {
            config.port = port;
        }

        // A database URL wins over a rule file
        if let Some(url) = &cli.database_url {
            config.store = match config.store {
                StoreConfig::Postgres(mut pg) => {
                    pg.url = url.clone();
                    StoreConfig::Postgres(pg)
                }
                StoreConfig::Yaml { .. } => StoreConfig::Postgres(PgStoreConfig::new(url.clone())),
            };
        } else if let Some(rules) = &cli.rules {
            config.store = StoreConfig::Yaml { path: rules.clone() };
        }

        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Socket address string to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            store: StoreConfig::default(),
            detector: DetectorConfig::default(),
            warm_start: false,
        }
    }
}

/// Rule store selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Rules read from a YAML file on every reload
    Yaml {
        #[serde(default = "default_rules_path")]
        path: PathBuf,
    },
    /// Rules read from a PostgreSQL table
    Postgres(PgStoreConfig),
}

impl StoreConfig {
    /// Human-readable description for startup logs
    pub fn describe(&self) -> String {
        match self {
            StoreConfig::Yaml { path } => format!("yaml file {}", path.display()),
            StoreConfig::Postgres(pg) => format!("postgres table {}", pg.table),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Yaml {
            path: default_rules_path(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("./rules/error_patterns.yaml")
}
