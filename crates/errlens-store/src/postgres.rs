//! PostgreSQL rule store and change listener
//!
//! Rules live in a table (default `error_patterns`) with at least the
//! columns `id`, `pattern`, `category`, `match_type`, `description` and
//! `is_active`. Writers signal changes with
//! `NOTIFY error_patterns_updated`, which [`PgRuleListener`] turns into
//! [`RuleEvent::RuleSetUpdated`] on the bus.

use async_trait::async_trait;
use errlens_core::{Error, MatchType, Result, Rule, RuleEvent, RuleEventBus, RuleStore, StoreError};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// SQLSTATE for `undefined_table`
const UNDEFINED_TABLE: &str = "42P01";

/// PostgreSQL store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgStoreConfig {
    /// Connection URL
    pub url: String,

    /// Rule table, optionally schema-qualified
    #[serde(default = "default_table")]
    pub table: String,

    /// Channel carrying rule-change notifications
    #[serde(default = "default_notify_channel")]
    pub notify_channel: String,

    /// Pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl PgStoreConfig {
    /// Settings for the given URL with defaults for everything else
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: default_table(),
            notify_channel: default_notify_channel(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_table() -> String {
    "error_patterns".to_string()
}

fn default_notify_channel() -> String {
    "error_patterns_updated".to_string()
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    pattern: String,
    category: String,
    match_type: String,
    description: Option<String>,
}

impl From<RuleRow> for Rule {
    fn from(row: RuleRow) -> Self {
        Rule {
            pattern: row.pattern,
            category: row.category,
            match_type: MatchType::from(row.match_type),
            description: row.description,
        }
    }
}

/// Rule store reading active rows from a PostgreSQL table
pub struct PgRuleStore {
    name: String,
    pool: PgPool,
    query: String,
}

impl PgRuleStore {
    /// Build a store over a lazily-connected pool
    ///
    /// No connection is attempted here, so a database that is down at
    /// startup only degrades detection instead of failing construction.
    pub fn connect_lazy(config: &PgStoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_lazy(&config.url)
            .map_err(|e| Error::config(format!("invalid database url: {}", e)))?;

        Self::with_pool(pool, &config.table)
    }

    /// Build a store over an existing pool
    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self> {
        validate_identifier(table)?;

        Ok(Self {
            name: format!("postgres:{}", table),
            pool,
            query: format!(
                "SELECT pattern, category, match_type, description FROM {} \
                 WHERE is_active = true ORDER BY id",
                table
            ),
        })
    }

    /// Underlying pool, shared with the listener
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn fetch_rules(&self) -> std::result::Result<Vec<Rule>, StoreError> {
        let rows = sqlx::query_as::<_, RuleRow>(&self.query)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        debug!("Fetched {} rules from {}", rows.len(), self.name);
        Ok(rows.into_iter().map(Rule::from).collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Map a driver error onto the store error classes
pub fn classify_sqlx_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNDEFINED_TABLE) {
            return StoreError::MissingRelation(db_err.message().to_string());
        }
    }
    StoreError::from_message(err.to_string())
}

/// Accepts `name` or `schema.name` made of ASCII letters, digits and `_`
fn validate_identifier(identifier: &str) -> Result<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = identifier.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(Error::config(format!("invalid SQL identifier '{}'", identifier)))
    }
}

/// Forwards PostgreSQL `NOTIFY` messages to the rule event bus
pub struct PgRuleListener {
    handle: JoinHandle<()>,
}

impl PgRuleListener {
    /// Start listening on `channel` in a background task
    pub fn spawn(pool: PgPool, channel: impl Into<String>, bus: RuleEventBus) -> Result<Self> {
        let channel = channel.into();
        validate_identifier(&channel)?;

        let handle = tokio::spawn(async move {
            run_listener(pool, channel, bus).await;
        });

        Ok(Self { handle })
    }

    /// Stop forwarding notifications
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn run_listener(pool: PgPool, channel: String, bus: RuleEventBus) {
    let mut backoff = Duration::from_secs(1);

    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Rule listener could not connect: {}, retrying in {:?}", e, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(60));
                continue;
            }
        };

        if let Err(e) = listener.listen(&channel).await {
            error!("Failed to LISTEN on '{}': {}", channel, e);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
            continue;
        }

        info!("Listening for rule changes on channel '{}'", channel);
        backoff = Duration::from_secs(1);

        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => {
                    debug!("Rule change notification: {}", notification.payload());
                    bus.publish(RuleEvent::RuleSetUpdated);
                }
                Ok(None) => {
                    // Notifications sent while disconnected are lost
                    warn!("Rule listener connection lost, reconnecting");
                    bus.publish(RuleEvent::RuleSetUpdated);
                }
                Err(e) => {
                    error!("Rule listener failed: {}", e);
                    break;
                }
            }
        }

        tokio::time::sleep(backoff).await;
    }
}
