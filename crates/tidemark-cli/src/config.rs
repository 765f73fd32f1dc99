//! CLI configuration.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tidemark_core::{NodeId, Schema};
use tidemark_store::StoreConfig;

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Database path
    pub db_path: PathBuf,

    /// Node id to persist when the database is first created
    pub node_id: Option<NodeId>,

    /// JSON schema document describing the sync tables
    pub schema_path: Option<PathBuf>,

    /// SQLite busy timeout
    pub busy_timeout: Duration,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./tidemark.db"),
            node_id: None,
            schema_path: None,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TIDEMARK_DB_PATH`: SQLite database path
    /// - `TIDEMARK_NODE_ID`: Node id for a fresh database
    /// - `TIDEMARK_SCHEMA`: Path to a JSON schema document
    /// - `TIDEMARK_BUSY_TIMEOUT_MS`: SQLite busy timeout in milliseconds
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(db_path) = std::env::var("TIDEMARK_DB_PATH") {
            config.db_path = PathBuf::from(db_path);
        }

        if let Ok(id) = std::env::var("TIDEMARK_NODE_ID") {
            config.node_id = Some(NodeId::new(id).context("Invalid TIDEMARK_NODE_ID")?);
        }

        if let Ok(path) = std::env::var("TIDEMARK_SCHEMA") {
            config.schema_path = Some(PathBuf::from(path));
        }

        if let Ok(ms) = std::env::var("TIDEMARK_BUSY_TIMEOUT_MS") {
            let ms: u64 = ms.parse().context("Invalid TIDEMARK_BUSY_TIMEOUT_MS")?;
            config.busy_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Store configuration for the configured database.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        let mut store = StoreConfig::file(&self.db_path);
        store.node_id.clone_from(&self.node_id);
        store.busy_timeout = self.busy_timeout;
        store
    }

    /// Read the schema document, or an empty schema if none is configured.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not a valid schema.
    pub async fn load_schema(&self) -> Result<Schema> {
        let Some(path) = &self.schema_path else {
            return Ok(Schema::new());
        };

        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read schema {}", path.display()))?;
        Schema::from_json(&json).with_context(|| format!("Invalid schema {}", path.display()))
    }
}
