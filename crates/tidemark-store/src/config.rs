//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;
use tidemark_core::NodeId;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database path; `None` keeps everything in memory (for testing)
    pub db_path: Option<PathBuf>,

    /// Node identifier used the first time a database is initialized.
    /// Ignored once a node id has been persisted.
    pub node_id: Option<NodeId>,

    /// How long a write waits on a locked database before failing
    pub busy_timeout: Duration,

    /// Buffer size of the outbox notification channel
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            node_id: None,
            busy_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Configuration for a file-backed database.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Configuration for an in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Set the node id to persist on first open.
    #[must_use]
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}
