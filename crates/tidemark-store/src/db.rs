//! `SQLite`-backed sync store: connection setup, engine tables, node identity.

use crate::config::StoreConfig;
use crate::error::Result;
use crate::outbox::{ChangeOutbox, OUTBOX_TABLE};
use crate::pipeline::MutationPipeline;
use crate::predicate::quote_ident;
use crate::reconcile::ReconciliationEngine;
use rusqlite::{Connection, OptionalExtension};
use std::sync::Arc;
use tidemark_core::schema::{
    SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_VERSION,
};
use tidemark_core::{
    shadow_column, CausalClock, NodeId, Schema, TableSchema, TimeSource, Timestamp,
};
use tokio::sync::Mutex;

/// Single writer connection shared by the store's components.
pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

const META_TABLE: &str = "sync_meta";
const NODE_ID_KEY: &str = "node_id";
const LAST_ISSUED_KEY: &str = "last_issued_hlc";

/// Handle to a sync-enabled database.
///
/// Owns the connection, the schema, and the node's [`CausalClock`], and hands
/// out the outbox, mutation pipeline, and reconciliation engine that share them.
pub struct SyncStore {
    pub(crate) conn: SharedConnection,
    schema: Arc<Schema>,
    clock: Arc<CausalClock>,
    outbox: ChangeOutbox,
}

impl SyncStore {
    /// Open or create a database and its sync tables.
    ///
    /// # Errors
    ///
    /// Returns error if the schema is invalid or the database cannot be
    /// opened or initialized.
    pub fn open(config: &StoreConfig, schema: Schema) -> Result<Self> {
        Self::open_inner(config, schema, None)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if the schema is invalid or initialization fails.
    pub fn in_memory(schema: Schema) -> Result<Self> {
        Self::open_inner(&StoreConfig::in_memory(), schema, None)
    }

    /// Open a database whose clock reads a custom wall-clock source.
    ///
    /// # Errors
    ///
    /// Returns error if the schema is invalid or initialization fails.
    pub fn open_with_time_source(
        config: &StoreConfig,
        schema: Schema,
        time_source: TimeSource,
    ) -> Result<Self> {
        Self::open_inner(config, schema, Some(time_source))
    }

    fn open_inner(
        config: &StoreConfig,
        schema: Schema,
        time_source: Option<TimeSource>,
    ) -> Result<Self> {
        schema.validate()?;

        let conn = match &config.db_path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(config.busy_timeout)?;
        init_schema(&conn, &schema)?;

        let node_id = load_node_id(&conn, config.node_id.as_ref())?;
        let clock = match time_source {
            Some(source) => CausalClock::with_time_source(node_id, source),
            None => CausalClock::new(node_id),
        };
        seed_clock(&conn, &schema, &clock)?;

        tracing::info!(
            node_id = %clock.node_id(),
            tables = schema.tables.len(),
            path = ?config.db_path,
            "Sync store opened"
        );

        let conn = Arc::new(Mutex::new(conn));
        let outbox = ChangeOutbox::new(Arc::clone(&conn), config.event_capacity);

        Ok(Self {
            conn,
            schema: Arc::new(schema),
            clock: Arc::new(clock),
            outbox,
        })
    }

    /// The change outbox.
    #[must_use]
    pub fn outbox(&self) -> &ChangeOutbox {
        &self.outbox
    }

    /// A mutation pipeline bound to this store.
    #[must_use]
    pub fn pipeline(&self) -> MutationPipeline {
        MutationPipeline::new(
            Arc::clone(&self.conn),
            Arc::clone(&self.schema),
            Arc::clone(&self.clock),
            self.outbox.clone(),
        )
    }

    /// A reconciliation engine bound to this store.
    #[must_use]
    pub fn reconciler(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(
            Arc::clone(&self.conn),
            Arc::clone(&self.schema),
            Arc::clone(&self.clock),
        )
    }

    /// The node's causal clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<CausalClock> {
        &self.clock
    }

    /// The node id persisted for this database.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        self.clock.node_id()
    }

    /// Draw a timestamp from the clock and record it in the database.
    ///
    /// Unlike [`CausalClock::now`], the issued value survives a restart: a
    /// reopened store only issues later timestamps.
    ///
    /// # Errors
    ///
    /// Returns error if the timestamp cannot be recorded.
    pub async fn issue_timestamp(&self) -> Result<Timestamp> {
        let conn = self.conn.lock().await;
        let hlc = self.clock.now();
        conn.execute(
            &format!(
                "INSERT INTO {META_TABLE} (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            (LAST_ISSUED_KEY, hlc.encode()),
        )?;
        Ok(hlc)
    }

    /// Registered sync tables.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// Initialize engine tables and every registered sync table.
fn init_schema(conn: &Connection, schema: &Schema) -> Result<()> {
    conn.execute_batch(&format!(
        r"
        PRAGMA foreign_keys = ON;

        -- Engine metadata (node identity)
        CREATE TABLE IF NOT EXISTS {META_TABLE} (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Pending local mutations, drained by the sync driver
        CREATE TABLE IF NOT EXISTS {OUTBOX_TABLE} (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            row_id TEXT NOT NULL,
            hlc TEXT NOT NULL,
            is_full_row INTEGER NOT NULL,
            payload TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_{OUTBOX_TABLE}_table ON {OUTBOX_TABLE}(table_name);
        "
    ))?;

    for table in &schema.tables {
        conn.execute_batch(&create_table_sql(table))?;
    }

    Ok(())
}

/// `CREATE TABLE IF NOT EXISTS` for a sync table, including engine columns.
pub(crate) fn create_table_sql(table: &TableSchema) -> String {
    let mut columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let null = if c.is_not_null { " NOT NULL" } else { "" };
            format!("{} {}{null}", quote_ident(&c.name), c.logical_type.sql_type())
        })
        .collect();

    columns.extend(
        table
            .lww_columns()
            .map(|c| format!("{} TEXT", quote_ident(&shadow_column(&c.name)))),
    );

    let keyed_by_system_id = table.primary_key.len() == 1 && table.primary_key[0] == SYSTEM_ID;
    columns.push(if keyed_by_system_id {
        format!("{} TEXT NOT NULL PRIMARY KEY", quote_ident(SYSTEM_ID))
    } else {
        format!("{} TEXT NOT NULL UNIQUE", quote_ident(SYSTEM_ID))
    });
    columns.push(format!("{} TEXT NOT NULL", quote_ident(SYSTEM_VERSION)));
    columns.push(format!("{} TEXT NOT NULL", quote_ident(SYSTEM_CREATED_AT)));
    columns.push(format!(
        "{} INTEGER NOT NULL DEFAULT 1",
        quote_ident(SYSTEM_IS_LOCAL_ORIGIN)
    ));

    if !keyed_by_system_id {
        let key = table
            .primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        columns.push(format!("PRIMARY KEY ({key})"));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
        quote_ident(&table.name),
        columns.join(",\n    ")
    )
}

/// Load the persisted node id, persisting `preferred` (or a fresh one) on first use.
fn load_node_id(conn: &Connection, preferred: Option<&NodeId>) -> Result<NodeId> {
    let stored: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {META_TABLE} WHERE key = ?1"),
            [NODE_ID_KEY],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(stored) = stored {
        let node_id = NodeId::new(stored)?;
        if let Some(preferred) = preferred.filter(|p| **p != node_id) {
            tracing::warn!(
                persisted = %node_id,
                configured = %preferred,
                "Ignoring configured node id; database already has one"
            );
        }
        return Ok(node_id);
    }

    let node_id = preferred.cloned().unwrap_or_else(NodeId::generate);
    conn.execute(
        &format!("INSERT INTO {META_TABLE} (key, value) VALUES (?1, ?2)"),
        (NODE_ID_KEY, node_id.as_str()),
    )?;
    tracing::info!(%node_id, "Persisted new node id");
    Ok(node_id)
}

/// Advance the clock past every HLC already on disk, so timestamps stay
/// monotonic across restarts even if the wall clock moved backwards.
///
/// Covers the outbox, the last issued timestamp, and every HLC-valued column
/// of each sync table: remote rows keep their shadows verbatim, so a shadow
/// may be newer than anything this node stamped itself.
fn seed_clock(conn: &Connection, schema: &Schema, clock: &CausalClock) -> Result<()> {
    let mut queries = vec![
        format!("SELECT MAX(hlc) FROM {OUTBOX_TABLE}"),
        format!("SELECT MAX(value) FROM {META_TABLE} WHERE key = '{LAST_ISSUED_KEY}'"),
    ];
    for table in &schema.tables {
        let columns = [SYSTEM_VERSION.to_string(), SYSTEM_CREATED_AT.to_string()]
            .into_iter()
            .chain(table.lww_columns().map(|c| shadow_column(&c.name)));
        queries.extend(columns.map(|column| {
            format!(
                "SELECT MAX({}) FROM {}",
                quote_ident(&column),
                quote_ident(&table.name)
            )
        }));
    }

    for sql in queries {
        let max: Option<String> = conn.query_row(&sql, [], |row| row.get(0))?;
        if let Some(max) = max {
            clock.merge(&Timestamp::parse(&max)?);
        }
    }

    Ok(())
}
