//! Durable, append-only log of pending local mutations ("dirty rows").
//!
//! Entries live in the same database as the data tables and are appended in
//! the same transaction as the row write they describe. They are never
//! rewritten: the sync driver reads them with [`ChangeOutbox::get_all`],
//! transmits them, and acknowledges with [`ChangeOutbox::remove`]. Delivery is
//! at-least-once, so receivers should deduplicate on `(row_id, hlc)`.

use crate::db::SharedConnection;
use crate::error::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tidemark_core::{Row, Timestamp};
use tokio::sync::broadcast;

/// Table holding outbox entries.
pub const OUTBOX_TABLE: &str = "sync_outbox";

/// One pending local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyRow {
    /// Position in the outbox; FIFO order and acknowledgment key
    pub sequence: i64,
    /// Table the mutation touched
    pub table_name: String,
    /// `system_id` of the mutated row
    pub row_id: String,
    /// HLC of the mutation
    pub hlc: Timestamp,
    /// Row was local-origin at mutation time, so the whole row may be sent
    pub is_full_row: bool,
    /// Caller-supplied values; `None` for a delete tombstone
    pub payload: Option<Row>,
}

impl DirtyRow {
    /// Whether this entry records a delete.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

/// Append one entry using the caller's connection or transaction.
pub(crate) fn append(
    conn: &Connection,
    table: &str,
    row_id: &str,
    hlc: &Timestamp,
    is_local_origin: bool,
    payload: Option<&Row>,
) -> Result<DirtyRow> {
    let encoded = payload.map(serde_json::to_string).transpose()?;

    conn.execute(
        &format!(
            r"
            INSERT INTO {OUTBOX_TABLE} (table_name, row_id, hlc, is_full_row, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "
        ),
        (table, row_id, hlc.encode(), is_local_origin, encoded.as_deref()),
    )?;

    Ok(DirtyRow {
        sequence: conn.last_insert_rowid(),
        table_name: table.to_string(),
        row_id: row_id.to_string(),
        hlc: hlc.clone(),
        is_full_row: is_local_origin,
        payload: payload.cloned(),
    })
}

type RawEntry = (i64, String, String, String, bool, Option<String>);

fn read_entries(conn: &Connection, table: Option<&str>) -> Result<Vec<DirtyRow>> {
    let mut stmt = conn.prepare(&format!(
        r"
        SELECT sequence, table_name, row_id, hlc, is_full_row, payload
        FROM {OUTBOX_TABLE}
        WHERE ?1 IS NULL OR table_name = ?1
        ORDER BY sequence ASC
        "
    ))?;

    let raw = stmt
        .query_map([table], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<RawEntry>>>()?;

    raw.into_iter()
        .map(|(sequence, table_name, row_id, hlc, is_full_row, payload)| {
            Ok(DirtyRow {
                sequence,
                table_name,
                row_id,
                hlc: Timestamp::parse(&hlc)?,
                is_full_row,
                payload: payload.as_deref().map(serde_json::from_str).transpose()?,
            })
        })
        .collect()
}

/// Handle to the change outbox.
#[derive(Clone)]
pub struct ChangeOutbox {
    conn: SharedConnection,
    events: broadcast::Sender<DirtyRow>,
}

impl std::fmt::Debug for ChangeOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeOutbox")
            .field("subscribers", &self.events.receiver_count())
            .finish_non_exhaustive()
    }
}

impl ChangeOutbox {
    pub(crate) fn new(conn: SharedConnection, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { conn, events }
    }

    /// Durably append one entry. Every call produces a new entry; nothing is
    /// coalesced.
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be encoded or the write fails.
    pub async fn add(
        &self,
        table: &str,
        row_id: &str,
        hlc: &Timestamp,
        is_local_origin: bool,
        payload: Option<Row>,
    ) -> Result<DirtyRow> {
        let entry = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let entry = append(&tx, table, row_id, hlc, is_local_origin, payload.as_ref())?;
            tx.commit()?;
            entry
        };

        self.notify(vec![entry.clone()]);
        Ok(entry)
    }

    /// All pending entries in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns error if the read fails or a stored entry is corrupt.
    pub async fn get_all(&self) -> Result<Vec<DirtyRow>> {
        let conn = self.conn.lock().await;
        read_entries(&conn, None)
    }

    /// Pending entries for one table in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns error if the read fails or a stored entry is corrupt.
    pub async fn get_for_table(&self, table: &str) -> Result<Vec<DirtyRow>> {
        let conn = self.conn.lock().await;
        read_entries(&conn, Some(table))
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns error if the count query fails.
    pub async fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {OUTBOX_TABLE}"),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Whether nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns error if the count query fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Acknowledge entries after confirmed transmission.
    ///
    /// Entries that are already gone are ignored. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn remove(&self, entries: &[DirtyRow]) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt =
                tx.prepare(&format!("DELETE FROM {OUTBOX_TABLE} WHERE sequence = ?1"))?;
            for entry in entries {
                removed += stmt.execute([entry.sequence])?;
            }
        }
        tx.commit()?;

        tracing::debug!(requested = entries.len(), removed, "Outbox entries acknowledged");
        Ok(removed)
    }

    /// Subscribe to entries as they are committed.
    ///
    /// Slow receivers may observe [`broadcast::error::RecvError::Lagged`]; the
    /// outbox itself is the source of truth, so a lagged driver should re-read
    /// it with [`get_all`](Self::get_all).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DirtyRow> {
        self.events.subscribe()
    }

    /// Publish committed entries to subscribers.
    pub(crate) fn notify(&self, entries: Vec<DirtyRow>) {
        for entry in entries {
            // No subscribers is fine: entries are durable and can be polled.
            let _ = self.events.send(entry);
        }
    }
}
