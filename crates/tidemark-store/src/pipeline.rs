//! Local mutation pipeline.
//!
//! Every write stamps a fresh HLC, maintains the engine columns
//! (`system_version`, `system_created_at`, `system_is_local_origin`, shadow
//! HLCs) and appends to the outbox in the same transaction as the row write.

use crate::db::SharedConnection;
use crate::error::{Error, Result};
use crate::executor::{is_local_origin, system_id_of, StorageExecutor};
use crate::outbox::{self, ChangeOutbox};
use crate::predicate::Predicate;
use std::sync::Arc;
use tidemark_core::schema::{SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_VERSION};
use tidemark_core::{
    plan_local_update, shadow_column, CausalClock, LogicalType, Row, Schema, SchemaError,
    TableSchema, Value,
};
use uuid::Uuid;

/// Applies local inserts, updates and deletes.
#[derive(Clone)]
pub struct MutationPipeline {
    conn: SharedConnection,
    schema: Arc<Schema>,
    clock: Arc<CausalClock>,
    outbox: ChangeOutbox,
}

impl MutationPipeline {
    pub(crate) fn new(
        conn: SharedConnection,
        schema: Arc<Schema>,
        clock: Arc<CausalClock>,
        outbox: ChangeOutbox,
    ) -> Self {
        Self {
            conn,
            schema,
            clock,
            outbox,
        }
    }

    /// Insert a row of user columns, returning its `system_id`.
    ///
    /// `values` may carry a caller-chosen `system_id`; otherwise a UUID v4 is
    /// generated. Absent NOT NULL columns receive their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaMismatch`] for unknown tables or columns,
    /// reserved columns, or mistyped values, and [`Error::ConstraintViolation`]
    /// if the database rejects the row.
    pub async fn insert(&self, table: &str, mut values: Row) -> Result<String> {
        let table_schema = self.schema.table(table)?;

        let supplied_id = take_system_id(table_schema, &mut values)?;
        let values = table_schema.coerce_row(&values)?;

        let mut payload = values.clone();
        if let Some(id) = &supplied_id {
            payload.insert(SYSTEM_ID.to_string(), Value::from(id.as_str()));
        }
        let system_id = supplied_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut row = values;
        table_schema.fill_defaults(&mut row, self.clock.wall_ms());

        let entry = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;

            let hlc = self.clock.now();
            row.insert(SYSTEM_ID.to_string(), Value::from(system_id.as_str()));
            row.insert(SYSTEM_VERSION.to_string(), Value::from(&hlc));
            row.insert(SYSTEM_CREATED_AT.to_string(), Value::from(&hlc));
            row.insert(SYSTEM_IS_LOCAL_ORIGIN.to_string(), Value::from(true));
            for def in table_schema.lww_columns() {
                row.insert(shadow_column(&def.name), Value::from(&hlc));
            }

            tx.insert(table, &row)?;
            let entry = outbox::append(&tx, table, &system_id, &hlc, true, Some(&payload))?;
            tx.commit()?;
            entry
        };

        tracing::debug!(table, system_id = %system_id, hlc = %entry.hlc, "Row inserted");
        self.outbox.notify(vec![entry]);
        Ok(system_id)
    }

    /// Update every row matching `predicate`, returning how many rows changed.
    ///
    /// LWW columns are applied per row only when the new HLC is newer than the
    /// column's shadow. Rows whose effective change-set is empty are left
    /// untouched and produce no outbox entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaMismatch`] for unknown or reserved columns,
    /// [`Error::IllegalColumnWrite`] if a non-LWW column would be written on a
    /// row that did not originate locally (nothing is mutated), and
    /// [`Error::ConstraintViolation`] if the database rejects a write.
    pub async fn update(&self, table: &str, values: Row, predicate: &Predicate) -> Result<usize> {
        let table_schema = self.schema.table(table)?;
        let values = table_schema.coerce_row(&values)?;
        predicate.validate(table_schema)?;

        let entries = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;

            let snapshot = tx.query(table, predicate)?;
            if snapshot.is_empty() || values.is_empty() {
                return Ok(0);
            }
            check_column_access(table_schema, &values, &snapshot)?;

            let hlc = self.clock.now();
            let mut entries = Vec::new();
            for stored in &snapshot {
                let changes = plan_local_update(table_schema, stored, &values, &hlc)?;
                if changes.is_empty() {
                    continue;
                }

                let system_id = system_id_of(table, stored)?;
                tx.update(table, &changes, &Predicate::eq(SYSTEM_ID, system_id))?;
                entries.push(outbox::append(
                    &tx,
                    table,
                    system_id,
                    &hlc,
                    is_local_origin(stored),
                    Some(&values),
                )?);
            }

            tx.commit()?;
            entries
        };

        let updated = entries.len();
        tracing::debug!(table, updated, "Rows updated");
        self.outbox.notify(entries);
        Ok(updated)
    }

    /// Delete every row matching `predicate`, returning how many were removed.
    ///
    /// Each removed row leaves a tombstone in the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaMismatch`] for unknown tables or predicate
    /// columns, or a storage error if the delete fails.
    pub async fn delete(&self, table: &str, predicate: &Predicate) -> Result<usize> {
        let table_schema = self.schema.table(table)?;
        predicate.validate(table_schema)?;

        let entries = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;

            let snapshot = tx.query(table, predicate)?;
            if snapshot.is_empty() {
                return Ok(0);
            }

            let hlc = self.clock.now();
            let mut entries = Vec::with_capacity(snapshot.len());
            for stored in &snapshot {
                let system_id = system_id_of(table, stored)?;
                tx.delete(table, &Predicate::eq(SYSTEM_ID, system_id))?;
                entries.push(outbox::append(
                    &tx,
                    table,
                    system_id,
                    &hlc,
                    is_local_origin(stored),
                    None,
                )?);
            }

            tx.commit()?;
            entries
        };

        let deleted = entries.len();
        tracing::debug!(table, deleted, "Rows deleted");
        self.outbox.notify(entries);
        Ok(deleted)
    }

    /// Read every row matching `predicate`, including engine and shadow columns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaMismatch`] for unknown tables or predicate
    /// columns, or a storage error if the read fails.
    pub async fn query(&self, table: &str, predicate: &Predicate) -> Result<Vec<Row>> {
        let table_schema = self.schema.table(table)?;
        predicate.validate(table_schema)?;

        let conn = self.conn.lock().await;
        conn.query(table, predicate)
    }

    /// Read one row by `system_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaMismatch`] for unknown tables, or a storage error
    /// if the read fails.
    pub async fn get(&self, table: &str, system_id: &str) -> Result<Option<Row>> {
        let rows = self
            .query(table, &Predicate::eq(SYSTEM_ID, system_id))
            .await?;
        Ok(rows.into_iter().next())
    }
}

/// Remove a caller-supplied `system_id`, treating NULL as absent.
fn take_system_id(table: &TableSchema, values: &mut Row) -> Result<Option<String>> {
    match values.remove(SYSTEM_ID) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Text(id)) if !id.is_empty() => Ok(Some(id)),
        Some(other) => Err(SchemaError::TypeMismatch {
            table: table.name.clone(),
            column: SYSTEM_ID.to_string(),
            expected: LogicalType::Text,
            got: other.type_name(),
        }
        .into()),
    }
}

/// Non-LWW columns may only be written on rows that originated locally.
fn check_column_access(table: &TableSchema, values: &Row, snapshot: &[Row]) -> Result<()> {
    let Some(column) = values
        .keys()
        .find(|c| table.column(c).is_some_and(|def| !def.is_lww))
    else {
        return Ok(());
    };

    match snapshot.iter().find(|row| !is_local_origin(row)) {
        Some(row) => Err(Error::IllegalColumnWrite {
            table: table.name.clone(),
            column: column.clone(),
            system_id: system_id_of(&table.name, row)?.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncStore;
    use tidemark_core::{row, ColumnDef, ColumnDefault, NodeId, Timestamp};

    fn schema() -> Schema {
        Schema::new().with_table(TableSchema::new(
            "tasks",
            vec![
                ColumnDef::new("title", LogicalType::Text).lww().not_null(),
                ColumnDef::new("done", LogicalType::Boolean)
                    .not_null()
                    .with_default(ColumnDefault::Value(Value::Integer(0))),
                ColumnDef::new("notes", LogicalType::Text),
            ],
        ))
    }

    fn store() -> SyncStore {
        SyncStore::in_memory(schema()).unwrap()
    }

    async fn force(store: &SyncStore, sql: &str) {
        store.conn.lock().await.execute(sql, []).unwrap();
    }

    #[tokio::test]
    async fn insert_stamps_engine_columns() {
        let store = store();
        let pipeline = store.pipeline();

        let id = pipeline
            .insert("tasks", row! { "title" => "A" })
            .await
            .unwrap();
        let row = pipeline.get("tasks", &id).await.unwrap().unwrap();

        let version = row[SYSTEM_VERSION].clone();
        assert_eq!(row["title"], Value::from("A"));
        assert_eq!(row["done"], Value::Integer(0));
        assert_eq!(row["notes"], Value::Null);
        assert_eq!(row["title__hlc"], version);
        assert_eq!(row[SYSTEM_CREATED_AT], version);
        assert_eq!(row[SYSTEM_IS_LOCAL_ORIGIN], Value::Integer(1));
        assert_eq!(
            version.as_timestamp().unwrap().unwrap().node_id,
            *store.node_id()
        );

        let entries = store.outbox().get_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_id, id);
        assert!(entries[0].is_full_row);
        assert_eq!(entries[0].payload, Some(row! { "title" => "A" }));
    }

    #[tokio::test]
    async fn insert_keeps_caller_system_id() {
        let store = store();
        let pipeline = store.pipeline();

        let id = pipeline
            .insert("tasks", row! { SYSTEM_ID => "fixed", "title" => "A" })
            .await
            .unwrap();
        assert_eq!(id, "fixed");

        let err = pipeline
            .insert("tasks", row! { SYSTEM_ID => "fixed", "title" => "B" })
            .await
            .unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(store.outbox().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_rejects_bad_input_without_writing() {
        let store = store();
        let pipeline = store.pipeline();

        for (table, values) in [
            ("ghosts", row! { "title" => "A" }),
            ("tasks", row! { "bogus" => 1 }),
            ("tasks", row! { "title" => 7 }),
            ("tasks", row! { SYSTEM_VERSION => "x" }),
            ("tasks", row! { "title__hlc" => "x" }),
            ("tasks", row! { SYSTEM_ID => 5 }),
        ] {
            let err = pipeline.insert(table, values).await.unwrap_err();
            assert!(matches!(err, Error::SchemaMismatch(_)), "{err}");
        }

        assert!(store.outbox().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn update_bumps_version_and_logs_payload() {
        let store = store();
        let pipeline = store.pipeline();
        let id = pipeline
            .insert("tasks", row! { "title" => "A" })
            .await
            .unwrap();
        let before = pipeline.get("tasks", &id).await.unwrap().unwrap();

        let changed = pipeline
            .update(
                "tasks",
                row! { "title" => "B", "notes" => "n" },
                &Predicate::eq(SYSTEM_ID, id.as_str()),
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let after = pipeline.get("tasks", &id).await.unwrap().unwrap();
        assert_eq!(after["title"], Value::from("B"));
        assert_eq!(after["notes"], Value::from("n"));
        let version = |row: &Row| row[SYSTEM_VERSION].as_timestamp().unwrap().unwrap();
        assert!(version(&after) > version(&before));
        assert_eq!(after["title__hlc"], after[SYSTEM_VERSION]);
        assert_eq!(after[SYSTEM_CREATED_AT], before[SYSTEM_CREATED_AT]);

        let entries = store.outbox().get_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1].payload,
            Some(row! { "title" => "B", "notes" => "n" })
        );
    }

    #[tokio::test]
    async fn update_skips_lww_column_with_newer_shadow() {
        let store = store();
        let pipeline = store.pipeline();
        let id = pipeline
            .insert("tasks", row! { "title" => "A" })
            .await
            .unwrap();

        let future = Timestamp::new(u64::MAX / 2, 0, NodeId::new("peer").unwrap());
        force(
            &store,
            &format!(
                "UPDATE tasks SET title = 'server', title__hlc = '{}'",
                future.encode()
            ),
        )
        .await;

        let changed = pipeline
            .update("tasks", row! { "title" => "B" }, &Predicate::All)
            .await
            .unwrap();

        assert_eq!(changed, 0);
        let row = pipeline.get("tasks", &id).await.unwrap().unwrap();
        assert_eq!(row["title"], Value::from("server"));
        assert_eq!(store.outbox().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_of_plain_column_on_remote_row_is_rejected() {
        let store = store();
        let pipeline = store.pipeline();
        let local = pipeline
            .insert("tasks", row! { "title" => "mine" })
            .await
            .unwrap();
        let remote = pipeline
            .insert("tasks", row! { "title" => "theirs" })
            .await
            .unwrap();
        force(
            &store,
            &format!("UPDATE tasks SET system_is_local_origin = 0 WHERE system_id = '{remote}'"),
        )
        .await;

        let err = pipeline
            .update("tasks", row! { "notes" => "x" }, &Predicate::All)
            .await
            .unwrap_err();
        match err {
            Error::IllegalColumnWrite {
                column, system_id, ..
            } => {
                assert_eq!(column, "notes");
                assert_eq!(system_id, remote);
            }
            other => panic!("unexpected error: {other}"),
        }

        let untouched = pipeline.get("tasks", &local).await.unwrap().unwrap();
        assert_eq!(untouched["notes"], Value::Null);
        assert_eq!(store.outbox().len().await.unwrap(), 2);

        // LWW columns stay writable everywhere.
        let changed = pipeline
            .update("tasks", row! { "title" => "edited" }, &Predicate::All)
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let entries = store.outbox().get_all().await.unwrap();
        let remote_entry = entries.iter().rfind(|e| e.row_id == remote).unwrap();
        assert!(!remote_entry.is_full_row);
    }

    #[tokio::test]
    async fn update_without_matches_is_zero() {
        let store = store();
        let changed = store
            .pipeline()
            .update(
                "tasks",
                row! { "title" => "x" },
                &Predicate::eq(SYSTEM_ID, "missing"),
            )
            .await
            .unwrap();

        assert_eq!(changed, 0);
        assert!(store.outbox().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn update_to_null_on_not_null_column_fails_atomically() {
        let store = store();
        let pipeline = store.pipeline();
        let id = pipeline
            .insert("tasks", row! { "title" => "A" })
            .await
            .unwrap();

        let err = pipeline
            .update("tasks", row! { "title" => Value::Null }, &Predicate::All)
            .await
            .unwrap_err();

        assert!(err.is_constraint_violation());
        let row = pipeline.get("tasks", &id).await.unwrap().unwrap();
        assert_eq!(row["title"], Value::from("A"));
        assert_eq!(store.outbox().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_leaves_tombstones() {
        let store = store();
        let pipeline = store.pipeline();
        for title in ["a", "b", "c"] {
            pipeline
                .insert("tasks", row! { "title" => title })
                .await
                .unwrap();
        }

        let deleted = pipeline
            .delete("tasks", &Predicate::is_in("title", ["a", "b"]))
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(pipeline.query("tasks", &Predicate::All).await.unwrap().len(), 1);

        let tombstones: Vec<_> = store
            .outbox()
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .filter(outbox::DirtyRow::is_tombstone)
            .collect();
        assert_eq!(tombstones.len(), 2);
        assert_eq!(tombstones[0].hlc, tombstones[1].hlc);
        assert!(tombstones.iter().all(|t| t.is_full_row));
    }

    #[tokio::test]
    async fn predicates_are_validated() {
        let store = store();
        let err = store
            .pipeline()
            .query("tasks", &Predicate::eq("ghost", 1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::SchemaMismatch(SchemaError::UnknownColumn { .. })
        ));
    }

    #[tokio::test]
    async fn now_defaults_read_the_store_clock() {
        let schema = Schema::new().with_table(TableSchema::new(
            "events",
            vec![ColumnDef::new("at_ms", LogicalType::Integer)
                .not_null()
                .with_default(ColumnDefault::NowMillis)],
        ));
        let store = SyncStore::open_with_time_source(
            &crate::StoreConfig::in_memory(),
            schema,
            Arc::new(|| 42_000_u64),
        )
        .unwrap();
        let pipeline = store.pipeline();

        let id = pipeline.insert("events", Row::new()).await.unwrap();
        let row = pipeline.get("events", &id).await.unwrap().unwrap();

        assert_eq!(row["at_ms"], Value::Integer(42_000));
    }
}
