//! Reconciliation of externally supplied authoritative rows.
//!
//! The sync driver hands pulled rows to [`ReconciliationEngine::bulk_load`].
//! New rows are inserted as remote-origin; existing rows are merged per column
//! (see `tidemark_core::merge`). Reconciliation never writes to the outbox, so
//! pulled state is not echoed back to the server.

use crate::db::SharedConnection;
use crate::error::Result;
use crate::executor::StorageExecutor;
use crate::predicate::Predicate;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;
use tidemark_core::schema::{SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_VERSION};
use tidemark_core::{
    plan_reconcile, CausalClock, ColumnKind, LogicalType, Row, Schema, SchemaError, TableSchema,
    Value,
};

/// What to do when a row write violates a database constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConstraintPolicy {
    /// Roll back the whole batch and return the violation
    #[default]
    AbortBatch,
    /// Roll back only the offending row, log it, and continue
    SkipRow,
}

/// Summary of one bulk load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkLoadReport {
    /// Rows that did not exist locally
    pub inserted: usize,
    /// Existing rows that changed
    pub updated: usize,
    /// Existing rows already converged with the input
    pub unchanged: usize,
    /// `system_id`s rolled back under [`ConstraintPolicy::SkipRow`]
    pub skipped: Vec<String>,
}

impl BulkLoadReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Inserted => self.inserted += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Inserted,
    Updated,
    Unchanged,
}

/// A validated incoming row.
struct Incoming {
    system_id: String,
    row: Row,
}

/// Merges pulled rows into local tables.
#[derive(Clone)]
pub struct ReconciliationEngine {
    conn: SharedConnection,
    schema: Arc<Schema>,
    clock: Arc<CausalClock>,
}

impl ReconciliationEngine {
    pub(crate) fn new(conn: SharedConnection, schema: Arc<Schema>, clock: Arc<CausalClock>) -> Self {
        Self {
            conn,
            schema,
            clock,
        }
    }

    /// Merge a batch of authoritative rows into `table`.
    ///
    /// The whole batch is validated first; malformed input aborts before any
    /// write regardless of `policy`. Rows are then applied in one transaction.
    /// Re-applying an identical batch changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaMismatch`](crate::Error::SchemaMismatch) for an
    /// unknown table or column, a missing or non-text `system_id`, or a
    /// mistyped value; [`Error::InvalidTimestamp`](crate::Error::InvalidTimestamp)
    /// for a malformed HLC; and
    /// [`Error::ConstraintViolation`](crate::Error::ConstraintViolation) under
    /// [`ConstraintPolicy::AbortBatch`], in which case nothing is written.
    pub async fn bulk_load(
        &self,
        table: &str,
        rows: Vec<Row>,
        policy: ConstraintPolicy,
    ) -> Result<BulkLoadReport> {
        let table_schema = self.schema.table(table)?;
        let batch = rows
            .into_iter()
            .map(|row| self.prepare(table_schema, row))
            .collect::<Result<Vec<_>>>()?;

        let mut report = BulkLoadReport::default();
        {
            let mut conn = self.conn.lock().await;
            let mut tx = conn.transaction()?;

            for incoming in &batch {
                match policy {
                    ConstraintPolicy::AbortBatch => {
                        report.record(self.apply_row(&tx, table_schema, incoming)?);
                    }
                    ConstraintPolicy::SkipRow => {
                        let savepoint = tx.savepoint()?;
                        match self.apply_row(&savepoint, table_schema, incoming) {
                            Ok(outcome) => {
                                savepoint.commit()?;
                                report.record(outcome);
                            }
                            Err(err) if err.is_constraint_violation() => {
                                drop(savepoint);
                                tracing::warn!(
                                    table,
                                    system_id = %incoming.system_id,
                                    error = %err,
                                    "Skipping row that violates a constraint"
                                );
                                report.skipped.push(incoming.system_id.clone());
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
            }

            tx.commit()?;
        }

        tracing::debug!(
            table,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped.len(),
            "Bulk load applied"
        );
        Ok(report)
    }

    /// Validate one row, coerce user values, and observe its HLCs.
    fn prepare(&self, table: &TableSchema, row: Row) -> Result<Incoming> {
        let mut system_id = None;
        let mut prepared = Row::new();

        for (column, value) in row {
            match table.classify(&column) {
                Some(ColumnKind::User(_)) => {
                    let value = table.coerce(&column, &value)?;
                    prepared.insert(column, value);
                }
                Some(
                    ColumnKind::Shadow(_) | ColumnKind::SystemVersion | ColumnKind::SystemCreatedAt,
                ) => {
                    let hlc = value.as_timestamp()?;
                    if let Some(hlc) = &hlc {
                        self.clock.merge(hlc);
                    }
                    prepared.insert(column, hlc.map_or(Value::Null, Value::from));
                }
                Some(ColumnKind::SystemId) => match value {
                    Value::Text(id) if !id.is_empty() => {
                        prepared.insert(column, Value::from(id.as_str()));
                        system_id = Some(id);
                    }
                    Value::Null => {}
                    other => {
                        return Err(SchemaError::TypeMismatch {
                            table: table.name.clone(),
                            column,
                            expected: LogicalType::Text,
                            got: other.type_name(),
                        }
                        .into());
                    }
                },
                Some(ColumnKind::LocalOrigin) => {}
                None => {
                    return Err(SchemaError::UnknownColumn {
                        table: table.name.clone(),
                        column,
                    }
                    .into());
                }
            }
        }

        let system_id = system_id.ok_or_else(|| SchemaError::MissingColumn {
            table: table.name.clone(),
            column: SYSTEM_ID.to_string(),
        })?;
        Ok(Incoming {
            system_id,
            row: prepared,
        })
    }

    fn apply_row(
        &self,
        conn: &Connection,
        table: &TableSchema,
        incoming: &Incoming,
    ) -> Result<Outcome> {
        let by_id = Predicate::eq(SYSTEM_ID, incoming.system_id.as_str());
        let local = conn.query(&table.name, &by_id)?.into_iter().next();

        let Some(local) = local else {
            let mut row = incoming.row.clone();
            table.fill_defaults(&mut row, self.clock.wall_ms());

            let newest = row
                .iter()
                .filter(|(column, _)| {
                    matches!(
                        table.classify(column),
                        Some(ColumnKind::Shadow(_) | ColumnKind::SystemVersion)
                    )
                })
                .map(|(_, value)| value.as_timestamp())
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .max();
            let version = Value::from(newest.unwrap_or_else(|| self.clock.now()));
            if row.get(SYSTEM_CREATED_AT).map_or(true, Value::is_null) {
                row.insert(SYSTEM_CREATED_AT.to_string(), version.clone());
            }
            row.insert(SYSTEM_VERSION.to_string(), version);
            row.insert(SYSTEM_IS_LOCAL_ORIGIN.to_string(), Value::from(false));

            conn.insert(&table.name, &row)?;
            return Ok(Outcome::Inserted);
        };

        let merge = plan_reconcile(table, &local, &incoming.row)?;
        if !merge.stale_columns.is_empty() {
            tracing::trace!(
                table = %table.name,
                system_id = %incoming.system_id,
                columns = ?merge.stale_columns,
                "Kept newer local values"
            );
        }
        if merge.is_noop() {
            return Ok(Outcome::Unchanged);
        }

        conn.update(&table.name, &merge.changes, &by_id)?;
        Ok(Outcome::Updated)
    }
}
