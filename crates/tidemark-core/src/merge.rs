//! Per-column merge semantics for sync-enabled rows.
//!
//! Defines deterministic conflict resolution for local updates and for
//! reconciliation of externally supplied rows.
//!
//! # Merge Rules
//!
//! | Column kind | Local update | Reconciliation |
//! |-------------|--------------|----------------|
//! | LWW, shadow HLC present | apply iff new HLC > local shadow | apply iff incoming shadow > local shadow (ties keep local) |
//! | LWW, no incoming shadow | n/a | unconditional overwrite |
//! | Non-LWW | always applied | unconditional overwrite |
//! | Primary key, shadows, `system_is_local_origin` | n/a | never overwritten from input |

use crate::hlc::{Timestamp, TimestampError};
use crate::schema::{
    shadow_column, ColumnDef, ColumnKind, TableSchema, SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_VERSION,
};
use crate::value::{Row, Value};

/// Merge strategy for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Last-Writer-Wins, arbitrated by the column's shadow HLC
    Lww,
    /// Whatever arrives is written
    Overwrite,
}

impl ColumnDef {
    /// Get the merge strategy for this column.
    #[must_use]
    pub fn merge_strategy(&self) -> MergeStrategy {
        if self.is_lww {
            MergeStrategy::Lww
        } else {
            MergeStrategy::Overwrite
        }
    }
}

/// Whether a write stamped `incoming` supersedes the local shadow.
///
/// A missing local shadow always loses; equal timestamps keep local state.
#[must_use]
pub fn incoming_wins(incoming: &Timestamp, local: Option<&Timestamp>) -> bool {
    local.map_or(true, |local| incoming > local)
}

fn shadow_of(row: &Row, column: &str) -> Result<Option<Timestamp>, TimestampError> {
    row.get(&shadow_column(column))
        .map_or(Ok(None), Value::as_timestamp)
}

/// Compute the effective change-set of a local update for one stored row.
///
/// `values` holds already validated user columns. LWW columns whose shadow is
/// causally newer than `hlc` are dropped. An empty result means the row must
/// not be written at all.
///
/// # Errors
///
/// Returns error if a stored shadow HLC is corrupt.
pub fn plan_local_update(
    table: &TableSchema,
    stored: &Row,
    values: &Row,
    hlc: &Timestamp,
) -> Result<Row, TimestampError> {
    let mut changes = Row::new();

    for (column, value) in values {
        let Some(def) = table.column(column) else {
            continue;
        };
        match def.merge_strategy() {
            MergeStrategy::Lww => {
                if incoming_wins(hlc, shadow_of(stored, column)?.as_ref()) {
                    changes.insert(column.clone(), value.clone());
                    changes.insert(shadow_column(column), Value::from(hlc));
                }
            }
            MergeStrategy::Overwrite => {
                changes.insert(column.clone(), value.clone());
            }
        }
    }

    if !changes.is_empty() {
        changes.insert(SYSTEM_VERSION.to_string(), Value::from(hlc));
    }
    Ok(changes)
}

/// Outcome of reconciling one incoming row against its local counterpart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowMerge {
    /// Columns to write; empty when the row is already converged
    pub changes: Row,
    /// LWW columns whose incoming value lost to a newer or equal local shadow
    pub stale_columns: Vec<String>,
}

impl RowMerge {
    /// Whether the local row needs a write.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Reconcile an incoming authoritative row with the stored local row.
///
/// Values that already match local state are not rewritten, so re-applying
/// the same input yields an empty change-set. When anything changes,
/// `system_version` advances to the newest of the local version, the incoming
/// version, and every shadow HLC applied, and the row loses its local-origin
/// flag.
///
/// # Errors
///
/// Returns error if a local or incoming HLC is corrupt.
pub fn plan_reconcile(
    table: &TableSchema,
    local: &Row,
    incoming: &Row,
) -> Result<RowMerge, TimestampError> {
    let mut merge = RowMerge::default();
    let mut newest_shadow: Option<Timestamp> = None;

    for (column, value) in incoming {
        let def = match table.classify(column) {
            Some(ColumnKind::User(def)) if !table.is_primary_key(column) => def,
            _ => continue,
        };
        let differs = local.get(column) != Some(value);
        let incoming_shadow = match def.merge_strategy() {
            MergeStrategy::Lww => shadow_of(incoming, column)?,
            MergeStrategy::Overwrite => None,
        };

        match (def.merge_strategy(), incoming_shadow) {
            (MergeStrategy::Lww, Some(incoming_hlc)) => {
                let local_hlc = shadow_of(local, column)?;
                if !incoming_wins(&incoming_hlc, local_hlc.as_ref()) {
                    merge.stale_columns.push(column.clone());
                    continue;
                }
                if differs {
                    merge.changes.insert(column.clone(), value.clone());
                }
                merge
                    .changes
                    .insert(shadow_column(column), Value::from(&incoming_hlc));
                newest_shadow = newest_shadow.max(Some(incoming_hlc));
            }
            (MergeStrategy::Lww, None) | (MergeStrategy::Overwrite, _) => {
                if differs {
                    merge.changes.insert(column.clone(), value.clone());
                }
            }
        }
    }

    if merge.is_noop() {
        return Ok(merge);
    }

    let local_version = local
        .get(SYSTEM_VERSION)
        .map_or(Ok(None), Value::as_timestamp)?;
    let incoming_version = incoming
        .get(SYSTEM_VERSION)
        .map_or(Ok(None), Value::as_timestamp)?;
    let version = newest_shadow.max(incoming_version);
    if let Some(version) = version.filter(|v| incoming_wins(v, local_version.as_ref())) {
        merge
            .changes
            .insert(SYSTEM_VERSION.to_string(), Value::from(version));
    }
    merge
        .changes
        .insert(SYSTEM_IS_LOCAL_ORIGIN.to_string(), Value::from(false));

    Ok(merge)
}
