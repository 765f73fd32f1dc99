//! # Tidemark Core
//!
//! HLC timestamps, schema metadata, and merge semantics for Tidemark.
//!
//! This crate provides:
//! - Hybrid Logical Clock (HLC) producing causally ordered, sortable timestamps
//! - Schema metadata for sync-enabled tables (LWW columns, defaults, keys)
//! - Row values mirroring the storage classes of the embedded store
//! - Per-column merge rules for local updates and reconciliation
//!
//! It performs no IO; the store crate drives it against SQLite.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hlc;
pub mod merge;
pub mod schema;
pub mod value;

pub use hlc::{CausalClock, NodeId, TimeSource, Timestamp, TimestampError};
pub use merge::{incoming_wins, plan_local_update, plan_reconcile, MergeStrategy, RowMerge};
pub use schema::{
    shadow_column, ColumnDef, ColumnDefault, ColumnKind, LogicalType, Schema, SchemaError,
    TableSchema,
};
pub use value::{Row, Value};
