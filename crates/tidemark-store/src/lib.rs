//! # Tidemark Store
//!
//! SQLite-backed sync consistency engine for local-first applications.
//!
//! This crate provides:
//! - [`SyncStore`]: opens the database, creates engine tables, and persists
//!   the node id
//! - [`MutationPipeline`]: local inserts, updates and deletes that stamp HLCs
//!   and append to the outbox atomically
//! - [`ChangeOutbox`]: durable FIFO of pending local changes for the sync driver
//! - [`ReconciliationEngine`]: per-column LWW merge of pulled rows
//!
//! Network transport and the sync driver live outside this crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod outbox;
pub mod pipeline;
pub mod predicate;
pub mod reconcile;

pub use config::StoreConfig;
pub use db::SyncStore;
pub use error::{Error, Result};
pub use executor::StorageExecutor;
pub use outbox::{ChangeOutbox, DirtyRow};
pub use pipeline::MutationPipeline;
pub use predicate::Predicate;
pub use reconcile::{BulkLoadReport, ConstraintPolicy, ReconciliationEngine};
