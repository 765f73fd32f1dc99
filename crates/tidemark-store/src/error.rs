//! Error types for the Tidemark store.

use tidemark_core::{SchemaError, TimestampError};

/// All errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown table or column, reserved column written, or mistyped value.
    /// Fatal; never retried.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaError),

    /// A non-LWW column was written on a row that did not originate here.
    /// Raised before any storage mutation.
    #[error("illegal write to non-LWW column '{column}' of remote-origin row '{system_id}' in '{table}'")]
    IllegalColumnWrite {
        /// Table name
        table: String,
        /// Offending column
        column: String,
        /// Row identity
        system_id: String,
    },

    /// Uniqueness, foreign-key, NOT NULL or check constraint rejected a write
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// I/O or engine failure from the storage layer, propagated unchanged
    #[error("storage failure: {0}")]
    Storage(rusqlite::Error),

    /// A stored or supplied HLC string could not be parsed
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] TimestampError),

    /// Outbox payload could not be encoded or decoded
    #[error("payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// A stored row is missing engine-maintained fields
    #[error("corrupt row in '{table}': {detail}")]
    CorruptRow {
        /// Table name
        table: String,
        /// What was wrong
        detail: String,
    },
}

impl Error {
    /// Whether the error is a constraint violation that a batch policy may skip.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::ConstraintViolation(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::ConstraintViolation(message.unwrap_or_else(|| code.to_string()))
            }
            other => Error::Storage(other),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_failures_are_classified() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT NOT NULL UNIQUE);")
            .unwrap();
        conn.execute("INSERT INTO t (a) VALUES ('x')", []).unwrap();

        let err: Error = conn
            .execute("INSERT INTO t (a) VALUES ('x')", [])
            .unwrap_err()
            .into();
        assert!(err.is_constraint_violation());

        let err: Error = conn.execute("SELECT * FROM missing", []).unwrap_err().into();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn error_display() {
        let err = Error::IllegalColumnWrite {
            table: "tasks".into(),
            column: "owner".into(),
            system_id: "r1".into(),
        };
        assert_eq!(
            err.to_string(),
            "illegal write to non-LWW column 'owner' of remote-origin row 'r1' in 'tasks'"
        );

        let err = Error::from(SchemaError::UnknownTable("nope".into()));
        assert_eq!(err.to_string(), "schema mismatch: unknown table 'nope'");
    }
}
