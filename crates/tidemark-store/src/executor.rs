//! Storage executor: the row-level operations the sync engine needs from the
//! embedded database.
//!
//! Implemented for [`rusqlite::Connection`], so it can be used directly on a
//! connection or inside a transaction or savepoint (both deref to it).

use crate::error::{Error, Result};
use crate::predicate::{quote_ident, Predicate};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use tidemark_core::schema::{SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN};
use tidemark_core::{Row, Value};

/// Row-level storage operations.
pub trait StorageExecutor {
    /// Insert one row, returning its storage row id.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails or violates a constraint.
    fn insert(&self, table: &str, row: &Row) -> Result<i64>;

    /// Apply `changes` to every row matching `predicate`, returning the count.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails or violates a constraint.
    fn update(&self, table: &str, changes: &Row, predicate: &Predicate) -> Result<usize>;

    /// Delete every row matching `predicate`, returning the count.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    fn delete(&self, table: &str, predicate: &Predicate) -> Result<usize>;

    /// Read every row matching `predicate`, in storage order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn query(&self, table: &str, predicate: &Predicate) -> Result<Vec<Row>>;
}

impl StorageExecutor for Connection {
    fn insert(&self, table: &str, row: &Row) -> Result<i64> {
        let columns = row
            .keys()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let slots = vec!["?"; row.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({slots})",
            quote_ident(table)
        );

        self.execute(&sql, params_from_iter(row.values().map(to_sql)))?;
        Ok(self.last_insert_rowid())
    }

    fn update(&self, table: &str, changes: &Row, predicate: &Predicate) -> Result<usize> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut params: Vec<Value> = changes.values().cloned().collect();
        let assignments = changes
            .keys()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let filter = predicate.to_sql(&mut params);
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {filter}",
            quote_ident(table)
        );

        Ok(self.execute(&sql, params_from_iter(params.iter().map(to_sql)))?)
    }

    fn delete(&self, table: &str, predicate: &Predicate) -> Result<usize> {
        let mut params = Vec::new();
        let filter = predicate.to_sql(&mut params);
        let sql = format!("DELETE FROM {} WHERE {filter}", quote_ident(table));

        Ok(self.execute(&sql, params_from_iter(params.iter().map(to_sql)))?)
    }

    fn query(&self, table: &str, predicate: &Predicate) -> Result<Vec<Row>> {
        let mut params = Vec::new();
        let filter = predicate.to_sql(&mut params);
        let sql = format!(
            "SELECT * FROM {} WHERE {filter} ORDER BY rowid",
            quote_ident(table)
        );

        let mut stmt = self.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt
            .query_map(params_from_iter(params.iter().map(to_sql)), |row| {
                names
                    .iter()
                    .enumerate()
                    .map(|(index, name)| Ok((name.clone(), from_sql(row.get_ref(index)?))))
                    .collect::<rusqlite::Result<Row>>()
            })?
            .collect::<rusqlite::Result<Vec<Row>>>()?;

        Ok(rows)
    }
}

/// Convert a row value into an SQLite parameter.
pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

/// Convert an SQLite column value into a row value.
pub(crate) fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// `system_id` of a stored row.
pub(crate) fn system_id_of<'a>(table: &str, row: &'a Row) -> Result<&'a str> {
    row.get(SYSTEM_ID)
        .and_then(Value::as_text)
        .ok_or_else(|| Error::CorruptRow {
            table: table.to_string(),
            detail: format!("missing {SYSTEM_ID}"),
        })
}

/// `system_is_local_origin` of a stored row.
pub(crate) fn is_local_origin(row: &Row) -> bool {
    row.get(SYSTEM_IS_LOCAL_ORIGIN)
        .and_then(Value::as_integer)
        .is_some_and(|flag| flag != 0)
}
