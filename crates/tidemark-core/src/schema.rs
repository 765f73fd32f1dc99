//! Schema metadata for sync-enabled tables.
//!
//! The schema DSL and migrations live elsewhere; this module only carries the
//! per-column facts the sync engine needs: logical type, whether the column is
//! last-writer-wins, nullability and defaults.

use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-generated immutable row identity.
pub const SYSTEM_ID: &str = "system_id";
/// HLC of the most recent write to any column.
pub const SYSTEM_VERSION: &str = "system_version";
/// HLC at row creation.
pub const SYSTEM_CREATED_AT: &str = "system_created_at";
/// 1 while the row was created here and never overwritten by reconciliation.
pub const SYSTEM_IS_LOCAL_ORIGIN: &str = "system_is_local_origin";
/// Suffix of per-column shadow HLC fields.
pub const SHADOW_SUFFIX: &str = "__hlc";

const RESERVED_PREFIX: &str = "system_";
const RESERVED_TABLE_PREFIX: &str = "sync_";

/// Name of the shadow HLC column for an LWW column.
#[must_use]
pub fn shadow_column(column: &str) -> String {
    format!("{column}{SHADOW_SUFFIX}")
}

/// Logical type of a user column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    /// UTF-8 text
    Text,
    /// 64-bit integer
    Integer,
    /// 64-bit float
    Real,
    /// Boolean stored as 0/1
    Boolean,
    /// Raw bytes
    Blob,
    /// JSON document stored as text
    Json,
}

impl LogicalType {
    /// SQL column type used when creating tables.
    #[must_use]
    pub fn sql_type(self) -> &'static str {
        match self {
            LogicalType::Text | LogicalType::Json => "TEXT",
            LogicalType::Integer | LogicalType::Boolean => "INTEGER",
            LogicalType::Real => "REAL",
            LogicalType::Blob => "BLOB",
        }
    }

    /// Fallback value for NOT NULL columns without a declared default.
    #[must_use]
    pub fn zero_value(self) -> Value {
        match self {
            LogicalType::Text => Value::Text(String::new()),
            LogicalType::Integer | LogicalType::Boolean => Value::Integer(0),
            LogicalType::Real => Value::Real(0.0),
            LogicalType::Blob => Value::Blob(Vec::new()),
            LogicalType::Json => Value::Text("null".to_string()),
        }
    }

    /// Check a value against this type, widening where storage allows it.
    #[allow(clippy::cast_precision_loss)]
    fn accepts(self, value: Value) -> Option<Value> {
        match (self, value) {
            (_, Value::Null) => Some(Value::Null),
            (LogicalType::Text, v @ Value::Text(_))
            | (LogicalType::Integer, v @ Value::Integer(_))
            | (LogicalType::Real, v @ Value::Real(_))
            | (LogicalType::Blob, v @ Value::Blob(_)) => Some(v),
            (LogicalType::Real, Value::Integer(i)) => Some(Value::Real(i as f64)),
            (LogicalType::Boolean, Value::Integer(i)) if i == 0 || i == 1 => {
                Some(Value::Integer(i))
            }
            (LogicalType::Json, Value::Text(s)) => serde_json::from_str::<serde_json::Value>(&s)
                .ok()
                .map(|_| Value::Text(s)),
            _ => None,
        }
    }
}

/// Default produced for a column when a NOT NULL value is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum ColumnDefault {
    /// A constant value
    Value(Value),
    /// A fresh random UUID string
    Uuid,
    /// The writer clock's wall time in milliseconds
    NowMillis,
}

impl ColumnDefault {
    /// Produce a default value; `now_ms` is the writer clock's wall time.
    #[must_use]
    pub fn produce(&self, now_ms: u64) -> Value {
        match self {
            ColumnDefault::Value(v) => v.clone(),
            ColumnDefault::Uuid => Value::Text(Uuid::new_v4().to_string()),
            ColumnDefault::NowMillis => Value::Integer(i64::try_from(now_ms).unwrap_or(i64::MAX)),
        }
    }
}

/// Definition of a user column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Logical type
    pub logical_type: LogicalType,
    /// Whether concurrent writes are arbitrated per column by HLC
    #[serde(default)]
    pub is_lww: bool,
    /// Whether the column rejects NULL
    #[serde(default)]
    pub is_not_null: bool,
    /// Declared default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ColumnDefault>,
}

impl ColumnDef {
    /// Create a nullable, non-LWW column.
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            is_lww: false,
            is_not_null: false,
            default: None,
        }
    }

    /// Mark the column as last-writer-wins.
    #[must_use]
    pub fn lww(mut self) -> Self {
        self.is_lww = true;
        self
    }

    /// Mark the column NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.is_not_null = true;
        self
    }

    /// Attach a default.
    #[must_use]
    pub fn with_default(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }

    /// Value used to fill a missing NOT NULL column.
    #[must_use]
    pub fn default_value(&self, now_ms: u64) -> Value {
        self.default.as_ref().map_or_else(
            || self.logical_type.zero_value(),
            |default| default.produce(now_ms),
        )
    }
}

/// What a column name refers to within a table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnKind<'a> {
    /// A declared user column
    User(&'a ColumnDef),
    /// The shadow HLC of an LWW user column
    Shadow(&'a ColumnDef),
    /// `system_id`
    SystemId,
    /// `system_version`
    SystemVersion,
    /// `system_created_at`
    SystemCreatedAt,
    /// `system_is_local_origin`
    LocalOrigin,
}

/// Metadata for one sync-enabled table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// User columns in declaration order
    pub columns: Vec<ColumnDef>,
    /// Primary-key column set
    #[serde(default = "default_primary_key")]
    pub primary_key: Vec<String>,
}

fn default_primary_key() -> Vec<String> {
    vec![SYSTEM_ID.to_string()]
}

impl TableSchema {
    /// Create a table keyed by `system_id`.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: default_primary_key(),
        }
    }

    /// Replace the primary-key column set.
    #[must_use]
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Look up a user column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Iterate over LWW columns.
    pub fn lww_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.is_lww)
    }

    /// Whether `column` is part of the primary key.
    #[must_use]
    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }

    /// Resolve a column name, including system and shadow columns.
    #[must_use]
    pub fn classify(&self, name: &str) -> Option<ColumnKind<'_>> {
        match name {
            SYSTEM_ID => return Some(ColumnKind::SystemId),
            SYSTEM_VERSION => return Some(ColumnKind::SystemVersion),
            SYSTEM_CREATED_AT => return Some(ColumnKind::SystemCreatedAt),
            SYSTEM_IS_LOCAL_ORIGIN => return Some(ColumnKind::LocalOrigin),
            _ => {}
        }
        if let Some(base) = name.strip_suffix(SHADOW_SUFFIX) {
            return self
                .column(base)
                .filter(|c| c.is_lww)
                .map(ColumnKind::Shadow);
        }
        self.column(name).map(ColumnKind::User)
    }

    /// Every physical column name, in table order.
    #[must_use]
    pub fn physical_columns(&self) -> Vec<String> {
        let mut names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        names.extend(self.lww_columns().map(|c| shadow_column(&c.name)));
        names.extend(
            [
                SYSTEM_ID,
                SYSTEM_VERSION,
                SYSTEM_CREATED_AT,
                SYSTEM_IS_LOCAL_ORIGIN,
            ]
            .map(String::from),
        );
        names
    }

    /// Resolve `column` to a user column or fail.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ReservedColumn`] for system and shadow columns and
    /// [`SchemaError::UnknownColumn`] for anything undeclared.
    pub fn user_column(&self, column: &str) -> Result<&ColumnDef, SchemaError> {
        match self.classify(column) {
            Some(ColumnKind::User(def)) => Ok(def),
            Some(_) => Err(SchemaError::ReservedColumn {
                table: self.name.clone(),
                column: column.to_string(),
            }),
            None => Err(self.unknown(column)),
        }
    }

    /// Check that a column name is known to this table (any kind).
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownColumn`] if it is not.
    pub fn require_known(&self, column: &str) -> Result<(), SchemaError> {
        self.classify(column)
            .map(|_| ())
            .ok_or_else(|| self.unknown(column))
    }

    /// Coerce a value to the logical type of a user column.
    ///
    /// # Errors
    ///
    /// Returns error if the column is not a user column or the value does not fit.
    pub fn coerce(&self, column: &str, value: &Value) -> Result<Value, SchemaError> {
        let def = self.user_column(column)?;
        def.logical_type
            .accepts(value.clone())
            .ok_or_else(|| SchemaError::TypeMismatch {
                table: self.name.clone(),
                column: column.to_string(),
                expected: def.logical_type,
                got: value.type_name(),
            })
    }

    /// Coerce every value of a caller-supplied row of user columns.
    ///
    /// # Errors
    ///
    /// Returns the first column that is unknown, reserved, or mistyped.
    pub fn coerce_row(&self, values: &Row) -> Result<Row, SchemaError> {
        values
            .iter()
            .map(|(column, value)| Ok((column.clone(), self.coerce(column, value)?)))
            .collect()
    }

    /// Fill NOT NULL columns that are absent or NULL.
    pub fn fill_defaults(&self, row: &mut Row, now_ms: u64) {
        for def in self.columns.iter().filter(|c| c.is_not_null) {
            let missing = row.get(&def.name).map_or(true, Value::is_null);
            if missing {
                row.insert(def.name.clone(), def.default_value(now_ms));
            }
        }
    }

    /// Validate names and key declarations.
    ///
    /// # Errors
    ///
    /// Returns error on invalid identifiers, reserved or duplicate column names,
    /// or primary-key columns that do not exist.
    pub fn validate(&self) -> Result<(), SchemaError> {
        check_identifier(&self.name)?;
        if self.name.starts_with(RESERVED_TABLE_PREFIX) {
            return Err(SchemaError::InvalidIdentifier(self.name.clone()));
        }

        for (index, def) in self.columns.iter().enumerate() {
            check_identifier(&def.name)?;
            if def.name.starts_with(RESERVED_PREFIX) || def.name.ends_with(SHADOW_SUFFIX) {
                return Err(SchemaError::ReservedColumn {
                    table: self.name.clone(),
                    column: def.name.clone(),
                });
            }
            if self.columns[..index].iter().any(|c| c.name == def.name) {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.clone(),
                    column: def.name.clone(),
                });
            }
        }

        if self.primary_key.is_empty() {
            return Err(SchemaError::InvalidPrimaryKey {
                table: self.name.clone(),
                column: String::new(),
            });
        }
        for key in &self.primary_key {
            if key != SYSTEM_ID && self.column(key).is_none() {
                return Err(SchemaError::InvalidPrimaryKey {
                    table: self.name.clone(),
                    column: key.clone(),
                });
            }
        }

        Ok(())
    }

    fn unknown(&self, column: &str) -> SchemaError {
        SchemaError::UnknownColumn {
            table: self.name.clone(),
            column: column.to_string(),
        }
    }
}

/// The set of sync-enabled tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Registered tables
    pub tables: Vec<TableSchema>,
}

impl Schema {
    /// Create an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style method to add a table.
    #[must_use]
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    /// Parse and validate a JSON schema document.
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid JSON or fails validation.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let schema: Self =
            serde_json::from_str(json).map_err(|e| SchemaError::Parse(e.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Look up a table.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownTable`] if no table has this name.
    pub fn table(&self, name: &str) -> Result<&TableSchema, SchemaError> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))
    }

    /// Validate every table and reject duplicate table names.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (index, table) in self.tables.iter().enumerate() {
            table.validate()?;
            if self.tables[..index].iter().any(|t| t.name == table.name) {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }
        }
        Ok(())
    }
}

fn check_identifier(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

/// Schema lookup and validation failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    /// No table registered under this name
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    /// No column with this name in the table
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
    /// A required column is absent from the input
    #[error("missing column '{column}' for table '{table}'")]
    MissingColumn {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
    /// The column is maintained by the sync engine
    #[error("column '{column}' in table '{table}' is reserved")]
    ReservedColumn {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
    /// Value does not fit the column's logical type
    #[error("type mismatch for '{table}.{column}': expected {expected:?}, got {got}")]
    TypeMismatch {
        /// Table name
        table: String,
        /// Column name
        column: String,
        /// Declared logical type
        expected: LogicalType,
        /// Storage class of the offending value
        got: &'static str,
    },
    /// Table or column name is not a plain SQL identifier
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    /// Column declared twice
    #[error("duplicate column '{column}' in table '{table}'")]
    DuplicateColumn {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
    /// Table declared twice
    #[error("duplicate table '{0}'")]
    DuplicateTable(String),
    /// Primary key is empty or names a missing column
    #[error("invalid primary key column '{column}' in table '{table}'")]
    InvalidPrimaryKey {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
    /// Schema document could not be parsed
    #[error("invalid schema document: {0}")]
    Parse(String),
}
