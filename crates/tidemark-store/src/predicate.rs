//! Row predicates compiled to parameterized SQL.

use tidemark_core::{SchemaError, TableSchema, Value};

/// A filter over the rows of one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every row
    All,
    /// `column = value` (`IS NULL` for a NULL value)
    Eq(String, Value),
    /// `column <> value` (`IS NOT NULL` for a NULL value)
    Ne(String, Value),
    /// `column < value`
    Lt(String, Value),
    /// `column > value`
    Gt(String, Value),
    /// `column IN (values...)`
    In(String, Vec<Value>),
    /// `column IS NULL`
    IsNull(String),
    /// All sub-predicates hold
    And(Vec<Predicate>),
    /// Any sub-predicate holds
    Or(Vec<Predicate>),
    /// Negation
    Not(Box<Predicate>),
}

impl Predicate {
    /// `column = value`.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.into(), value.into())
    }

    /// `column IN (values...)`.
    pub fn is_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    /// Conjunction with another predicate.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Column names referenced anywhere in the predicate.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::All => {}
            Predicate::Eq(c, _)
            | Predicate::Ne(c, _)
            | Predicate::Lt(c, _)
            | Predicate::Gt(c, _)
            | Predicate::In(c, _)
            | Predicate::IsNull(c) => out.push(c),
            Predicate::And(parts) | Predicate::Or(parts) => {
                for part in parts {
                    part.collect_columns(out);
                }
            }
            Predicate::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Check that every referenced column exists in `table`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownColumn`] for the first unknown column.
    pub fn validate(&self, table: &TableSchema) -> Result<(), SchemaError> {
        self.columns()
            .into_iter()
            .try_for_each(|column| table.require_known(column))
    }

    /// Render a `WHERE` clause body, pushing bound values onto `params`.
    pub(crate) fn to_sql(&self, params: &mut Vec<Value>) -> String {
        match self {
            Predicate::All => "1".to_string(),
            Predicate::Eq(c, Value::Null) | Predicate::IsNull(c) => {
                format!("{} IS NULL", quote_ident(c))
            }
            Predicate::Ne(c, Value::Null) => format!("{} IS NOT NULL", quote_ident(c)),
            Predicate::Eq(c, v) => binary(c, "=", v, params),
            Predicate::Ne(c, v) => binary(c, "<>", v, params),
            Predicate::Lt(c, v) => binary(c, "<", v, params),
            Predicate::Gt(c, v) => binary(c, ">", v, params),
            Predicate::In(_, values) if values.is_empty() => "0".to_string(),
            Predicate::In(c, values) => {
                params.extend(values.iter().cloned());
                let slots = vec!["?"; values.len()].join(", ");
                format!("{} IN ({slots})", quote_ident(c))
            }
            Predicate::And(parts) => join(parts, " AND ", "1", params),
            Predicate::Or(parts) => join(parts, " OR ", "0", params),
            Predicate::Not(inner) => format!("NOT ({})", inner.to_sql(params)),
        }
    }
}

fn binary(column: &str, op: &str, value: &Value, params: &mut Vec<Value>) -> String {
    params.push(value.clone());
    format!("{} {op} ?", quote_ident(column))
}

fn join(parts: &[Predicate], sep: &str, empty: &str, params: &mut Vec<Value>) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    parts
        .iter()
        .map(|p| format!("({})", p.to_sql(params)))
        .collect::<Vec<_>>()
        .join(sep)
}

/// Quote an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
