use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};

use crate::error::RepositoryError;

pub(crate) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Accepts `name` or `schema.name` made of ASCII word characters and returns
/// it double-quoted.
pub(crate) fn quote_identifier(name: &str) -> Result<String, RepositoryError> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !valid {
        return Err(RepositoryError::InvalidIdentifier(name.to_owned()));
    }

    Ok(name.split('.').map(|part| format!("\"{part}\"")).collect::<Vec<_>>().join("."))
}

/// `"a" = ? AND "b" = ?` plus the values to bind, in column order.
pub(crate) fn key_predicate(
    primary_key: &BTreeMap<String, Value>,
) -> Result<(String, Vec<Value>), RepositoryError> {
    let mut clauses = Vec::with_capacity(primary_key.len());
    let mut binds = Vec::with_capacity(primary_key.len());
    for (column, value) in primary_key {
        if value.is_null() {
            clauses.push(format!("{} IS NULL", quote_identifier(column)?));
        } else {
            clauses.push(format!("{} = ?", quote_identifier(column)?));
            binds.push(value.clone());
        }
    }
    Ok((clauses.join(" AND "), binds))
}

/// Scalars bind natively; arrays and objects bind as JSON text.
pub(crate) fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => query.bind(integer),
            None => query.bind(number.as_f64()),
        },
        Value::String(text) => query.bind(text.clone()),
        other => query.bind(other.to_string()),
    }
}

pub(crate) fn bind_all<'q>(mut query: SqliteQuery<'q>, values: &[Value]) -> SqliteQuery<'q> {
    for value in values {
        query = bind_value(query, value);
    }
    query
}

pub(crate) fn to_json(map: &BTreeMap<String, Value>) -> Result<String, RepositoryError> {
    serde_json::to_string(map).map_err(|error| RepositoryError::Decode(error.to_string()))
}

pub(crate) fn from_json(text: &str) -> Result<BTreeMap<String, Value>, RepositoryError> {
    serde_json::from_str(text).map_err(|error| RepositoryError::Decode(error.to_string()))
}
