//! Entity keys.
//!
//! An [`EntityKey`] is the primary-key tuple of one tracked entity, in the
//! order the key columns are declared. Every version row of the same entity
//! shares the same key, which is what groups rows into a history chain.
//!
//! Key parts are restricted to values with total equality (integers, text,
//! blobs) so keys can be hashed and ordered. `NULL` and floating point
//! values are rejected.

use std::fmt;

use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, Result};

/// One column value of an entity key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    /// Integer key column.
    Integer(i64),
    /// Text key column.
    Text(String),
    /// Blob key column.
    Blob(Vec<u8>),
}

impl KeyPart {
    /// Convert an owned `SQLite` value into a key part.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(Self::Integer(*i)),
            Value::Text(s) => Ok(Self::Text(s.clone())),
            Value::Blob(b) => Ok(Self::Blob(b.clone())),
            Value::Null => Err(CoreError::InvalidKey("NULL is not a valid key value".into())),
            Value::Real(r) => Err(CoreError::InvalidKey(format!(
                "floating point value {r} is not a valid key value"
            ))),
        }
    }

    /// Convert back into an owned `SQLite` value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Integer(i) => Value::Integer(*i),
            Self::Text(s) => Value::Text(s.clone()),
            Self::Blob(b) => Value::Blob(b.clone()),
        }
    }
}

impl ToSql for KeyPart {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Integer(i) => ToSqlOutput::from(*i),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Blob(b) => write!(f, "x'{}'", hex(b)),
        }
    }
}

impl From<i64> for KeyPart {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Primary-key tuple identifying one entity's history chain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(Vec<KeyPart>);

impl EntityKey {
    /// Build a key from its parts.
    #[must_use]
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Build a key from `SQLite` values, rejecting `NULL` and reals.
    pub fn from_values(values: &[Value]) -> Result<Self> {
        if values.is_empty() {
            return Err(CoreError::InvalidKey("key must have at least one column".into()));
        }
        values
            .iter()
            .map(KeyPart::from_value)
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    /// Key parts in declaration order.
    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Number of key columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no columns (never true for keys built by `from_values`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key parts as owned `SQLite` values.
    #[must_use]
    pub fn to_values(&self) -> Vec<Value> {
        self.0.iter().map(KeyPart::to_value).collect()
    }
}

impl From<i64> for EntityKey {
    fn from(i: i64) -> Self {
        Self(vec![KeyPart::Integer(i)])
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        Self(vec![KeyPart::from(s)])
    }
}

impl From<Vec<KeyPart>> for EntityKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str(")")
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
