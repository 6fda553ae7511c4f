//! Version repository: reads and writes one entity type's version table.

use std::collections::BTreeMap;

use chronicle_core::{AuditId, EntityKey};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, params_from_iter};

use crate::errors::{Result, VersioningError};
use crate::schema::{VersionTable, quote_ident};
use crate::sqlite::row_types::VersionRow;
use crate::unit_of_work::VersionObject;

/// Version repository. Stateless, every method takes `&Connection`.
pub struct VersionRepo;

impl VersionRepo {
    /// Write one version row stamped with `audit_id`. The end marker, if the
    /// table has one, starts out null.
    pub fn insert(
        conn: &Connection,
        table: &VersionTable,
        object: &VersionObject,
        audit_id: AuditId,
    ) -> Result<()> {
        let data_columns = data_columns(table);
        if object.values.len() != data_columns.len() {
            return Err(VersioningError::InvalidOperation(format!(
                "{} expects {} values, got {}",
                table.name(),
                data_columns.len(),
                object.values.len()
            )));
        }
        let mut columns: Vec<String> = data_columns.iter().map(|c| quote_ident(c)).collect();
        columns.push(quote_ident(table.audit_id_column()));
        columns.push(quote_ident(table.operation_type_column()));
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();

        let mut values = object.values.clone();
        values.push(Value::Integer(audit_id.get()));
        values.push(Value::Integer(object.operation.as_i64()));

        let _ = conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table.name()),
                columns.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values.iter()),
        )?;
        Ok(())
    }

    /// Close the row of `key` directly preceding `audit_id` by setting its end
    /// marker to `audit_id`. Older rows are left alone even if open.
    ///
    /// Returns the number of rows closed; always 0 for append-only tables.
    pub fn close_previous(
        conn: &Connection,
        table: &VersionTable,
        key: &EntityKey,
        audit_id: AuditId,
    ) -> Result<usize> {
        let Some(end) = table.end_audit_id_column() else {
            return Ok(0);
        };
        check_key(table, key)?;
        let mut values = vec![Value::Integer(audit_id.get())];
        values.extend(key.to_values());
        let changed = conn.execute(
            &format!(
                "UPDATE {t} SET {end} = ?1
                  WHERE {pred} AND {end} IS NULL
                    AND {aid} = (SELECT MAX({aid}) FROM {t} WHERE {pred} AND {aid} < ?1)",
                t = quote_ident(table.name()),
                end = quote_ident(end),
                pred = key_predicate(table, 2),
                aid = quote_ident(table.audit_id_column()),
            ),
            params_from_iter(values.iter()),
        )?;
        Ok(changed)
    }

    /// Every row of `key`, oldest first.
    pub fn chain(conn: &Connection, table: &VersionTable, key: &EntityKey) -> Result<Vec<VersionRow>> {
        check_key(table, key)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {}",
            select_list(table),
            quote_ident(table.name()),
            key_predicate(table, 1),
            quote_ident(table.audit_id_column())
        ))?;
        let values = key.to_values();
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| map_row(table, row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The row of `key` that was current at `audit_id`.
    ///
    /// With an end marker this is `audit_id <= N < end_audit_id`; append-only
    /// tables take the greatest `audit_id <= N`.
    pub fn version_at(
        conn: &Connection,
        table: &VersionTable,
        key: &EntityKey,
        audit_id: AuditId,
    ) -> Result<Option<VersionRow>> {
        check_key(table, key)?;
        let aid = quote_ident(table.audit_id_column());
        let name = quote_ident(table.name());
        let n = key.len() + 1;
        let sql = match table.end_audit_id_column() {
            Some(end) => format!(
                "SELECT {cols} FROM {name} WHERE {pred} AND {aid} <= ?{n}
                   AND ({end} IS NULL OR {end} > ?{n})
                 ORDER BY {aid} DESC LIMIT 1",
                cols = select_list(table),
                pred = key_predicate(table, 1),
                end = quote_ident(end),
            ),
            None => format!(
                "SELECT {cols} FROM {name} WHERE {pred} AND {aid} = (
                   SELECT MAX({aid}) FROM {name} WHERE {pred} AND {aid} <= ?{n}
                 )",
                cols = select_list(table),
                pred = key_predicate(table, 1),
            ),
        };
        let mut values = key.to_values();
        values.push(Value::Integer(audit_id.get()));
        let row = conn
            .query_row(&sql, params_from_iter(values.iter()), |row| map_row(table, row))
            .optional()?;
        Ok(row)
    }

    /// Rows created by one audit, ordered by key.
    pub fn for_audit(conn: &Connection, table: &VersionTable, audit_id: AuditId) -> Result<Vec<VersionRow>> {
        let order: Vec<String> = table
            .key_columns()
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY {}",
            select_list(table),
            quote_ident(table.name()),
            quote_ident(table.audit_id_column()),
            order.join(", ")
        ))?;
        let rows = stmt
            .query_map([audit_id], |row| map_row(table, row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of rows in the table.
    pub fn count(conn: &Connection, table: &VersionTable) -> Result<i64> {
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table.name())),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Key columns then tracked columns.
fn data_columns(table: &VersionTable) -> Vec<&str> {
    table
        .key_columns()
        .iter()
        .chain(table.columns())
        .map(|c| c.name.as_str())
        .collect()
}

fn check_key(table: &VersionTable, key: &EntityKey) -> Result<()> {
    if key.len() == table.key_columns().len() {
        Ok(())
    } else {
        Err(VersioningError::InvalidKey(format!(
            "{} has {} key columns, key {key} has {}",
            table.entity(),
            table.key_columns().len(),
            key.len()
        )))
    }
}

/// `"k1" = ?first AND "k2" = ?first+1 ...`
fn key_predicate(table: &VersionTable, first: usize) -> String {
    table
        .key_columns()
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(&c.name), first + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn select_list(table: &VersionTable) -> String {
    let mut cols: Vec<String> = data_columns(table).into_iter().map(quote_ident).collect();
    cols.push(quote_ident(table.audit_id_column()));
    cols.push(
        table
            .end_audit_id_column()
            .map_or_else(|| "NULL".to_string(), quote_ident),
    );
    cols.push(quote_ident(table.operation_type_column()));
    cols.join(", ")
}

fn map_row(table: &VersionTable, row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    let names = data_columns(table);
    let key_len = table.key_columns().len();
    let mut values = BTreeMap::new();
    let mut key_values = Vec::with_capacity(key_len);
    for (i, name) in names.iter().enumerate() {
        let value: Value = row.get(i)?;
        if i < key_len {
            key_values.push(value.clone());
        }
        let _ = values.insert((*name).to_string(), value);
    }
    let key = EntityKey::from_values(&key_values)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Null, Box::new(e)))?;
    let n = names.len();
    Ok(VersionRow {
        key,
        values,
        audit_id: row.get(n)?,
        end_audit_id: row.get(n + 1)?,
        operation: row.get(n + 2)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
