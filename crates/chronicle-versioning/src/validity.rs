//! Validity interval repair and verification.
//!
//! Every version row covers the half-open interval `[audit_id,
//! end_audit_id)`. For one entity key the rows ordered by `audit_id` form a
//! chain in which each row ends where the next begins and the last row is
//! open. The write path keeps this true incrementally
//! ([`VersionRepo::close_previous`](crate::sqlite::repositories::VersionRepo::close_previous));
//! [`update_end_tx_column`] rebuilds it from scratch for tables that were
//! populated without it, or whose end markers cannot be trusted.

use chronicle_settings::VersioningSettings;
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;
use tracing::{debug, info};

use chronicle_core::EntityKey;

use crate::errors::{Result, VersioningError};
use crate::schema::{quote_ident, table_info};

/// Names of the audit columns on a version table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidityColumns {
    /// Creating-audit column.
    pub audit_id: String,
    /// Superseding-audit column.
    pub end_audit_id: String,
}

impl Default for ValidityColumns {
    fn default() -> Self {
        Self::from(&VersioningSettings::default())
    }
}

impl From<&VersioningSettings> for ValidityColumns {
    fn from(settings: &VersioningSettings) -> Self {
        Self {
            audit_id: settings.audit_id_column.clone(),
            end_audit_id: settings.end_audit_id_column.clone(),
        }
    }
}

/// Outcome of a batch repair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Version table name.
    pub table: String,
    /// Rows read.
    pub rows_scanned: usize,
    /// Distinct entity keys.
    pub chains: usize,
    /// Rows whose end marker was rewritten.
    pub rows_changed: usize,
}

/// A row whose end marker disagrees with its chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChainViolation {
    /// Rendered entity key.
    pub key: String,
    /// The row's audit id.
    pub audit_id: i64,
    /// End marker the chain implies.
    pub expected: Option<i64>,
    /// End marker stored.
    pub found: Option<i64>,
}

/// Recompute every end marker of `version_table` using the default column
/// names. See [`update_end_tx_column_with`].
pub fn update_end_tx_column(conn: &Connection, version_table: &str) -> Result<RepairReport> {
    update_end_tx_column_with(conn, version_table, &ValidityColumns::default())
}

/// Recompute every end marker of `version_table`.
///
/// Rows are grouped by entity key (the table's primary key minus the
/// audit column) and ordered by audit id; each row's end becomes the next
/// row's audit id and the last row's end becomes null. Existing values are
/// overwritten. Running it twice changes nothing the second time.
///
/// Runs inside the caller's transaction when one is open on `conn`,
/// otherwise inside its own.
///
/// # Errors
///
/// - [`VersioningError::Schema`] if the table, its end column, or its key
///   columns cannot be found.
/// - [`VersioningError::ValidityConflict`] if one key has two rows with the
///   same audit id. Nothing is written in that case.
pub fn update_end_tx_column_with(
    conn: &Connection,
    version_table: &str,
    columns: &ValidityColumns,
) -> Result<RepairReport> {
    let layout = ChainLayout::discover(conn, version_table, columns)?;

    let own_tx = if conn.is_autocommit() {
        Some(conn.unchecked_transaction()?)
    } else {
        debug!(table = version_table, "repairing inside caller's transaction");
        None
    };

    let chains = layout.load(conn)?;
    let rows_scanned = chains.iter().map(|c| c.rows.len()).sum();

    // Plan every chain before the first write so a conflict leaves the
    // table untouched.
    let mut updates: Vec<(&Chain, i64, Option<i64>)> = Vec::new();
    for chain in &chains {
        let ends = chain.expected_ends(&layout)?;
        for (&(audit_id, found), expected) in chain.rows.iter().zip(ends) {
            if found != expected {
                updates.push((chain, audit_id, expected));
            }
        }
    }

    let mut rows_changed = 0;
    if !updates.is_empty() {
        let n = layout.key_columns.len();
        let mut stmt = conn.prepare(&format!(
            "UPDATE {t} SET {end} = ?1 WHERE {pred} AND {aid} = ?{last}",
            t = quote_ident(&layout.table),
            end = quote_ident(&layout.end_audit_id),
            pred = layout.key_predicate(2),
            aid = quote_ident(&layout.audit_id),
            last = n + 2,
        ))?;
        for (chain, audit_id, end) in &updates {
            let mut params = Vec::with_capacity(n + 2);
            params.push(end.map_or(Value::Null, Value::Integer));
            params.extend(chain.key.iter().cloned());
            params.push(Value::Integer(*audit_id));
            rows_changed += stmt.execute(params_from_iter(params.iter()))?;
        }
    }

    if let Some(tx) = own_tx {
        tx.commit()?;
    }

    let report = RepairReport {
        table: layout.table.clone(),
        rows_scanned,
        chains: chains.len(),
        rows_changed,
    };
    info!(
        table = %report.table,
        rows = report.rows_scanned,
        chains = report.chains,
        changed = report.rows_changed,
        "end markers repaired"
    );
    Ok(report)
}

/// List rows whose end marker disagrees with their chain, without writing.
///
/// # Errors
///
/// Same as [`update_end_tx_column_with`].
pub fn verify_chains(
    conn: &Connection,
    version_table: &str,
    columns: &ValidityColumns,
) -> Result<Vec<ChainViolation>> {
    let layout = ChainLayout::discover(conn, version_table, columns)?;
    let mut violations = Vec::new();
    for chain in layout.load(conn)? {
        let ends = chain.expected_ends(&layout)?;
        for (&(audit_id, found), expected) in chain.rows.iter().zip(ends) {
            if found != expected {
                violations.push(ChainViolation {
                    key: render_key(&chain.key),
                    audit_id,
                    expected,
                    found,
                });
            }
        }
    }
    Ok(violations)
}

/// End markers for a chain of audit ids sorted ascending: each row ends at
/// its successor, the last is open.
pub fn chain_ends(audit_ids: &[i64]) -> Vec<Option<i64>> {
    (0..audit_ids.len())
        .map(|i| audit_ids.get(i + 1).copied())
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal
// ─────────────────────────────────────────────────────────────────────────────

struct ChainLayout {
    table: String,
    key_columns: Vec<String>,
    audit_id: String,
    end_audit_id: String,
}

struct Chain {
    key: Vec<Value>,
    /// `(audit_id, stored end)` sorted by audit id.
    rows: Vec<(i64, Option<i64>)>,
}

impl ChainLayout {
    fn discover(conn: &Connection, table: &str, columns: &ValidityColumns) -> Result<Self> {
        let mut info = table_info(conn, table)?;
        if info.is_empty() {
            return Err(VersioningError::Schema(format!("table '{table}' not found")));
        }
        for required in [&columns.audit_id, &columns.end_audit_id] {
            if !info.iter().any(|c| &c.name == required) {
                return Err(VersioningError::Schema(format!(
                    "table '{table}' has no column '{required}'"
                )));
            }
        }
        info.retain(|c| c.pk > 0 && c.name != columns.audit_id && c.name != columns.end_audit_id);
        info.sort_by_key(|c| c.pk);
        if info.is_empty() {
            return Err(VersioningError::Schema(format!(
                "table '{table}' has no entity key columns in its primary key"
            )));
        }
        Ok(Self {
            table: table.to_string(),
            key_columns: info.into_iter().map(|c| c.name).collect(),
            audit_id: columns.audit_id.clone(),
            end_audit_id: columns.end_audit_id.clone(),
        })
    }

    fn key_predicate(&self, first: usize) -> String {
        self.key_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} IS ?{}", quote_ident(c), first + i))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn load(&self, conn: &Connection) -> Result<Vec<Chain>> {
        let keys: Vec<String> = self.key_columns.iter().map(|c| quote_ident(c)).collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT {keys}, {aid}, {end} FROM {t} ORDER BY {keys}, {aid}",
            keys = keys.join(", "),
            aid = quote_ident(&self.audit_id),
            end = quote_ident(&self.end_audit_id),
            t = quote_ident(&self.table),
        ))?;
        let n = self.key_columns.len();
        let mut rows = stmt.query([])?;
        let mut chains: Vec<Chain> = Vec::new();
        while let Some(row) = rows.next()? {
            let key = (0..n)
                .map(|i| row.get::<_, Value>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let audit_id: i64 = row.get(n)?;
            let end: Option<i64> = row.get(n + 1)?;
            match chains.last_mut() {
                Some(chain) if chain.key == key => chain.rows.push((audit_id, end)),
                _ => chains.push(Chain {
                    key,
                    rows: vec![(audit_id, end)],
                }),
            }
        }
        Ok(chains)
    }
}

impl Chain {
    fn expected_ends(&self, layout: &ChainLayout) -> Result<Vec<Option<i64>>> {
        let audit_ids: Vec<i64> = self.rows.iter().map(|(a, _)| *a).collect();
        if let Some(pair) = audit_ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(VersioningError::ValidityConflict {
                table: layout.table.clone(),
                key: render_key(&self.key),
                audit_id: pair[0],
            });
        }
        Ok(chain_ends(&audit_ids))
    }
}

fn render_key(values: &[Value]) -> String {
    EntityKey::from_values(values).map_or_else(|_| format!("{values:?}"), |k| k.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Version table without foreign keys so rows can be planted directly.
    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE article_version (
               id INTEGER NOT NULL,
               name TEXT,
               audit_id INTEGER NOT NULL,
               end_audit_id INTEGER,
               operation_type SMALLINT NOT NULL,
               PRIMARY KEY (id, audit_id)
             );",
        )
        .unwrap();
        conn
    }

    fn plant(conn: &Connection, id: i64, audit_id: i64, end: Option<i64>) {
        conn.execute(
            "INSERT INTO article_version (id, name, audit_id, end_audit_id, operation_type)
             VALUES (?1, 'x', ?2, ?3, 1)",
            rusqlite::params![id, audit_id, end],
        )
        .unwrap();
    }

    fn ends(conn: &Connection) -> Vec<(i64, i64, Option<i64>)> {
        conn.prepare("SELECT id, audit_id, end_audit_id FROM article_version ORDER BY audit_id")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn chain_ends_basic() {
        assert_eq!(chain_ends(&[1, 2, 4]), vec![Some(2), Some(4), None]);
        assert_eq!(chain_ends(&[7]), vec![None]);
        assert!(chain_ends(&[]).is_empty());
    }

    #[test]
    fn repair_interleaved_chains() {
        let conn = setup();
        plant(&conn, 1, 1, None);
        plant(&conn, 1, 2, None);
        plant(&conn, 2, 3, None);
        plant(&conn, 1, 4, None);
        plant(&conn, 2, 5, None);

        let report = update_end_tx_column(&conn, "article_version").unwrap();
        assert_eq!(report.rows_scanned, 5);
        assert_eq!(report.chains, 2);
        assert_eq!(report.rows_changed, 3);
        assert_eq!(
            ends(&conn),
            vec![
                (1, 1, Some(2)),
                (1, 2, Some(4)),
                (2, 3, Some(5)),
                (1, 4, None),
                (2, 5, None),
            ]
        );
    }

    #[test]
    fn repair_overwrites_stale_values() {
        let conn = setup();
        plant(&conn, 1, 1, Some(9));
        plant(&conn, 1, 3, Some(1));
        let report = update_end_tx_column(&conn, "article_version").unwrap();
        assert_eq!(report.rows_changed, 2);
        assert_eq!(ends(&conn), vec![(1, 1, Some(3)), (1, 3, None)]);
    }

    #[test]
    fn repair_is_idempotent() {
        let conn = setup();
        plant(&conn, 1, 1, None);
        plant(&conn, 1, 2, None);
        update_end_tx_column(&conn, "article_version").unwrap();
        let before = ends(&conn);
        let second = update_end_tx_column(&conn, "article_version").unwrap();
        assert_eq!(second.rows_changed, 0);
        assert_eq!(ends(&conn), before);
    }

    #[test]
    fn duplicate_audit_rejected_before_writes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE loose_version (
               id INTEGER NOT NULL,
               audit_id INTEGER NOT NULL,
               end_audit_id INTEGER,
               PRIMARY KEY (id, audit_id, end_audit_id)
             );
             INSERT INTO loose_version VALUES (1, 1, NULL), (1, 2, NULL), (1, 2, 7);
             INSERT INTO loose_version VALUES (2, 1, NULL), (2, 5, NULL);",
        )
        .unwrap();

        let err = update_end_tx_column(&conn, "loose_version").unwrap_err();
        assert_matches!(
            err,
            VersioningError::ValidityConflict { ref table, audit_id: 2, .. } if table == "loose_version"
        );
        let untouched: Option<i64> = conn
            .query_row(
                "SELECT end_audit_id FROM loose_version WHERE id = 2 AND audit_id = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(untouched, None);
    }

    #[test]
    fn runs_inside_open_transaction() {
        let conn = setup();
        plant(&conn, 1, 1, None);
        plant(&conn, 1, 2, None);

        conn.execute_batch("BEGIN").unwrap();
        update_end_tx_column(&conn, "article_version").unwrap();
        assert!(!conn.is_autocommit());
        conn.execute_batch("ROLLBACK").unwrap();

        assert_eq!(ends(&conn), vec![(1, 1, None), (1, 2, None)]);
    }

    #[test]
    fn composite_keys_group_correctly() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE translation_version (
               id INTEGER NOT NULL,
               lang TEXT NOT NULL,
               audit_id INTEGER NOT NULL,
               end_audit_id INTEGER,
               PRIMARY KEY (id, lang, audit_id)
             );
             INSERT INTO translation_version VALUES (1, 'en', 1, NULL), (1, 'fi', 2, NULL), (1, 'en', 3, NULL);",
        )
        .unwrap();
        let report = update_end_tx_column(&conn, "translation_version").unwrap();
        assert_eq!(report.chains, 2);
        assert_eq!(report.rows_changed, 1);
    }

    #[test]
    fn null_key_parts_are_repaired_and_counted() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE page_version (
               id INTEGER,
               lang TEXT,
               audit_id INTEGER NOT NULL,
               end_audit_id INTEGER,
               PRIMARY KEY (id, lang, audit_id)
             );
             INSERT INTO page_version VALUES (1, NULL, 1, NULL), (1, NULL, 2, NULL), (1, 'en', 3, NULL);",
        )
        .unwrap();

        let report = update_end_tx_column(&conn, "page_version").unwrap();
        assert_eq!(report.chains, 2);
        assert_eq!(report.rows_changed, 1);
        let closed: Option<i64> = conn
            .query_row(
                "SELECT end_audit_id FROM page_version WHERE lang IS NULL AND audit_id = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(closed, Some(2));
        assert_eq!(update_end_tx_column(&conn, "page_version").unwrap().rows_changed, 0);
    }

    #[test]
    fn missing_table_and_columns() {
        let conn = setup();
        assert_matches!(
            update_end_tx_column(&conn, "nope_version"),
            Err(VersioningError::Schema(msg)) if msg.contains("not found")
        );

        conn.execute_batch("CREATE TABLE plain_version (id INTEGER, audit_id INTEGER, PRIMARY KEY (id, audit_id));")
            .unwrap();
        assert_matches!(
            update_end_tx_column(&conn, "plain_version"),
            Err(VersioningError::Schema(msg)) if msg.contains("end_audit_id")
        );
    }

    #[test]
    fn verify_reports_without_writing() {
        let conn = setup();
        plant(&conn, 1, 1, None);
        plant(&conn, 1, 2, None);
        let violations =
            verify_chains(&conn, "article_version", &ValidityColumns::default()).unwrap();
        assert_eq!(
            violations,
            vec![ChainViolation {
                key: "(1)".into(),
                audit_id: 1,
                expected: Some(2),
                found: None,
            }]
        );
        assert_eq!(ends(&conn)[0].2, None);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chain_ends_link_successors(mut ids in proptest::collection::btree_set(1i64..1000, 1..32)
                .prop_map(|s| s.into_iter().collect::<Vec<_>>()))
            {
                ids.sort_unstable();
                let ends = chain_ends(&ids);
                prop_assert_eq!(ends.len(), ids.len());
                prop_assert_eq!(ends[ends.len() - 1], None);
                for i in 0..ids.len() - 1 {
                    prop_assert_eq!(ends[i], Some(ids[i + 1]));
                    prop_assert!(ids[i] < ends[i].unwrap());
                }
            }

            #[test]
            fn repair_establishes_chain_invariant(
                rows in proptest::collection::btree_map((1i64..4, 1i64..40), proptest::option::of(1i64..40), 1..40)
            ) {
                let conn = setup();
                for (&(id, audit), &end) in &rows {
                    plant(&conn, id, audit, end);
                }
                update_end_tx_column(&conn, "article_version").unwrap();
                prop_assert!(verify_chains(&conn, "article_version", &ValidityColumns::default())
                    .unwrap()
                    .is_empty());
                let again = update_end_tx_column(&conn, "article_version").unwrap();
                prop_assert_eq!(again.rows_changed, 0);
            }
        }
    }
}
