//! Read-only access to arbitrary-schema SQLite files found inside an archive.
//!
//! Source databases are opened read-only and never migrated. Rows come back
//! as JSON payloads keyed by lowercased column name (plus `_rowid_`), which
//! is what the normalizer's candidate-field lookups operate on.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};

/// One row of a source table, keyed by lowercased column name.
pub type RowPayload = Map<String, Value>;

pub fn open_readonly(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )
    .with_context(|| format!("failed to open source database {}", path.display()))
}

/// List user tables (everything not reserved by the engine) with their
/// column names.
pub fn user_tables(conn: &Connection) -> Result<Vec<(String, Vec<String>)>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(&name)))?;
        let columns: Vec<String> = info
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        tables.push((name, columns));
    }
    Ok(tables)
}

/// Fetch every row of a table as a payload map. The rowid is aliased in as
/// `_rowid_` so derived identifiers stay stable across re-ingestions.
pub fn read_rows(conn: &Connection, table: &str) -> Result<Vec<RowPayload>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT rowid AS _rowid_, * FROM {}",
        quote_identifier(table)
    ))?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| name.to_lowercase())
        .collect();

    let mut rows = stmt.query([])?;
    let mut payloads = Vec::new();
    while let Some(row) = rows.next()? {
        let mut payload = Map::new();
        for (index, name) in column_names.iter().enumerate() {
            payload.insert(name.clone(), cell_to_json(row.get_ref(index)?));
        }
        payloads.push(payload);
    }
    Ok(payloads)
}

fn cell_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sms (address TEXT, date INTEGER, body TEXT);
             INSERT INTO sms VALUES ('+15550001', 1700000000, 'hello');
             INSERT INTO sms VALUES (NULL, NULL, NULL);
             CREATE TABLE attachments (data BLOB);
             INSERT INTO attachments VALUES (x'DEADBEEF');",
        )
        .unwrap();
    }

    #[test]
    fn lists_user_tables_with_columns() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("sms.db");
        sample_db(&db_path);

        let conn = open_readonly(&db_path).unwrap();
        let mut tables = user_tables(&conn).unwrap();
        tables.sort();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[1].0, "sms");
        assert_eq!(tables[1].1, vec!["address", "date", "body"]);
    }

    #[test]
    fn rows_carry_lowercased_keys_and_rowid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("sms.db");
        sample_db(&db_path);

        let conn = open_readonly(&db_path).unwrap();
        let rows = read_rows(&conn, "sms").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["_rowid_"], Value::from(1));
        assert_eq!(rows[0]["body"], Value::from("hello"));
        assert_eq!(rows[1]["body"], Value::Null);
    }

    #[test]
    fn blobs_are_hex_encoded() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("sms.db");
        sample_db(&db_path);

        let conn = open_readonly(&db_path).unwrap();
        let rows = read_rows(&conn, "attachments").unwrap();
        assert_eq!(rows[0]["data"], Value::from("deadbeef"));
    }

    #[test]
    fn readonly_open_rejects_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(open_readonly(&tmp.path().join("absent.db")).is_err());
    }
}
