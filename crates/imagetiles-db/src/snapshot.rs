//! Derived table shape.
//!
//! A [`SchemaSnapshot`] describes which tables, columns and indexes exist. It
//! can be produced two ways: by replaying ledger steps ([`SchemaSnapshot::from_ledger`])
//! or by reading the physical database ([`SchemaSnapshot::introspect`]).
//! Comparing the two is how out-of-band schema changes are detected.
//!
//! The replayed shape is cached in `schema_snapshot`, keyed by version and a
//! fingerprint of the ledger prefix, with a digest binding the stored payload
//! to that fingerprint. The cache is never authoritative: a row whose version,
//! fingerprint or digest disagrees is ignored and rewritten.

use std::collections::BTreeMap;

use imagetiles_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::migrations::{init_tracking_tables, ColumnDef, Migration, SchemaChange};

/// Tables owned by the migration machinery itself, never part of a shape.
const TRACKING_TABLES: &[&str] = &["schema_migrations", "schema_snapshot"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnShape {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

impl From<&ColumnDef> for ColumnShape {
    fn from(def: &ColumnDef) -> Self {
        Self {
            name: def.name.to_string(),
            sql_type: def.sql_type.as_sql().to_string(),
            not_null: def.not_null,
            primary_key: def.primary_key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShape {
    pub columns: Vec<ColumnShape>,
    /// CHECK expressions, whitespace-normalized and sorted.
    #[serde(default)]
    pub checks: Vec<String>,
}

impl TableShape {
    fn column(&self, name: &str) -> Option<&ColumnShape> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShape {
    pub table: String,
    pub columns: Vec<String>,
}

/// Tables and indexes, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub version: i64,
    pub tables: BTreeMap<String, TableShape>,
    pub indexes: BTreeMap<String, IndexShape>,
}

impl SchemaSnapshot {
    /// Replay every ledger step up to and including `version`.
    pub fn from_ledger(ledger: &[Migration], version: i64) -> Result<Self> {
        let mut snapshot = SchemaSnapshot::default();
        for migration in ledger.iter().take_while(|m| m.version <= version) {
            for change in migration.changes {
                snapshot.apply(migration, change)?;
            }
            snapshot.version = migration.version;
        }
        if snapshot.version != version {
            return Err(Error::conflict(format!(
                "ledger has no version {version} (latest is {})",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    fn apply(&mut self, migration: &Migration, change: &SchemaChange) -> Result<()> {
        let invalid = |msg: String| {
            Error::Internal(format!(
                "ledger step {} ({}): {msg}",
                migration.version, migration.name
            ))
        };

        match change {
            SchemaChange::CreateTable { table, columns } => {
                if self.tables.contains_key(*table) {
                    return Err(invalid(format!("table {table} already exists")));
                }
                let mut checks: Vec<String> = columns
                    .iter()
                    .filter_map(|c| c.check)
                    .map(normalize_sql)
                    .collect();
                checks.sort();
                let shape = TableShape {
                    columns: columns.iter().map(ColumnShape::from).collect(),
                    checks,
                };
                self.tables.insert(table.to_string(), shape);
            }
            SchemaChange::AddColumn { table, column } => {
                let shape = self
                    .tables
                    .get_mut(*table)
                    .ok_or_else(|| invalid(format!("table {table} does not exist")))?;
                if shape.column(column.name).is_some() {
                    return Err(invalid(format!("column {table}.{} already exists", column.name)));
                }
                shape.columns.push(ColumnShape::from(column));
                if let Some(expr) = column.check {
                    shape.checks.push(normalize_sql(expr));
                    shape.checks.sort();
                }
            }
            SchemaChange::CreateIndex {
                name,
                table,
                columns,
            } => {
                let shape = self
                    .tables
                    .get(*table)
                    .ok_or_else(|| invalid(format!("table {table} does not exist")))?;
                if let Some(missing) = columns.iter().find(|c| shape.column(c).is_none()) {
                    return Err(invalid(format!("index {name} names unknown column {missing}")));
                }
                if self.indexes.contains_key(*name) {
                    return Err(invalid(format!("index {name} already exists")));
                }
                self.indexes.insert(
                    name.to_string(),
                    IndexShape {
                        table: table.to_string(),
                        columns: columns.iter().map(|c| c.to_string()).collect(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Read the physical shape. `version` is left at 0; the physical database
    /// has no notion of it.
    pub fn introspect(conn: &Connection) -> Result<Self> {
        let mut snapshot = SchemaSnapshot::default();

        let mut tables = conn
            .prepare(
                "SELECT name, sql FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(Error::database)?;
        let found_tables = tables
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(Error::database)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::database)?;

        let mut columns = conn
            .prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
            )
            .map_err(Error::database)?;
        for (name, sql) in found_tables
            .into_iter()
            .filter(|(n, _)| !TRACKING_TABLES.contains(&n.as_str()))
        {
            let cols = columns
                .query_map([&name], |row| {
                    Ok(ColumnShape {
                        name: row.get(0)?,
                        sql_type: row.get::<_, String>(1)?.to_uppercase(),
                        not_null: row.get::<_, i64>(2)? != 0,
                        primary_key: row.get::<_, i64>(3)? != 0,
                    })
                })
                .map_err(Error::database)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::database)?;
            let checks = sql.as_deref().map(check_constraints).unwrap_or_default();
            snapshot.tables.insert(
                name,
                TableShape {
                    columns: cols,
                    checks,
                },
            );
        }

        // Automatic indexes (primary keys, UNIQUE) have no SQL and are implied
        // by the column definitions.
        let mut indexes = conn
            .prepare(
                "SELECT name, tbl_name FROM sqlite_master
                 WHERE type = 'index' AND sql IS NOT NULL
                 ORDER BY name",
            )
            .map_err(Error::database)?;
        let found = indexes
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(Error::database)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::database)?;

        let mut index_columns = conn
            .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
            .map_err(Error::database)?;
        for (name, table) in found {
            if TRACKING_TABLES.contains(&table.as_str()) {
                continue;
            }
            let cols = index_columns
                .query_map([&name], |row| row.get::<_, String>(0))
                .map_err(Error::database)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::database)?;
            snapshot.indexes.insert(name, IndexShape { table, columns: cols });
        }

        Ok(snapshot)
    }

    /// Human-readable differences between `self` (expected) and `actual`.
    /// Empty when the shapes match. Versions are not compared.
    pub fn diff(&self, actual: &SchemaSnapshot) -> Vec<String> {
        let mut out = Vec::new();

        for (name, expected) in &self.tables {
            let Some(found) = actual.tables.get(name) else {
                out.push(format!("table {name} is missing"));
                continue;
            };
            for col in &expected.columns {
                match found.column(&col.name) {
                    None => out.push(format!("column {name}.{} is missing", col.name)),
                    Some(c) if c != col => out.push(format!(
                        "column {name}.{} is {} (not null: {}, pk: {}), expected {} (not null: {}, pk: {})",
                        col.name,
                        c.sql_type,
                        c.not_null,
                        c.primary_key,
                        col.sql_type,
                        col.not_null,
                        col.primary_key
                    )),
                    Some(_) => {}
                }
            }
            for col in &found.columns {
                if expected.column(&col.name).is_none() {
                    out.push(format!("column {name}.{} is not in the ledger", col.name));
                }
            }
            for check in &expected.checks {
                if !found.checks.contains(check) {
                    out.push(format!("check ({check}) on {name} is missing"));
                }
            }
            for check in &found.checks {
                if !expected.checks.contains(check) {
                    out.push(format!("check ({check}) on {name} is not in the ledger"));
                }
            }
        }
        for name in actual.tables.keys() {
            if !self.tables.contains_key(name) {
                out.push(format!("table {name} is not in the ledger"));
            }
        }

        for (name, expected) in &self.indexes {
            match actual.indexes.get(name) {
                None => out.push(format!("index {name} is missing")),
                Some(found) if found != expected => out.push(format!(
                    "index {name} covers {}({}), expected {}({})",
                    found.table,
                    found.columns.join(", "),
                    expected.table,
                    expected.columns.join(", ")
                )),
                Some(_) => {}
            }
        }
        for name in actual.indexes.keys() {
            if !self.indexes.contains_key(name) {
                out.push(format!("index {name} is not in the ledger"));
            }
        }

        out
    }
}

/// Collapse whitespace runs so rendered and stored SQL compare equal.
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Every `CHECK (...)` expression in a `CREATE TABLE` statement, sorted.
fn check_constraints(sql: &str) -> Vec<String> {
    let upper = sql.to_ascii_uppercase();
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut from = 0;

    while let Some(pos) = upper[from..].find("CHECK") {
        let start = from + pos;
        from = start + "CHECK".len();
        if start > 0 && is_ident_byte(bytes[start - 1]) {
            continue;
        }
        if bytes.get(from).copied().is_some_and(is_ident_byte) {
            continue;
        }
        let rest = sql[from..].trim_start();
        if !rest.starts_with('(') {
            continue;
        }
        let open = sql.len() - rest.len();
        let mut depth = 0usize;
        for (i, c) in sql[open..].char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        out.push(normalize_sql(&sql[open + 1..open + i]));
                        from = open + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    out.sort();
    out
}

/// SHA-256 binding a serialized shape to the ledger fingerprint it was
/// derived from.
pub fn shape_digest(fingerprint: &str, shape: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update([0u8]);
    hasher.update(shape.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 over the rendered DDL of every step up to `version`.
pub fn ledger_fingerprint(ledger: &[Migration], version: i64) -> String {
    let mut hasher = Sha256::new();
    for migration in ledger.iter().take_while(|m| m.version <= version) {
        hasher.update(migration.version.to_le_bytes());
        hasher.update(migration.name.as_bytes());
        hasher.update(migration.sql().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Cached shape for `version`, if the cache row matches version and
/// fingerprint and its payload still matches the stored digest.
pub fn load_cached(conn: &Connection, version: i64, fingerprint: &str) -> Result<Option<SchemaSnapshot>> {
    let row: Option<(i64, String, String, String)> = conn
        .query_row(
            "SELECT version, fingerprint, shape, shape_digest FROM schema_snapshot WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(Error::database)?;

    let Some((cached_version, cached_fingerprint, shape, digest)) = row else {
        return Ok(None);
    };
    if cached_version != version || cached_fingerprint != fingerprint {
        return Ok(None);
    }
    if digest != shape_digest(fingerprint, &shape) {
        tracing::warn!(version, "schema snapshot cache payload was modified, discarding");
        return Ok(None);
    }
    match serde_json::from_str::<SchemaSnapshot>(&shape) {
        Ok(snapshot) if snapshot.version == version => Ok(Some(snapshot)),
        Ok(_) => Ok(None),
        Err(e) => {
            tracing::warn!(error = %e, "discarding unreadable schema snapshot cache");
            Ok(None)
        }
    }
}

/// Overwrite the cache row.
pub fn store_cached(conn: &Connection, snapshot: &SchemaSnapshot, fingerprint: &str) -> Result<()> {
    let shape = serde_json::to_string(snapshot)
        .map_err(|e| Error::Internal(format!("failed to serialize schema snapshot: {e}")))?;
    conn.execute(
        "INSERT INTO schema_snapshot (id, version, fingerprint, shape, shape_digest, generated_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             version = excluded.version,
             fingerprint = excluded.fingerprint,
             shape = excluded.shape,
             shape_digest = excluded.shape_digest,
             generated_at = excluded.generated_at",
        rusqlite::params![
            snapshot.version,
            fingerprint,
            shape,
            shape_digest(fingerprint, &shape),
            chrono::Utc::now().to_rfc3339()
        ],
    )
    .map_err(Error::database)?;
    Ok(())
}

/// The shape the ledger produces at `version`, served from the cache when
/// valid and regenerated (and re-cached) otherwise.
pub fn expected_snapshot(conn: &Connection, ledger: &[Migration], version: i64) -> Result<SchemaSnapshot> {
    let fingerprint = ledger_fingerprint(ledger, version);
    if let Some(snapshot) = load_cached(conn, version, &fingerprint)? {
        tracing::debug!(version, "schema snapshot cache hit");
        return Ok(snapshot);
    }
    tracing::debug!(version, "schema snapshot cache miss, replaying ledger");
    let snapshot = SchemaSnapshot::from_ledger(ledger, version)?;
    store_cached(conn, &snapshot, &fingerprint)?;
    Ok(snapshot)
}

/// Rebuild the cache from the ledger at the recorded version, ignoring any
/// existing cache row.
pub fn regenerate_snapshot(conn: &Connection, ledger: &[Migration]) -> Result<SchemaSnapshot> {
    init_tracking_tables(conn)?;
    let version = crate::migrations::current_version(conn)?;
    let snapshot = SchemaSnapshot::from_ledger(ledger, version)?;
    store_cached(conn, &snapshot, &ledger_fingerprint(ledger, version))?;
    tracing::info!(version, "regenerated schema snapshot");
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{run_migrations, IMAGE_FILES_TABLE, MIGRATIONS};

    #[test]
    fn from_ledger_matches_migrated_database() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let expected = SchemaSnapshot::from_ledger(MIGRATIONS, 2).unwrap();
        let actual = SchemaSnapshot::introspect(&conn).unwrap();
        assert!(expected.diff(&actual).is_empty(), "{:?}", expected.diff(&actual));
    }

    #[test]
    fn from_ledger_partial_version() {
        let snapshot = SchemaSnapshot::from_ledger(MIGRATIONS, 1).unwrap();
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.tables.contains_key(IMAGE_FILES_TABLE));
        assert!(snapshot.indexes.is_empty());

        let empty = SchemaSnapshot::from_ledger(MIGRATIONS, 0).unwrap();
        assert!(empty.tables.is_empty());
    }

    #[test]
    fn from_ledger_unknown_version() {
        assert!(SchemaSnapshot::from_ledger(MIGRATIONS, 42).is_err());
    }

    #[test]
    fn image_files_columns() {
        let snapshot = SchemaSnapshot::from_ledger(MIGRATIONS, 1).unwrap();
        let table = &snapshot.tables[IMAGE_FILES_TABLE];
        let id = table.column("id").unwrap();
        assert!(id.primary_key && id.not_null);
        assert!(!table.column("description").unwrap().not_null);
        assert_eq!(table.column("width").unwrap().sql_type, "INTEGER");
    }

    #[test]
    fn ledger_and_database_agree_on_checks() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let expected = SchemaSnapshot::from_ledger(MIGRATIONS, 2).unwrap();
        assert_eq!(
            expected.tables[IMAGE_FILES_TABLE].checks,
            vec![
                "length(filename) BETWEEN 1 AND 50".to_string(),
                "length(project) > 0".to_string(),
            ]
        );
        let actual = SchemaSnapshot::introspect(&conn).unwrap();
        assert_eq!(actual.tables[IMAGE_FILES_TABLE].checks, expected.tables[IMAGE_FILES_TABLE].checks);
    }

    #[test]
    fn check_constraints_skips_lookalike_names() {
        let sql = "CREATE TABLE t (checksum TEXT, a INTEGER CHECK ( a  >  (1 + 1) ), b TEXT check(b <> ''))";
        assert_eq!(check_constraints(sql), vec!["a > (1 + 1)", "b <> ''"]);
    }

    #[test]
    fn diff_reports_dropped_check() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "DROP INDEX idx_image_files_project;
             DROP TABLE image_files;
             CREATE TABLE image_files (
                 id TEXT PRIMARY KEY NOT NULL,
                 description TEXT,
                 filename TEXT NOT NULL,
                 height INTEGER NOT NULL,
                 project TEXT NOT NULL CHECK (length(project) > 0),
                 width INTEGER NOT NULL
             );
             CREATE INDEX idx_image_files_project ON image_files(project, id);",
        )
        .unwrap();

        let expected = SchemaSnapshot::from_ledger(MIGRATIONS, 2).unwrap();
        let diff = expected.diff(&SchemaSnapshot::introspect(&conn).unwrap());
        assert_eq!(
            diff,
            vec!["check (length(filename) BETWEEN 1 AND 50) on image_files is missing".to_string()]
        );
    }

    #[test]
    fn introspect_ignores_tracking_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_tracking_tables(&conn).unwrap();
        let snapshot = SchemaSnapshot::introspect(&conn).unwrap();
        assert!(snapshot.tables.is_empty());
        assert!(snapshot.indexes.is_empty());
    }

    #[test]
    fn diff_reports_dropped_column() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute_batch("ALTER TABLE image_files DROP COLUMN description;")
            .unwrap();

        let expected = SchemaSnapshot::from_ledger(MIGRATIONS, 2).unwrap();
        let diff = expected.diff(&SchemaSnapshot::introspect(&conn).unwrap());
        assert_eq!(diff, vec!["column image_files.description is missing".to_string()]);
    }

    #[test]
    fn diff_reports_extra_objects() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "ALTER TABLE image_files ADD COLUMN checksum TEXT;
             CREATE TABLE scratch (x INTEGER);",
        )
        .unwrap();

        let expected = SchemaSnapshot::from_ledger(MIGRATIONS, 2).unwrap();
        let diff = expected.diff(&SchemaSnapshot::introspect(&conn).unwrap());
        assert!(diff.contains(&"column image_files.checksum is not in the ledger".to_string()));
        assert!(diff.contains(&"table scratch is not in the ledger".to_string()));
    }

    #[test]
    fn fingerprint_depends_on_prefix() {
        let one = ledger_fingerprint(MIGRATIONS, 1);
        let two = ledger_fingerprint(MIGRATIONS, 2);
        assert_ne!(one, two);
        assert_eq!(one, ledger_fingerprint(&MIGRATIONS[..1], 1));
        assert_eq!(one.len(), 64);
    }

    #[test]
    fn cache_round_trip_and_invalidation() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let fingerprint = ledger_fingerprint(MIGRATIONS, 2);
        let cached = load_cached(&conn, 2, &fingerprint).unwrap();
        assert_eq!(cached, Some(SchemaSnapshot::from_ledger(MIGRATIONS, 2).unwrap()));

        assert_eq!(load_cached(&conn, 2, "stale").unwrap(), None);
        assert_eq!(load_cached(&conn, 1, &fingerprint).unwrap(), None);
    }

    #[test]
    fn hand_edited_cache_is_replaced() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute("UPDATE schema_snapshot SET shape = '{garbage'", [])
            .unwrap();

        let fingerprint = ledger_fingerprint(MIGRATIONS, 2);
        assert_eq!(load_cached(&conn, 2, &fingerprint).unwrap(), None);

        let snapshot = regenerate_snapshot(&conn, MIGRATIONS).unwrap();
        assert_eq!(load_cached(&conn, 2, &fingerprint).unwrap(), Some(snapshot));
    }

    #[test]
    fn well_formed_edited_cache_is_replaced() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute_batch("DROP INDEX idx_image_files_project;").unwrap();

        // Rewrite the cached shape to match the tampered database.
        let mut edited = SchemaSnapshot::from_ledger(MIGRATIONS, 2).unwrap();
        edited.indexes.clear();
        conn.execute(
            "UPDATE schema_snapshot SET shape = ?1",
            [serde_json::to_string(&edited).unwrap()],
        )
        .unwrap();

        let fingerprint = ledger_fingerprint(MIGRATIONS, 2);
        assert_eq!(load_cached(&conn, 2, &fingerprint).unwrap(), None);

        let err = run_migrations(&conn).unwrap_err();
        match err {
            Error::MigrationConflict(msg) => assert!(msg.contains("idx_image_files_project")),
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
