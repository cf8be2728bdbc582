//! Schema ledger and migration runner.
//!
//! The ledger is an ordered, append-only list of [`Migration`]s. Each one is a
//! structural description ([`SchemaChange`]) rather than raw SQL, so the same
//! entry can both render its DDL and be replayed onto a [`SchemaSnapshot`].
//! Shipped entries are never edited or reordered; new ones are appended.
//!
//! A `schema_migrations` table records which versions have been applied. Each
//! step and its marker row commit in a single transaction.

use std::fmt::Write as _;

use chrono::NaiveDateTime;
use imagetiles_common::{Error, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;

use crate::snapshot::{self, SchemaSnapshot};

// ---------------------------------------------------------------------------
// ledger types
// ---------------------------------------------------------------------------

/// Declared SQLite column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
        }
    }
}

/// One column as declared by a ledger step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub not_null: bool,
    pub primary_key: bool,
    pub check: Option<&'static str>,
}

impl ColumnDef {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            sql_type: SqlType::Text,
            not_null: false,
            primary_key: false,
            check: None,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            sql_type: SqlType::Integer,
            not_null: false,
            primary_key: false,
            check: None,
        }
    }

    pub const fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Primary key columns are always NOT NULL.
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    pub const fn check(mut self, expr: &'static str) -> Self {
        self.check = Some(expr);
        self
    }

    fn to_sql(self) -> String {
        let mut sql = format!("{} {}", self.name, self.sql_type.as_sql());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(expr) = self.check {
            let _ = write!(sql, " CHECK ({expr})");
        }
        sql
    }
}

/// A structural change made by one ledger step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    CreateTable {
        table: &'static str,
        columns: &'static [ColumnDef],
    },
    AddColumn {
        table: &'static str,
        column: ColumnDef,
    },
    CreateIndex {
        name: &'static str,
        table: &'static str,
        columns: &'static [&'static str],
    },
}

impl SchemaChange {
    /// Render the DDL for this change.
    pub fn to_sql(&self) -> String {
        match self {
            SchemaChange::CreateTable { table, columns } => {
                let cols: Vec<String> = columns.iter().map(|c| format!("    {}", c.to_sql())).collect();
                format!("CREATE TABLE {table} (\n{}\n);", cols.join(",\n"))
            }
            SchemaChange::AddColumn { table, column } => {
                format!("ALTER TABLE {table} ADD COLUMN {};", column.to_sql())
            }
            SchemaChange::CreateIndex {
                name,
                table,
                columns,
            } => format!("CREATE INDEX {name} ON {table}({});", columns.join(", ")),
        }
    }
}

/// A single ledger step.
#[derive(Debug)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub changes: &'static [SchemaChange],
}

impl Migration {
    /// Full DDL for this step.
    pub fn sql(&self) -> String {
        self.changes
            .iter()
            .map(SchemaChange::to_sql)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// the shipped ledger
// ---------------------------------------------------------------------------

/// Table holding image file metadata.
pub const IMAGE_FILES_TABLE: &str = "image_files";

const IMAGE_FILES_COLUMNS: &[ColumnDef] = &[
    ColumnDef::text("id").primary_key(),
    ColumnDef::text("description"),
    ColumnDef::text("filename")
        .not_null()
        .check("length(filename) BETWEEN 1 AND 50"),
    ColumnDef::integer("height").not_null(),
    ColumnDef::text("project")
        .not_null()
        .check("length(project) > 0"),
    ColumnDef::integer("width").not_null(),
];

/// V1: image file metadata table.
const V1_CREATE_IMAGE_FILES: &[SchemaChange] = &[SchemaChange::CreateTable {
    table: IMAGE_FILES_TABLE,
    columns: IMAGE_FILES_COLUMNS,
}];

/// V2: index backing per-project listing.
const V2_INDEX_PROJECT: &[SchemaChange] = &[SchemaChange::CreateIndex {
    name: "idx_image_files_project",
    table: IMAGE_FILES_TABLE,
    columns: &["project", "id"],
}];

/// All shipped migrations, in application order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_image_files",
        changes: V1_CREATE_IMAGE_FILES,
    },
    Migration {
        version: 2,
        name: "index_image_files_project",
        changes: V2_INDEX_PROJECT,
    },
];

// ---------------------------------------------------------------------------
// runner
// ---------------------------------------------------------------------------

/// A marker row from `schema_migrations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: Option<NaiveDateTime>,
}

/// Outcome of one migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub previous_version: i64,
    pub current_version: i64,
    /// Versions applied by this run, in order. Empty for a no-op run.
    pub applied: Vec<i64>,
}

/// Applies a ledger to a connection.
#[derive(Debug, Clone, Copy)]
pub struct Migrator<'a> {
    ledger: &'a [Migration],
}

impl Default for Migrator<'static> {
    fn default() -> Self {
        Self { ledger: MIGRATIONS }
    }
}

impl<'a> Migrator<'a> {
    pub fn new(ledger: &'a [Migration]) -> Self {
        Self { ledger }
    }

    /// Latest version in the ledger, 0 for an empty ledger.
    pub fn latest_version(&self) -> i64 {
        self.ledger.last().map(|m| m.version).unwrap_or(0)
    }

    /// Apply all pending steps.
    pub fn run(&self, conn: &Connection) -> Result<MigrationReport> {
        self.run_observed(conn, |_| {})
    }

    /// Apply all pending steps, calling `on_step` before each one starts.
    ///
    /// Before anything is applied the markers must be a prefix of the ledger
    /// and the physical shape must equal the shape the ledger produces at the
    /// recorded version. Any disagreement is a [`Error::MigrationConflict`].
    pub fn run_observed(
        &self,
        conn: &Connection,
        mut on_step: impl FnMut(&Migration),
    ) -> Result<MigrationReport> {
        validate_ledger(self.ledger)?;
        init_tracking_tables(conn)?;

        let applied = applied_migrations(conn)?;
        let previous_version = self.check_markers(&applied)?;
        self.verify_shape(conn, previous_version)?;

        let pending: Vec<&Migration> = self
            .ledger
            .iter()
            .filter(|m| m.version > previous_version)
            .collect();

        if pending.is_empty() {
            tracing::debug!(version = previous_version, "schema is current");
            return Ok(MigrationReport {
                previous_version,
                current_version: previous_version,
                applied: Vec::new(),
            });
        }

        let mut report = MigrationReport {
            previous_version,
            current_version: previous_version,
            applied: Vec::with_capacity(pending.len()),
        };

        for migration in pending {
            on_step(migration);
            apply_migration(conn, migration)?;
            report.current_version = migration.version;
            report.applied.push(migration.version);
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "applied migration"
            );
        }

        // The new shape must be exactly what the ledger describes.
        self.verify_shape(conn, report.current_version)?;

        Ok(report)
    }

    /// Steps not yet recorded as applied.
    pub fn pending(&self, conn: &Connection) -> Result<Vec<&'a Migration>> {
        let current = current_version(conn)?;
        Ok(self
            .ledger
            .iter()
            .filter(|m| m.version > current)
            .collect())
    }

    /// Markers must be exactly the first N ledger entries.
    fn check_markers(&self, applied: &[AppliedMigration]) -> Result<i64> {
        for (idx, marker) in applied.iter().enumerate() {
            let Some(expected) = self.ledger.get(idx) else {
                return Err(Error::conflict(format!(
                    "database records migration {} ({}) which this build does not know; \
                     latest known version is {}",
                    marker.version,
                    marker.name,
                    self.latest_version()
                )));
            };
            if expected.version != marker.version || expected.name != marker.name {
                return Err(Error::conflict(format!(
                    "applied migration {} ({}) does not match ledger entry {} ({})",
                    marker.version, marker.name, expected.version, expected.name
                )));
            }
        }
        Ok(applied.last().map(|m| m.version).unwrap_or(0))
    }

    fn verify_shape(&self, conn: &Connection, version: i64) -> Result<()> {
        let expected = snapshot::expected_snapshot(conn, self.ledger, version)?;
        let actual = SchemaSnapshot::introspect(conn)?;
        let differences = expected.diff(&actual);
        if differences.is_empty() {
            return Ok(());
        }
        tracing::error!(version, ?differences, "physical schema disagrees with ledger");
        Err(Error::conflict(format!(
            "schema at version {version} differs from the ledger: {}",
            differences.join("; ")
        )))
    }
}

/// Versions must start at 1 and increase by one.
fn validate_ledger(ledger: &[Migration]) -> Result<()> {
    for (idx, migration) in ledger.iter().enumerate() {
        let expected = idx as i64 + 1;
        if migration.version != expected {
            return Err(Error::Internal(format!(
                "ledger entry {} ({}) has version {}, expected {expected}",
                idx, migration.name, migration.version
            )));
        }
    }
    Ok(())
}

/// Create the marker and snapshot-cache tables if they do not exist.
pub fn init_tracking_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY NOT NULL,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE TABLE IF NOT EXISTS schema_snapshot (
            id           INTEGER PRIMARY KEY CHECK (id = 1),
            version      INTEGER NOT NULL,
            fingerprint  TEXT NOT NULL,
            shape        TEXT NOT NULL,
            shape_digest TEXT NOT NULL,
            generated_at TEXT NOT NULL
        );",
    )
    .map_err(|e| Error::database(format!("Failed to create schema tracking tables: {e}")))
}

/// Apply one step and record its marker in the same transaction.
fn apply_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(Error::database)?;

    let already: bool = tx
        .query_row(
            "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
            [migration.version],
            |row| row.get(0),
        )
        .map_err(Error::database)?;
    if already {
        return Err(Error::conflict(format!(
            "migration {} ({}) was recorded by another writer during this run",
            migration.version, migration.name
        )));
    }

    tx.execute_batch(&migration.sql()).map_err(|e| {
        Error::database(format!(
            "Migration V{} ({}) failed: {e}",
            migration.version, migration.name
        ))
    })?;

    tx.execute(
        "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![migration.version, migration.name],
    )
    .map_err(Error::database)?;

    tx.commit().map_err(Error::database)
}

/// Whether `schema_migrations` exists. Read-only callers check this instead
/// of creating the tracking tables outside the migration lock.
fn markers_table_exists(conn: &Connection) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
        [],
        |row| row.get(0),
    )
    .map_err(Error::database)
}

/// All marker rows in version order. Empty if nothing was ever applied.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<AppliedMigration>> {
    if !markers_table_exists(conn)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn
        .prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")
        .map_err(Error::database)?;
    let rows = stmt
        .query_map([], |row| {
            let applied_at: String = row.get(2)?;
            Ok(AppliedMigration {
                version: row.get(0)?,
                name: row.get(1)?,
                applied_at: NaiveDateTime::parse_from_str(&applied_at, "%Y-%m-%d %H:%M:%S").ok(),
            })
        })
        .map_err(Error::database)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::database)?;
    Ok(rows)
}

/// Highest recorded version, 0 when nothing has been applied.
pub fn current_version(conn: &Connection) -> Result<i64> {
    if !markers_table_exists(conn)? {
        return Ok(0);
    }
    conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .map(|v| v.unwrap_or(0))
    .map_err(Error::database)
}

/// Latest version of the shipped ledger.
pub fn latest_version() -> i64 {
    Migrator::default().latest_version()
}

/// Apply the shipped ledger.
pub fn run_migrations(conn: &Connection) -> Result<MigrationReport> {
    Migrator::default().run(conn)
}
