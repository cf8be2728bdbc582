//! Connection pool management for SQLite via r2d2.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use imagetiles_common::{Error, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::migrations;

/// Type alias for the database connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Type alias for a pooled database connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DbTarget {
    /// A SQLite file on disk.
    File(PathBuf),
    /// A named shared-cache in-memory database. Every pool opened with the
    /// same name within one process sees the same data.
    Memory(String),
}

impl DbTarget {
    /// A fresh in-memory database that no other pool shares.
    pub fn unique_memory() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        DbTarget::Memory(format!("memdb_{}_{n}", std::process::id()))
    }

    fn manager(&self) -> SqliteConnectionManager {
        match self {
            DbTarget::File(path) => SqliteConnectionManager::file(path),
            DbTarget::Memory(name) => {
                SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
            }
        }
    }

    /// Key identifying the physical storage for process-wide locking.
    pub fn lock_key(&self) -> String {
        match self {
            DbTarget::File(path) => {
                let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
                format!("file:{}", resolved.display())
            }
            DbTarget::Memory(name) => format!("memory:{name}"),
        }
    }

    /// Sidecar file used for the cross-process migration lock.
    pub fn lock_file(&self) -> Option<PathBuf> {
        match self {
            DbTarget::File(path) => {
                let mut name = path.as_os_str().to_owned();
                name.push(".migrate.lock");
                Some(PathBuf::from(name))
            }
            DbTarget::Memory(_) => None,
        }
    }
}

impl fmt::Display for DbTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbTarget::File(path) => write!(f, "{}", path.display()),
            DbTarget::Memory(name) => write!(f, "memory:{name}"),
        }
    }
}

/// Pool tuning.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub max_size: u32,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Build a pool without touching the schema.
///
/// File databases get WAL journal mode; every connection gets a busy timeout.
pub fn build_pool(target: &DbTarget, options: &PoolOptions) -> Result<DbPool> {
    if let DbTarget::File(path) = target {
        ensure_parent_dir(path)?;
    }

    let busy_timeout = options.busy_timeout;
    let wal = matches!(target, DbTarget::File(_));
    let manager = target.manager().with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        if wal {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        Ok(())
    });

    Pool::builder()
        .max_size(options.max_size)
        .build(manager)
        .map_err(|e| Error::database(format!("Failed to create connection pool for {target}: {e}")))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Initialize a uniquely-named in-memory pool (useful for tests) and apply
/// the shipped ledger.
pub fn init_memory_pool() -> Result<DbPool> {
    let pool = build_pool(&DbTarget::unique_memory(), &PoolOptions::default())?;
    let conn = get_conn(&pool)?;
    migrations::run_migrations(&conn)?;
    drop(conn);
    Ok(pool)
}

/// Convenience helper to get a connection from the pool.
pub fn get_conn(pool: &DbPool) -> Result<PooledConnection> {
    pool.get()
        .map_err(|e| Error::database(format!("Failed to get connection from pool: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_memory_pool() {
        let pool = init_memory_pool().unwrap();
        assert_eq!(pool.max_size(), 4);
    }

    #[test]
    fn test_memory_pools_are_isolated() {
        let a = init_memory_pool().unwrap();
        let b = init_memory_pool().unwrap();

        get_conn(&a)
            .unwrap()
            .execute(
                "INSERT INTO image_files (id, filename, project, width, height)
                 VALUES ('00000000-0000-0000-0000-000000000001', 'a.png', 'p', 1, 1)",
                [],
            )
            .unwrap();

        let count: i64 = get_conn(&b)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM image_files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_connections_share_memory_database() {
        let target = DbTarget::unique_memory();
        let pool = build_pool(&target, &PoolOptions::default()).unwrap();
        get_conn(&pool)
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();

        let other = build_pool(&target, &PoolOptions::default()).unwrap();
        let x: i64 = get_conn(&other)
            .unwrap()
            .query_row("SELECT x FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(x, 7);
    }

    #[test]
    fn test_file_pool_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("images.db");
        let pool = build_pool(&DbTarget::File(path), &PoolOptions::default()).unwrap();
        let mode: String = get_conn(&pool)
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_lock_file_path() {
        let target = DbTarget::File(PathBuf::from("/data/images.db"));
        assert_eq!(
            target.lock_file(),
            Some(PathBuf::from("/data/images.db.migrate.lock"))
        );
        assert_eq!(DbTarget::unique_memory().lock_file(), None);
    }
}
