//! The image metadata store.
//!
//! [`ImageStore`] couples a connection pool with a per-instance readiness
//! state. A store starts [`StoreState::Uninitialized`], moves through
//! [`StoreState::Applying`] while the ledger runs under the migration lock,
//! and serves CRUD only once [`StoreState::Current`]. A failed run leaves the
//! instance in [`StoreState::Failed`] for good; reopening re-derives the
//! pending steps from the recorded markers.
//!
//! Readiness is also checked against the shared storage: each CRUD operation
//! holds a shared migration lock and fails with [`Error::StoreNotReady`] while
//! another instance is migrating, or once the recorded version has moved past
//! the version this instance verified.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use imagetiles_common::{Error, ImageFileId, Result, StoreInstanceId};
use parking_lot::RwLock;
use serde::Serialize;

use crate::lock::{MigrationLock, SharedMigrationLock};
use crate::migrations::{self, AppliedMigration, Migration, MigrationReport, Migrator, MIGRATIONS};
use crate::models::{ImageFile, ImageFileUpdate, NewImageFile};
use crate::pool::{self, DbPool, DbTarget, PoolOptions, PooledConnection};
use crate::queries::image_files;
use crate::snapshot::{self, SchemaSnapshot};

/// Lifecycle of one store instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StoreState {
    Uninitialized,
    /// Migration run in progress. `version` is the step being applied, or
    /// `None` while the lock is taken and the existing shape verified.
    Applying { version: Option<i64> },
    Current { version: i64 },
    Failed { reason: String },
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreState::Uninitialized => write!(f, "uninitialized"),
            StoreState::Applying { version: None } => write!(f, "applying (verifying schema)"),
            StoreState::Applying { version: Some(v) } => write!(f, "applying migration {v}"),
            StoreState::Current { version } => write!(f, "current at version {version}"),
            StoreState::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Store tuning.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub pool: PoolOptions,
    /// How long `migrate` waits for another instance's migration lock.
    pub lock_timeout: Duration,
    /// Rows fetched per round trip by [`ImageFileIter`].
    pub list_page_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool: PoolOptions::default(),
            lock_timeout: Duration::from_secs(30),
            list_page_size: 100,
        }
    }
}

/// Migration status for operators.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub state: StoreState,
    pub current_version: i64,
    pub latest_version: i64,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<String>,
}

struct StoreInner {
    pool: DbPool,
    target: DbTarget,
    instance: StoreInstanceId,
    options: StoreOptions,
    state: RwLock<StoreState>,
}

/// Cheaply cloneable handle to one store instance.
#[derive(Clone)]
pub struct ImageStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageStore")
            .field("target", &self.inner.target)
            .field("instance", &self.inner.instance)
            .field("state", &*self.inner.state.read())
            .finish()
    }
}

impl ImageStore {
    /// Build a store without touching the schema.
    pub fn new(target: DbTarget, options: StoreOptions) -> Result<Self> {
        let pool = pool::build_pool(&target, &options.pool)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                pool,
                target,
                instance: StoreInstanceId::new(),
                options,
                state: RwLock::new(StoreState::Uninitialized),
            }),
        })
    }

    /// Build a store and bring its schema to the shipped ledger.
    pub fn open(target: DbTarget, options: StoreOptions) -> Result<Self> {
        let store = Self::new(target, options)?;
        let report = store.migrate()?;
        tracing::info!(
            target = %store.inner.target,
            from = report.previous_version,
            to = report.current_version,
            "image store ready"
        );
        Ok(store)
    }

    pub fn target(&self) -> &DbTarget {
        &self.inner.target
    }

    pub fn instance_id(&self) -> StoreInstanceId {
        self.inner.instance
    }

    pub fn state(&self) -> StoreState {
        self.inner.state.read().clone()
    }

    // -----------------------------------------------------------------------
    // schema
    // -----------------------------------------------------------------------

    /// Apply the shipped ledger.
    pub fn migrate(&self) -> Result<MigrationReport> {
        self.migrate_with(MIGRATIONS)
    }

    /// Apply `ledger` under the migration lock.
    ///
    /// Lock contention returns [`Error::MigrationLocked`] and leaves the state
    /// unchanged. Any other failure moves the instance to
    /// [`StoreState::Failed`].
    pub fn migrate_with(&self, ledger: &[Migration]) -> Result<MigrationReport> {
        let previous = {
            let mut state = self.inner.state.write();
            match &*state {
                StoreState::Failed { reason } => {
                    return Err(Error::not_ready(format!(
                        "store failed earlier and must be reopened: {reason}"
                    )))
                }
                StoreState::Applying { .. } => {
                    return Err(Error::not_ready("a migration run is already in progress"))
                }
                _ => {}
            }
            std::mem::replace(&mut *state, StoreState::Applying { version: None })
        };

        let _lock = match MigrationLock::acquire(
            &self.inner.target,
            self.inner.instance,
            self.inner.options.lock_timeout,
        ) {
            Ok(lock) => lock,
            Err(e) => {
                *self.inner.state.write() = previous;
                return Err(e);
            }
        };

        let result = pool::get_conn(&self.inner.pool).and_then(|conn| {
            Migrator::new(ledger).run_observed(&conn, |m| {
                tracing::info!(version = m.version, name = m.name, "applying migration");
                *self.inner.state.write() = StoreState::Applying {
                    version: Some(m.version),
                };
            })
        });

        let mut state = self.inner.state.write();
        match result {
            Ok(report) => {
                *state = StoreState::Current {
                    version: report.current_version,
                };
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, target = %self.inner.target, "migration failed");
                *state = StoreState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Recorded markers, pending steps and instance state.
    pub fn status(&self) -> Result<MigrationStatus> {
        let conn = pool::get_conn(&self.inner.pool)?;
        let migrator = Migrator::default();
        let applied = migrations::applied_migrations(&conn)?;
        let pending = migrator
            .pending(&conn)?
            .into_iter()
            .map(|m| format!("{:03}_{}", m.version, m.name))
            .collect();
        Ok(MigrationStatus {
            state: self.state(),
            current_version: applied.last().map(|m| m.version).unwrap_or(0),
            latest_version: migrator.latest_version(),
            applied,
            pending,
        })
    }

    /// Rebuild the cached shape from the shipped ledger.
    pub fn regenerate_snapshot(&self) -> Result<SchemaSnapshot> {
        let conn = self.ready_conn()?;
        snapshot::regenerate_snapshot(&conn, MIGRATIONS)
    }

    /// A connection, only if this instance has reached `Current`, no other
    /// instance is migrating, and the recorded version is still ours.
    fn ready_conn(&self) -> Result<ReadyConn> {
        let version = match &*self.inner.state.read() {
            StoreState::Current { version } => *version,
            other => return Err(Error::not_ready(other.to_string())),
        };

        let guard = SharedMigrationLock::try_acquire(&self.inner.target)?.ok_or_else(|| {
            Error::not_ready(format!(
                "{} is being migrated by another store instance",
                self.inner.target
            ))
        })?;

        let conn = pool::get_conn(&self.inner.pool)?;
        let recorded = migrations::current_version(&conn)?;
        if recorded != version {
            return Err(Error::not_ready(format!(
                "schema is at version {recorded} but this instance verified version {version}; reopen the store"
            )));
        }

        Ok(ReadyConn {
            conn,
            _guard: guard,
        })
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    pub fn create(&self, new: NewImageFile) -> Result<ImageFile> {
        let conn = self.ready_conn()?;
        let file = image_files::create_image_file(&conn, new)?;
        tracing::debug!(id = %file.id, project = %file.project, "created image file");
        Ok(file)
    }

    pub fn get(&self, id: ImageFileId) -> Result<ImageFile> {
        let conn = self.ready_conn()?;
        image_files::get_image_file(&conn, id)?.ok_or_else(|| Error::not_found("image file", id))
    }

    pub fn update(&self, id: ImageFileId, update: &ImageFileUpdate) -> Result<ImageFile> {
        let conn = self.ready_conn()?;
        let file = image_files::update_image_file(&conn, id, update)?
            .ok_or_else(|| Error::not_found("image file", id))?;
        tracing::debug!(%id, "updated image file");
        Ok(file)
    }

    /// Deleting an absent id, including a second delete, is `NotFound`.
    pub fn delete(&self, id: ImageFileId) -> Result<()> {
        let conn = self.ready_conn()?;
        if !image_files::delete_image_file(&conn, id)? {
            return Err(Error::not_found("image file", id));
        }
        tracing::debug!(%id, "deleted image file");
        Ok(())
    }

    /// Lazily iterate image files, optionally within one project.
    pub fn list(&self, project: Option<&str>) -> Result<ImageFileIter> {
        self.ready_conn()?;
        Ok(ImageFileIter {
            store: self.clone(),
            project: project.map(String::from),
            page_size: self.inner.options.list_page_size.max(1),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    pub fn count(&self, project: Option<&str>) -> Result<u64> {
        let conn = self.ready_conn()?;
        image_files::count_image_files(&conn, project)
    }

    pub fn list_projects(&self) -> Result<Vec<String>> {
        let conn = self.ready_conn()?;
        image_files::list_projects(&conn)
    }
}

/// A pooled connection that keeps the shared migration lock while in use.
struct ReadyConn {
    conn: PooledConnection,
    _guard: SharedMigrationLock,
}

impl Deref for ReadyConn {
    type Target = rusqlite::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

/// Keyset-paged iterator over image files in ascending id order.
///
/// Each page is fetched on demand. Without concurrent writes a full traversal
/// yields every matching record exactly once.
#[derive(Debug)]
pub struct ImageFileIter {
    store: ImageStore,
    project: Option<String>,
    page_size: u32,
    after: Option<ImageFileId>,
    buffer: VecDeque<ImageFile>,
    exhausted: bool,
}

impl ImageFileIter {
    /// Start over from the first record.
    pub fn restart(&mut self) {
        self.after = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fetch_page(&mut self) -> Result<()> {
        let conn = self.store.ready_conn()?;
        let page = image_files::list_image_files_page(
            &conn,
            self.project.as_deref(),
            self.after,
            self.page_size,
        )?;
        if page.len() < self.page_size as usize {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(last.id);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for ImageFileIter {
    type Item = Result<ImageFile>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_not_ready() {
        let store = ImageStore::new(DbTarget::unique_memory(), StoreOptions::default()).unwrap();
        assert_eq!(store.state(), StoreState::Uninitialized);

        let err = store
            .create(NewImageFile::new("a.png", "p", 1, 1))
            .unwrap_err();
        assert!(matches!(err, Error::StoreNotReady(_)));
        assert!(matches!(store.list(None), Err(Error::StoreNotReady(_))));
    }

    #[test]
    fn migrate_reaches_current() {
        let store = ImageStore::new(DbTarget::unique_memory(), StoreOptions::default()).unwrap();
        let report = store.migrate().unwrap();
        assert_eq!(report.applied, vec![1, 2]);
        assert_eq!(
            store.state(),
            StoreState::Current {
                version: migrations::latest_version()
            }
        );
    }

    #[test]
    fn failed_migration_is_terminal() {
        let store = ImageStore::new(DbTarget::unique_memory(), StoreOptions::default()).unwrap();
        let conn = pool::get_conn(&store.inner.pool).unwrap();
        conn.execute_batch("CREATE TABLE image_files (id TEXT PRIMARY KEY);")
            .unwrap();
        drop(conn);

        let err = store.migrate().unwrap_err();
        assert!(matches!(err, Error::MigrationConflict(_)));
        assert!(matches!(store.state(), StoreState::Failed { .. }));

        assert!(matches!(store.migrate(), Err(Error::StoreNotReady(_))));
        assert!(matches!(
            store.get(ImageFileId::new()),
            Err(Error::StoreNotReady(_))
        ));
    }

    #[test]
    fn lock_contention_keeps_state() {
        let options = StoreOptions {
            lock_timeout: Duration::ZERO,
            ..StoreOptions::default()
        };
        let store = ImageStore::new(DbTarget::unique_memory(), options).unwrap();
        let _held = MigrationLock::try_acquire(store.target(), StoreInstanceId::new())
            .unwrap()
            .unwrap();

        let err = store.migrate().unwrap_err();
        assert!(matches!(err, Error::MigrationLocked(_)));
        assert_eq!(store.state(), StoreState::Uninitialized);
    }

    #[test]
    fn crud_refused_while_lock_is_held() {
        let store = ImageStore::open(DbTarget::unique_memory(), StoreOptions::default()).unwrap();
        let writer = MigrationLock::try_acquire(store.target(), StoreInstanceId::new())
            .unwrap()
            .unwrap();

        assert!(matches!(
            store.create(NewImageFile::new("a.png", "p", 1, 1)),
            Err(Error::StoreNotReady(_))
        ));
        assert!(matches!(store.count(None), Err(Error::StoreNotReady(_))));

        drop(writer);
        store.create(NewImageFile::new("a.png", "p", 1, 1)).unwrap();
    }

    #[test]
    fn status_reports_pending() {
        let store = ImageStore::new(DbTarget::unique_memory(), StoreOptions::default()).unwrap();
        let status = store.status().unwrap();
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending.len(), MIGRATIONS.len());
        assert_eq!(status.pending[0], "001_create_image_files");

        store.migrate().unwrap();
        let status = store.status().unwrap();
        assert_eq!(status.current_version, status.latest_version);
        assert!(status.pending.is_empty());
        assert_eq!(status.applied.len(), MIGRATIONS.len());
    }

    #[test]
    fn iterator_pages_and_restarts() {
        let options = StoreOptions {
            list_page_size: 2,
            ..StoreOptions::default()
        };
        let store = ImageStore::open(DbTarget::unique_memory(), options).unwrap();
        for i in 0..5 {
            store
                .create(NewImageFile::new(format!("{i}.png"), "p", 1, 1))
                .unwrap();
        }

        let mut iter = store.list(Some("p")).unwrap();
        let first: Vec<_> = iter.by_ref().map(|r| r.unwrap().id).collect();
        assert_eq!(first.len(), 5);
        assert!(iter.next().is_none());

        iter.restart();
        let second: Vec<_> = iter.map(|r| r.unwrap().id).collect();
        assert_eq!(first, second);
    }
}
