//! Shared test harness for integration tests.
//!
//! Provides [`TestStore`], which owns a temporary directory holding a SQLite
//! file. Several store instances (or a raw connection) can be opened on the
//! same file to exercise cross-instance behaviour.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use imagetiles_db::pool::DbTarget;
use imagetiles_db::store::{ImageStore, StoreOptions};
use tempfile::TempDir;

/// A database file in a private temporary directory.
pub struct TestStore {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("images.db");
        Self { dir, path }
    }

    pub fn target(&self) -> DbTarget {
        DbTarget::File(self.path.clone())
    }

    /// Options with a short lock timeout so contention tests finish quickly.
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: Duration::from_secs(10),
            ..StoreOptions::default()
        }
    }

    /// A fresh, migrated store instance on this file.
    pub fn open(&self) -> ImageStore {
        ImageStore::open(self.target(), self.options()).expect("failed to open store")
    }

    /// A fresh store instance that has not run the ledger.
    pub fn unopened(&self) -> ImageStore {
        ImageStore::new(self.target(), self.options()).expect("failed to build store")
    }

    /// A plain connection for out-of-band inspection and tampering.
    pub fn raw(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.path).expect("failed to open raw connection")
    }
}
