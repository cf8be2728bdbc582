//! imagetiles-db: image metadata persistence.
//!
//! This crate stores image file metadata in SQLite using rusqlite and r2d2
//! connection pooling. The table shape is produced exclusively by replaying
//! the migration ledger.
//!
//! # Modules
//!
//! - `migrations` - The append-only schema ledger and its runner
//! - `snapshot` - Derived table shape, physical introspection, and the shape cache
//! - `lock` - Exclusive lock held while migrations run
//! - `pool` - Connection pool management
//! - `models` - Image file record and its validation rules
//! - `queries` - Image file query operations
//! - `store` - The store handle: readiness state plus CRUD
//!
//! # Example
//!
//! ```no_run
//! use imagetiles_db::models::NewImageFile;
//! use imagetiles_db::pool::DbTarget;
//! use imagetiles_db::store::{ImageStore, StoreOptions};
//!
//! let store = ImageStore::open(
//!     DbTarget::File("/var/lib/imagetiles/images.db".into()),
//!     StoreOptions::default(),
//! )
//! .unwrap();
//!
//! let file = store
//!     .create(NewImageFile::new("tile1.png", "proj-A", 4096, 2048))
//!     .unwrap();
//! println!("Created image file: {}", file.id);
//! ```

pub mod lock;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod snapshot;
pub mod store;
