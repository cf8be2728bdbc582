//! Readers-writer lock between migration runs and record access.
//!
//! A migration run holds [`MigrationLock`] exclusively; every CRUD operation
//! holds a [`SharedMigrationLock`] while it touches the database, so the two
//! never overlap across store instances.
//!
//! Two layers: a process-wide registry keyed by [`DbTarget::lock_key`] (covers
//! in-memory databases and several stores inside one process), and on unix an
//! advisory `flock` on the `<db>.migrate.lock` sidecar for file databases
//! (covers separate processes, and is released by the kernel if the holder
//! dies). Locks are released when the guard drops.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use imagetiles_common::{Error, Result, StoreInstanceId};
use parking_lot::Mutex;

use crate::pool::DbTarget;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Exclusive,
    Shared(usize),
}

fn held_keys() -> &'static Mutex<HashMap<String, Held>> {
    static HELD: OnceLock<Mutex<HashMap<String, Held>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashMap::new()))
}

fn register_shared(key: &str) -> bool {
    let mut held = held_keys().lock();
    match held.get_mut(key) {
        Some(Held::Exclusive) => false,
        Some(Held::Shared(n)) => {
            *n += 1;
            true
        }
        None => {
            held.insert(key.to_string(), Held::Shared(1));
            true
        }
    }
}

fn release_shared(key: &str) {
    let mut held = held_keys().lock();
    let last = match held.get_mut(key) {
        Some(Held::Shared(n)) if *n > 1 => {
            *n -= 1;
            false
        }
        Some(Held::Shared(_)) => true,
        _ => false,
    };
    if last {
        held.remove(key);
    }
}

/// Guard for an acquired migration lock.
pub struct MigrationLock {
    key: String,
    holder: StoreInstanceId,
    #[cfg(unix)]
    _file: Option<nix::fcntl::Flock<std::fs::File>>,
}

impl MigrationLock {
    /// Acquire the lock, retrying until `timeout` elapses.
    pub fn acquire(target: &DbTarget, holder: StoreInstanceId, timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(target, holder)? {
                tracing::debug!(%target, %holder, "acquired migration lock");
                return Ok(lock);
            }
            if started.elapsed() >= timeout {
                return Err(Error::MigrationLocked(format!(
                    "{target} is being migrated by another store instance{}",
                    describe_holder(target)
                )));
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Acquire the lock if nobody holds it.
    pub fn try_acquire(target: &DbTarget, holder: StoreInstanceId) -> Result<Option<Self>> {
        let key = target.lock_key();
        {
            let mut held = held_keys().lock();
            if held.contains_key(&key) {
                return Ok(None);
            }
            held.insert(key.clone(), Held::Exclusive);
        }

        #[cfg(unix)]
        {
            let file = match target.lock_file() {
                Some(path) => match lock_sidecar(&path, holder, true) {
                    Ok(Some(file)) => Some(file),
                    Ok(None) => {
                        held_keys().lock().remove(&key);
                        return Ok(None);
                    }
                    Err(e) => {
                        held_keys().lock().remove(&key);
                        return Err(e);
                    }
                },
                None => None,
            };
            Ok(Some(Self {
                key,
                holder,
                _file: file,
            }))
        }

        #[cfg(not(unix))]
        {
            Ok(Some(Self { key, holder }))
        }
    }

    /// The store instance holding this lock.
    pub fn holder(&self) -> StoreInstanceId {
        self.holder
    }
}

impl std::fmt::Debug for MigrationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationLock")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        held_keys().lock().remove(&self.key);
        tracing::debug!(key = %self.key, holder = %self.holder, "released migration lock");
    }
}

/// Guard held by record access while it touches the database.
pub struct SharedMigrationLock {
    key: String,
    #[cfg(unix)]
    _file: Option<nix::fcntl::Flock<std::fs::File>>,
}

impl SharedMigrationLock {
    /// Take a shared hold, or `None` while a migration run holds the lock.
    pub fn try_acquire(target: &DbTarget) -> Result<Option<Self>> {
        let key = target.lock_key();
        if !register_shared(&key) {
            return Ok(None);
        }

        #[cfg(unix)]
        {
            let file = match target.lock_file() {
                Some(path) => match lock_sidecar(&path, StoreInstanceId::new(), false) {
                    Ok(Some(file)) => Some(file),
                    Ok(None) => {
                        release_shared(&key);
                        return Ok(None);
                    }
                    Err(e) => {
                        release_shared(&key);
                        return Err(e);
                    }
                },
                None => None,
            };
            Ok(Some(Self { key, _file: file }))
        }

        #[cfg(not(unix))]
        {
            Ok(Some(Self { key }))
        }
    }
}

impl std::fmt::Debug for SharedMigrationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMigrationLock")
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for SharedMigrationLock {
    fn drop(&mut self) {
        release_shared(&self.key);
    }
}

/// Flock the sidecar. Only exclusive holders record themselves in it.
#[cfg(unix)]
fn lock_sidecar(
    path: &std::path::Path,
    holder: StoreInstanceId,
    exclusive: bool,
) -> Result<Option<nix::fcntl::Flock<std::fs::File>>> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};
    use std::io::{Seek, Write};

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let mode = if exclusive {
        FlockArg::LockExclusiveNonblock
    } else {
        FlockArg::LockSharedNonblock
    };
    match Flock::lock(file, mode) {
        Ok(mut locked) => {
            if exclusive {
                locked.set_len(0)?;
                locked.rewind()?;
                writeln!(locked, "{holder} pid={}", std::process::id())?;
            }
            Ok(Some(locked))
        }
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
        Err((_, errno)) => Err(Error::from(std::io::Error::from(errno))),
    }
}

/// Holder details written into the sidecar, for error messages.
fn describe_holder(target: &DbTarget) -> String {
    target
        .lock_file()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| format!(" ({s})"))
        .unwrap_or_default()
}
