//! StateStore - serialized mutation and atomic persistence of run state.
//!
//! The store owns the authoritative in-memory [`RunState`] behind an async
//! mutex and mirrors every committed mutation to disk. Writes go to a
//! sibling `.tmp` file first and land via rename, so the document on disk
//! is always either the previous committed state or the new one, never a
//! torn write. A crash between the two steps leaves a stale `.tmp` behind,
//! which `open` discards.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::state::model::RunState;
use crate::{mlog_debug, Error, Result};

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<RunState>,
}

impl StateStore {
    /// Create the store for a brand new run and persist the initial
    /// document.
    ///
    /// # Errors
    /// Returns `Error::RunExists` if a state file is already present at
    /// `path` - an existing run must be resumed, not overwritten.
    pub fn init(path: impl Into<PathBuf>, state: RunState) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Err(Error::RunExists(state.feature.clone()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        persist(&path, &state)?;
        mlog_debug!(
            "StateStore::init feature={} run={} path={}",
            state.feature,
            state.short_run_id(),
            path.display()
        );
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    /// Open the store for an existing run, loading the last committed
    /// document. A leftover `.tmp` from an interrupted write is removed;
    /// the committed file is the source of truth.
    ///
    /// # Errors
    /// Returns `Error::RunNotFound` if no state file exists at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::RunNotFound(path.display().to_string()));
        }
        let tmp = tmp_path(&path);
        if tmp.exists() {
            mlog_debug!("Discarding interrupted write {}", tmp.display());
            fs::remove_file(&tmp)?;
        }
        let raw = fs::read_to_string(&path)?;
        let state: RunState = serde_json::from_str(&raw)?;
        mlog_debug!(
            "StateStore::open feature={} run={} path={}",
            state.feature,
            state.short_run_id(),
            path.display()
        );
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    /// Whether a state file exists at `path`.
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Apply a mutation atomically: read-modify-write under the lock,
    /// persist, commit. The closure runs against a working copy, so if it
    /// fails, or the write to disk fails, neither memory nor disk changes.
    pub async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RunState) -> Result<T>,
    {
        let mut guard = self.inner.lock().await;
        let mut working = guard.clone();
        let out = f(&mut working)?;
        persist(&self.path, &working)?;
        *guard = working;
        Ok(out)
    }

    /// A deep copy of the current committed state.
    pub async fn snapshot(&self) -> RunState {
        self.inner.lock().await.clone()
    }

    /// Read-only access without cloning the whole document.
    pub async fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&RunState) -> T,
    {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Write-then-rename. The rename is atomic on the filesystems we care
/// about, so readers never observe a partial document.
fn persist(path: &Path, state: &RunState) -> Result<()> {
    let tmp = tmp_path(path);
    let json = serde_json::to_string_pretty(state)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
