//! Per-node attribute store.
//! Each node carries one key/value record next to it on disk plus a lock file used to
//! serialize read-modify-write sequences across threads and processes.

mod attributes;
mod file_backend;
mod lock;
pub mod prefixes;

pub use attributes::Attributes;
pub use file_backend::FileBackend;
pub use lock::AttrLock;

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttrError {
    /// The record exists but the key is not set.
    #[error("attribute {key} not set on {path}")]
    AttrUnset { path: String, key: String },
    /// The node has no attribute record at all.
    #[error("no attribute record for {0}")]
    NotExist(String),
    /// A path segment expected to be a container is a file.
    #[error("not a directory: {0}")]
    NotDir(String),
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),
    #[error("corrupt attribute record {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AttrError {
    pub fn is_unset(&self) -> bool { matches!(self, AttrError::AttrUnset { .. }) }
    pub fn is_not_exist(&self) -> bool { matches!(self, AttrError::NotExist(_)) }
    pub fn is_not_dir(&self) -> bool { matches!(self, AttrError::NotDir(_)) }

    /// True when the error only says the value or record is absent.
    pub fn is_absent(&self) -> bool { self.is_unset() || self.is_not_exist() || self.is_not_dir() }
}

pub type AttrResult<T> = std::result::Result<T, AttrError>;

/// Storage contract for node attributes.
///
/// Write methods take `acquire_lock`; callers that already hold the node's `AttrLock`
/// pass `false` so the same lock is not requested twice.
pub trait MetadataBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read the whole record.
    fn all(&self, path: &Path) -> AttrResult<Attributes>;

    fn get(&self, path: &Path, key: &str) -> AttrResult<Vec<u8>> {
        let attrs = self.all(path)?;
        attrs
            .get(key)
            .map(|v| v.to_vec())
            .ok_or_else(|| AttrError::AttrUnset { path: path.display().to_string(), key: key.to_string() })
    }

    fn get_string(&self, path: &Path, key: &str) -> AttrResult<String> {
        let raw = self.get(path, key)?;
        String::from_utf8(raw).map_err(|e| AttrError::Corrupt { path: path.display().to_string(), reason: e.to_string() })
    }

    fn get_i64(&self, path: &Path, key: &str) -> AttrResult<i64> {
        let s = self.get_string(path, key)?;
        s.parse::<i64>().map_err(|e| AttrError::Corrupt { path: path.display().to_string(), reason: format!("{}: {}", key, e) })
    }

    fn get_u64(&self, path: &Path, key: &str) -> AttrResult<u64> {
        let s = self.get_string(path, key)?;
        s.parse::<u64>().map_err(|e| AttrError::Corrupt { path: path.display().to_string(), reason: format!("{}: {}", key, e) })
    }

    fn list_keys(&self, path: &Path) -> AttrResult<Vec<String>> {
        Ok(self.all(path)?.keys().cloned().collect())
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> AttrResult<()> {
        let mut attrs = Attributes::new();
        attrs.set(key, value.to_vec());
        self.set_multiple(path, &attrs, true)
    }

    /// Merge `attrs` into the record in one atomic replace.
    fn set_multiple(&self, path: &Path, attrs: &Attributes, acquire_lock: bool) -> AttrResult<()>;

    /// Remove and set keys in one atomic replace.
    fn update(&self, path: &Path, remove: &[&str], set: &Attributes, acquire_lock: bool) -> AttrResult<()>;

    fn remove(&self, path: &Path, key: &str, acquire_lock: bool) -> AttrResult<()> {
        self.update(path, &[key], &Attributes::new(), acquire_lock)
    }

    /// Acquire the node's exclusive lock; released when the guard drops.
    fn lock(&self, path: &Path) -> AttrResult<AttrLock>;

    /// Delete the record. A record that is already gone is not an error.
    fn purge(&self, path: &Path) -> AttrResult<()>;

    /// Move the record along with a node that is being renamed on disk.
    fn rename(&self, old: &Path, new: &Path) -> AttrResult<()>;

    fn metadata_path(&self, path: &Path) -> PathBuf;
    fn lockfile_path(&self, path: &Path) -> PathBuf;

    /// True for the sidecar files this backend owns, so directory listings can skip them.
    fn is_metadata_file(&self, path: &Path) -> bool;
}

/// Append a suffix to the final path component without touching existing extensions.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
#[path = "metadata_tests.rs"]
mod metadata_tests;
