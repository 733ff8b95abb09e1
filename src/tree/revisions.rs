use chrono::{DateTime, Duration, Utc};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{remove_path, Tree};
use crate::error::{Error, Result};
use crate::metadata::{prefixes, Attributes};
use crate::node::checksums::checksums_equal;
use crate::node::{times, Node, NodeRef, REVISION_DELIMITER};

/// Attempts at finding a free revision key when a snapshot cannot reuse an existing one.
const MAX_REVISION_ATTEMPTS: i64 = 64;

/// Attributes that describe one revision's content.
pub(crate) fn is_revision_attr(key: &str) -> bool {
    key.starts_with(prefixes::CHECKSUM_PREFIX)
        || key == prefixes::TYPE
        || key == prefixes::BLOB_ID
        || key == prefixes::BLOB_SIZE
        || key == prefixes::MTIME
}

impl Tree {
    /// Revision timestamps and paths stored next to a node, oldest first.
    pub(crate) fn revision_paths(&self, space_id: &str, node_id: &str) -> Result<Vec<(String, PathBuf)>> {
        let live = self.lu.internal_path(space_id, node_id);
        let (dir, base) = match (live.parent(), live.file_name()) {
            (Some(d), Some(b)) => (d.to_path_buf(), b.to_string_lossy().to_string()),
            _ => return Ok(Vec::new()),
        };
        let prefix = format!("{}{}", base, REVISION_DELIMITER);
        let rd = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for ent in rd {
            let path = ent?.path();
            if self.lu.backend().is_metadata_file(&path) {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if let Some(ts) = name.strip_prefix(&prefix) {
                if ts.contains(".wlock") || ts.contains(".tmp.") {
                    continue;
                }
                out.push((ts.to_string(), path));
            }
        }
        out.sort_by(|a, b| {
            let pa = times::parse_rfc3339(&a.0).ok();
            let pb = times::parse_rfc3339(&b.0).ok();
            pa.cmp(&pb).then_with(|| a.0.cmp(&b.0))
        });
        Ok(out)
    }

    pub fn list_revisions(&self, n: &Node) -> Result<Vec<Node>> {
        let mut out = Vec::new();
        for (ts, _) in self.revision_paths(&n.space_id, &n.id)? {
            let rev = Node::read_node(&self.lu, &n.space_id, &NodeRef::revision(&n.id, &ts), true)?;
            if rev.exists {
                out.push(rev);
            }
        }
        Ok(out)
    }

    /// Freeze the current content attributes of `n` as a revision keyed by `mtime`.
    /// The caller holds the node's attribute lock.
    ///
    /// The revision entry is created exclusively. When one already exists for that key and
    /// carries the same checksums, its duplicate blob is dropped and the entry is reused;
    /// otherwise the next free key is taken.
    pub fn create_revision(&self, n: &Node, mtime: &DateTime<Utc>) -> Result<PathBuf> {
        let node_path = self.lu.internal_path(&n.space_id, &n.id);
        let current = self.lu.backend().all(&node_path)?;
        let mut ts = *mtime;
        for _ in 0..MAX_REVISION_ATTEMPTS {
            let key = times::format_rfc3339_nano(&ts);
            let rev_path = self.lu.revision_path(&n.space_id, &n.id, &key);
            match OpenOptions::new().write(true).create_new(true).open(&rev_path) {
                Ok(_) => {
                    if let Err(e) = self.lu.copy_metadata(&node_path, &rev_path, is_revision_attr, true) {
                        let _ = remove_path(&rev_path);
                        return Err(e);
                    }
                    debug!(target: "spacefs::tree", "created revision {} of {}", key, n.id);
                    return Ok(rev_path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let existing = match self.lu.backend().all(&rev_path) {
                        Ok(a) => a,
                        Err(e) if e.is_absent() => Attributes::new(),
                        Err(e) => return Err(e.into()),
                    };
                    if existing.is_empty() {
                        // entry without record: left over from an interrupted snapshot
                        self.lu.copy_metadata(&node_path, &rev_path, is_revision_attr, true)?;
                        return Ok(rev_path);
                    }
                    if checksums_equal(&current, &existing) == Some(true) {
                        let dup = existing.string(prefixes::BLOB_ID).unwrap_or_default();
                        if dup != current.string(prefixes::BLOB_ID).unwrap_or_default() {
                            self.delete_blob_id(&n.space_id, &dup)?;
                        }
                        self.lu.copy_metadata(&node_path, &rev_path, is_revision_attr, true)?;
                        info!(target: "spacefs::tree", "reused revision {} of {} with identical content", key, n.id);
                        return Ok(rev_path);
                    }
                    ts += Duration::nanoseconds(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::internal(format!("no free revision key for {} near {}", n.id, times::format_rfc3339_nano(mtime))))
    }

    /// Make a stored revision the current content again. The current content becomes a
    /// revision itself.
    pub fn restore_revision(&self, n: &Node, timestamp: &str) -> Result<()> {
        let _guard = n.lock()?;
        let rev_path = self.lu.revision_path(&n.space_id, &n.id, timestamp);
        let rev_attrs = match self.lu.backend().all(&rev_path) {
            Ok(a) => a,
            Err(e) if e.is_absent() => return Err(Error::not_found(format!("revision {} of {}", timestamp, n.id))),
            Err(e) => return Err(e.into()),
        };
        let mtime = n.mtime()?;
        let new_rev = self.create_revision(n, &mtime)?;

        let mut set: Attributes = rev_attrs
            .iter()
            .filter(|(k, _)| is_revision_attr(k) && k.as_str() != prefixes::MTIME)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        set.set_string(prefixes::MTIME, &times::format_rfc3339_nano(&Utc::now()));
        if let Err(e) = n.set_xattrs(&set, false) {
            let _ = remove_path(&new_rev);
            let _ = self.lu.backend().purge(&new_rev);
            return Err(e);
        }
        if new_rev != rev_path {
            remove_path(&rev_path)?;
            self.lu.backend().purge(&rev_path)?;
        }

        let restored_size = rev_attrs.u64(prefixes::BLOB_SIZE).unwrap_or(0);
        let diff = restored_size as i64 - n.blob_size as i64;
        drop(_guard);
        self.propagate(n, diff)
    }

    /// Remove a stored revision and its blob.
    pub fn delete_revision(&self, n: &Node, timestamp: &str) -> Result<()> {
        let rev_path = self.lu.revision_path(&n.space_id, &n.id, timestamp);
        let (blob_id, _) = match self.lu.read_blob_id_and_size(&rev_path) {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Err(Error::not_found(format!("revision {} of {}", timestamp, n.id))),
            Err(e) => return Err(e),
        };
        if blob_id != n.blob_id {
            self.delete_blob_id(&n.space_id, &blob_id)?;
        }
        remove_path(&rev_path)?;
        self.lu.backend().purge(&rev_path)?;
        Ok(())
    }

    /// Put the content attributes stored at `rev_path` back onto `n`.
    pub fn restore_metadata_from(&self, n: &Node, rev_path: &std::path::Path, acquire_lock: bool) -> Result<()> {
        self.lu.copy_metadata(rev_path, &n.internal_path(), is_revision_attr, acquire_lock)
    }
}
