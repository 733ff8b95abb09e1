use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::Tree;
use crate::error::Result;
use crate::lookup::ROOT_PARENT;
use crate::metadata::{prefixes, sibling, AttrError, Attributes};
use crate::node::{times, NodeType};

/// A pending size/mtime change travelling from a node's parent up to its space root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub space_id: String,
    /// First ancestor to update.
    pub start_id: String,
    pub sync_time: DateTime<Utc>,
    pub size_diff: i64,
    /// Ancestors the change is known to be applied to.
    #[serde(default)]
    pub applied: Vec<String>,
}

impl Tree {
    fn change_path(&self, id: &str) -> PathBuf {
        self.lu.changes_dir().join(format!("{}.json", id))
    }

    fn write_change(&self, change: &Change) -> Result<()> {
        let path = self.change_path(&change.id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = sibling(&path, ".tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&serde_json::to_vec(change)?)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_change(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.change_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Update tree mtime and tree size of every ancestor of `n`.
    ///
    /// The change is journaled before the walk. Each ancestor marks the change id as pending in
    /// the same write that applies it, the journal then records the ancestor as done, and only
    /// then the pending mark is dropped again. A replay skips ancestors that either the journal
    /// or a pending mark show as applied, so no ancestor counts a change twice.
    pub fn propagate(&self, n: &crate::node::Node, size_diff: i64) -> Result<()> {
        let opts = self.lu.options();
        if !opts.treetime_accounting && (!opts.treesize_accounting || size_diff == 0) {
            return Ok(());
        }
        if n.is_space_root() || n.parent_id.is_empty() || n.parent_id == ROOT_PARENT {
            return Ok(());
        }
        let change = Change {
            id: uuid::Uuid::new_v4().to_string(),
            space_id: n.space_id.clone(),
            start_id: n.parent_id.clone(),
            sync_time: Utc::now(),
            size_diff,
            applied: Vec::new(),
        };
        self.write_change(&change)?;
        self.apply_change(&change)?;
        self.remove_change(&change.id)
    }

    pub(crate) fn apply_change(&self, change: &Change) -> Result<()> {
        let opts = self.lu.options();
        let backend = self.lu.backend();
        let sync = times::format_rfc3339_nano(&change.sync_time);
        let mut change = change.clone();
        let mut cur = change.start_id.clone();
        loop {
            let path = self.lu.internal_path(&change.space_id, &cur);
            let guard = match backend.lock(&path) {
                Ok(g) => g,
                Err(e) if e.is_absent() => break,
                Err(e) => return Err(e.into()),
            };
            let attrs = match backend.all(&path) {
                Ok(a) => a,
                Err(e) if e.is_absent() => {
                    debug!(target: "spacefs::tree", "propagation {} stopped at missing node {}", change.id, cur);
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let done = change.applied.contains(&cur);
            let mut pending = pending_changes(&attrs);
            let marked = pending.contains(&change.id);
            if !done && !marked {
                let mut set = Attributes::new();
                let mut remove = Vec::new();
                if opts.treetime_accounting {
                    let older = match attrs.string(prefixes::TMTIME).map(|t| times::parse_rfc3339(&t)) {
                        Some(Ok(t)) => t < change.sync_time,
                        _ => true,
                    };
                    if older {
                        set.set_string(prefixes::TMTIME, &sync);
                    }
                    remove.push(prefixes::TMP_ETAG);
                }
                if opts.treesize_accounting && change.size_diff != 0 {
                    let current = match attrs.u64(prefixes::TREESIZE) {
                        Some(s) => s,
                        None => self.calculate_tree_size(&change.space_id, &path)?,
                    };
                    let next = if change.size_diff < 0 {
                        let dec = change.size_diff.unsigned_abs();
                        if dec > current {
                            warn!(target: "spacefs::tree", "treesize of {} would go negative ({} - {}), clamping", cur, current, dec);
                        }
                        current.saturating_sub(dec)
                    } else {
                        current.saturating_add(change.size_diff as u64)
                    };
                    set.set_u64(prefixes::TREESIZE, next);
                }
                pending.push(change.id.clone());
                set.set_string(prefixes::PROPAGATION_PENDING, &pending.join(","));
                backend.update(&path, &remove, &set, false)?;
            }
            drop(guard);

            if !done {
                change.applied.push(cur.clone());
                self.write_change(&change)?;
            }
            if !done || marked {
                self.clear_pending(&path, &change.id)?;
            }

            let parent = attrs.string(prefixes::PARENT_ID).unwrap_or_default();
            if cur == change.space_id || parent.is_empty() || parent == ROOT_PARENT {
                break;
            }
            cur = parent;
        }
        Ok(())
    }

    /// Drop a change id from a node's pending marks once the journal covers it.
    fn clear_pending(&self, path: &Path, change_id: &str) -> Result<()> {
        let backend = self.lu.backend();
        let _guard = backend.lock(path)?;
        let mut pending = match backend.all(path) {
            Ok(a) => pending_changes(&a),
            Err(e) if e.is_absent() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let before = pending.len();
        pending.retain(|p| p != change_id);
        if pending.len() == before {
            return Ok(());
        }
        if pending.is_empty() {
            backend.remove(path, prefixes::PROPAGATION_PENDING, false)?;
        } else {
            let mut set = Attributes::new();
            set.set_string(prefixes::PROPAGATION_PENDING, &pending.join(","));
            backend.set_multiple(path, &set, false)?;
        }
        Ok(())
    }

    /// Sum of the sizes of a container's direct children.
    fn calculate_tree_size(&self, space_id: &str, dir: &Path) -> Result<u64> {
        let mut total = 0u64;
        let rd = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for ent in rd {
            let ent = ent?;
            let id = match fs::read_to_string(ent.path()) {
                Ok(id) => id.trim().to_string(),
                Err(_) => continue,
            };
            let child = match self.lu.backend().all(&self.lu.internal_path(space_id, &id)) {
                Ok(a) => a,
                Err(AttrError::NotExist(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let size = match child.string(prefixes::TYPE).map(|t| NodeType::parse(&t)) {
                Some(NodeType::Container) => child.u64(prefixes::TREESIZE).unwrap_or(0),
                _ => child.u64(prefixes::BLOB_SIZE).unwrap_or(0),
            };
            total = total.saturating_add(size);
        }
        Ok(total)
    }

    /// Re-apply journaled changes left behind by an interrupted process.
    pub fn recover_pending_propagations(&self) -> Result<usize> {
        let dir = self.lu.changes_dir();
        let rd = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut pending = Vec::new();
        for ent in rd {
            let p = ent?.path();
            if p.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&p).map_err(crate::error::Error::from).and_then(|b| Ok(serde_json::from_slice::<Change>(&b)?)) {
                Ok(c) => pending.push(c),
                Err(e) => warn!(target: "spacefs::tree", "dropping unreadable change {}: {}", p.display(), e),
            }
        }
        pending.sort_by(|a, b| a.sync_time.cmp(&b.sync_time));
        let n = pending.len();
        for change in pending {
            self.apply_change(&change)?;
            self.remove_change(&change.id)?;
        }
        Ok(n)
    }
}

fn pending_changes(attrs: &Attributes) -> Vec<String> {
    attrs
        .string(prefixes::PROPAGATION_PENDING)
        .map(|s| s.split(',').filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}
