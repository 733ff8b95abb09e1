use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{remove_path, Tree};
use crate::error::{Error, Result};
use crate::identity::RequestContext;
use crate::lookup::{pathify, Reference};
use crate::metadata::{prefixes, sibling, Attributes};
use crate::node::{times, Node, NodeRef, NodeType, TRASH_DELIMITER};
use crate::paths;

/// A trashed node as listed in a space's recycle bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecycleItem {
    /// Id of the trashed node; addresses the item for restore and purge.
    pub key: String,
    pub space_id: String,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    /// Path the node had when it was deleted.
    pub origin: String,
    pub deletion_time: DateTime<Utc>,
}

struct TrashedNode {
    link: PathBuf,
    path: PathBuf,
    deletion_time: String,
    attrs: Attributes,
}

impl Tree {
    fn trash_link_path(&self, space_id: &str, node_id: &str) -> PathBuf {
        self.lu.trash_dir(space_id).join(pathify(node_id, 4, 2))
    }

    fn write_trash_link(&self, link: &Path, target_key: &str) -> Result<()> {
        if let Some(dir) = link.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = sibling(link, ".tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(target_key.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, link)?;
        Ok(())
    }

    fn read_trashed(&self, space_id: &str, node_id: &str) -> Result<TrashedNode> {
        let link = self.trash_link_path(space_id, node_id);
        let key = match fs::read_to_string(&link) {
            Ok(k) => k.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(format!("recycle item {} in {}", node_id, space_id)))
            }
            Err(e) => return Err(e.into()),
        };
        let deletion_time = match key.split_once(TRASH_DELIMITER) {
            Some((id, ts)) if id == node_id => ts.to_string(),
            _ => return Err(Error::internal(format!("malformed trash link {}: {}", link.display(), key))),
        };
        let path = self.lu.internal_path(space_id, &key);
        let attrs = self.lu.backend().all(&path)?;
        Ok(TrashedNode { link, path, deletion_time, attrs })
    }

    /// Move a node into the recycle bin of its space.
    pub fn delete(&self, n: &Node) -> Result<()> {
        if n.is_space_root() {
            return Err(Error::invalid("cannot delete a space root"));
        }
        if !n.exists {
            return Err(Error::not_found(format!("{}/{}", n.space_id, n.id)));
        }
        let origin = self.lu.path(n)?;
        let size = self.node_size(n)? as i64;
        let parent = n.parent()?;

        let deletion_time = times::format_rfc3339_nano(&Utc::now());
        let trashed_key = format!("{}{}{}", n.id, TRASH_DELIMITER, deletion_time);
        let node_path = n.internal_path();
        let trashed_path = self.lu.internal_path(&n.space_id, &trashed_key);
        let link = self.trash_link_path(&n.space_id, &n.id);

        n.set_xattr_string(prefixes::TRASH_ORIGIN, &origin)?;
        self.write_trash_link(&link, &trashed_key)?;
        if let Err(e) = fs::rename(&node_path, &trashed_path) {
            let _ = fs::remove_file(&link);
            let _ = n.remove_xattr(prefixes::TRASH_ORIGIN, true);
            return Err(e.into());
        }
        self.lu.backend().rename(&node_path, &trashed_path)?;
        match fs::remove_file(n.lock_info_path()) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                warn!(target: "spacefs::tree", "could not drop lock of trashed node {}: {}", n.id, e)
            }
            _ => {}
        }

        if let Err(e) = self.lu.unlink_child(&parent, &n.name) {
            // put the node back in place, the entry still points at it
            let _ = fs::rename(&trashed_path, &node_path);
            let _ = self.lu.backend().rename(&trashed_path, &node_path);
            let _ = self.lu.backend().remove(&node_path, prefixes::TRASH_ORIGIN, true);
            let _ = fs::remove_file(&link);
            return Err(e);
        }
        info!(target: "spacefs::tree", "trashed {} ({}) from {}", n.name, n.id, origin);
        self.propagate(n, -size)
    }

    /// Items in the recycle bin of a space, most recently deleted first.
    pub fn list_recycle(&self, space_id: &str) -> Result<Vec<RecycleItem>> {
        let dir = self.lu.trash_dir(space_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        for ent in WalkDir::new(&dir).min_depth(1) {
            let ent = match ent {
                Ok(e) => e,
                Err(e) => {
                    warn!(target: "spacefs::tree", "skipping unreadable trash entry: {}", e);
                    continue;
                }
            };
            if !ent.file_type().is_file() || ent.file_name().to_string_lossy().ends_with(".tmp") {
                continue;
            }
            let key = match fs::read_to_string(ent.path()) {
                Ok(k) => k.trim().to_string(),
                Err(e) => {
                    debug!(target: "spacefs::tree", "unreadable trash link {}: {}", ent.path().display(), e);
                    continue;
                }
            };
            let Some((id, _)) = key.split_once(TRASH_DELIMITER) else { continue };
            let t = match self.read_trashed(space_id, id) {
                Ok(t) => t,
                Err(e) => {
                    warn!(target: "spacefs::tree", "dangling trash link {}: {}", ent.path().display(), e);
                    continue;
                }
            };
            let node_type = t.attrs.string(prefixes::TYPE).map(|s| NodeType::parse(&s)).unwrap_or(NodeType::Invalid);
            let size = match node_type {
                NodeType::Container => t.attrs.u64(prefixes::TREESIZE).unwrap_or(0),
                _ => t.attrs.u64(prefixes::BLOB_SIZE).unwrap_or(0),
            };
            items.push(RecycleItem {
                key: id.to_string(),
                space_id: space_id.to_string(),
                name: t.attrs.string(prefixes::NAME).unwrap_or_default(),
                node_type,
                size,
                origin: t.attrs.string(prefixes::TRASH_ORIGIN).unwrap_or_default(),
                deletion_time: times::parse_rfc3339(&t.deletion_time)?,
            });
        }
        items.sort_by(|a, b| b.deletion_time.cmp(&a.deletion_time));
        Ok(items)
    }

    /// Put a trashed node back, at `target` or at the path it was deleted from.
    pub fn restore_recycle_item(&self, space_id: &str, key: &str, target: Option<&Node>) -> Result<Node> {
        let t = self.read_trashed(space_id, key)?;
        let target = match target {
            Some(n) => n.clone(),
            None => {
                let origin = t.attrs.string(prefixes::TRASH_ORIGIN).unwrap_or_default();
                if origin.is_empty() {
                    return Err(Error::invalid(format!("recycle item {} has no origin", key)));
                }
                let (dir, _) = paths::split_dir_name(&origin)?;
                let parent = self.lu.node_from_resource(&RequestContext::default(), &Reference::by_path(space_id, &dir))?;
                parent.child(&t.attrs.string(prefixes::NAME).unwrap_or_default())?
            }
        };
        if target.exists {
            return Err(Error::already_exists(target.name.clone()));
        }
        let parent = Node::read_node(&self.lu, space_id, &NodeRef::live(&target.parent_id), true)?;
        if !parent.exists || !parent.is_dir() {
            return Err(Error::not_found(format!("restore target parent {}", target.parent_id)));
        }

        self.lu.link_child(&parent, &target.name, key)?;
        let live_path = self.lu.internal_path(space_id, key);
        if let Err(e) = fs::rename(&t.path, &live_path) {
            let _ = self.lu.unlink_child(&parent, &target.name);
            return Err(e.into());
        }
        self.lu.backend().rename(&t.path, &live_path)?;

        let mut set = Attributes::new();
        set.set_string(prefixes::NAME, &target.name);
        set.set_string(prefixes::PARENT_ID, &parent.id);
        self.lu.backend().update(&live_path, &[prefixes::TRASH_ORIGIN], &set, true)?;
        match fs::remove_file(&t.link) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let restored = Node::read_node(&self.lu, space_id, &NodeRef::live(key), true)?;
        info!(target: "spacefs::tree", "restored {} as {} under {}", key, restored.name, parent.id);
        let size = self.node_size(&restored)? as i64;
        self.propagate(&restored, size)?;
        Ok(restored)
    }

    /// Permanently remove one recycle bin item with all its content.
    pub fn purge_recycle_item(&self, space_id: &str, key: &str) -> Result<()> {
        let t = self.read_trashed(space_id, key)?;
        self.purge_node(space_id, key, &t.path)?;
        match fs::remove_file(&t.link) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        info!(target: "spacefs::tree", "purged recycle item {} in {}", key, space_id);
        Ok(())
    }

    pub fn empty_recycle(&self, space_id: &str) -> Result<usize> {
        let items = self.list_recycle(space_id)?;
        for item in &items {
            self.purge_recycle_item(space_id, &item.key)?;
        }
        Ok(items.len())
    }

    /// Remove the node stored at `path` together with its descendants, revisions and blobs.
    /// The lock file is left in place.
    pub(crate) fn purge_node(&self, space_id: &str, node_id: &str, path: &Path) -> Result<()> {
        let attrs = match self.lu.backend().all(path) {
            Ok(a) => Some(a),
            Err(e) if e.is_absent() => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(a) = &attrs {
            let is_container = match a.string(prefixes::TYPE) {
                Some(t) => NodeType::parse(&t) == NodeType::Container,
                None => self.lu.type_from_path(path) == NodeType::Container,
            };
            if is_container {
                for (_, child_id) in self.lu.list_entries_at(path)? {
                    let child_path = self.lu.internal_path(space_id, &child_id);
                    self.purge_node(space_id, &child_id, &child_path)?;
                }
            } else {
                self.delete_blob_id(space_id, &a.string(prefixes::BLOB_ID).unwrap_or_default())?;
            }
        }
        for (ts, rev_path) in self.revision_paths(space_id, node_id)? {
            match self.lu.read_blob_id_and_size(&rev_path) {
                Ok((blob_id, _)) => self.delete_blob_id(space_id, &blob_id)?,
                Err(e) => debug!(target: "spacefs::tree", "revision {} of {} without record: {}", ts, node_id, e),
            }
            remove_path(&rev_path)?;
            self.lu.backend().purge(&rev_path)?;
        }
        remove_path(path)?;
        self.lu.backend().purge(path)?;
        let _ = fs::remove_file(sibling(path, ".wlock"));
        debug!(target: "spacefs::tree", "purged node {} in {}", node_id, space_id);
        Ok(())
    }
}
