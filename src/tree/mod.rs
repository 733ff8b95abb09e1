//! Structural operations on the node tree.
//!
//! Every operation is ordered so that a crash between two steps leaves either the old
//! state or a state the operation can be re-run on: records are written before entries
//! link them into a parent, and entries are removed last.

mod propagator;
mod recycle;
mod revisions;

pub use propagator::Change;
pub use recycle::RecycleItem;

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::blobstore::Blobstore;
use crate::error::{Error, Result};
use crate::identity::UserId;
use crate::lookup::{Lookup, ROOT_PARENT};
use crate::metadata::{prefixes, AttrLock, Attributes};
use crate::node::{times, Node, NodeRef, NodeType, QuotaChecker};

pub struct Tree {
    lu: Arc<Lookup>,
    blobstore: Arc<dyn Blobstore>,
    quota: Arc<dyn QuotaChecker>,
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let res = match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match res {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl Tree {
    pub fn new(lu: Arc<Lookup>, blobstore: Arc<dyn Blobstore>, quota: Arc<dyn QuotaChecker>) -> Self {
        Self { lu, blobstore, quota }
    }

    pub fn lookup(&self) -> &Arc<Lookup> { &self.lu }
    pub fn quota_checker(&self) -> &dyn QuotaChecker { self.quota.as_ref() }

    /// Create the storage layout and finish propagations interrupted by a crash.
    pub fn setup(&self) -> Result<()> {
        self.lu.ensure_layout()?;
        let replayed = self.recover_pending_propagations()?;
        if replayed > 0 {
            info!(target: "spacefs::tree", "replayed {} pending propagations", replayed);
        }
        Ok(())
    }

    /// Create the root container of a new space. Space roots carry the space id as node id
    /// and `root` as parent.
    pub fn create_space_root(&self, space_id: &str, name: &str, space_type: &str, owner: Option<&UserId>) -> Result<Node> {
        let path = self.lu.internal_path(space_id, space_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(Error::already_exists(format!("space {}", space_id))),
            Err(e) => return Err(e.into()),
        }
        let mut attrs = Attributes::new();
        attrs.set_string(prefixes::ID, space_id);
        attrs.set_string(prefixes::PARENT_ID, ROOT_PARENT);
        attrs.set_string(prefixes::NAME, name);
        attrs.set_string(prefixes::TYPE, NodeType::Container.as_str());
        attrs.set_string(prefixes::SPACE_NAME, name);
        attrs.set_string(prefixes::SPACE_TYPE, space_type);
        attrs.set_u64(prefixes::TREESIZE, 0);
        attrs.set_string(prefixes::MTIME, &times::format_rfc3339_nano(&Utc::now()));
        if let Some(o) = owner {
            attrs.set_string(prefixes::OWNER_ID, &o.opaque_id);
            attrs.set_string(prefixes::OWNER_IDP, &o.idp);
            attrs.set_string(prefixes::OWNER_TYPE, o.user_type.as_str());
        }
        if let Err(e) = self.lu.backend().set_multiple(&path, &attrs, true) {
            let _ = remove_path(&path);
            return Err(e.into());
        }
        fs::create_dir_all(self.lu.trash_dir(space_id))?;
        fs::create_dir_all(self.lu.blobs_dir(space_id))?;
        info!(target: "spacefs::tree", "created {} space {} ({})", space_type, name, space_id);
        Node::read_node(&self.lu, space_id, &NodeRef::live(space_id), true)
    }

    /// Write the record of a new node, then link it into its parent.
    fn create_node(&self, n: &Node, extra: &Attributes) -> Result<()> {
        let path = n.internal_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        match n.node_type {
            NodeType::Container => fs::create_dir(&path)?,
            _ => {
                OpenOptions::new().write(true).create_new(true).open(&path)?;
            }
        }
        let mut attrs = n.node_metadata();
        attrs.set_string(prefixes::MTIME, &times::format_rfc3339_nano(&Utc::now()));
        attrs.extend(extra);
        if let Err(e) = n.set_xattrs(&attrs, true) {
            let _ = remove_path(&path);
            return Err(e);
        }

        let parent = Node::read_node(&self.lu, &n.space_id, &NodeRef::live(&n.parent_id), true)?;
        if let Err(e) = self.lu.link_child(&parent, &n.name, &n.id) {
            let _ = remove_path(&path);
            let _ = self.lu.backend().purge(&path);
            return Err(e);
        }
        Ok(())
    }

    pub fn create_dir(&self, n: &mut Node) -> Result<()> {
        if n.exists {
            return Err(Error::already_exists(n.name.clone()));
        }
        if n.id.is_empty() {
            n.id = uuid::Uuid::new_v4().to_string();
        }
        n.node_type = NodeType::Container;
        let mut extra = Attributes::new();
        extra.set_u64(prefixes::TREESIZE, 0);
        self.create_node(n, &extra)?;
        n.exists = true;
        debug!(target: "spacefs::tree", "created dir {} ({}) under {}", n.name, n.id, n.parent_id);
        self.propagate(n, 0)
    }

    /// Create an empty file, optionally flagged as processing and with a given mtime.
    pub fn touch_file(&self, n: &mut Node, mark_processing: Option<&str>, mtime: Option<&str>) -> Result<()> {
        if n.exists {
            if let Some(mt) = mtime {
                n.set_mtime(&times::parse_mtime(mt)?)?;
                return Ok(());
            }
            return Err(Error::already_exists(n.name.clone()));
        }
        if n.id.is_empty() {
            n.id = uuid::Uuid::new_v4().to_string();
        }
        n.node_type = NodeType::File;
        let mut extra = Attributes::new();
        if let Some(upload_id) = mark_processing {
            extra.set_string(prefixes::STATUS, &format!("{}{}", prefixes::PROCESSING_STATUS, upload_id));
        }
        if let Some(mt) = mtime {
            extra.set_string(prefixes::MTIME, &times::format_rfc3339_nano(&times::parse_mtime(mt)?));
        }
        self.create_node(n, &extra)?;
        n.exists = true;
        self.propagate(n, 0)
    }

    /// Reserve a brand new file node: create its entry exclusively, write the identifying
    /// record, enforce quota and link it into the parent. The returned lock stays held until
    /// the caller has written the final attributes.
    pub fn init_new_node(&self, n: &Node, size: u64) -> Result<AttrLock> {
        let path = n.internal_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let lock = n.lock()?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(Error::already_exists(n.id.clone())),
            Err(e) => return Err(e.into()),
        }
        let reserve = || -> Result<()> {
            let mut ident = n.node_metadata();
            ident.retain(|k| [prefixes::ID, prefixes::PARENT_ID, prefixes::NAME, prefixes::TYPE].contains(&k));
            n.set_xattrs(&ident, false)?;
            let space_root = n.space_root()?;
            self.quota.check_quota(&space_root, false, 0, size)?;
            let parent = Node::read_node(&self.lu, &n.space_id, &NodeRef::live(&n.parent_id), true)?;
            self.lu.link_child(&parent, &n.name, &n.id)
        };
        if let Err(e) = reserve() {
            let _ = remove_path(&path);
            let _ = self.lu.backend().purge(&path);
            return Err(e);
        }
        debug!(target: "spacefs::tree", "initialized node {} as {}", n.id, n.name);
        Ok(lock)
    }

    /// Move or rename a node within one space. An existing target is purged first.
    ///
    /// The node's record is switched to the new parent and name before its entry is relinked,
    /// remembering the old entry in `move.origin`. Running the same move again after a crash
    /// between the two steps relinks from that origin.
    pub fn move_node(&self, old: &Node, new: &Node) -> Result<()> {
        if old.space_id != new.space_id {
            return Err(Error::not_supported("cross space move"));
        }
        if old.is_space_root() {
            return Err(Error::invalid("cannot move a space root"));
        }
        if new.exists && new.id != old.id {
            let replaced = self.node_size(new)? as i64;
            self.purge_node(&new.space_id, &new.id, &new.internal_path())?;
            self.lu.unlink_child(&new.parent()?, &new.name)?;
            self.propagate(new, -replaced)?;
        }

        let (src_parent, src_name) = self.move_source(old)?;
        let new_parent = Node::read_node(&self.lu, &new.space_id, &NodeRef::live(&new.parent_id), true)?;
        if !new_parent.exists {
            return Err(Error::not_found(format!("target parent {}", new.parent_id)));
        }
        let same_parent = src_parent.id == new_parent.id;
        if !same_parent {
            let mut cur = new_parent.clone();
            while !cur.is_space_root() {
                if cur.id == old.id {
                    return Err(Error::invalid("cannot move a folder into itself"));
                }
                cur = cur.parent()?;
            }
        }

        let mut attrs = Attributes::new();
        attrs.set_string(prefixes::PARENT_ID, &new.parent_id);
        attrs.set_string(prefixes::NAME, &new.name);
        attrs.set_string(prefixes::MOVE_ORIGIN, &format!("{}/{}", src_parent.id, src_name));
        old.set_xattrs(&attrs, true)?;
        let relinked = fs::rename(self.lu.entry_path(&src_parent, &src_name), self.lu.entry_path(&new_parent, &new.name));
        if let Err(e) = relinked {
            let mut back = Attributes::new();
            back.set_string(prefixes::PARENT_ID, &src_parent.id);
            back.set_string(prefixes::NAME, &src_name);
            if let Err(re) = self.lu.backend().update(&old.internal_path(), &[prefixes::MOVE_ORIGIN], &back, true) {
                warn!(target: "spacefs::tree", "restoring record of {} after failed move: {}", old.id, re);
            }
            return Err(e.into());
        }
        old.remove_xattr(prefixes::MOVE_ORIGIN, true)?;

        let mut moved = old.clone();
        moved.parent_id = new.parent_id.clone();
        moved.name = new.name.clone();
        if same_parent {
            return self.propagate(&moved, 0);
        }
        let size = self.node_size(old)? as i64;
        let mut from = old.clone();
        from.parent_id = src_parent.id.clone();
        from.name = src_name;
        self.propagate(&from, -size)?;
        self.propagate(&moved, size)
    }

    /// Parent and name of the entry that currently links `n`: the origin of an unfinished
    /// move if that entry still points at `n`, else what its record says.
    fn move_source(&self, n: &Node) -> Result<(Node, String)> {
        if let Some(origin) = n.xattr_string(prefixes::MOVE_ORIGIN)? {
            if let Some((parent_id, name)) = origin.split_once('/') {
                let parent = Node::read_node(&self.lu, &n.space_id, &NodeRef::live(parent_id), true)?;
                if parent.exists && self.lu.read_entry(&parent, name)?.as_deref() == Some(n.id.as_str()) {
                    debug!(target: "spacefs::tree", "resuming move of {} from {}", n.id, origin);
                    return Ok((parent, name.to_string()));
                }
            }
        }
        Ok((n.parent()?, n.name.clone()))
    }

    /// Size a node contributes to its ancestors.
    pub fn node_size(&self, n: &Node) -> Result<u64> {
        if n.is_dir() {
            Ok(n.tree_size()?.unwrap_or(0))
        } else {
            Ok(n.blob_size)
        }
    }

    /// Existing children of a container. Unreadable entries are skipped.
    pub fn list_folder(&self, n: &Node) -> Result<Vec<Node>> {
        if !n.is_dir() {
            return Err(Error::invalid(format!("{} is not a container", n.id)));
        }
        let mut out = Vec::new();
        for (name, id) in self.lu.list_entries(n)? {
            match Node::read_node(&self.lu, &n.space_id, &NodeRef::live(&id), true) {
                Ok(c) if c.exists => out.push(c),
                Ok(_) => debug!(target: "spacefs::tree", "entry {} points to missing node {}", name, id),
                Err(e) => warn!(target: "spacefs::tree", "could not read child {} of {}: {}", id, n.id, e),
            }
        }
        Ok(out)
    }

    pub fn write_blob(&self, n: &Node, source: &Path) -> Result<()> {
        self.blobstore.upload(n, source)
    }

    /// Content of a node; an empty stream when the node has no blob yet.
    pub fn read_blob(&self, n: &Node) -> Result<Box<dyn Read + Send>> {
        if n.blob_id.is_empty() {
            return Ok(Box::new(std::io::empty()));
        }
        self.blobstore.download(n)
    }

    pub fn delete_blob(&self, n: &Node) -> Result<()> {
        if n.blob_id.is_empty() {
            return Ok(());
        }
        self.blobstore.delete(n)
    }

    fn delete_blob_id(&self, space_id: &str, blob_id: &str) -> Result<()> {
        if blob_id.is_empty() {
            return Ok(());
        }
        let n = Node::new(&self.lu, space_id, "", "", "", 0, blob_id, NodeType::File, None);
        self.blobstore.delete(&n)
    }
}

#[cfg(test)]
#[path = "tree_tests.rs"]
mod tree_tests;
