//! Path lookup: maps `(space, node)` identities to on-disk locations and resolves
//! references into nodes.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::identity::{RequestContext, UserId};
use crate::metadata::{prefixes, Attributes, MetadataBackend};
use crate::node::{Node, NodeRef, NodeType};
use crate::paths;

pub const SPACE_TYPE_PERSONAL: &str = "personal";
pub const SPACE_TYPE_PROJECT: &str = "project";

/// Parent id recorded on space roots.
pub const ROOT_PARENT: &str = "root";

/// Address of a resource: a starting node (or the space root) plus an optional relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Reference {
    pub space_id: String,
    pub node_id: Option<String>,
    pub path: String,
}

impl Reference {
    pub fn space_root(space_id: &str) -> Self {
        Self { space_id: space_id.to_string(), node_id: None, path: String::new() }
    }

    pub fn by_id(space_id: &str, node_id: &str) -> Self {
        Self { space_id: space_id.to_string(), node_id: Some(node_id.to_string()), path: String::new() }
    }

    pub fn by_path(space_id: &str, path: &str) -> Self {
        Self { space_id: space_id.to_string(), node_id: None, path: path.to_string() }
    }
}

/// Split an id into `depth` segments of `width` characters followed by the rest,
/// spreading nodes across directories.
pub fn pathify(id: &str, depth: usize, width: usize) -> String {
    let chars: Vec<char> = id.chars().collect();
    let mut out = String::with_capacity(id.len() + depth);
    let mut i = 0;
    for _ in 0..depth {
        if i + width >= chars.len() {
            break;
        }
        out.extend(&chars[i..i + width]);
        out.push('/');
        i += width;
    }
    out.extend(&chars[i..]);
    out
}

pub struct Lookup {
    options: Options,
    backend: Arc<dyn MetadataBackend>,
}

impl Lookup {
    pub fn new(options: Options, backend: Arc<dyn MetadataBackend>) -> Self {
        Self { options, backend }
    }

    pub fn options(&self) -> &Options { &self.options }
    pub fn backend(&self) -> &dyn MetadataBackend { self.backend.as_ref() }
    pub fn root(&self) -> &Path { &self.options.root }

    pub fn spaces_dir(&self) -> PathBuf { self.root().join("spaces") }
    pub fn uploads_dir(&self) -> PathBuf { self.root().join("uploads") }
    pub fn changes_dir(&self) -> PathBuf { self.root().join("changes") }
    pub fn tmp_dir(&self) -> PathBuf { self.root().join("tmp") }

    pub fn space_dir(&self, space_id: &str) -> PathBuf {
        self.spaces_dir().join(pathify(space_id, 1, 2))
    }

    pub fn nodes_dir(&self, space_id: &str) -> PathBuf { self.space_dir(space_id).join("nodes") }
    pub fn trash_dir(&self, space_id: &str) -> PathBuf { self.space_dir(space_id).join("trash") }
    pub fn blobs_dir(&self, space_id: &str) -> PathBuf { self.space_dir(space_id).join("blobs") }

    /// On-disk path of a node. Revision and trash keys (`<id>.REV.<ts>`) map next to the live node.
    pub fn internal_path(&self, space_id: &str, node_key: &str) -> PathBuf {
        self.nodes_dir(space_id).join(pathify(node_key, 4, 2))
    }

    pub fn revision_path(&self, space_id: &str, node_id: &str, timestamp: &str) -> PathBuf {
        self.internal_path(space_id, &NodeRef::revision(node_id, timestamp).key())
    }

    /// Create every directory the engine writes into.
    pub fn ensure_layout(&self) -> Result<()> {
        for d in [self.spaces_dir(), self.uploads_dir(), self.changes_dir(), self.tmp_dir()] {
            fs::create_dir_all(&d)?;
        }
        Ok(())
    }

    /// Generate the id for a new space. Personal spaces reuse the owner's id.
    pub fn generate_space_id(&self, space_type: &str, owner: Option<&UserId>) -> Result<String> {
        match space_type {
            SPACE_TYPE_PERSONAL => owner
                .map(|o| o.opaque_id.clone())
                .filter(|id| !id.is_empty())
                .ok_or_else(|| Error::invalid("personal spaces need an owner")),
            _ => Ok(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Resolve a reference to a node; the last segment may not exist.
    pub fn node_from_resource(self: &Arc<Self>, _ctx: &RequestContext, r: &Reference) -> Result<Node> {
        if r.space_id.is_empty() {
            return Err(Error::invalid("reference without space id"));
        }
        let start = match &r.node_id {
            Some(id) if !id.is_empty() => Node::read_node(self, &r.space_id, &NodeRef::parse(id), false)?,
            _ => self.node_from_space_id(&r.space_id)?,
        };
        if r.path.is_empty() || r.path == "." {
            return Ok(start);
        }
        if !start.exists {
            return Err(Error::not_found(format!("{}/{}", r.space_id, r.node_id.as_deref().unwrap_or(""))));
        }
        self.walk_path(start, &r.path)
    }

    pub fn node_from_id(self: &Arc<Self>, space_id: &str, node_id: &str) -> Result<Node> {
        Node::read_node(self, space_id, &NodeRef::parse(node_id), false)
    }

    pub fn node_from_space_id(self: &Arc<Self>, space_id: &str) -> Result<Node> {
        let root = Node::read_node(self, space_id, &NodeRef::live(space_id), false)?;
        if !root.exists {
            return Err(Error::not_found(format!("space {}", space_id)));
        }
        Ok(root)
    }

    /// Follow `path` segment by segment from `start`. Intermediate segments must exist.
    pub fn walk_path(&self, start: Node, path: &str) -> Result<Node> {
        let segments = paths::split_relative(path)?;
        let mut cur = start;
        for (i, seg) in segments.iter().enumerate() {
            cur = cur.child(seg)?;
            if !cur.exists && i + 1 < segments.len() {
                return Err(Error::not_found(seg.clone()));
            }
        }
        Ok(cur)
    }

    /// Absolute path of a node within its space, built by walking parents.
    pub fn path(&self, node: &Node) -> Result<String> {
        let mut names = Vec::new();
        let mut cur = node.clone();
        while !cur.is_space_root() {
            names.push(cur.name.clone());
            cur = cur.parent()?;
            if !cur.exists {
                return Err(Error::internal(format!("dangling parent of {}", node.id)));
            }
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Copy filtered attributes from `src` to `dst` in one write.
    pub fn copy_metadata<F>(&self, src: &Path, dst: &Path, filter: F, acquire_target_lock: bool) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        let all = self.backend.all(src)?;
        let copied: Attributes = all.iter().filter(|(k, _)| filter(k)).map(|(k, v)| (k.clone(), v.clone())).collect();
        self.backend.set_multiple(dst, &copied, acquire_target_lock)?;
        Ok(())
    }

    pub fn read_blob_id_and_size(&self, path: &Path) -> Result<(String, u64)> {
        let attrs = self.backend.all(path)?;
        let blob_id = attrs.string(prefixes::BLOB_ID).unwrap_or_default();
        let size = attrs.u64(prefixes::BLOB_SIZE).unwrap_or(0);
        Ok((blob_id, size))
    }

    pub fn type_from_path(&self, path: &Path) -> NodeType {
        match fs::symlink_metadata(path) {
            Ok(m) if m.is_dir() => NodeType::Container,
            Ok(m) if m.is_file() => NodeType::File,
            Ok(m) if m.file_type().is_symlink() => NodeType::Symlink,
            _ => NodeType::Invalid,
        }
    }

    /// Entry path linking `name` to a child id inside a container.
    pub fn entry_path(&self, parent: &Node, name: &str) -> PathBuf {
        parent.internal_path().join(name)
    }

    /// Atomically create the name entry for a child. Fails with `AlreadyExists` if the name is
    /// taken by a node that has a record. An entry left behind by an interrupted create, one
    /// whose target has no record, is taken over under the parent's lock.
    pub fn link_child(&self, parent: &Node, name: &str, child_id: &str) -> Result<()> {
        paths::validate_name(name)?;
        let entry = self.entry_path(parent, name);
        let tmp_dir = self.tmp_dir();
        fs::create_dir_all(&tmp_dir)?;
        let tmp = tmp_dir.join(format!("entry.{}", uuid::Uuid::new_v4().simple()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(child_id.as_bytes())?;
            f.sync_all()?;
        }
        let res = match fs::hard_link(&tmp, &entry) {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self.replace_stale_entry(parent, name, child_id, &tmp),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(format!("parent {} of {}", parent.id, name))),
            other => other.map_err(Error::from),
        };
        let _ = fs::remove_file(&tmp);
        res
    }

    fn replace_stale_entry(&self, parent: &Node, name: &str, child_id: &str, tmp: &Path) -> Result<()> {
        let _guard = self.backend.lock(&parent.internal_path())?;
        let current = match self.read_entry(parent, name)? {
            Some(id) => id,
            None => return Err(Error::aborted(format!("entry {} vanished while linking", name))),
        };
        if current == child_id {
            return Ok(());
        }
        match self.backend.all(&self.internal_path(&parent.space_id, &current)) {
            Ok(_) => Err(Error::already_exists(name.to_string())),
            Err(e) if e.is_not_exist() || e.is_not_dir() => {
                fs::rename(tmp, self.entry_path(parent, name))?;
                warn!(target: "spacefs::lookup", "replaced stale entry {} -> {} with {}", name, current, child_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the child id an entry points to; `None` when the name is not present.
    pub fn read_entry(&self, parent: &Node, name: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.entry_path(parent, name)) {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::NotADirectory => Ok(None),
            Err(e) if e.kind() == ErrorKind::IsADirectory => Err(Error::internal(format!("entry {} is a directory", name))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn unlink_child(&self, parent: &Node, name: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(parent, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Entries of a container as `(name, child id)` pairs, sorted by name.
    pub fn list_entries(&self, parent: &Node) -> Result<Vec<(String, String)>> {
        self.list_entries_at(&parent.internal_path())
    }

    /// Entries of the container directory at `dir`, which may be a trashed node.
    pub fn list_entries_at(&self, dir: &Path) -> Result<Vec<(String, String)>> {
        let rd = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for ent in rd {
            let ent = ent?;
            let name = ent.file_name().to_string_lossy().to_string();
            match fs::read_to_string(ent.path()) {
                Ok(id) if !id.trim().is_empty() => out.push((name, id.trim().to_string())),
                Ok(_) => debug!(target: "spacefs::lookup", "skipping empty entry {}", ent.path().display()),
                Err(e) => debug!(target: "spacefs::lookup", "skipping unreadable entry {}: {}", ent.path().display(), e),
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pathify_splits_prefix() {
        assert_eq!(pathify("abcdefghij", 4, 2), "ab/cd/ef/gh/ij");
        assert_eq!(pathify("abc", 4, 2), "ab/c");
        assert_eq!(pathify("ab", 4, 2), "ab");
        assert_eq!(pathify("space-1", 1, 2), "sp/ace-1");
    }

    #[test]
    fn personal_space_id_is_owner_id() {
        let lu = Lookup::new(Options::with_root("/tmp/x"), Arc::new(crate::metadata::FileBackend::default()));
        let owner = UserId::new("local", "alice-id", crate::identity::UserType::Primary);
        assert_eq!(lu.generate_space_id(SPACE_TYPE_PERSONAL, Some(&owner)).unwrap(), "alice-id");
        assert!(lu.generate_space_id(SPACE_TYPE_PERSONAL, None).is_err());
        assert_ne!(lu.generate_space_id(SPACE_TYPE_PROJECT, Some(&owner)).unwrap(), "alice-id");
    }
}
