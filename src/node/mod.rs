//! Nodes: the tree entities addressed by `(space id, node id)`.
//! Everything a node knows about itself lives in its attribute record; the on-disk entry
//! only tells containers from files when the type attribute is missing.

pub mod checksums;
pub mod grants;
pub mod locks;
pub mod mime;
mod node_ref;
pub mod permissions;
pub mod quota;
mod resource_info;
pub mod times;

pub use grants::{Grant, Grantee};
pub use locks::{Lock, LockType};
pub use node_ref::{NodeRef, REVISION_DELIMITER, TRASH_DELIMITER};
pub use permissions::Permissions;
pub use quota::{check_quota_values, DiskQuotaChecker, QuotaChecker};
pub use resource_info::{InfoRequest, Quota, ResourceId, ResourceInfo};

use chrono::{DateTime, Utc};
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identity::{RequestContext, UserId, UserType};
use crate::lookup::{Lookup, ROOT_PARENT};
use crate::metadata::{prefixes, AttrError, AttrLock, Attributes};
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Invalid,
    File,
    Container,
    Symlink,
    Reference,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Invalid => "invalid",
            NodeType::File => "file",
            NodeType::Container => "container",
            NodeType::Symlink => "symlink",
            NodeType::Reference => "reference",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "file" => NodeType::File,
            "container" => NodeType::Container,
            "symlink" => NodeType::Symlink,
            "reference" => NodeType::Reference,
            _ => NodeType::Invalid,
        }
    }
}

/// Etag of a node: md5 over the id followed by the binary encoding of its tree mtime.
pub fn calculate_etag(node_id: &str, tmtime: &DateTime<Utc>) -> String {
    let mut h = Md5::new();
    h.update(node_id.as_bytes());
    h.update(times::marshal_binary(tmtime));
    format!("\"{}\"", hex::encode(h.finalize()))
}

#[derive(Clone)]
pub struct Node {
    pub space_id: String,
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub node_type: NodeType,
    pub blob_id: String,
    pub blob_size: u64,
    /// False when no attribute record could be read for the node.
    pub exists: bool,
    /// Revision timestamp when this node describes a stored revision.
    pub revision: Option<String>,
    owner: Option<UserId>,
    lu: Arc<Lookup>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("space_id", &self.space_id)
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("name", &self.name)
            .field("type", &self.node_type)
            .field("blob_id", &self.blob_id)
            .field("blob_size", &self.blob_size)
            .field("exists", &self.exists)
            .field("revision", &self.revision)
            .finish()
    }
}

fn owner_from_attrs(attrs: &Attributes) -> Option<UserId> {
    let id = attrs.string(prefixes::OWNER_ID).filter(|s| !s.is_empty())?;
    Some(UserId {
        idp: attrs.string(prefixes::OWNER_IDP).unwrap_or_default(),
        opaque_id: id,
        user_type: attrs.string(prefixes::OWNER_TYPE).map(|t| UserType::parse(&t)).unwrap_or_default(),
    })
}

fn absent_ok(res: std::result::Result<Attributes, AttrError>) -> Result<Option<Attributes>> {
    match res {
        Ok(a) => Ok(Some(a)),
        Err(e) if e.is_absent() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Node {
    /// In-memory node that has not been written yet.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lu: &Arc<Lookup>,
        space_id: &str,
        id: &str,
        parent_id: &str,
        name: &str,
        blob_size: u64,
        blob_id: &str,
        node_type: NodeType,
        owner: Option<UserId>,
    ) -> Self {
        Self {
            space_id: space_id.to_string(),
            id: id.to_string(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            node_type,
            blob_id: blob_id.to_string(),
            blob_size,
            exists: false,
            revision: None,
            owner,
            lu: lu.clone(),
        }
    }

    /// Read a node. A missing record yields a node with `exists == false`, not an error.
    pub fn read_node(lu: &Arc<Lookup>, space_id: &str, r: &NodeRef, can_list_disabled: bool) -> Result<Node> {
        let backend = lu.backend();
        let missing = |owner: Option<UserId>| {
            let mut n = Node::new(lu, space_id, r.id(), "", "", 0, "", NodeType::Invalid, owner);
            n.revision = r.timestamp().map(str::to_string);
            n
        };

        let root_attrs = match absent_ok(backend.all(&lu.internal_path(space_id, space_id)))? {
            Some(a) => a,
            None => return Ok(missing(None)),
        };
        if !can_list_disabled && root_attrs.contains_key(prefixes::DTIME) {
            return Err(Error::not_found(format!("space {} is disabled", space_id)));
        }
        let owner = owner_from_attrs(&root_attrs);

        let live_path = lu.internal_path(space_id, r.id());
        let attrs = if r.id() == space_id {
            root_attrs
        } else {
            match absent_ok(backend.all(&live_path))? {
                Some(a) => a,
                None => return Ok(missing(owner)),
            }
        };

        let parent_id = attrs
            .string(prefixes::PARENT_ID)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::internal(format!("missing parent id on node {}/{}", space_id, r.id())))?;
        let node_type = match attrs.string(prefixes::TYPE) {
            Some(t) => NodeType::parse(&t),
            None => lu.type_from_path(&live_path),
        };
        let mut n = Node::new(
            lu,
            space_id,
            r.id(),
            &parent_id,
            &attrs.string(prefixes::NAME).unwrap_or_default(),
            0,
            "",
            node_type,
            owner.clone(),
        );
        n.exists = true;

        match r {
            NodeRef::Live(_) => {
                n.blob_id = attrs.string(prefixes::BLOB_ID).unwrap_or_default();
                n.blob_size = attrs.u64(prefixes::BLOB_SIZE).unwrap_or(0);
            }
            NodeRef::Revision { timestamp, .. } => {
                let rev_path = lu.internal_path(space_id, &r.key());
                match absent_ok(backend.all(&rev_path))? {
                    Some(rev) => {
                        n.blob_id = rev.string(prefixes::BLOB_ID).unwrap_or_default();
                        n.blob_size = rev.u64(prefixes::BLOB_SIZE).unwrap_or(0);
                        n.revision = Some(timestamp.clone());
                    }
                    None => return Ok(missing(owner)),
                }
            }
        }
        Ok(n)
    }

    /// Resolve one path segment below this container. A miss yields a non-existing node
    /// carrying the requested name and this node as parent.
    pub fn child(&self, name: &str) -> Result<Node> {
        let name = paths::normalize_nfc(name);
        let nonexistent = || {
            Node::new(&self.lu, &self.space_id, "", &self.id, &name, 0, "", NodeType::Invalid, self.owner.clone())
        };
        match self.lu.read_entry(self, &name)? {
            None => Ok(nonexistent()),
            Some(id) => {
                let c = Node::read_node(&self.lu, &self.space_id, &NodeRef::live(&id), true)?;
                if !c.exists {
                    let mut dangling = nonexistent();
                    dangling.id = id;
                    return Ok(dangling);
                }
                Ok(c)
            }
        }
    }

    pub fn parent(&self) -> Result<Node> {
        if self.is_space_root() || self.parent_id.is_empty() || self.parent_id == ROOT_PARENT {
            return Err(Error::not_found(format!("node {} has no parent", self.id)));
        }
        Node::read_node(&self.lu, &self.space_id, &NodeRef::live(&self.parent_id), true)
    }

    pub fn space_root(&self) -> Result<Node> {
        Node::read_node(&self.lu, &self.space_id, &NodeRef::live(&self.space_id), true)
    }

    pub fn lookup(&self) -> &Arc<Lookup> { &self.lu }
    pub fn is_space_root(&self) -> bool { !self.id.is_empty() && self.id == self.space_id }
    pub fn is_dir(&self) -> bool { self.node_type == NodeType::Container }
    pub fn owner(&self) -> Option<&UserId> { self.owner.as_ref() }

    pub fn node_ref(&self) -> NodeRef {
        match &self.revision {
            Some(ts) => NodeRef::revision(&self.id, ts),
            None => NodeRef::live(&self.id),
        }
    }

    /// Location of this node's entry on disk.
    pub fn internal_path(&self) -> PathBuf {
        self.lu.internal_path(&self.space_id, &self.node_ref().key())
    }

    pub fn parent_path(&self) -> PathBuf {
        self.lu.internal_path(&self.space_id, &self.parent_id)
    }

    pub fn xattrs(&self) -> Result<Attributes> {
        Ok(self.lu.backend().all(&self.internal_path())?)
    }

    /// A single attribute as a string; `None` when unset or the record is gone.
    pub fn xattr_string(&self, key: &str) -> Result<Option<String>> {
        match self.lu.backend().get_string(&self.internal_path(), key) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_absent() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_xattr(&self, key: &str, value: &[u8]) -> Result<()> {
        Ok(self.lu.backend().set(&self.internal_path(), key, value)?)
    }

    pub fn set_xattr_string(&self, key: &str, value: &str) -> Result<()> {
        self.set_xattr(key, value.as_bytes())
    }

    pub fn set_xattrs(&self, attrs: &Attributes, acquire_lock: bool) -> Result<()> {
        Ok(self.lu.backend().set_multiple(&self.internal_path(), attrs, acquire_lock)?)
    }

    pub fn remove_xattr(&self, key: &str, acquire_lock: bool) -> Result<()> {
        Ok(self.lu.backend().remove(&self.internal_path(), key, acquire_lock)?)
    }

    /// Take the exclusive attribute lock of this node.
    pub fn lock(&self) -> Result<AttrLock> {
        Ok(self.lu.backend().lock(&self.internal_path())?)
    }

    /// Base attributes written when a node is created.
    pub fn node_metadata(&self) -> Attributes {
        let mut a = Attributes::new();
        a.set_string(prefixes::ID, &self.id);
        a.set_string(prefixes::PARENT_ID, &self.parent_id);
        a.set_string(prefixes::NAME, &self.name);
        a.set_string(prefixes::TYPE, self.node_type.as_str());
        if self.node_type == NodeType::File {
            a.set_string(prefixes::BLOB_ID, &self.blob_id);
            a.set_u64(prefixes::BLOB_SIZE, self.blob_size);
        }
        a
    }

    pub fn mtime(&self) -> Result<DateTime<Utc>> {
        if let Some(s) = self.xattr_string(prefixes::MTIME)? {
            return times::parse_rfc3339(&s);
        }
        let md = std::fs::symlink_metadata(self.internal_path())?;
        Ok(times::from_system_time(md.modified()?))
    }

    pub fn set_mtime(&self, t: &DateTime<Utc>) -> Result<()> {
        self.set_xattr_string(prefixes::MTIME, &times::format_rfc3339_nano(t))
    }

    /// Tree mtime, falling back to the node's own mtime.
    pub fn tmtime(&self) -> Result<DateTime<Utc>> {
        match self.xattr_string(prefixes::TMTIME)? {
            Some(s) => times::parse_rfc3339(&s),
            None => self.mtime(),
        }
    }

    pub fn set_tmtime(&self, t: Option<&DateTime<Utc>>) -> Result<()> {
        match t {
            Some(t) => self.set_xattr_string(prefixes::TMTIME, &times::format_rfc3339_nano(t)),
            None => self.remove_xattr(prefixes::TMTIME, true),
        }
    }

    pub fn dtime(&self) -> Result<Option<DateTime<Utc>>> {
        match self.xattr_string(prefixes::DTIME)? {
            Some(s) => Ok(Some(times::parse_rfc3339(&s)?)),
            None => Ok(None),
        }
    }

    /// At a space root the deletion time doubles as the "space disabled" flag.
    pub fn set_dtime(&self, t: Option<&DateTime<Utc>>) -> Result<()> {
        match t {
            Some(t) => self.set_xattr_string(prefixes::DTIME, &times::format_rfc3339_nano(t)),
            None => self.remove_xattr(prefixes::DTIME, true),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.dtime(), Ok(Some(_)))
    }

    pub fn tree_size(&self) -> Result<Option<u64>> {
        match self.xattr_string(prefixes::TREESIZE)? {
            Some(s) => s
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::internal(format!("invalid treesize '{}' on {}", s, self.id))),
            None => Ok(None),
        }
    }

    pub fn set_tree_size(&self, size: u64) -> Result<()> {
        self.set_xattr_string(prefixes::TREESIZE, &size.to_string())
    }

    pub fn etag(&self) -> Result<String> {
        if let Some(tmp) = self.xattr_string(prefixes::TMP_ETAG)?.filter(|t| !t.is_empty()) {
            return Ok(format!("\"{}\"", hex::encode(tmp.as_bytes())));
        }
        Ok(calculate_etag(&self.id, &self.tmtime()?))
    }

    /// Pin a temporary etag until the next propagation clears it.
    pub fn set_etag(&self, value: &str) -> Result<()> {
        let value = value.trim_matches('"');
        let calculated = calculate_etag(&self.id, &self.tmtime()?);
        if calculated.trim_matches('"') == value {
            return Ok(());
        }
        self.set_xattr_string(prefixes::TMP_ETAG, value)
    }

    pub fn unset_temp_etag(&self) -> Result<()> {
        self.remove_xattr(prefixes::TMP_ETAG, true)
    }

    pub fn processing_id(&self) -> Result<Option<String>> {
        Ok(self
            .xattr_string(prefixes::STATUS)?
            .and_then(|s| s.strip_prefix(prefixes::PROCESSING_STATUS).map(str::to_string)))
    }

    pub fn is_processing(&self) -> bool {
        matches!(self.processing_id(), Ok(Some(_)))
    }

    pub fn mark_processing(&self, upload_id: &str) -> Result<()> {
        self.set_xattr_string(prefixes::STATUS, &format!("{}{}", prefixes::PROCESSING_STATUS, upload_id))
    }

    /// Clear the processing marker if it still names `upload_id`.
    pub fn unmark_processing(&self, upload_id: &str) -> Result<()> {
        let _guard = self.lock()?;
        self.unmark_processing_locked(upload_id)
    }

    /// Same as `unmark_processing` for callers already holding the node lock.
    pub(crate) fn unmark_processing_locked(&self, upload_id: &str) -> Result<()> {
        let current = self.xattr_string(prefixes::STATUS)?;
        let marker = format!("{}{}", prefixes::PROCESSING_STATUS, upload_id);
        if current.as_deref() == Some(marker.as_str()) {
            self.remove_xattr(prefixes::STATUS, false)?;
        }
        Ok(())
    }

    pub fn set_scan_data(&self, status: &str, date: &DateTime<Utc>) -> Result<()> {
        let mut a = Attributes::new();
        a.set_string(prefixes::SCAN_STATUS, status);
        a.set_string(prefixes::SCAN_DATE, &times::format_rfc3339_nano(date));
        self.set_xattrs(&a, true)
    }

    pub fn scan_data(&self) -> Result<Option<(String, DateTime<Utc>)>> {
        let attrs = match absent_ok(self.lu.backend().all(&self.internal_path()))? {
            Some(a) => a,
            None => return Ok(None),
        };
        match (attrs.string(prefixes::SCAN_STATUS), attrs.string(prefixes::SCAN_DATE)) {
            (Some(s), Some(d)) => Ok(Some((s, times::parse_rfc3339(&d)?))),
            _ => Ok(None),
        }
    }

    pub fn set_favorite(&self, user: &UserId, favorite: bool) -> Result<()> {
        let key = prefixes::favorite_key(&user.opaque_id);
        if favorite {
            self.set_xattr_string(&key, "1")
        } else {
            self.remove_xattr(&key, true)
        }
    }

    pub fn is_favorite(&self, user: &UserId) -> bool {
        matches!(self.xattr_string(&prefixes::favorite_key(&user.opaque_id)), Ok(Some(v)) if v == "1")
    }

    pub fn is_owner(&self, ctx: &RequestContext) -> bool {
        match (&ctx.user, &self.owner) {
            (Some(u), Some(o)) => u.id.opaque_id == o.opaque_id && (o.idp.is_empty() || u.id.idp == o.idp),
            _ => false,
        }
    }

    /// Permissions the caller holds on this node alone. The owner gets everything.
    pub fn permission_set(&self, ctx: &RequestContext) -> Result<(Permissions, bool)> {
        if self.is_owner(ctx) {
            return Ok((Permissions::full(), false));
        }
        match &ctx.user {
            Some(u) => self.read_user_permissions(u),
            None => Ok((Permissions::none(), false)),
        }
    }
}
