//! The storage engine as callers see it: every operation resolves a reference, checks the
//! caller's permissions and resource locks, then delegates to the tree or the upload store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::blobstore::LocalBlobstore;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::events::Publisher;
use crate::identity::{RequestContext, UserId};
use crate::lookup::{Lookup, Reference, SPACE_TYPE_PERSONAL};
use crate::metadata::{prefixes, Attributes, FileBackend};
use crate::metrics;
use crate::node::checksums::DeclaredChecksum;
use crate::node::{
    calculate_etag, times, DiskQuotaChecker, Grant, Grantee, InfoRequest, Lock, Node, NodeRef, Permissions,
    QuotaChecker, ResourceInfo,
};
use crate::paths;
use crate::permissions::PermissionResolver;
use crate::tree::{RecycleItem, Tree};
use crate::upload::{meta, UploadSession, UploadStore};

/// Parameters of a new space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSpace {
    pub space_type: String,
    pub name: String,
    /// Defaults to the caller for personal spaces.
    pub owner: Option<UserId>,
    pub quota: Option<i64>,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub id: String,
    pub name: String,
    pub space_type: String,
    pub alias: Option<String>,
    pub owner: Option<UserId>,
    pub quota: Option<String>,
    pub used: u64,
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub key: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub etag: String,
}

pub struct Filesystem {
    lu: Arc<Lookup>,
    tree: Arc<Tree>,
    permissions: PermissionResolver,
    uploads: UploadStore,
}

impl Filesystem {
    pub fn new(opts: Options, publisher: Option<Arc<dyn Publisher>>) -> Result<Self> {
        Self::with_quota_checker(opts, Arc::new(DiskQuotaChecker), publisher)
    }

    pub fn with_quota_checker(
        opts: Options,
        quota: Arc<dyn QuotaChecker>,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Result<Self> {
        let backend = Arc::new(FileBackend::new(opts.lock_timeout(), opts.lock_poll()));
        let blobs = Arc::new(LocalBlobstore::new(&opts.root));
        let lu = Arc::new(Lookup::new(opts, backend));
        let tree = Arc::new(Tree::new(lu.clone(), blobs, quota));
        tree.setup()?;
        let uploads = UploadStore::new(lu.clone(), tree.clone(), publisher);
        info!(target: "spacefs::fs", "storage opened at {}", lu.root().display());
        Ok(Self { permissions: PermissionResolver::new(lu.clone()), lu, tree, uploads })
    }

    pub fn lookup(&self) -> &Arc<Lookup> { &self.lu }
    pub fn tree(&self) -> &Arc<Tree> { &self.tree }
    pub fn uploads(&self) -> &UploadStore { &self.uploads }

    fn resolve(&self, ctx: &RequestContext, r: &Reference) -> Result<Node> {
        self.lu.node_from_resource(ctx, r)
    }

    fn existing(&self, ctx: &RequestContext, r: &Reference) -> Result<Node> {
        let n = self.resolve(ctx, r)?;
        if !n.exists {
            return Err(Error::not_found(format!("{}/{}", r.space_id, r.path)));
        }
        Ok(n)
    }

    fn describe(&self, ctx: &RequestContext, n: &Node, p: Permissions, req: &InfoRequest) -> Result<ResourceInfo> {
        n.as_resource_info(ctx, p, req)
    }

    // spaces

    pub fn create_space(&self, ctx: &RequestContext, req: &CreateSpace) -> Result<ResourceInfo> {
        let caller = ctx.user.as_ref().ok_or_else(|| Error::permission_denied("anonymous space creation"))?;
        let owner = match (&req.owner, req.space_type.as_str()) {
            (Some(o), _) => Some(o.clone()),
            (None, SPACE_TYPE_PERSONAL) => Some(caller.id.clone()),
            (None, _) => None,
        };
        let space_id = self.lu.generate_space_id(&req.space_type, owner.as_ref())?;
        let root = self.tree.create_space_root(&space_id, &req.name, &req.space_type, owner.as_ref())?;

        let mut attrs = Attributes::new();
        if let Some(q) = req.quota {
            attrs.set_string(prefixes::QUOTA, &q.to_string());
        }
        if let Some(alias) = &req.alias {
            attrs.set_string(prefixes::SPACE_ALIAS, alias);
        }
        if owner.is_none() {
            let mut manager = Grant::new(Grantee::User(caller.id.opaque_id.clone()), Permissions::full());
            manager.creator = Some(caller.id.opaque_id.clone());
            manager.ctime = Some(Utc::now());
            attrs.set(manager.grantee.attr_key()?, manager.encode()?);
        }
        if !attrs.is_empty() {
            root.set_xattrs(&attrs, true)?;
        }
        let (p, _) = self.permissions.assemble_permissions(ctx, &root)?;
        self.describe(ctx, &root, p, &InfoRequest::all())
    }

    /// Spaces the caller can see. Disabled spaces are only listed for their managers.
    pub fn list_spaces(&self, ctx: &RequestContext) -> Result<Vec<SpaceInfo>> {
        let mut out = Vec::new();
        let base = self.lu.spaces_dir();
        for ent in WalkDir::new(&base).min_depth(1).max_depth(2) {
            let ent = match ent {
                Ok(e) => e,
                Err(e) => {
                    debug!(target: "spacefs::fs", "skipping unreadable space dir: {}", e);
                    continue;
                }
            };
            if !ent.file_type().is_dir() || !ent.path().join("nodes").is_dir() {
                continue;
            }
            let Ok(rel) = ent.path().strip_prefix(&base) else { continue };
            let space_id: String = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
            let root = Node::read_node(&self.lu, &space_id, &NodeRef::live(&space_id), true)?;
            if !root.exists {
                continue;
            }
            let visible = if root.is_disabled() {
                let (p, denied) = root.permission_set(ctx)?;
                root.is_owner(ctx) || (!denied && p.add_grant)
            } else {
                let (p, denied) = self.permissions.assemble_permissions(ctx, &root)?;
                !denied && p.stat
            };
            if visible {
                out.push(space_info(&root)?);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn set_quota(&self, ctx: &RequestContext, space_id: &str, quota: i64) -> Result<()> {
        let root = self.lu.node_from_space_id(space_id)?;
        self.permissions.require(ctx, &root, "set quota", |p| p.add_grant)?;
        root.set_xattr_string(prefixes::QUOTA, &quota.to_string())
    }

    pub fn disable_space(&self, ctx: &RequestContext, space_id: &str) -> Result<()> {
        let root = self.lu.node_from_space_id(space_id)?;
        self.permissions.require(ctx, &root, "disable space", |p| p.delete)?;
        root.set_dtime(Some(&Utc::now()))?;
        info!(target: "spacefs::fs", "disabled space {}", space_id);
        Ok(())
    }

    pub fn restore_space(&self, ctx: &RequestContext, space_id: &str) -> Result<()> {
        let root = Node::read_node(&self.lu, space_id, &NodeRef::live(space_id), true)?;
        if !root.exists {
            return Err(Error::not_found(format!("space {}", space_id)));
        }
        let (p, denied) = root.permission_set(ctx)?;
        if denied || !(p.add_grant || p.delete) {
            return Err(Error::permission_denied(format!("restore space {}", space_id)));
        }
        root.set_dtime(None)
    }

    // namespace

    pub fn create_dir(&self, ctx: &RequestContext, r: &Reference) -> Result<ResourceInfo> {
        let mut n = self.resolve(ctx, r)?;
        if n.exists {
            return Err(Error::already_exists(r.path.clone()));
        }
        paths::validate_name(&n.name)?;
        let p = self.permissions.require(ctx, &n, "create container", |p| p.create_container)?;
        self.tree.create_dir(&mut n)?;
        self.describe(ctx, &self.lu.node_from_id(&n.space_id, &n.id)?, p, &InfoRequest::all())
    }

    /// Create an empty file, or only set the mtime of an existing one.
    pub fn touch_file(&self, ctx: &RequestContext, r: &Reference, mtime: Option<&str>) -> Result<()> {
        let mut n = self.resolve(ctx, r)?;
        paths::validate_name(&n.name)?;
        self.permissions.require(ctx, &n, "touch", |p| p.initiate_file_upload)?;
        if n.exists {
            n.check_lock(ctx)?;
        }
        self.tree.touch_file(&mut n, None, mtime)
    }

    pub fn get_md(&self, ctx: &RequestContext, r: &Reference, req: &InfoRequest) -> Result<ResourceInfo> {
        let n = self.existing(ctx, r)?;
        let p = self.permissions.require(ctx, &n, "stat", |p| p.stat)?;
        self.describe(ctx, &n, p, req)
    }

    pub fn get_path(&self, ctx: &RequestContext, r: &Reference) -> Result<String> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "get path", |p| p.get_path)?;
        self.lu.path(&n)
    }

    /// Children the caller may stat; children behind a deny grant are left out.
    pub fn list_folder(&self, ctx: &RequestContext, r: &Reference, req: &InfoRequest) -> Result<Vec<ResourceInfo>> {
        let dir = self.existing(ctx, r)?;
        self.permissions.require(ctx, &dir, "list container", |p| p.list_container)?;
        let mut out = Vec::new();
        for child in self.tree.list_folder(&dir)? {
            let (p, denied) = self.permissions.assemble_permissions(ctx, &child)?;
            if denied || !p.stat {
                continue;
            }
            out.push(self.describe(ctx, &child, p, req)?);
        }
        Ok(out)
    }

    pub fn move_node(&self, ctx: &RequestContext, from: &Reference, to: &Reference) -> Result<()> {
        let old = self.existing(ctx, from)?;
        let new = self.resolve(ctx, to)?;
        paths::validate_name(&new.name)?;
        self.permissions.require(ctx, &old, "move", |p| p.move_)?;
        let is_dir = old.is_dir();
        self.permissions.require(ctx, &new, "move target", |p| {
            if is_dir { p.create_container } else { p.initiate_file_upload }
        })?;
        old.check_lock(ctx)?;
        if new.exists {
            new.check_lock(ctx)?;
        }
        self.tree.move_node(&old, &new)
    }

    /// Soft delete into the space's recycle bin.
    pub fn delete(&self, ctx: &RequestContext, r: &Reference) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "delete", |p| p.delete)?;
        n.check_lock(ctx)?;
        self.tree.delete(&n)
    }

    pub fn download(&self, ctx: &RequestContext, r: &Reference) -> Result<Box<dyn Read + Send>> {
        let n = self.existing(ctx, r)?;
        if n.is_dir() {
            return Err(Error::invalid(format!("{} is a container", n.id)));
        }
        self.permissions.require(ctx, &n, "download", |p| p.initiate_file_download)?;
        self.tree.read_blob(&n)
    }

    pub fn set_arbitrary_metadata(&self, ctx: &RequestContext, r: &Reference, md: &BTreeMap<String, String>) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "set metadata", |p| p.initiate_file_upload)?;
        n.check_lock(ctx)?;
        let mut attrs = Attributes::new();
        for (k, v) in md {
            attrs.set_string(format!("{}{}", prefixes::METADATA_PREFIX, k), v);
        }
        n.set_xattrs(&attrs, true)
    }

    pub fn unset_arbitrary_metadata(&self, ctx: &RequestContext, r: &Reference, keys: &[String]) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "unset metadata", |p| p.initiate_file_upload)?;
        n.check_lock(ctx)?;
        let _guard = n.lock()?;
        for k in keys {
            n.remove_xattr(&format!("{}{}", prefixes::METADATA_PREFIX, k), false)?;
        }
        Ok(())
    }

    pub fn set_favorite(&self, ctx: &RequestContext, r: &Reference, favorite: bool) -> Result<()> {
        let user = ctx.user.as_ref().ok_or_else(|| Error::permission_denied("anonymous favorite"))?;
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "favorite", |p| p.stat)?;
        n.set_favorite(&user.id, favorite)
    }

    // uploads

    /// Open an upload session for `r`. Nothing is written to the tree until the bytes are in.
    pub fn initiate_upload(
        &self,
        ctx: &RequestContext,
        r: &Reference,
        size: Option<u64>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<UploadSession> {
        let n = self.resolve(ctx, r)?;
        paths::validate_name(&n.name)?;
        if n.exists && n.is_dir() {
            return Err(Error::invalid(format!("{} is a container", r.path)));
        }
        if let Some(cs) = metadata.get(meta::CHECKSUM).filter(|c| !c.is_empty()) {
            DeclaredChecksum::parse(cs)?;
        }
        if let Some(mt) = metadata.get(meta::MTIME).filter(|m| !m.is_empty()) {
            times::parse_mtime(mt)?;
        }
        self.permissions.require(ctx, &n, "upload", |p| p.initiate_file_upload)?;
        if n.exists {
            n.check_lock(ctx)?;
        }
        if let Some(size) = size {
            let root = self.lu.node_from_space_id(&n.space_id)?;
            self.tree.quota_checker().check_quota(&root, n.exists, n.blob_size, size)?;
        }

        let mut s = self.uploads.new_session(ctx);
        s.set_target(&n);
        match size {
            Some(size) => s.set_size(size),
            None => {
                s.set_size_is_deferred(true);
                s.set_metadata(meta::SIZE_DEFERRED, "true");
            }
        }
        for key in [
            meta::CHECKSUM,
            meta::MTIME,
            meta::IF_MATCH,
            meta::IF_NONE_MATCH,
            meta::IF_UNMODIFIED_SINCE,
            meta::PROVIDER_ID,
        ] {
            if let Some(v) = metadata.get(key).filter(|v| !v.is_empty()) {
                s.set_metadata(key, v);
            }
        }
        if let Some(lock_id) = &ctx.lock_id {
            s.set_metadata(meta::LOCK_ID, lock_id);
        }
        let parent = self.lu.node_from_id(&n.space_id, &n.parent_id)?;
        s.set_metadata(meta::DIR, &self.lu.path(&parent)?);
        s.set_metadata(meta::FILENAME, &n.name);
        let expires = Utc::now().timestamp() + self.lu.options().upload_expiration_secs;
        s.set_metadata(meta::EXPIRES, &expires.to_string());

        s.touch_bin()?;
        s.persist()?;
        metrics::upload_started();
        info!(target: "spacefs::fs", "initiated upload {} for {}/{}", s.id(), n.space_id, n.name);
        Ok(s)
    }

    fn session_for(&self, ctx: &RequestContext, id: &str) -> Result<UploadSession> {
        let s = self.uploads.get(id)?;
        match ctx.user_id() {
            Some(uid) if uid == s.executant().opaque_id => Ok(s),
            _ => Err(Error::not_found(format!("upload {}", id))),
        }
    }

    /// Append a chunk and return the new offset.
    pub fn write_chunk<R: Read>(&self, ctx: &RequestContext, id: &str, offset: u64, reader: R) -> Result<u64> {
        let mut s = self.session_for(ctx, id)?;
        s.write_chunk(offset, reader)?;
        Ok(s.offset())
    }

    pub fn finish_upload(&self, ctx: &RequestContext, id: &str) -> Result<ResourceInfo> {
        let mut s = self.session_for(ctx, id)?;
        if s.size_is_deferred() || s.offset() != s.size() {
            return Err(Error::invalid(format!("upload {} has {} of {} bytes", id, s.offset(), s.size())));
        }
        let n = s.finish_upload()?;
        let n = self.lu.node_from_id(&n.space_id, &n.id)?;
        let (p, _) = self.permissions.assemble_permissions(ctx, &n)?;
        self.describe(ctx, &n, p, &InfoRequest::all())
    }

    pub fn cancel_upload(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let s = self.session_for(ctx, id)?;
        s.terminate()?;
        metrics::upload_aborted();
        Ok(())
    }

    /// Single shot upload of a whole stream.
    pub fn upload<R: Read>(
        &self,
        ctx: &RequestContext,
        r: &Reference,
        size: u64,
        reader: R,
        metadata: &BTreeMap<String, String>,
    ) -> Result<ResourceInfo> {
        let s = self.initiate_upload(ctx, r, Some(size), metadata)?;
        let offset = self.write_chunk(ctx, s.id(), 0, reader)?;
        if offset != size {
            return Err(Error::invalid(format!("upload {} received {} of {} bytes", s.id(), offset, size)));
        }
        self.finish_upload(ctx, s.id())
    }

    // revisions

    pub fn list_revisions(&self, ctx: &RequestContext, r: &Reference) -> Result<Vec<Revision>> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "list versions", |p| p.list_file_versions)?;
        let mut out = Vec::new();
        for rev in self.tree.list_revisions(&n)? {
            let Some(ts) = rev.revision.as_deref() else { continue };
            let mtime = times::parse_rfc3339(ts)?;
            let key = rev.node_ref().key();
            out.push(Revision { etag: calculate_etag(&key, &mtime), key, size: rev.blob_size, mtime });
        }
        Ok(out)
    }

    fn revision_timestamp(n: &Node, key: &str) -> Result<String> {
        match NodeRef::parse(key) {
            NodeRef::Revision { id, timestamp } if id == n.id => Ok(timestamp),
            NodeRef::Revision { .. } => Err(Error::invalid(format!("revision {} belongs to another node", key))),
            NodeRef::Live(timestamp) => Ok(timestamp),
        }
    }

    pub fn download_revision(&self, ctx: &RequestContext, r: &Reference, key: &str) -> Result<Box<dyn Read + Send>> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "download version", |p| p.initiate_file_download)?;
        let ts = Self::revision_timestamp(&n, key)?;
        let rev = Node::read_node(&self.lu, &n.space_id, &NodeRef::revision(&n.id, &ts), false)?;
        if !rev.exists || rev.blob_id.is_empty() {
            return Err(Error::not_found(format!("revision {} of {}", ts, n.id)));
        }
        self.tree.read_blob(&rev)
    }

    pub fn restore_revision(&self, ctx: &RequestContext, r: &Reference, key: &str) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "restore version", |p| p.restore_file_version)?;
        n.check_lock(ctx)?;
        let ts = Self::revision_timestamp(&n, key)?;
        self.tree.restore_revision(&n, &ts)
    }

    pub fn delete_revision(&self, ctx: &RequestContext, r: &Reference, key: &str) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "delete version", |p| p.delete)?;
        let ts = Self::revision_timestamp(&n, key)?;
        self.tree.delete_revision(&n, &ts)
    }

    // recycle bin

    pub fn list_recycle(&self, ctx: &RequestContext, space_id: &str) -> Result<Vec<RecycleItem>> {
        let root = self.lu.node_from_space_id(space_id)?;
        self.permissions.require(ctx, &root, "list recycle", |p| p.list_recycle)?;
        self.tree.list_recycle(space_id)
    }

    pub fn restore_recycle_item(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        key: &str,
        restore_to: Option<&Reference>,
    ) -> Result<ResourceInfo> {
        let root = self.lu.node_from_space_id(space_id)?;
        self.permissions.require(ctx, &root, "restore recycle item", |p| p.restore_recycle_item)?;
        let target = match restore_to {
            Some(r) => {
                let t = self.resolve(ctx, r)?;
                paths::validate_name(&t.name)?;
                self.permissions.require(ctx, &t, "restore target", |p| p.initiate_file_upload || p.create_container)?;
                Some(t)
            }
            None => None,
        };
        let n = self.tree.restore_recycle_item(space_id, key, target.as_ref())?;
        let (p, _) = self.permissions.assemble_permissions(ctx, &n)?;
        self.describe(ctx, &n, p, &InfoRequest::all())
    }

    pub fn purge_recycle_item(&self, ctx: &RequestContext, space_id: &str, key: &str) -> Result<()> {
        let root = self.lu.node_from_space_id(space_id)?;
        self.permissions.require(ctx, &root, "purge recycle", |p| p.purge_recycle)?;
        self.tree.purge_recycle_item(space_id, key)
    }

    pub fn empty_recycle(&self, ctx: &RequestContext, space_id: &str) -> Result<usize> {
        let root = self.lu.node_from_space_id(space_id)?;
        self.permissions.require(ctx, &root, "purge recycle", |p| p.purge_recycle)?;
        self.tree.empty_recycle(space_id)
    }

    // grants

    fn write_grant(&self, ctx: &RequestContext, n: &Node, mut grant: Grant, must_exist: bool) -> Result<()> {
        let key = grant.grantee.attr_key()?;
        let _guard = n.lock()?;
        let existing = n.read_grant(&key)?;
        match (&existing, must_exist) {
            (Some(_), false) => return Err(Error::already_exists(format!("grant {} on {}", key, n.id))),
            (None, true) => return Err(Error::not_found(format!("grant {} on {}", key, n.id))),
            _ => {}
        }
        grant.creator = existing
            .as_ref()
            .and_then(|g| g.creator.clone())
            .or_else(|| ctx.user_id().map(str::to_string));
        grant.ctime = existing.as_ref().and_then(|g| g.ctime).or_else(|| Some(Utc::now()));
        let mut attrs = Attributes::new();
        attrs.set(key, grant.encode()?);
        n.set_xattrs(&attrs, false)
    }

    pub fn add_grant(&self, ctx: &RequestContext, r: &Reference, grant: Grant) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "add grant", |p| p.add_grant)?;
        self.write_grant(ctx, &n, grant, false)
    }

    pub fn update_grant(&self, ctx: &RequestContext, r: &Reference, grant: Grant) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "update grant", |p| p.update_grant)?;
        self.write_grant(ctx, &n, grant, true)
    }

    /// Store an all-false grant, which wins over any allow grant for the grantee.
    pub fn deny_grant(&self, ctx: &RequestContext, r: &Reference, grantee: Grantee) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "deny grant", |p| p.deny_grant)?;
        let key = grantee.attr_key()?;
        let exists = n.read_grant(&key)?.is_some();
        self.write_grant(ctx, &n, Grant::new(grantee, Permissions::none()), exists)
    }

    pub fn remove_grant(&self, ctx: &RequestContext, r: &Reference, grantee: &Grantee) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "remove grant", |p| p.remove_grant)?;
        let key = grantee.attr_key()?;
        let _guard = n.lock()?;
        if n.read_grant(&key)?.is_none() {
            return Err(Error::not_found(format!("grant {} on {}", key, n.id)));
        }
        n.remove_xattr(&key, false)
    }

    pub fn list_grants(&self, ctx: &RequestContext, r: &Reference) -> Result<Vec<Grant>> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "list grants", |p| p.list_grants)?;
        n.list_grants()
    }

    // resource locks

    pub fn set_lock(&self, ctx: &RequestContext, r: &Reference, lock: &Lock) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "lock", |p| p.initiate_file_upload)?;
        n.set_lock(lock)
    }

    pub fn get_lock(&self, ctx: &RequestContext, r: &Reference) -> Result<Option<Lock>> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "stat", |p| p.stat)?;
        n.read_lock()
    }

    pub fn refresh_lock(&self, ctx: &RequestContext, r: &Reference, lock: &Lock, existing_lock_id: Option<&str>) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "lock", |p| p.initiate_file_upload)?;
        n.refresh_lock(ctx, lock, existing_lock_id)
    }

    pub fn unlock(&self, ctx: &RequestContext, r: &Reference, lock_id: &str) -> Result<()> {
        let n = self.existing(ctx, r)?;
        self.permissions.require(ctx, &n, "unlock", |p| p.initiate_file_upload)?;
        n.unlock(ctx, lock_id)
    }
}

fn space_info(root: &Node) -> Result<SpaceInfo> {
    let attrs = root.xattrs()?;
    Ok(SpaceInfo {
        id: root.space_id.clone(),
        name: attrs.string(prefixes::SPACE_NAME).unwrap_or_else(|| root.name.clone()),
        space_type: attrs.string(prefixes::SPACE_TYPE).unwrap_or_default(),
        alias: attrs.string(prefixes::SPACE_ALIAS),
        owner: root.owner().cloned(),
        quota: attrs.string(prefixes::QUOTA),
        used: attrs.u64(prefixes::TREESIZE).unwrap_or(0),
        disabled: attrs.contains_key(prefixes::DTIME),
    })
}

#[cfg(test)]
#[path = "fs_tests.rs"]
mod fs_tests;
