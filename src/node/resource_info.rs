use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::checksums::ChecksumType;
use super::{mime, Lock, Node, NodeType, Permissions};
use crate::error::Result;
use crate::identity::{RequestContext, UserId};
use crate::metadata::prefixes;

pub const KEY_FAVORITE: &str = "favorite";
pub const KEY_SHARE_TYPES: &str = "share-types";
pub const KEY_CHECKSUMS: &str = "checksums";
pub const KEY_QUOTA: &str = "quota";
pub const KEY_LOCK: &str = "lock";
pub const KEY_ALL: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub space_id: String,
    pub opaque_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
    pub remaining: u64,
}

/// Which optional parts of the descriptor to assemble.
#[derive(Debug, Clone, Default)]
pub struct InfoRequest {
    /// Metadata keys to include; empty or `"*"` means all.
    pub metadata_keys: Vec<String>,
    /// Fill `path` with the full in-space path instead of the base name.
    pub full_path: bool,
}

impl InfoRequest {
    pub fn all() -> Self { Self::default() }

    fn wants(&self, key: &str) -> bool {
        self.metadata_keys.is_empty() || self.metadata_keys.iter().any(|k| k == KEY_ALL || k == key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub parent_id: Option<ResourceId>,
    pub name: String,
    pub path: String,
    pub resource_type: NodeType,
    pub mime_type: String,
    pub size: u64,
    pub etag: String,
    pub mtime: DateTime<Utc>,
    pub permission_set: Permissions,
    pub owner: Option<UserId>,
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
    pub favorite: bool,
    pub lock: Option<Lock>,
    #[serde(default)]
    pub share_types: Vec<String>,
    pub quota: Option<Quota>,
    #[serde(default)]
    pub arbitrary_metadata: BTreeMap<String, String>,
    pub processing: bool,
}

impl Node {
    /// Assemble the externally visible description of this node.
    pub fn as_resource_info(&self, ctx: &RequestContext, permissions: Permissions, req: &InfoRequest) -> Result<ResourceInfo> {
        let attrs = self.xattrs()?;

        let size = match self.node_type {
            NodeType::Container => self.tree_size().unwrap_or_else(|e| {
                debug!(target: "spacefs::node", "treesize of {} unreadable: {}", self.id, e);
                None
            }).unwrap_or(0),
            _ => self.blob_size,
        };

        let path = if req.full_path { self.lookup().path(self)? } else { self.name.clone() };

        let mut info = ResourceInfo {
            id: ResourceId { space_id: self.space_id.clone(), opaque_id: self.node_ref().key() },
            parent_id: (!self.is_space_root()).then(|| ResourceId { space_id: self.space_id.clone(), opaque_id: self.parent_id.clone() }),
            name: self.name.clone(),
            path,
            resource_type: self.node_type,
            mime_type: mime::detect(self.is_dir(), &self.name),
            size,
            etag: self.etag()?,
            mtime: self.tmtime()?,
            permission_set: permissions,
            owner: self.owner().cloned(),
            checksums: BTreeMap::new(),
            favorite: false,
            lock: None,
            share_types: Vec::new(),
            quota: None,
            arbitrary_metadata: BTreeMap::new(),
            processing: self.is_processing(),
        };

        if req.wants(KEY_FAVORITE) {
            if let Some(u) = &ctx.user {
                info.favorite = self.is_favorite(&u.id);
            }
        }
        if req.wants(KEY_SHARE_TYPES) {
            if self.has_user_shares() {
                info.share_types.push("user".to_string());
            }
            if self.has_group_shares() {
                info.share_types.push("group".to_string());
            }
        }
        if req.wants(KEY_CHECKSUMS) && self.node_type == NodeType::File {
            for kind in [ChecksumType::Sha1, ChecksumType::Md5, ChecksumType::Adler32] {
                if let Some(raw) = attrs.get(kind.attr_key()) {
                    info.checksums.insert(kind.as_str().to_string(), hex::encode(raw));
                }
            }
        }
        if req.wants(KEY_QUOTA) && self.is_space_root() && permissions.get_quota {
            if let Some(total) = attrs.string(prefixes::QUOTA).and_then(|q| q.parse::<u64>().ok()).filter(|q| *q > 0) {
                let used = attrs.u64(prefixes::TREESIZE).unwrap_or(0);
                info.quota = Some(Quota { total, used, remaining: total.saturating_sub(used) });
            }
        }
        if req.wants(KEY_LOCK) {
            info.lock = self.read_lock()?;
        }
        for (k, v) in attrs.with_prefix(prefixes::METADATA_PREFIX) {
            let key = &k[prefixes::METADATA_PREFIX.len()..];
            if req.wants(key) {
                info.arbitrary_metadata.insert(key.to_string(), String::from_utf8_lossy(v).to_string());
            }
        }
        Ok(info)
    }
}
