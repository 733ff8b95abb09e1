use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use super::{meta, storage, UploadStore};
use crate::error::{Error, Result};
use crate::identity::{RequestContext, User, UserId, UserType};
use crate::lookup::Reference;
use crate::metadata::sibling;
use crate::node::{times, Node, NodeRef};

/// Durable record of one upload, in the shape resumable-upload clients expect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadInfo {
    #[serde(rename = "ID")]
    pub id: String,
    pub size: u64,
    #[serde(default)]
    pub size_is_deferred: bool,
    /// Stale after a restart; the bin length is authoritative.
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub meta_data: BTreeMap<String, String>,
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub partial_uploads: Vec<String>,
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
}

pub struct UploadSession {
    pub(super) store: UploadStore,
    pub(super) info: UploadInfo,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession").field("info", &self.info).finish()
    }
}

impl UploadSession {
    pub fn info(&self) -> &UploadInfo { &self.info }
    pub fn id(&self) -> &str { &self.info.id }
    pub fn offset(&self) -> u64 { self.info.offset }
    pub fn size(&self) -> u64 { self.info.size }
    pub fn size_is_deferred(&self) -> bool { self.info.size_is_deferred }

    pub fn metadata(&self, key: &str) -> &str {
        self.info.meta_data.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) {
        self.info.meta_data.insert(key.to_string(), value.to_string());
    }

    pub fn storage_value(&self, key: &str) -> &str {
        self.info.storage.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set_storage_value(&mut self, key: &str, value: &str) {
        self.info.storage.insert(key.to_string(), value.to_string());
    }

    pub fn set_size(&mut self, size: u64) { self.info.size = size; }
    pub fn set_size_is_deferred(&mut self, deferred: bool) { self.info.size_is_deferred = deferred; }

    pub fn space_id(&self) -> &str { self.storage_value(storage::SPACE_ROOT) }
    pub fn node_id(&self) -> &str { self.storage_value(storage::NODE_ID) }
    pub fn node_parent_id(&self) -> &str { self.storage_value(storage::NODE_PARENT_ID) }
    pub fn filename(&self) -> &str { self.storage_value(storage::NODE_NAME) }
    pub fn node_exists(&self) -> bool { self.storage_value(storage::NODE_EXISTS) == "true" }
    pub fn dir(&self) -> &str { self.metadata(meta::DIR) }
    pub fn provider_id(&self) -> &str { self.metadata(meta::PROVIDER_ID) }
    pub fn lock_id(&self) -> &str { self.metadata(meta::LOCK_ID) }
    pub fn initiator_id(&self) -> &str { self.metadata(meta::INITIATOR_ID) }
    pub fn header_if_match(&self) -> &str { self.metadata(meta::IF_MATCH) }
    pub fn header_if_none_match(&self) -> &str { self.metadata(meta::IF_NONE_MATCH) }
    pub fn header_if_unmodified_since(&self) -> &str { self.metadata(meta::IF_UNMODIFIED_SINCE) }
    pub fn versions_path(&self) -> &str { self.metadata(meta::VERSIONS_PATH) }

    /// Size change the committed upload causes for the tree.
    pub fn size_diff(&self) -> i64 {
        self.metadata(meta::SIZE_DIFF).parse().unwrap_or(0)
    }

    /// Client supplied mtime; `None` when absent or unparsable.
    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        let v = self.metadata(meta::MTIME);
        if v.is_empty() {
            return None;
        }
        times::parse_mtime(v).ok()
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        let v = self.metadata(meta::EXPIRES);
        if v.is_empty() {
            return None;
        }
        times::parse_mtime(v).ok()
    }

    /// Finished receiving bytes and no scan verdict yet.
    pub fn is_processing(&self) -> bool {
        !self.info.size_is_deferred && self.info.size == self.info.offset && self.metadata(meta::SCAN_RESULT).is_empty()
    }

    pub fn set_scan_data(&mut self, result: &str, date: &DateTime<Utc>) {
        self.set_metadata(meta::SCAN_RESULT, result);
        self.set_metadata(meta::SCAN_DATE, &times::format_rfc3339_nano(date));
    }

    pub fn scan_data(&self) -> Option<(String, DateTime<Utc>)> {
        let date = times::parse_rfc3339(self.metadata(meta::SCAN_DATE)).ok()?;
        Some((self.metadata(meta::SCAN_RESULT).to_string(), date))
    }

    /// Record the user the session acts for; replayed into every later call.
    pub fn set_executant(&mut self, user: &User) {
        self.set_storage_value(storage::IDP, &user.id.idp);
        self.set_storage_value(storage::USER_ID, &user.id.opaque_id);
        self.set_storage_value(storage::USER_TYPE, user.id.user_type.as_str());
        self.set_storage_value(storage::USER_NAME, &user.username);
        self.set_storage_value(storage::USER_DISPLAY_NAME, &user.display_name);
    }

    pub fn executant(&self) -> UserId {
        UserId::new(
            self.storage_value(storage::IDP),
            self.storage_value(storage::USER_ID),
            UserType::parse(self.storage_value(storage::USER_TYPE)),
        )
    }

    fn executant_user(&self) -> User {
        User {
            id: self.executant(),
            username: self.storage_value(storage::USER_NAME).to_string(),
            display_name: self.storage_value(storage::USER_DISPLAY_NAME).to_string(),
            groups: Vec::new(),
        }
    }

    pub fn space_owner(&self) -> Option<UserId> {
        let id = self.storage_value(storage::SPACE_OWNER);
        (!id.is_empty()).then(|| UserId { opaque_id: id.to_string(), ..Default::default() })
    }

    /// Point the session at `target`. A target that does not exist yet gets a fresh node id.
    pub fn set_target(&mut self, target: &Node) {
        let node_id = if target.exists {
            target.id.clone()
        } else {
            uuid::Uuid::new_v4().to_string()
        };
        self.set_storage_value(storage::SPACE_ROOT, &target.space_id);
        self.set_storage_value(storage::NODE_ID, &node_id);
        self.set_storage_value(storage::NODE_PARENT_ID, &target.parent_id);
        self.set_storage_value(storage::NODE_NAME, &target.name);
        self.set_storage_value(storage::NODE_EXISTS, if target.exists { "true" } else { "false" });
        if let Some(owner) = target.owner() {
            self.set_storage_value(storage::SPACE_OWNER, &owner.opaque_id);
        }
    }

    /// Request context rebuilt from the record, independent of the original caller.
    pub fn context(&self) -> RequestContext {
        let user = (!self.storage_value(storage::USER_ID).is_empty()).then(|| self.executant_user());
        RequestContext {
            user,
            lock_id: Some(self.lock_id().to_string()).filter(|l| !l.is_empty()),
            initiator_id: Some(self.initiator_id().to_string()).filter(|i| !i.is_empty()),
            request_id: None,
        }
    }

    /// Reference to the target file by path below the space root.
    pub fn reference(&self) -> Reference {
        let dir = self.dir().trim_matches('/');
        let path = if dir.is_empty() || dir == "." {
            self.filename().to_string()
        } else {
            format!("{}/{}", dir, self.filename())
        };
        Reference::by_path(self.space_id(), &path)
    }

    pub fn node(&self) -> Result<Node> {
        Node::read_node(self.store.lookup(), self.space_id(), &NodeRef::live(self.node_id()), false)
    }

    pub fn bin_path(&self) -> PathBuf {
        self.store.bin_path(&self.info.id)
    }

    pub fn info_path(&self) -> PathBuf {
        self.store.info_path(&self.info.id)
    }

    /// Location clients or processors can fetch the staged bytes from.
    pub fn url(&self) -> String {
        format!("file://{}", self.bin_path().display())
    }

    /// Create the staging bin if it does not exist yet.
    pub fn touch_bin(&self) -> Result<()> {
        let path = self.bin_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(())
    }

    /// Atomically replace the session record.
    pub fn persist(&self) -> Result<()> {
        let path = self.info_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = sibling(&path, &format!(".tmp.{}", uuid::Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec(&self.info)?;
        let res = (|| -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Undo what the session did, in three independent steps.
    ///
    /// `revert_metadata` puts back the attributes kept in the revision snapshot, or deletes a
    /// node this session created if the session is still the latest one writing to it.
    /// Files that are already gone count as removed.
    pub fn cleanup(&self, revert_metadata: bool, clean_bin: bool, clean_info: bool) -> Result<()> {
        let mut result = Ok(());
        if revert_metadata {
            result = self.revert_node_metadata();
            if let Err(e) = &result {
                error!(target: "spacefs::upload", "reverting metadata of upload {} failed: {}", self.id(), e);
            }
        }
        if clean_bin {
            match fs::remove_file(self.bin_path()) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    error!(target: "spacefs::upload", "removing bin of {} failed: {}", self.id(), e);
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
                _ => {}
            }
        }
        if clean_info {
            match fs::remove_file(self.info_path()) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    error!(target: "spacefs::upload", "removing record of {} failed: {}", self.id(), e);
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
                _ => {}
            }
        }
        result
    }

    fn revert_node_metadata(&self) -> Result<()> {
        let n = self.node()?;
        if !n.exists {
            debug!(target: "spacefs::upload", "node of upload {} is already gone", self.id());
            return Ok(());
        }
        let versions_path = self.versions_path();
        if self.node_exists() && !versions_path.is_empty() {
            let p = PathBuf::from(versions_path);
            let lu = self.store.lookup();
            let _guard = n.lock()?;
            self.store.tree().restore_metadata_from(&n, &p, false)?;
            n.unmark_processing_locked(self.id())?;
            match fs::remove_file(&p) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    warn!(target: "spacefs::upload", "removing version {} failed: {}", p.display(), e)
                }
                _ => {}
            }
            lu.backend().purge(&p)?;
            info!(target: "spacefs::upload", "reverted {} to its previous revision", n.id);
            return Ok(());
        }
        if self.node_exists() {
            // overwritten without a snapshot: nothing to restore
            n.unmark_processing(self.id())?;
            return Ok(());
        }
        let latest = n.processing_id()?;
        match latest.as_deref() {
            Some(id) if id == self.id() => {
                self.store.tree().purge_node(&n.space_id, &n.id, &n.internal_path())?;
                let parent = n.parent()?;
                self.store.lookup().unlink_child(&parent, &n.name)?;
                info!(target: "spacefs::upload", "removed node {} created by upload {}", n.id, self.id());
                Ok(())
            }
            Some(other) => Err(Error::aborted(format!(
                "node {} is now written by upload {}, leaving it untouched",
                n.id, other
            ))),
            None => Err(Error::aborted(format!(
                "node {} is no longer processing upload {}, leaving it untouched",
                n.id,
                self.id()
            ))),
        }
    }
}
