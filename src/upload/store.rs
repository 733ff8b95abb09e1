use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{meta, storage, UploadInfo, UploadSession};
use crate::error::{Error, Result};
use crate::events::Publisher;
use crate::identity::RequestContext;
use crate::lookup::Lookup;
use crate::tree::Tree;

/// Session ids are generated as uuids; anything else cannot name a record.
static UPLOAD_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("valid upload id pattern"));

/// Creates, loads and lists upload sessions below `<root>/uploads`.
#[derive(Clone)]
pub struct UploadStore {
    lu: Arc<Lookup>,
    tree: Arc<Tree>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl UploadStore {
    pub fn new(lu: Arc<Lookup>, tree: Arc<Tree>, publisher: Option<Arc<dyn Publisher>>) -> Self {
        Self { lu, tree, publisher }
    }

    pub fn lookup(&self) -> &Arc<Lookup> { &self.lu }
    pub fn tree(&self) -> &Arc<Tree> { &self.tree }
    pub(crate) fn publisher(&self) -> Option<&dyn Publisher> { self.publisher.as_deref() }

    pub fn bin_path(&self, id: &str) -> PathBuf {
        self.lu.uploads_dir().join(id)
    }

    pub fn info_path(&self, id: &str) -> PathBuf {
        self.lu.uploads_dir().join(format!("{}.info", id))
    }

    /// A fresh session acting for the caller. Nothing is written until `persist`.
    pub fn new_session(&self, ctx: &RequestContext) -> UploadSession {
        let mut s = UploadSession {
            store: self.clone(),
            info: UploadInfo {
                id: uuid::Uuid::new_v4().to_string(),
                ..Default::default()
            },
        };
        s.set_storage_value(storage::TYPE, storage::STORE_TYPE);
        if let Some(user) = &ctx.user {
            s.set_executant(user);
        }
        if let Some(initiator) = &ctx.initiator_id {
            s.set_metadata(meta::INITIATOR_ID, initiator);
        }
        s
    }

    /// Load a session. The offset is the size of the staging bin, not the recorded value.
    pub fn get(&self, id: &str) -> Result<UploadSession> {
        if !UPLOAD_ID.is_match(id) {
            return Err(Error::not_found(format!("upload {}", id)));
        }
        let bytes = match fs::read(self.info_path(id)) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::not_found(format!("upload {}", id))),
            Err(e) => return Err(e.into()),
        };
        let mut info: UploadInfo = serde_json::from_slice(&bytes)?;
        let stat = match fs::metadata(self.bin_path(id)) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(format!("staged bytes of upload {}", id)))
            }
            Err(e) => return Err(e.into()),
        };
        if info.offset != stat.len() {
            debug!(target: "spacefs::upload", "upload {} recorded offset {} but has {} bytes", id, info.offset, stat.len());
        }
        info.offset = stat.len();
        Ok(UploadSession { store: self.clone(), info })
    }

    /// Every session with a readable record.
    pub fn list(&self) -> Result<Vec<UploadSession>> {
        let rd = match fs::read_dir(self.lu.uploads_dir()) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for ent in rd {
            let name = ent?.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".info") else { continue };
            match self.get(id) {
                Ok(s) => out.push(s),
                Err(e) if e.is_not_found() => debug!(target: "spacefs::upload", "skipping incomplete upload {}", id),
                Err(e) => warn!(target: "spacefs::upload", "skipping unreadable upload {}: {}", id, e),
            }
        }
        out.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(out)
    }

    /// Terminate sessions whose expiry lies before `now`. Returns how many were removed.
    pub fn clean_expired(&self, now: &chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let mut removed = 0;
        for s in self.list()? {
            match s.expires() {
                Some(exp) if exp < *now => {}
                _ => continue,
            }
            if s.is_processing() {
                debug!(target: "spacefs::upload", "not expiring {} while it is processing", s.id());
                continue;
            }
            match s.terminate() {
                Ok(()) => removed += 1,
                Err(e) => warn!(target: "spacefs::upload", "expiring upload {} failed: {}", s.id(), e),
            }
        }
        if removed > 0 {
            info!(target: "spacefs::upload", "removed {} expired uploads", removed);
        }
        Ok(removed)
    }
}
