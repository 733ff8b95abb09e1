use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use tracing::debug;

use super::Node;
use crate::error::{Error, Result};
use crate::identity::{RequestContext, UserId};
use crate::metadata::sibling;

const LOCK_SUFFIX: &str = ".wlock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Shared,
    Write,
    Exclusive,
}

/// A client visible resource lock, distinct from the internal attribute lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: String,
    pub lock_type: LockType,
    #[serde(default)]
    pub user: Option<UserId>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn is_expired(&self, now: &DateTime<Utc>) -> bool {
        matches!(self.expiration, Some(exp) if exp < *now)
    }
}

impl Node {
    pub fn lock_info_path(&self) -> PathBuf {
        sibling(&self.internal_path(), LOCK_SUFFIX)
    }

    fn write_lock_info(&self, lock: &Lock) -> Result<()> {
        let path = self.lock_info_path();
        let tmp = sibling(&path, &format!(".tmp.{}", uuid::Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec(lock)?;
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_lock_info(&self) -> Result<()> {
        match std::fs::remove_file(self.lock_info_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current lock; expired locks are removed and reported as absent.
    pub fn read_lock(&self) -> Result<Option<Lock>> {
        let bytes = match std::fs::read(self.lock_info_path()) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let lock: Lock = serde_json::from_slice(&bytes)
            .map_err(|e| Error::internal(format!("invalid lock record on {}: {}", self.id, e)))?;
        if lock.is_expired(&Utc::now()) {
            debug!(target: "spacefs::node", "removing expired lock {} on {}", lock.lock_id, self.id);
            self.remove_lock_info()?;
            return Ok(None);
        }
        Ok(Some(lock))
    }

    pub fn set_lock(&self, lock: &Lock) -> Result<()> {
        if lock.lock_id.is_empty() {
            return Err(Error::invalid("lock id must not be empty"));
        }
        let _guard = self.lock()?;
        if let Some(existing) = self.read_lock()? {
            return Err(Error::locked(existing.lock_id));
        }
        self.write_lock_info(lock)
    }

    pub fn refresh_lock(&self, ctx: &RequestContext, lock: &Lock, existing_lock_id: Option<&str>) -> Result<()> {
        let _guard = self.lock()?;
        let current = self.read_lock()?.ok_or_else(|| Error::aborted("lock does not exist"))?;
        let expected = existing_lock_id.unwrap_or(&lock.lock_id);
        if current.lock_id != expected {
            return Err(Error::locked(current.lock_id));
        }
        self.check_lock_owner(ctx, &current)?;
        self.write_lock_info(lock)
    }

    pub fn unlock(&self, ctx: &RequestContext, lock_id: &str) -> Result<()> {
        let _guard = self.lock()?;
        let current = self.read_lock()?.ok_or_else(|| Error::aborted("lock does not exist"))?;
        if current.lock_id != lock_id {
            return Err(Error::locked(current.lock_id));
        }
        self.check_lock_owner(ctx, &current)?;
        self.remove_lock_info()
    }

    fn check_lock_owner(&self, ctx: &RequestContext, lock: &Lock) -> Result<()> {
        match (&lock.user, ctx.user.as_ref()) {
            (Some(owner), Some(u)) if owner.opaque_id != u.id.opaque_id => {
                Err(Error::permission_denied("cannot change the lock of another user"))
            }
            _ => Ok(()),
        }
    }

    /// Writes to a locked node need the matching lock id in the request context.
    pub fn check_lock(&self, ctx: &RequestContext) -> Result<()> {
        match self.read_lock()? {
            None => Ok(()),
            Some(l) if ctx.lock_id.as_deref() == Some(l.lock_id.as_str()) => Ok(()),
            Some(l) => Err(Error::locked(l.lock_id)),
        }
    }
}
