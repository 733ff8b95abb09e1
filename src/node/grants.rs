use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use super::{Node, Permissions};
use crate::error::{Error, Result};
use crate::identity::User;
use crate::metadata::prefixes;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Grantee {
    User(String),
    Group(String),
}

impl Grantee {
    pub fn attr_key(&self) -> Result<String> {
        match self {
            Grantee::User(id) if !id.is_empty() => Ok(prefixes::user_grant_key(id)),
            Grantee::Group(id) if !id.is_empty() => Ok(prefixes::group_grant_key(id)),
            _ => Err(Error::invalid("grantee without id")),
        }
    }

    pub fn from_attr_key(key: &str) -> Option<Self> {
        if let Some(id) = key.strip_prefix(prefixes::GRANT_USER_PREFIX) {
            return Some(Grantee::User(id.to_string()));
        }
        key.strip_prefix(prefixes::GRANT_GROUP_PREFIX).map(|id| Grantee::Group(id.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub grantee: Grantee,
    pub permissions: Permissions,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub ctime: Option<DateTime<Utc>>,
}

/// Stored value of a grant attribute; the grantee is encoded in the key.
#[derive(Debug, Serialize, Deserialize)]
struct GrantRecord {
    permissions: Permissions,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    creator: Option<String>,
    #[serde(default)]
    ctime: Option<DateTime<Utc>>,
}

impl Grant {
    pub fn new(grantee: Grantee, permissions: Permissions) -> Self {
        Self { grantee, permissions, expiration: None, creator: None, ctime: None }
    }

    pub fn is_deny(&self) -> bool { self.permissions.is_none() }

    pub fn is_expired(&self, now: &DateTime<Utc>) -> bool {
        matches!(self.expiration, Some(exp) if exp < *now)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let rec = GrantRecord {
            permissions: self.permissions,
            expiration: self.expiration,
            creator: self.creator.clone(),
            ctime: self.ctime,
        };
        Ok(serde_json::to_vec(&rec)?)
    }

    pub fn decode(grantee: Grantee, raw: &[u8]) -> Result<Self> {
        let rec: GrantRecord = serde_json::from_slice(raw)
            .map_err(|e| Error::internal(format!("invalid grant record: {}", e)))?;
        Ok(Self { grantee, permissions: rec.permissions, expiration: rec.expiration, creator: rec.creator, ctime: rec.ctime })
    }
}

impl Node {
    pub fn set_grant(&self, grant: &Grant) -> Result<()> {
        self.set_xattr(&grant.grantee.attr_key()?, &grant.encode()?)
    }

    pub fn remove_grant(&self, grantee: &Grantee) -> Result<()> {
        self.remove_xattr(&grantee.attr_key()?, true)
    }

    /// Grant attribute keys present on this node.
    pub fn list_grantees(&self) -> Result<Vec<String>> {
        let attrs = self.xattrs()?;
        Ok(attrs.with_prefix(prefixes::GRANT_PREFIX).map(|(k, _)| k.clone()).collect())
    }

    pub fn read_grant(&self, key: &str) -> Result<Option<Grant>> {
        let grantee = Grantee::from_attr_key(key).ok_or_else(|| Error::invalid(format!("not a grant key: {}", key)))?;
        let attrs = self.xattrs()?;
        match attrs.get(key) {
            Some(raw) => Ok(Some(Grant::decode(grantee, raw)?)),
            None => Ok(None),
        }
    }

    pub fn list_grants(&self) -> Result<Vec<Grant>> {
        let attrs = self.xattrs()?;
        let mut out = Vec::new();
        for (k, raw) in attrs.with_prefix(prefixes::GRANT_PREFIX) {
            if let Some(g) = Grantee::from_attr_key(k) {
                out.push(Grant::decode(g, raw)?);
            }
        }
        Ok(out)
    }

    pub fn has_user_shares(&self) -> bool {
        self.list_grantees().map(|g| g.iter().any(|k| k.starts_with(prefixes::GRANT_USER_PREFIX))).unwrap_or(false)
    }

    pub fn has_group_shares(&self) -> bool {
        self.list_grantees().map(|g| g.iter().any(|k| k.starts_with(prefixes::GRANT_GROUP_PREFIX))).unwrap_or(false)
    }

    /// Aggregate the grants on this node that match `user` directly or through a group.
    /// A matching all-false grant denies regardless of any allow grant.
    pub fn read_user_permissions(&self, user: &User) -> Result<(Permissions, bool)> {
        let attrs = match self.xattrs() {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return Ok((Permissions::none(), false)),
            Err(e) => return Err(e),
        };
        let groups: HashSet<&str> = user.groups.iter().map(String::as_str).collect();
        let user_key = prefixes::user_grant_key(&user.id.opaque_id);
        let now = Utc::now();
        let mut ap = Permissions::none();
        for (key, raw) in attrs.with_prefix(prefixes::GRANT_PREFIX) {
            let grantee = match Grantee::from_attr_key(key) {
                Some(Grantee::User(_)) if *key == user_key => Grantee::User(user.id.opaque_id.clone()),
                Some(Grantee::Group(g)) if groups.contains(g.as_str()) => Grantee::Group(g),
                _ => continue,
            };
            let grant = match Grant::decode(grantee, raw) {
                Ok(g) => g,
                Err(e) => {
                    warn!(target: "spacefs::node", "skipping unreadable grant {} on {}: {}", key, self.id, e);
                    continue;
                }
            };
            if grant.is_expired(&now) {
                continue;
            }
            if grant.is_deny() {
                return Ok((Permissions::none(), true));
            }
            ap.add(&grant.permissions);
        }
        Ok((ap, false))
    }
}
