use tracing::{debug, warn};

use super::Node;
use crate::error::{Error, Result};
use crate::metadata::prefixes;

/// Quota values that never limit writes: unset, unlimited, not yet calculated, unknown.
const UNLIMITED_SENTINELS: [&str; 4] = ["", "0", "-1", "-2"];

/// Decides whether a space can take `new_size` more bytes.
pub trait QuotaChecker: Send + Sync {
    /// Returns the remaining bytes after the write, or `InsufficientStorage`.
    fn check_quota(&self, space_root: &Node, overwrite: bool, old_size: u64, new_size: u64) -> Result<Option<u64>>;
}

/// Quota enforcement against the space root's quota attribute and the free disk space.
#[derive(Debug, Default, Clone)]
pub struct DiskQuotaChecker;

impl QuotaChecker for DiskQuotaChecker {
    fn check_quota(&self, space_root: &Node, overwrite: bool, old_size: u64, new_size: u64) -> Result<Option<u64>> {
        match fs2::available_space(space_root.internal_path()) {
            Ok(free) if free < new_size => {
                warn!(target: "spacefs::node", "disk full below {}: free {} needed {}", space_root.space_id, free, new_size);
                return Err(Error::insufficient_storage("disk full"));
            }
            Ok(_) => {}
            Err(e) => debug!(target: "spacefs::node", "could not probe free space: {}", e),
        }
        let used = space_root.tree_size()?.unwrap_or(0);
        let quota = space_root.xattr_string(prefixes::QUOTA)?.unwrap_or_default();
        check_quota_values(&quota, used, overwrite, old_size, new_size)
    }
}

/// Pure quota rule. `used` is the space's accumulated tree size.
pub fn check_quota_values(quota: &str, used: u64, overwrite: bool, old_size: u64, new_size: u64) -> Result<Option<u64>> {
    let quota = quota.trim();
    if UNLIMITED_SENTINELS.contains(&quota) || quota.starts_with('-') {
        return Ok(None);
    }
    let total: u64 = quota
        .parse()
        .map_err(|_| Error::internal(format!("invalid quota value '{}'", quota)))?;
    if overwrite {
        let after = used as i128 - old_size as i128 + new_size as i128;
        if after > total as i128 {
            return Err(Error::insufficient_storage("quota exceeded"));
        }
        return Ok(Some((total as i128 - after.max(0)) as u64));
    }
    // quota < used guards the subtraction below against wrapping
    if total < used || new_size > total - used {
        return Err(Error::insufficient_storage("quota exceeded"));
    }
    Ok(Some(total - used - new_size))
}
