//! Attribute key names.

pub const ID: &str = "id";
pub const PARENT_ID: &str = "parentid";
pub const NAME: &str = "name";
pub const TYPE: &str = "type";
pub const BLOB_ID: &str = "blobid";
pub const BLOB_SIZE: &str = "blobsize";

pub const CHECKSUM_PREFIX: &str = "cs.";
pub const CHECKSUM_SHA1: &str = "cs.sha1";
pub const CHECKSUM_MD5: &str = "cs.md5";
pub const CHECKSUM_ADLER32: &str = "cs.adler32";

pub const GRANT_PREFIX: &str = "grant.";
pub const GRANT_USER_PREFIX: &str = "grant.u:";
pub const GRANT_GROUP_PREFIX: &str = "grant.g:";

pub const TREESIZE: &str = "treesize";
pub const TMTIME: &str = "tmtime";
pub const MTIME: &str = "mtime";
pub const DTIME: &str = "dtime";
pub const TMP_ETAG: &str = "tmp.etag";

pub const STATUS: &str = "status";
pub const PROCESSING_STATUS: &str = "processing:";
pub const SCAN_STATUS: &str = "scan.status";
pub const SCAN_DATE: &str = "scan.date";

pub const QUOTA: &str = "quota";
pub const OWNER_ID: &str = "owner.id";
pub const OWNER_IDP: &str = "owner.idp";
pub const OWNER_TYPE: &str = "owner.type";
pub const SPACE_NAME: &str = "space.name";
pub const SPACE_TYPE: &str = "space.type";
pub const SPACE_ALIAS: &str = "space.alias";

pub const TRASH_ORIGIN: &str = "trash.origin";
/// `<parent id>/<name>` of the entry a move has not yet relinked.
pub const MOVE_ORIGIN: &str = "move.origin";
pub const FAVORITE_PREFIX: &str = "fav.";
pub const METADATA_PREFIX: &str = "md.";
/// Ids of journaled changes already applied to this node but not yet marked done in the journal.
pub const PROPAGATION_PENDING: &str = "propagation.pending";

/// Synthetic per-user favorite key.
pub fn favorite_key(user_opaque_id: &str) -> String {
    format!("{}{}", FAVORITE_PREFIX, user_opaque_id)
}

pub fn user_grant_key(id: &str) -> String {
    format!("{}{}", GRANT_USER_PREFIX, id)
}

pub fn group_grant_key(id: &str) -> String {
    format!("{}{}", GRANT_GROUP_PREFIX, id)
}
