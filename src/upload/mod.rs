//! Resumable upload sessions: staging, commit into the tree, and postprocessing.
//!
//! A session is one JSON record (`uploads/<id>.info`) plus a staging bin
//! (`uploads/<id>`). The bin's length is the session offset.

mod lifecycle;
mod processing;
mod session;
mod store;

pub use processing::PostprocessingOutcome;
pub use session::{UploadInfo, UploadSession};
pub use store::UploadStore;

/// Client facing metadata keys of a session record.
pub mod meta {
    pub const CHECKSUM: &str = "checksum";
    pub const MTIME: &str = "mtime";
    pub const IF_MATCH: &str = "if-match";
    pub const IF_NONE_MATCH: &str = "if-none-match";
    pub const IF_UNMODIFIED_SINCE: &str = "if-unmodified-since";
    pub const PROVIDER_ID: &str = "providerID";
    pub const LOCK_ID: &str = "lockid";
    pub const SIZE_DIFF: &str = "sizeDiff";
    pub const VERSIONS_PATH: &str = "versionsPath";
    pub const SCAN_RESULT: &str = "scanResult";
    pub const SCAN_DATE: &str = "scanDate";
    pub const EXPIRES: &str = "expires";
    pub const INITIATOR_ID: &str = "initiatorid";
    pub const DIR: &str = "dir";
    pub const FILENAME: &str = "filename";
    pub const SIZE_DEFERRED: &str = "sizedeferred";
}

/// Storage side keys of a session record.
pub mod storage {
    pub const TYPE: &str = "Type";
    pub const SPACE_ROOT: &str = "SpaceRoot";
    pub const NODE_ID: &str = "NodeId";
    pub const NODE_PARENT_ID: &str = "NodeParentId";
    pub const NODE_NAME: &str = "NodeName";
    pub const NODE_EXISTS: &str = "NodeExists";
    pub const IDP: &str = "Idp";
    pub const USER_ID: &str = "UserId";
    pub const USER_TYPE: &str = "UserType";
    pub const USER_NAME: &str = "UserName";
    pub const USER_DISPLAY_NAME: &str = "UserDisplayName";
    pub const SPACE_OWNER: &str = "SpaceOwnerOrManager";

    pub const STORE_TYPE: &str = "SpaceFsStore";
}

#[cfg(test)]
#[path = "upload_tests.rs"]
mod upload_tests;
