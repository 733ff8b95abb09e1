use serde::{Deserialize, Serialize};

/// Resource permission bitset. A grant whose set is entirely false is a deny.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub add_grant: bool,
    pub create_container: bool,
    pub delete: bool,
    pub get_path: bool,
    pub get_quota: bool,
    pub initiate_file_download: bool,
    pub initiate_file_upload: bool,
    pub list_grants: bool,
    pub list_container: bool,
    pub list_file_versions: bool,
    pub list_recycle: bool,
    #[serde(rename = "move")]
    pub move_: bool,
    pub remove_grant: bool,
    pub purge_recycle: bool,
    pub restore_file_version: bool,
    pub restore_recycle_item: bool,
    pub stat: bool,
    pub update_grant: bool,
    pub deny_grant: bool,
}

impl Permissions {
    pub fn none() -> Self { Self::default() }

    pub fn full() -> Self {
        Self {
            add_grant: true,
            create_container: true,
            delete: true,
            get_path: true,
            get_quota: true,
            initiate_file_download: true,
            initiate_file_upload: true,
            list_grants: true,
            list_container: true,
            list_file_versions: true,
            list_recycle: true,
            move_: true,
            remove_grant: true,
            purge_recycle: true,
            restore_file_version: true,
            restore_recycle_item: true,
            stat: true,
            update_grant: true,
            deny_grant: true,
        }
    }

    /// Read only access.
    pub fn viewer() -> Self {
        Self {
            get_path: true,
            get_quota: true,
            initiate_file_download: true,
            list_container: true,
            list_recycle: true,
            stat: true,
            ..Self::none()
        }
    }

    /// Read and write access without grant management.
    pub fn editor() -> Self {
        Self {
            create_container: true,
            delete: true,
            initiate_file_upload: true,
            list_file_versions: true,
            move_: true,
            restore_file_version: true,
            restore_recycle_item: true,
            ..Self::viewer()
        }
    }

    pub fn is_none(&self) -> bool { *self == Self::none() }

    /// OR every bit of `other` into `self`.
    pub fn add(&mut self, other: &Permissions) {
        self.add_grant |= other.add_grant;
        self.create_container |= other.create_container;
        self.delete |= other.delete;
        self.get_path |= other.get_path;
        self.get_quota |= other.get_quota;
        self.initiate_file_download |= other.initiate_file_download;
        self.initiate_file_upload |= other.initiate_file_upload;
        self.list_grants |= other.list_grants;
        self.list_container |= other.list_container;
        self.list_file_versions |= other.list_file_versions;
        self.list_recycle |= other.list_recycle;
        self.move_ |= other.move_;
        self.remove_grant |= other.remove_grant;
        self.purge_recycle |= other.purge_recycle;
        self.restore_file_version |= other.restore_file_version;
        self.restore_recycle_item |= other.restore_recycle_item;
        self.stat |= other.stat;
        self.update_grant |= other.update_grant;
        self.deny_grant |= other.deny_grant;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_union() {
        let mut p = Permissions::none();
        p.add(&Permissions::viewer());
        assert!(p.stat && !p.delete);
        p.add(&Permissions { delete: true, ..Permissions::none() });
        assert!(p.stat && p.delete);
        assert!(!p.is_none());
        assert!(Permissions::none().is_none());
    }

    #[test]
    fn serde_uses_move_keyword() {
        let json = serde_json::to_string(&Permissions { move_: true, ..Permissions::none() }).unwrap();
        assert!(json.contains("\"move\":true"));
        let back: Permissions = serde_json::from_str(r#"{"stat":true}"#).unwrap();
        assert!(back.stat && !back.move_);
    }
}
