use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    #[default]
    Primary,
    Secondary,
    Federated,
    Guest,
    Service,
    SpaceOwner,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Primary => "primary",
            UserType::Secondary => "secondary",
            UserType::Federated => "federated",
            UserType::Guest => "guest",
            UserType::Service => "service",
            UserType::SpaceOwner => "spaceowner",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "secondary" => UserType::Secondary,
            "federated" => UserType::Federated,
            "guest" => UserType::Guest,
            "service" => UserType::Service,
            "spaceowner" => UserType::SpaceOwner,
            _ => UserType::Primary,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId {
    #[serde(default)]
    pub idp: String,
    pub opaque_id: String,
    #[serde(default)]
    pub user_type: UserType,
}

impl UserId {
    pub fn new(idp: &str, opaque_id: &str, user_type: UserType) -> Self {
        Self { idp: idp.to_string(), opaque_id: opaque_id.to_string(), user_type }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl User {
    /// Convenience constructor for a primary user of the default identity provider.
    pub fn local(opaque_id: &str, username: &str) -> Self {
        Self {
            id: UserId::new("local", opaque_id, UserType::Primary),
            username: username.to_string(),
            display_name: username.to_string(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups<I: IntoIterator<Item = S>, S: Into<String>>(mut self, groups: I) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}
