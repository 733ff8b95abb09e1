use super::User;

/// Per-call context: the acting user plus request scoped values the storage layer consults.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user: Option<User>,
    /// Lock token presented by the client; compared against node locks before writes.
    pub lock_id: Option<String>,
    /// Identifies the client that initiated the change, echoed in events.
    pub initiator_id: Option<String>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn for_user(user: User) -> Self {
        Self { user: Some(user), ..Default::default() }
    }

    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = Some(lock_id.into());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.opaque_id.as_str())
    }
}
