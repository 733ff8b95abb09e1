//! Caller identity carried through every storage call.
//! Authentication happens upstream; the engine only consumes an already resolved user.

mod principal;
mod request_context;

pub use principal::{User, UserId, UserType};
pub use request_context::RequestContext;
