//! Effective permissions of a caller on a node, aggregated over the node and its ancestors.

use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::RequestContext;
use crate::lookup::Lookup;
use crate::node::{Node, Permissions};

pub struct PermissionResolver {
    lu: Arc<Lookup>,
}

impl PermissionResolver {
    pub fn new(lu: Arc<Lookup>) -> Self {
        Self { lu }
    }

    /// OR the grants of the node and every ancestor up to the space root.
    /// Any matching deny grant on the way yields `(none, true)`.
    pub fn assemble_permissions(&self, ctx: &RequestContext, node: &Node) -> Result<(Permissions, bool)> {
        if ctx.user.is_none() {
            return Ok((Permissions::none(), false));
        }
        if node.is_owner(ctx) {
            return Ok((Permissions::full(), false));
        }
        let space_root = self.lu.node_from_space_id(&node.space_id)?;
        if space_root.is_disabled() {
            return Ok((Permissions::none(), false));
        }

        let mut ap = Permissions::none();
        let mut cur = if node.exists {
            node.clone()
        } else if node.parent_id.is_empty() {
            return Err(Error::not_found(format!("{}/{}", node.space_id, node.id)));
        } else {
            // permissions of a node that is about to be created come from its parent
            self.lu.node_from_id(&node.space_id, &node.parent_id)?
        };
        loop {
            let (np, denied) = cur.permission_set(ctx)?;
            if denied {
                debug!(target: "spacefs::permissions", "deny grant on {} for {:?}", cur.id, ctx.user_id());
                return Ok((Permissions::none(), true));
            }
            ap.add(&np);
            if cur.is_space_root() {
                break;
            }
            cur = cur.parent()?;
            if !cur.exists {
                return Err(Error::internal(format!("broken parent chain above {}", node.id)));
            }
        }
        Ok((ap, false))
    }

    /// Fail with `AccessDenied` on a deny grant, `NotFound` when the caller may not even stat,
    /// and `PermissionDenied` when `check` is not satisfied.
    pub fn require<F>(&self, ctx: &RequestContext, node: &Node, what: &str, check: F) -> Result<Permissions>
    where
        F: Fn(&Permissions) -> bool,
    {
        let (p, denied) = self.assemble_permissions(ctx, node)?;
        if denied {
            return Err(Error::access_denied(format!("{} on {}", what, node.id)));
        }
        if !check(&p) {
            if !p.stat {
                return Err(Error::not_found(format!("{}/{}", node.space_id, node.id)));
            }
            return Err(Error::permission_denied(format!("{} on {}", what, node.id)));
        }
        Ok(p)
    }
}
