use std::fmt;

/// Separator between a node id and a revision timestamp in revision keys.
pub const REVISION_DELIMITER: &str = ".REV.";
/// Separator between a node id and the deletion timestamp of a trashed node.
pub const TRASH_DELIMITER: &str = ".T.";

/// Address of either the live state of a node or one of its stored revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Live(String),
    Revision { id: String, timestamp: String },
}

impl NodeRef {
    pub fn live(id: &str) -> Self { NodeRef::Live(id.to_string()) }

    pub fn revision(id: &str, timestamp: &str) -> Self {
        NodeRef::Revision { id: id.to_string(), timestamp: timestamp.to_string() }
    }

    /// Parse an external key such as `<id>` or `<id>.REV.<timestamp>`.
    pub fn parse(key: &str) -> Self {
        match key.split_once(REVISION_DELIMITER) {
            Some((id, ts)) if !id.is_empty() && !ts.is_empty() => NodeRef::revision(id, ts),
            _ => NodeRef::live(key),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            NodeRef::Live(id) => id,
            NodeRef::Revision { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        match self {
            NodeRef::Live(_) => None,
            NodeRef::Revision { timestamp, .. } => Some(timestamp),
        }
    }

    /// On-disk key of the referenced state.
    pub fn key(&self) -> String {
        match self {
            NodeRef::Live(id) => id.clone(),
            NodeRef::Revision { id, timestamp } => format!("{}{}{}", id, REVISION_DELIMITER, timestamp),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_key() {
        let r = NodeRef::parse("abc.REV.2024-01-02T03:04:05.6Z");
        assert_eq!(r.id(), "abc");
        assert_eq!(r.timestamp(), Some("2024-01-02T03:04:05.6Z"));
        assert_eq!(r.key(), "abc.REV.2024-01-02T03:04:05.6Z");
        let l = NodeRef::parse("abc");
        assert_eq!(l, NodeRef::live("abc"));
        assert_eq!(l.timestamp(), None);
        assert_eq!(NodeRef::parse(".REV.x"), NodeRef::live(".REV.x"));
    }
}
