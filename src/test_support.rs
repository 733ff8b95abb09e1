//! Shared fixtures for unit tests: a store in a temporary directory with one personal space.

use std::io::{Read, Write};
use std::sync::Arc;
use tempfile::TempDir;

use crate::blobstore::LocalBlobstore;
use crate::config::Options;
use crate::identity::{RequestContext, User};
use crate::lookup::{Lookup, SPACE_TYPE_PERSONAL};
use crate::metadata::FileBackend;
use crate::node::{DiskQuotaChecker, Node, NodeType};
use crate::tree::Tree;

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub lu: Arc<Lookup>,
    pub tree: Arc<Tree>,
    pub alice: User,
    pub root: Node,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub(crate) fn fixture_with<F: FnOnce(&mut Options)>(tweak: F) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = Options::with_root(dir.path());
    opts.lock_timeout_ms = 500;
    tweak(&mut opts);
    let backend = Arc::new(FileBackend::new(opts.lock_timeout(), opts.lock_poll()));
    let lu = Arc::new(Lookup::new(opts, backend));
    let blobs = Arc::new(LocalBlobstore::new(dir.path()));
    let tree = Arc::new(Tree::new(lu.clone(), blobs, Arc::new(DiskQuotaChecker)));
    tree.setup().unwrap();
    let alice = User::local("alice-0000-0000-0000", "alice");
    let root = tree
        .create_space_root(&alice.id.opaque_id, "alice", SPACE_TYPE_PERSONAL, Some(&alice.id))
        .unwrap();
    Fixture { dir, lu, tree, alice, root }
}

impl Fixture {
    pub fn alice_ctx(&self) -> RequestContext {
        RequestContext::for_user(self.alice.clone())
    }

    pub fn reload(&self, n: &Node) -> Node {
        self.lu.node_from_id(&n.space_id, &n.id).unwrap()
    }

    pub fn mkdir(&self, parent: &Node, name: &str) -> Node {
        let mut n = parent.child(name).unwrap();
        self.tree.create_dir(&mut n).unwrap();
        self.reload(&n)
    }

    /// Create a file with content, bypassing upload sessions.
    pub fn file(&self, parent: &Node, name: &str, content: &[u8]) -> Node {
        let mut n = parent.child(name).unwrap();
        n.node_type = NodeType::File;
        n.blob_id = uuid::Uuid::new_v4().to_string();
        n.blob_size = content.len() as u64;
        self.tree.touch_file(&mut n, None, None).unwrap();
        let src = self.dir.path().join(format!("src-{}", n.id));
        std::fs::File::create(&src).unwrap().write_all(content).unwrap();
        self.tree.write_blob(&n, &src).unwrap();
        std::fs::remove_file(&src).unwrap();
        self.tree.propagate(&n, content.len() as i64).unwrap();
        self.reload(&n)
    }

    pub fn read(&self, n: &Node) -> Vec<u8> {
        let mut out = Vec::new();
        self.tree.read_blob(n).unwrap().read_to_end(&mut out).unwrap();
        out
    }
}
