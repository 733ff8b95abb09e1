use super::*;
use crate::metadata::prefixes;
use crate::node::checksums::Checksums;
use crate::test_support::{fixture, fixture_with};

fn set_checksums(n: &Node, content: &[u8]) {
    let cs = Checksums::compute(content).unwrap();
    let mut attrs = Attributes::new();
    cs.to_attributes(&mut attrs);
    n.set_xattrs(&attrs, true).unwrap();
}

#[test]
fn create_dir_links_child_and_rejects_duplicates() {
    let fx = fixture();
    let docs = fx.mkdir(&fx.root, "docs");
    assert!(docs.is_dir());
    assert_eq!(docs.parent_id, fx.root.id);
    assert_eq!(docs.tree_size().unwrap(), Some(0));

    let mut again = Node::new(fx.tree.lookup(), &fx.root.space_id, "", &fx.root.id, "docs", 0, "", NodeType::Container, None);
    let err = fx.tree.create_dir(&mut again).unwrap_err();
    assert!(err.is_already_exists());
    // the losing attempt leaves no orphan record behind
    assert!(!fx.lu.backend().metadata_path(&again.internal_path()).exists());
}

#[test]
fn sizes_propagate_to_every_ancestor() {
    let fx = fixture();
    let a = fx.mkdir(&fx.root, "a");
    let b = fx.mkdir(&a, "b");
    fx.file(&b, "one.bin", &[1u8; 100]);
    fx.file(&a, "two.bin", &[2u8; 20]);

    assert_eq!(fx.reload(&b).tree_size().unwrap(), Some(100));
    assert_eq!(fx.reload(&a).tree_size().unwrap(), Some(120));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(120));
    assert!(std::fs::read_dir(fx.lu.changes_dir()).unwrap().next().is_none());
}

#[test]
fn propagation_updates_tree_mtime_and_clears_temp_etag() {
    let fx = fixture();
    let a = fx.mkdir(&fx.root, "a");
    a.set_etag("\"pinned\"").unwrap();
    let before = a.tmtime().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    fx.file(&a, "f", b"x");
    let a = fx.reload(&a);
    assert!(a.tmtime().unwrap() > before);
    assert_eq!(a.xattr_string(prefixes::TMP_ETAG).unwrap(), None);
}

#[test]
fn treesize_accounting_can_be_disabled() {
    let fx = fixture_with(|o| o.treesize_accounting = false);
    let a = fx.mkdir(&fx.root, "a");
    fx.file(&a, "f", b"12345");
    assert_eq!(fx.reload(&a).tree_size().unwrap(), Some(0));
}

#[test]
fn replaying_a_journaled_change_counts_once() {
    let fx = fixture();
    let a = fx.mkdir(&fx.root, "a");
    let change = Change {
        id: "change-1".into(),
        space_id: fx.root.space_id.clone(),
        start_id: a.id.clone(),
        sync_time: Utc::now(),
        size_diff: 7,
        applied: Vec::new(),
    };
    fx.tree.apply_change(&change).unwrap();
    // crash before the journal entry was removed
    let journal = fx.lu.changes_dir().join("change-1.json");
    assert!(journal.exists());
    assert_eq!(fx.tree.recover_pending_propagations().unwrap(), 1);

    assert!(!journal.exists());
    assert_eq!(fx.reload(&a).tree_size().unwrap(), Some(7));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(7));
    assert_eq!(fx.tree.recover_pending_propagations().unwrap(), 0);
}

#[test]
fn partially_applied_change_survives_later_traffic() {
    let fx = fixture();
    let a = fx.mkdir(&fx.root, "a");
    let change = Change {
        id: "interrupted".into(),
        space_id: fx.root.space_id.clone(),
        start_id: a.id.clone(),
        sync_time: Utc::now(),
        size_diff: 7,
        applied: Vec::new(),
    };
    std::fs::write(fx.lu.changes_dir().join("interrupted.json"), serde_json::to_vec(&change).unwrap()).unwrap();
    // the process died right after updating `a`, before the journal noted it
    let mut set = Attributes::new();
    set.set_u64(prefixes::TREESIZE, 7);
    set.set_string(prefixes::PROPAGATION_PENDING, "interrupted");
    fx.lu.backend().set_multiple(&a.internal_path(), &set, true).unwrap();

    for i in 0..33 {
        fx.file(&a, &format!("f{}", i), b"x");
    }
    assert_eq!(fx.reload(&a).tree_size().unwrap(), Some(40));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(33));

    assert_eq!(fx.tree.recover_pending_propagations().unwrap(), 1);
    let a = fx.reload(&a);
    assert_eq!(a.tree_size().unwrap(), Some(40));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(40));
    assert_eq!(a.xattr_string(prefixes::PROPAGATION_PENDING).unwrap(), None);
}

#[test]
fn journal_progress_skips_ancestors_already_done() {
    let fx = fixture();
    let a = fx.mkdir(&fx.root, "a");
    let b = fx.mkdir(&a, "b");
    let mut set = Attributes::new();
    set.set_u64(prefixes::TREESIZE, 5);
    fx.lu.backend().set_multiple(&b.internal_path(), &set, true).unwrap();
    // journal already records `b`, the process died before reaching `a`
    let change = Change {
        id: "halfway".into(),
        space_id: fx.root.space_id.clone(),
        start_id: b.id.clone(),
        sync_time: Utc::now(),
        size_diff: 5,
        applied: vec![b.id.clone()],
    };
    std::fs::write(fx.lu.changes_dir().join("halfway.json"), serde_json::to_vec(&change).unwrap()).unwrap();

    assert_eq!(fx.tree.recover_pending_propagations().unwrap(), 1);
    assert_eq!(fx.reload(&b).tree_size().unwrap(), Some(5));
    assert_eq!(fx.reload(&a).tree_size().unwrap(), Some(5));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(5));
}

#[test]
fn negative_propagation_clamps_at_zero() {
    let fx = fixture();
    let a = fx.mkdir(&fx.root, "a");
    let f = fx.file(&a, "f", b"abc");
    a.set_tree_size(1).unwrap();
    fx.tree.propagate(&f, -3).unwrap();
    assert_eq!(fx.reload(&a).tree_size().unwrap(), Some(0));
}

#[test]
fn move_renames_and_reparents() {
    let fx = fixture();
    let src = fx.mkdir(&fx.root, "src");
    let dst = fx.mkdir(&fx.root, "dst");
    let f = fx.file(&src, "f.txt", b"12345");

    let renamed = src.child("g.txt").unwrap();
    fx.tree.move_node(&f, &renamed).unwrap();
    let f = fx.reload(&f);
    assert_eq!(f.name, "g.txt");
    assert!(!src.child("f.txt").unwrap().exists);

    let target = dst.child("h.txt").unwrap();
    fx.tree.move_node(&f, &target).unwrap();
    let f = fx.reload(&f);
    assert_eq!(f.parent_id, dst.id);
    assert_eq!(fx.lu.path(&f).unwrap(), "/dst/h.txt");
    assert_eq!(fx.reload(&src).tree_size().unwrap(), Some(0));
    assert_eq!(fx.reload(&dst).tree_size().unwrap(), Some(5));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(5));
}

#[test]
fn interrupted_move_completes_when_run_again() {
    let fx = fixture();
    let src = fx.mkdir(&fx.root, "src");
    let dst = fx.mkdir(&fx.root, "dst");
    let f = fx.file(&src, "f", b"12345");
    // record already points at the new place, the entry was never relinked
    let mut attrs = Attributes::new();
    attrs.set_string(prefixes::PARENT_ID, &dst.id);
    attrs.set_string(prefixes::NAME, "g");
    attrs.set_string(prefixes::MOVE_ORIGIN, &format!("{}/f", src.id));
    f.set_xattrs(&attrs, true).unwrap();

    let old = src.child("f").unwrap();
    assert_eq!(old.id, f.id);
    let target = dst.child("g").unwrap();
    assert!(!target.exists);
    fx.tree.move_node(&old, &target).unwrap();

    let f = fx.reload(&f);
    assert_eq!(fx.lu.path(&f).unwrap(), "/dst/g");
    assert_eq!(dst.child("g").unwrap().id, f.id);
    assert!(!src.child("f").unwrap().exists);
    assert_eq!(f.xattr_string(prefixes::MOVE_ORIGIN).unwrap(), None);
    assert_eq!(fx.reload(&src).tree_size().unwrap(), Some(0));
    assert_eq!(fx.reload(&dst).tree_size().unwrap(), Some(5));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(5));
}

#[test]
fn stale_move_origin_is_ignored() {
    let fx = fixture();
    let a = fx.mkdir(&fx.root, "a");
    let f = fx.file(&fx.root, "f", b"xy");
    f.set_xattr_string(prefixes::MOVE_ORIGIN, &format!("{}/f", a.id)).unwrap();

    fx.tree.move_node(&fx.reload(&f), &a.child("moved").unwrap()).unwrap();
    assert_eq!(fx.lu.path(&fx.reload(&f)).unwrap(), "/a/moved");
    assert!(!fx.root.child("f").unwrap().exists);
}

#[test]
fn entry_without_a_record_can_be_reused() {
    let fx = fixture();
    fx.lu.link_child(&fx.root, "stale", "never-written").unwrap();
    let dir = fx.mkdir(&fx.root, "stale");
    assert!(dir.is_dir());
    assert_eq!(fx.root.child("stale").unwrap().id, dir.id);

    fx.lu.link_child(&fx.root, "stale2", "never-written-2").unwrap();
    let mut n = fx.root.child("stale2").unwrap();
    n.id = uuid::Uuid::new_v4().to_string();
    n.node_type = NodeType::File;
    drop(fx.tree.init_new_node(&n, 1).unwrap());
    assert_eq!(fx.root.child("stale2").unwrap().id, n.id);

    // a live entry is never taken over
    let err = fx.lu.link_child(&fx.root, "stale2", "someone-else").unwrap_err();
    assert!(err.is_already_exists());
}

#[test]
fn move_into_own_subtree_is_rejected() {
    let fx = fixture();
    let a = fx.mkdir(&fx.root, "a");
    let b = fx.mkdir(&a, "b");
    let err = fx.tree.move_node(&a, &b.child("a").unwrap()).unwrap_err();
    assert_eq!(err.code_str(), "invalid_argument");
    assert!(fx.root.child("a").unwrap().exists);
}

#[test]
fn move_over_existing_target_replaces_it() {
    let fx = fixture();
    let a = fx.file(&fx.root, "a", b"aaaa");
    let b = fx.file(&fx.root, "b", b"bb");
    fx.tree.move_node(&a, &fx.root.child("b").unwrap()).unwrap();
    let now_b = fx.root.child("b").unwrap();
    assert_eq!(now_b.id, a.id);
    assert!(!fx.lu.backend().metadata_path(&b.internal_path()).exists());
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(4));
}

#[test]
fn list_folder_returns_existing_children() {
    let fx = fixture();
    fx.mkdir(&fx.root, "b");
    fx.file(&fx.root, "a", b"1");
    let names: Vec<String> = fx.tree.list_folder(&fx.root).unwrap().into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn delete_and_restore_round_trip() {
    let fx = fixture();
    let docs = fx.mkdir(&fx.root, "docs");
    let f = fx.file(&docs, "f.txt", b"hello");
    fx.tree.delete(&f).unwrap();

    assert!(!docs.child("f.txt").unwrap().exists);
    assert_eq!(fx.reload(&docs).tree_size().unwrap(), Some(0));
    let items = fx.tree.list_recycle(&fx.root.space_id).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, f.id);
    assert_eq!(items[0].origin, "/docs/f.txt");
    assert_eq!(items[0].size, 5);

    let restored = fx.tree.restore_recycle_item(&fx.root.space_id, &f.id, None).unwrap();
    assert_eq!(restored.parent_id, docs.id);
    assert_eq!(restored.xattr_string(prefixes::TRASH_ORIGIN).unwrap(), None);
    assert_eq!(fx.read(&restored), b"hello");
    assert_eq!(fx.reload(&docs).tree_size().unwrap(), Some(5));
    assert!(fx.tree.list_recycle(&fx.root.space_id).unwrap().is_empty());
}

#[test]
fn restore_refuses_occupied_target() {
    let fx = fixture();
    let f = fx.file(&fx.root, "f.txt", b"1");
    fx.tree.delete(&f).unwrap();
    fx.file(&fx.root, "f.txt", b"2");
    let err = fx.tree.restore_recycle_item(&fx.root.space_id, &f.id, None).unwrap_err();
    assert!(err.is_already_exists());

    let elsewhere = fx.root.child("f-restored.txt").unwrap();
    let restored = fx.tree.restore_recycle_item(&fx.root.space_id, &f.id, Some(&elsewhere)).unwrap();
    assert_eq!(restored.name, "f-restored.txt");
}

#[test]
fn purge_removes_subtree_blobs_and_keeps_lock_files() {
    let fx = fixture();
    let dir = fx.mkdir(&fx.root, "dir");
    let f = fx.file(&dir, "f", b"data");
    let blob = fx.dir.path().join("spaces").join(crate::lookup::pathify(&f.space_id, 1, 2)).join("blobs").join(crate::lookup::pathify(&f.blob_id, 4, 2));
    assert!(blob.exists());
    fx.tree.delete(&dir).unwrap();
    assert_eq!(fx.tree.empty_recycle(&fx.root.space_id).unwrap(), 1);

    assert!(!blob.exists());
    assert!(!fx.lu.backend().metadata_path(&f.internal_path()).exists());
    assert!(fx.lu.backend().lockfile_path(&dir.internal_path()).exists());
    assert!(fx.tree.list_recycle(&fx.root.space_id).unwrap().is_empty());
}

#[test]
fn revision_snapshot_and_restore() {
    let fx = fixture();
    let f = fx.file(&fx.root, "f.txt", b"v1");
    set_checksums(&f, b"v1");
    let v1_mtime = f.mtime().unwrap();
    {
        let _g = f.lock().unwrap();
        fx.tree.create_revision(&f, &v1_mtime).unwrap();
    }
    // overwrite in place
    let mut attrs = Attributes::new();
    attrs.set_string(prefixes::BLOB_ID, "blob-v2");
    attrs.set_u64(prefixes::BLOB_SIZE, 3);
    f.set_xattrs(&attrs, true).unwrap();
    set_checksums(&f, b"v22");
    let f = fx.reload(&f);

    let revs = fx.tree.list_revisions(&f).unwrap();
    assert_eq!(revs.len(), 1);
    assert_eq!(revs[0].blob_size, 2);
    let ts = revs[0].revision.clone().unwrap();

    fx.tree.restore_revision(&f, &ts).unwrap();
    let f = fx.reload(&f);
    assert_eq!(f.blob_size, 2);
    let revs = fx.tree.list_revisions(&f).unwrap();
    assert_eq!(revs.len(), 1);
    assert_eq!(revs[0].blob_id, "blob-v2");
}

#[test]
fn colliding_snapshot_with_same_content_is_reused() {
    let fx = fixture();
    let f = fx.file(&fx.root, "f.txt", b"same");
    set_checksums(&f, b"same");
    let mtime = f.mtime().unwrap();
    let _g = f.lock().unwrap();
    let first = fx.tree.create_revision(&f, &mtime).unwrap();
    let second = fx.tree.create_revision(&f, &mtime).unwrap();
    assert_eq!(first, second);
    assert_eq!(fx.tree.list_revisions(&f).unwrap().len(), 1);
}

#[test]
fn colliding_snapshot_with_other_content_gets_new_key() {
    let fx = fixture();
    let f = fx.file(&fx.root, "f.txt", b"one");
    set_checksums(&f, b"one");
    let mtime = f.mtime().unwrap();
    let _g = f.lock().unwrap();
    let first = fx.tree.create_revision(&f, &mtime).unwrap();
    set_checksums(&f, b"two");
    let second = fx.tree.create_revision(&f, &mtime).unwrap();
    assert_ne!(first, second);
    assert_eq!(fx.tree.list_revisions(&f).unwrap().len(), 2);
}

#[test]
fn missing_checksums_never_dedupe() {
    let fx = fixture();
    let f = fx.file(&fx.root, "f.txt", b"x");
    let mtime = f.mtime().unwrap();
    let _g = f.lock().unwrap();
    fx.tree.create_revision(&f, &mtime).unwrap();
    fx.tree.create_revision(&f, &mtime).unwrap();
    assert_eq!(fx.tree.list_revisions(&f).unwrap().len(), 2);
}

#[test]
fn delete_revision_removes_its_blob() {
    let fx = fixture();
    let f = fx.file(&fx.root, "f.txt", b"x");
    let mtime = f.mtime().unwrap();
    {
        let _g = f.lock().unwrap();
        fx.tree.create_revision(&f, &mtime).unwrap();
    }
    let ts = fx.tree.list_revisions(&f).unwrap()[0].revision.clone().unwrap();
    fx.tree.delete_revision(&f, &ts).unwrap();
    assert!(fx.tree.list_revisions(&f).unwrap().is_empty());
    // the revision shared the live blob, which must survive
    assert_eq!(fx.read(&f), b"x");
    assert!(fx.tree.delete_revision(&f, &ts).unwrap_err().is_not_found());
}

#[test]
fn init_new_node_enforces_quota() {
    let fx = fixture();
    fx.root.set_xattr_string(prefixes::QUOTA, "10").unwrap();
    let mut n = fx.root.child("big").unwrap();
    n.id = uuid::Uuid::new_v4().to_string();
    n.node_type = NodeType::File;
    let err = fx.tree.init_new_node(&n, 11).unwrap_err();
    assert_eq!(err.code_str(), "insufficient_storage");
    assert!(!n.internal_path().exists());
    assert!(!fx.root.child("big").unwrap().exists);

    let guard = fx.tree.init_new_node(&n, 10).unwrap();
    let record = fx.lu.backend().all(&n.internal_path()).unwrap();
    assert_eq!(record.string(prefixes::PARENT_ID), Some(fx.root.id.clone()));
    assert_eq!(record.string(prefixes::NAME).as_deref(), Some("big"));
    drop(guard);
    assert_eq!(fx.root.child("big").unwrap().id, n.id);
}
