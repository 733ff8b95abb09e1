use super::*;
use std::io::Read;
use std::sync::Arc;

use crate::blobstore::LocalBlobstore;
use crate::events::{Event, MemoryPublisher, Publisher};
use crate::metadata::prefixes;
use crate::node::checksums::{ChecksumType, Checksums};
use crate::node::Node;
use crate::test_support::{fixture, fixture_with, Fixture};

fn store(fx: &Fixture, publisher: Option<Arc<MemoryPublisher>>) -> UploadStore {
    let publisher = publisher.map(|p| p as Arc<dyn Publisher>);
    UploadStore::new(fx.lu.clone(), fx.tree.clone(), publisher)
}

fn begin(fx: &Fixture, st: &UploadStore, parent: &Node, name: &str, size: u64, md: &[(&str, &str)]) -> UploadSession {
    let target = parent.child(name).unwrap();
    let mut s = st.new_session(&fx.alice_ctx());
    s.set_target(&target);
    s.set_size(size);
    s.set_metadata(meta::FILENAME, name);
    for (k, v) in md {
        s.set_metadata(k, v);
    }
    s.touch_bin().unwrap();
    s.persist().unwrap();
    s
}

fn upload(fx: &Fixture, st: &UploadStore, parent: &Node, name: &str, content: &[u8], md: &[(&str, &str)]) -> crate::error::Result<Node> {
    let mut s = begin(fx, st, parent, name, content.len() as u64, md);
    s.write_chunk(0, content).unwrap();
    s.finish_upload()
}

/// Yields its bytes, then fails like a dropped connection.
struct Truncated(Vec<u8>, bool);

impl Read for Truncated {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.1 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "client went away"));
        }
        let n = self.0.len().min(buf.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0.drain(..n);
        if self.0.is_empty() {
            self.1 = true;
        }
        Ok(n)
    }
}

#[test]
fn synchronous_upload_creates_the_node() {
    let fx = fixture();
    let st = store(&fx, None);
    let n = upload(&fx, &st, &fx.root, "hello.txt", b"hello", &[]).unwrap();

    let n = fx.reload(&n);
    assert!(n.exists);
    assert_eq!(n.blob_size, 5);
    assert!(!n.is_processing());
    assert_eq!(fx.read(&n), b"hello");
    assert_eq!(
        hex::encode(n.xattrs().unwrap().get(prefixes::CHECKSUM_SHA1).unwrap()),
        "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
    );
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(5));
    assert!(st.list().unwrap().is_empty());
    assert!(!st.bin_path(&n.blob_id).exists());
}

#[test]
fn offset_is_derived_from_staged_bytes() {
    let fx = fixture();
    let st = store(&fx, None);
    let mut s = begin(&fx, &st, &fx.root, "big.bin", 6, &[]);
    let id = s.id().to_string();
    s.write_chunk(0, &b"abc"[..]).unwrap();
    // the record still says 0; a reload must not trust it
    drop(s);

    let mut s = st.get(&id).unwrap();
    assert_eq!(s.offset(), 3);
    assert_eq!(s.write_chunk(0, &b"xyz"[..]).unwrap_err().code_str(), "invalid_argument");
    s.write_chunk(3, &b"defghi"[..]).unwrap();
    assert_eq!(s.offset(), 6, "bytes beyond the declared size are not taken");
    let n = s.finish_upload().unwrap();
    assert_eq!(fx.read(&fx.reload(&n)), b"abcdef");
}

#[test]
fn interrupted_stream_is_a_pause() {
    let fx = fixture();
    let st = store(&fx, None);
    let mut s = begin(&fx, &st, &fx.root, "f", 10, &[]);
    let written = s.write_chunk(0, Truncated(b"1234".to_vec(), false)).unwrap();
    assert_eq!(written, 4);
    assert_eq!(st.get(s.id()).unwrap().offset(), 4);
    assert!(!s.is_processing());
}

#[test]
fn unknown_or_malformed_ids_are_not_found() {
    let fx = fixture();
    let st = store(&fx, None);
    assert!(st.get("no-such-upload").unwrap_err().is_not_found());
    assert!(st.get("../etc/passwd").unwrap_err().is_not_found());
}

#[test]
fn record_keeps_the_resumable_upload_shape() {
    let fx = fixture();
    let st = store(&fx, None);
    let s = begin(&fx, &st, &fx.root, "f", 3, &[(meta::MTIME, "1700000000")]);
    let v: serde_json::Value = serde_json::from_slice(&std::fs::read(s.info_path()).unwrap()).unwrap();
    assert_eq!(v["ID"], s.id());
    assert_eq!(v["Size"], 3);
    assert_eq!(v["MetaData"]["mtime"], "1700000000");
    assert_eq!(v["Storage"]["NodeName"], "f");
    assert_eq!(v["Storage"]["UserId"], "alice-0000-0000-0000");
}

#[test]
fn context_is_rebuilt_from_the_record() {
    let fx = fixture();
    let st = store(&fx, None);
    let s = begin(&fx, &st, &fx.root, "f", 1, &[(meta::LOCK_ID, "lock-1")]);
    let s = st.get(s.id()).unwrap();
    let ctx = s.context();
    assert_eq!(ctx.user_id(), Some("alice-0000-0000-0000"));
    assert_eq!(ctx.lock_id.as_deref(), Some("lock-1"));
    assert_eq!(s.executant(), fx.alice.id);
}

#[test]
fn client_mtime_is_honored() {
    let fx = fixture();
    let st = store(&fx, None);
    let n = upload(&fx, &st, &fx.root, "f", b"x", &[(meta::MTIME, "1700000000.5")]).unwrap();
    let mtime = fx.reload(&n).mtime().unwrap();
    assert_eq!(mtime.timestamp(), 1_700_000_000);
    assert_eq!(mtime.timestamp_subsec_millis(), 500);
}

#[test]
fn checksum_round_trip() {
    let fx = fixture();
    let st = store(&fx, None);
    let body = b"checksummed body";
    let sha = Checksums::compute(&body[..]).unwrap().hex(ChecksumType::Sha1);
    let n = upload(&fx, &st, &fx.root, "c", body, &[(meta::CHECKSUM, &format!("sha1 {}", sha))]).unwrap();
    let stored = fx.reload(&n).xattrs().unwrap().get(prefixes::CHECKSUM_SHA1).map(hex::encode);
    assert_eq!(stored.as_deref(), Some(sha.as_str()));
}

#[test]
fn checksum_mismatch_leaves_the_node_untouched() {
    let fx = fixture();
    let st = store(&fx, None);
    let first = upload(&fx, &st, &fx.root, "c", b"original", &[]).unwrap();
    let before = fx.reload(&first).xattrs().unwrap();

    let mut s = begin(&fx, &st, &fx.root, "c", 7, &[(meta::CHECKSUM, "md5 00000000000000000000000000000000")]);
    s.write_chunk(0, &b"changed"[..]).unwrap();
    let err = s.finish_upload().unwrap_err();
    assert_eq!(err.code_str(), "checksum_mismatch");

    assert_eq!(fx.reload(&first).xattrs().unwrap(), before);
    assert_eq!(fx.read(&fx.reload(&first)), b"original");
    assert!(!s.bin_path().exists());
    assert!(!s.info_path().exists());
    assert!(st.get(s.id()).unwrap_err().is_not_found());
    assert!(st.list().unwrap().is_empty());
    assert!(fx.tree.list_revisions(&first).unwrap().is_empty());
}

#[test]
fn overwrite_keeps_a_revision_and_propagates_the_difference() {
    let fx = fixture();
    let st = store(&fx, None);
    let v1 = upload(&fx, &st, &fx.root, "doc", &[1u8; 50], &[]).unwrap();
    let v2 = upload(&fx, &st, &fx.root, "doc", &[2u8; 80], &[]).unwrap();
    assert_eq!(v1.id, v2.id);

    let cur = fx.reload(&v2);
    assert_eq!(cur.blob_size, 80);
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(80));
    let revs = fx.tree.list_revisions(&cur).unwrap();
    assert_eq!(revs.len(), 1);
    assert_eq!(revs[0].blob_size, 50);
    assert_eq!(fx.read(&revs[0]), vec![1u8; 50]);
}

#[test]
fn disabled_versioning_replaces_content_in_place() {
    let fx = fixture_with(|o| o.disable_versioning = true);
    let st = store(&fx, None);
    upload(&fx, &st, &fx.root, "doc", b"one", &[]).unwrap();
    let n = upload(&fx, &st, &fx.root, "doc", b"three", &[]).unwrap();
    assert!(fx.tree.list_revisions(&n).unwrap().is_empty());
    assert_eq!(fx.read(&fx.reload(&n)), b"three");
}

#[test]
fn same_content_at_same_mtime_shares_one_revision_blob() {
    let fx = fixture();
    let st = store(&fx, None);
    let at = [(meta::MTIME, "1700000000")];
    let first = upload(&fx, &st, &fx.root, "v", b"same", &at).unwrap();
    let first_blob = first.blob_id.clone();
    upload(&fx, &st, &fx.root, "v", b"same", &at).unwrap();
    let n = upload(&fx, &st, &fx.root, "v", b"different", &at).unwrap();

    let revs = fx.tree.list_revisions(&n).unwrap();
    assert_eq!(revs.len(), 1);
    assert_ne!(revs[0].blob_id, first_blob);
    let blobs = LocalBlobstore::new(fx.dir.path());
    assert!(!blobs.blob_path(&n.space_id, &first_blob).exists(), "duplicate blob is dropped");
    assert_eq!(fx.read(&revs[0]), b"same");
}

#[test]
fn conditional_headers_abort_without_changes() {
    let fx = fixture();
    let st = store(&fx, None);
    let n = upload(&fx, &st, &fx.root, "cond", b"v1", &[]).unwrap();
    let n = fx.reload(&n);
    let etag = n.etag().unwrap();

    let cases: [(&str, String); 3] = [
        (meta::IF_MATCH, "\"not-the-etag\"".to_string()),
        (meta::IF_NONE_MATCH, etag.clone()),
        (meta::IF_UNMODIFIED_SINCE, "2000-01-01T00:00:00Z".to_string()),
    ];
    for (key, value) in cases {
        let err = upload(&fx, &st, &fx.root, "cond", b"v2", &[(key, &value)]).unwrap_err();
        assert_eq!(err.code_str(), "aborted", "{}", key);
        let cur = fx.reload(&n);
        assert_eq!(fx.read(&cur), b"v1");
        assert!(!cur.is_processing());
        assert!(fx.tree.list_revisions(&cur).unwrap().is_empty());
    }

    let ok = upload(&fx, &st, &fx.root, "cond", b"v2", &[(meta::IF_MATCH, &etag)]).unwrap();
    assert_eq!(fx.read(&fx.reload(&ok)), b"v2");
}

#[test]
fn quota_is_enforced_on_commit() {
    let fx = fixture();
    fx.root.set_xattr_string(prefixes::QUOTA, "10").unwrap();
    let st = store(&fx, None);
    upload(&fx, &st, &fx.root, "a", &[0u8; 8], &[]).unwrap();
    let err = upload(&fx, &st, &fx.root, "b", &[0u8; 3], &[]).unwrap_err();
    assert_eq!(err.code_str(), "insufficient_storage");
    assert!(!fx.root.child("b").unwrap().exists);
    // overwriting counts the replaced bytes
    upload(&fx, &st, &fx.root, "a", &[0u8; 10], &[]).unwrap();
}

#[test]
fn precondition_failure_wins_over_a_full_space() {
    let fx = fixture();
    fx.root.set_xattr_string(prefixes::QUOTA, "10").unwrap();
    let st = store(&fx, None);
    let n = upload(&fx, &st, &fx.root, "full", &[0u8; 8], &[]).unwrap();

    let err = upload(&fx, &st, &fx.root, "full", &[1u8; 20], &[(meta::IF_MATCH, "\"stale\"")]).unwrap_err();
    assert_eq!(err.code_str(), "aborted");
    let err = upload(&fx, &st, &fx.root, "full", &[1u8; 20], &[]).unwrap_err();
    assert_eq!(err.code_str(), "insufficient_storage");
    assert_eq!(fx.read(&fx.reload(&n)), vec![0u8; 8]);
}

#[test]
fn zero_byte_upload_finalizes_even_in_async_mode() {
    let fx = fixture_with(|o| o.async_postprocessing = true);
    let publisher = Arc::new(MemoryPublisher::new());
    let st = store(&fx, Some(publisher.clone()));
    let n = upload(&fx, &st, &fx.root, "empty", b"", &[]).unwrap();
    assert!(!fx.reload(&n).is_processing());
    assert!(publisher.events().is_empty());
}

#[test]
fn async_upload_waits_for_postprocessing() {
    let fx = fixture_with(|o| o.async_postprocessing = true);
    let publisher = Arc::new(MemoryPublisher::new());
    let st = store(&fx, Some(publisher.clone()));
    let mut s = begin(&fx, &st, &fx.root, "scan-me", 4, &[]);
    let id = s.id().to_string();
    s.write_chunk(0, &b"data"[..]).unwrap();
    assert!(s.is_processing());
    let n = s.finish_upload().unwrap();

    let cur = fx.reload(&n);
    assert_eq!(cur.processing_id().unwrap().as_deref(), Some(id.as_str()));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(4));
    match publisher.take().as_slice() {
        [Event::BytesReceived { upload_id, filesize, filename, .. }] => {
            assert_eq!(upload_id, &id);
            assert_eq!(*filesize, 4);
            assert_eq!(filename, "scan-me");
        }
        other => panic!("unexpected events {:?}", other),
    }

    let when = chrono::Utc::now();
    st.set_scan_result(&id, "clean", &when).unwrap();
    assert_eq!(fx.reload(&n).scan_data().unwrap().map(|(s, _)| s).as_deref(), Some("clean"));

    st.postprocessing_finished(&id, PostprocessingOutcome::Continue).unwrap();
    let cur = fx.reload(&n);
    assert!(!cur.is_processing());
    assert_eq!(fx.read(&cur), b"data");
    assert!(st.get(&id).unwrap_err().is_not_found());
    match publisher.take().as_slice() {
        [Event::UploadReady { failed, is_version, .. }] => {
            assert!(!failed);
            assert!(!is_version);
        }
        other => panic!("unexpected events {:?}", other),
    }
}

#[test]
fn aborted_postprocessing_removes_a_new_node_and_keeps_the_bytes() {
    let fx = fixture_with(|o| o.async_postprocessing = true);
    let st = store(&fx, None);
    let mut s = begin(&fx, &st, &fx.root, "infected", 3, &[]);
    let id = s.id().to_string();
    s.write_chunk(0, &b"bad"[..]).unwrap();
    s.finish_upload().unwrap();

    st.postprocessing_finished(&id, PostprocessingOutcome::Abort).unwrap();
    assert!(!fx.root.child("infected").unwrap().exists);
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(0));
    assert_eq!(st.get(&id).unwrap().offset(), 3);
}

#[test]
fn deleted_postprocessing_restores_the_previous_revision() {
    let fx = fixture_with(|o| o.async_postprocessing = true);
    let publisher = Arc::new(MemoryPublisher::new());
    let st = store(&fx, Some(publisher.clone()));

    let mut first = begin(&fx, &st, &fx.root, "doc", 2, &[]);
    let first_id = first.id().to_string();
    first.write_chunk(0, &b"ok"[..]).unwrap();
    let n = first.finish_upload().unwrap();
    st.postprocessing_finished(&first_id, PostprocessingOutcome::Continue).unwrap();

    let mut second = begin(&fx, &st, &fx.root, "doc", 5, &[]);
    let second_id = second.id().to_string();
    second.write_chunk(0, &b"virus"[..]).unwrap();
    second.finish_upload().unwrap();
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(5));
    publisher.take();

    st.postprocessing_finished(&second_id, PostprocessingOutcome::Delete).unwrap();
    let cur = fx.reload(&n);
    assert_eq!(cur.blob_size, 2);
    assert!(!cur.is_processing());
    assert_eq!(fx.read(&cur), b"ok");
    assert!(fx.tree.list_revisions(&cur).unwrap().is_empty());
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(2));
    assert!(st.get(&second_id).unwrap_err().is_not_found());
    match publisher.take().as_slice() {
        [Event::UploadReady { failed, is_version, .. }] => {
            assert!(*failed);
            assert!(*is_version);
        }
        other => panic!("unexpected events {:?}", other),
    }
}

#[test]
fn cleanup_leaves_a_node_claimed_by_a_later_session() {
    let fx = fixture_with(|o| o.async_postprocessing = true);
    let st = store(&fx, None);
    let mut s = begin(&fx, &st, &fx.root, "raced", 1, &[]);
    s.write_chunk(0, &b"a"[..]).unwrap();
    let n = s.finish_upload().unwrap();
    n.mark_processing("someone-else").unwrap();

    let err = s.cleanup(true, false, false).unwrap_err();
    assert_eq!(err.code_str(), "aborted");
    assert!(fx.reload(&n).exists);
}

#[test]
fn terminate_is_idempotent() {
    let fx = fixture();
    let st = store(&fx, None);
    let mut s = begin(&fx, &st, &fx.root, "gone", 4, &[]);
    s.write_chunk(0, &b"ab"[..]).unwrap();
    s.terminate().unwrap();
    s.terminate().unwrap();
    assert!(!s.bin_path().exists());
    assert!(!s.info_path().exists());
    assert!(!fx.root.child("gone").unwrap().exists);
}

#[test]
fn terminate_after_async_commit_gives_the_space_back() {
    let fx = fixture_with(|o| o.async_postprocessing = true);
    let st = store(&fx, None);
    let dir = fx.mkdir(&fx.root, "inbox");
    let mut s = begin(&fx, &st, &dir, "pending.bin", 500, &[]);
    s.write_chunk(0, &[7u8; 500][..]).unwrap();
    let n = s.finish_upload().unwrap();
    assert!(fx.reload(&n).is_processing());
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(500));

    let s = st.get(s.id()).unwrap();
    s.terminate().unwrap();
    assert!(!dir.child("pending.bin").unwrap().exists);
    assert_eq!(fx.reload(&dir).tree_size().unwrap(), Some(0));
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(0));
    assert!(st.list().unwrap().is_empty());
}

#[test]
fn terminate_after_async_overwrite_restores_the_old_size() {
    let fx = fixture_with(|o| o.async_postprocessing = true);
    let st = store(&fx, None);
    let mut s = begin(&fx, &st, &fx.root, "doc", 3, &[]);
    s.write_chunk(0, &b"old"[..]).unwrap();
    s.finish_upload().unwrap();
    st.postprocessing_finished(s.id(), PostprocessingOutcome::Continue).unwrap();
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(3));

    let mut s = begin(&fx, &st, &fx.root, "doc", 10, &[]);
    s.write_chunk(0, &b"0123456789"[..]).unwrap();
    let n = s.finish_upload().unwrap();
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(10));

    s.terminate().unwrap();
    let n = fx.reload(&n);
    assert!(!n.is_processing());
    assert_eq!(n.blob_size, 3);
    assert_eq!(fx.read(&n), b"old");
    assert_eq!(fx.reload(&fx.root).tree_size().unwrap(), Some(3));
}

#[test]
fn upload_takes_over_an_entry_without_a_record() {
    let fx = fixture();
    let st = store(&fx, None);
    // what an interrupted create leaves behind
    fx.lu.link_child(&fx.root, "crashed.txt", "no-such-node").unwrap();
    assert!(!fx.root.child("crashed.txt").unwrap().exists);

    let n = upload(&fx, &st, &fx.root, "crashed.txt", b"second try", &[]).unwrap();
    let found = fx.root.child("crashed.txt").unwrap();
    assert!(found.exists);
    assert_eq!(found.id, n.id);
    assert_eq!(fx.read(&found), b"second try");
}

#[test]
fn publish_failure_is_reported() {
    let fx = fixture_with(|o| {
        o.async_postprocessing = true;
        o.publish_retries = 2;
    });
    let publisher = Arc::new(MemoryPublisher::new());
    publisher.fail_next(2);
    let st = store(&fx, Some(publisher.clone()));
    let mut s = begin(&fx, &st, &fx.root, "p", 1, &[]);
    s.write_chunk(0, &b"z"[..]).unwrap();
    assert_eq!(s.finish_upload().unwrap_err().code_str(), "internal");
    assert!(s.bin_path().exists(), "staged bytes survive for a retry");
}

#[test]
fn deferred_length_and_concatenation() {
    let fx = fixture();
    let st = store(&fx, None);
    let mut a = begin(&fx, &st, &fx.root, "part-a", 3, &[]);
    a.write_chunk(0, &b"foo"[..]).unwrap();
    let mut b = begin(&fx, &st, &fx.root, "part-b", 3, &[]);
    b.write_chunk(0, &b"bar"[..]).unwrap();

    let mut fin = begin(&fx, &st, &fx.root, "joined", 0, &[(meta::SIZE_DEFERRED, "true")]);
    fin.set_size_is_deferred(true);
    fin.concat_uploads(&[a, b]).unwrap();
    assert_eq!(fin.offset(), 6);
    assert_eq!(fin.declare_length(2).unwrap_err().code_str(), "invalid_argument");
    fin.declare_length(6).unwrap();
    assert_eq!(fin.declare_length(6).unwrap_err().code_str(), "invalid_argument");

    let n = fin.finish_upload().unwrap();
    assert_eq!(fx.read(&fx.reload(&n)), b"foobar");
}

#[test]
fn expired_sessions_are_cleaned() {
    let fx = fixture();
    let st = store(&fx, None);
    let old = begin(&fx, &st, &fx.root, "old", 5, &[(meta::EXPIRES, "1000")]);
    let fresh = begin(&fx, &st, &fx.root, "fresh", 5, &[(meta::EXPIRES, "4102444800")]);
    let untimed = begin(&fx, &st, &fx.root, "untimed", 5, &[]);
    assert_eq!(st.list().unwrap().len(), 3);

    assert_eq!(st.clean_expired(&chrono::Utc::now()).unwrap(), 1);
    assert!(st.get(old.id()).unwrap_err().is_not_found());
    assert!(st.get(fresh.id()).is_ok());
    assert!(st.get(untimed.id()).is_ok());
}
