use super::*;
use std::sync::Arc;
use std::time::Duration;

fn backend() -> FileBackend {
    FileBackend::new(Duration::from_millis(200), Duration::from_millis(2))
}

#[test]
fn missing_record_is_not_exist() {
    let dir = tempfile::tempdir().unwrap();
    let b = backend();
    let err = b.get(&dir.path().join("node"), prefixes::NAME).unwrap_err();
    assert!(err.is_not_exist());
}

#[test]
fn unset_key_on_existing_record() {
    let dir = tempfile::tempdir().unwrap();
    let b = backend();
    let p = dir.path().join("node");
    b.set(&p, prefixes::NAME, b"a.txt").unwrap();
    assert_eq!(b.get_string(&p, prefixes::NAME).unwrap(), "a.txt");
    let err = b.get(&p, prefixes::BLOB_ID).unwrap_err();
    assert!(err.is_unset());
}

#[test]
fn file_in_the_middle_is_not_dir() {
    let dir = tempfile::tempdir().unwrap();
    let b = backend();
    let file = dir.path().join("plain");
    std::fs::write(&file, b"x").unwrap();
    let err = b.all(&file.join("child")).unwrap_err();
    assert!(err.is_not_dir(), "got {:?}", err);
}

#[test]
fn multi_key_write_and_update() {
    let dir = tempfile::tempdir().unwrap();
    let b = backend();
    let p = dir.path().join("node");
    let mut a = Attributes::new();
    a.set_string(prefixes::ID, "n1");
    a.set_string(prefixes::PARENT_ID, "root");
    a.set_i64(prefixes::TREESIZE, 12);
    b.set_multiple(&p, &a, true).unwrap();
    assert_eq!(b.list_keys(&p).unwrap().len(), 3);

    let mut s = Attributes::new();
    s.set_i64(prefixes::TREESIZE, 20);
    b.update(&p, &[prefixes::PARENT_ID], &s, true).unwrap();
    let all = b.all(&p).unwrap();
    assert_eq!(all.i64(prefixes::TREESIZE), Some(20));
    assert!(!all.contains_key(prefixes::PARENT_ID));

    b.remove(&p, prefixes::TREESIZE, true).unwrap();
    assert!(b.get(&p, prefixes::TREESIZE).unwrap_err().is_unset());
}

#[test]
fn lock_is_exclusive_and_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let b = backend();
    let p = dir.path().join("node");
    let held = b.lock(&p).unwrap();
    let err = b.lock(&p).unwrap_err();
    assert!(matches!(err, AttrError::LockTimeout(_)));
    drop(held);
    let _again = b.lock(&p).unwrap();
    assert!(b.lockfile_path(&p).exists());
}

#[test]
fn lock_file_survives_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let b = backend();
    let p = dir.path().join("node");
    {
        let _g = b.lock(&p).unwrap();
    }
    assert!(b.lockfile_path(&p).exists());
}

#[test]
fn concurrent_writers_do_not_lose_keys() {
    let dir = tempfile::tempdir().unwrap();
    let b = Arc::new(FileBackend::new(Duration::from_secs(5), Duration::from_millis(1)));
    let p = Arc::new(dir.path().join("node"));
    let mut handles = Vec::new();
    for i in 0..8 {
        let b = b.clone();
        let p = p.clone();
        handles.push(std::thread::spawn(move || {
            b.set(&p, &format!("md.k{}", i), b"v").unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(b.list_keys(&p).unwrap().len(), 8);
}

#[test]
fn rename_and_purge_record() {
    let dir = tempfile::tempdir().unwrap();
    let b = backend();
    let a = dir.path().join("a");
    let c = dir.path().join("a.T.2024");
    b.set(&a, prefixes::NAME, b"x").unwrap();
    b.rename(&a, &c).unwrap();
    assert!(b.all(&a).unwrap_err().is_not_exist());
    assert_eq!(b.get_string(&c, prefixes::NAME).unwrap(), "x");
    b.purge(&c).unwrap();
    b.purge(&c).unwrap();
    assert!(b.is_metadata_file(&b.metadata_path(&c)));
    assert!(!b.is_metadata_file(&c));
}

#[test]
fn sibling_keeps_dots() {
    let p = std::path::Path::new("/x/ab.REV.2024-01-01T00:00:00.5Z");
    assert_eq!(sibling(p, ".meta"), std::path::PathBuf::from("/x/ab.REV.2024-01-01T00:00:00.5Z.meta"));
}
