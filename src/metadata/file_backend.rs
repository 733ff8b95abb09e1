use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::{sibling, AttrError, AttrLock, AttrResult, Attributes, MetadataBackend};

const META_SUFFIX: &str = ".meta";
const LOCK_SUFFIX: &str = ".lock";
const RECORD_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct AttrRecord {
    version: u32,
    attrs: Attributes,
}

/// Attribute records stored as one bincode file per node, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileBackend {
    lock_timeout: Duration,
    lock_poll: Duration,
}

impl Default for FileBackend {
    fn default() -> Self {
        Self { lock_timeout: Duration::from_secs(5), lock_poll: Duration::from_millis(10) }
    }
}

impl FileBackend {
    pub fn new(lock_timeout: Duration, lock_poll: Duration) -> Self {
        Self { lock_timeout, lock_poll }
    }

    fn read_record(&self, path: &Path) -> AttrResult<Attributes> {
        let meta = self.metadata_path(path);
        match std::fs::read(&meta) {
            Ok(bytes) => {
                let rec: AttrRecord = bincode::deserialize(&bytes)
                    .map_err(|e| AttrError::Corrupt { path: meta.display().to_string(), reason: e.to_string() })?;
                if rec.version != RECORD_VERSION {
                    return Err(AttrError::Corrupt { path: meta.display().to_string(), reason: format!("unsupported record version {}", rec.version) });
                }
                Ok(rec.attrs)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AttrError::NotExist(path.display().to_string())),
            Err(e) if e.kind() == ErrorKind::NotADirectory => Err(AttrError::NotDir(path.display().to_string())),
            Err(e) => Err(AttrError::Io(e)),
        }
    }

    fn write_record(&self, path: &Path, attrs: Attributes) -> AttrResult<()> {
        let meta = self.metadata_path(path);
        let rec = AttrRecord { version: RECORD_VERSION, attrs };
        let bytes = bincode::serialize(&rec)
            .map_err(|e| AttrError::Corrupt { path: meta.display().to_string(), reason: e.to_string() })?;
        let tmp = sibling(&meta, &format!(".tmp.{}", uuid::Uuid::new_v4().simple()));
        let res = (|| -> std::io::Result<()> {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            std::fs::rename(&tmp, &meta)
        })();
        if let Err(e) = res {
            let _ = std::fs::remove_file(&tmp);
            return Err(match e.kind() {
                ErrorKind::NotFound => AttrError::NotExist(path.display().to_string()),
                ErrorKind::NotADirectory => AttrError::NotDir(path.display().to_string()),
                _ => AttrError::Io(e),
            });
        }
        Ok(())
    }

    fn modify<F: FnOnce(&mut Attributes)>(&self, path: &Path, acquire_lock: bool, f: F) -> AttrResult<()> {
        let _guard = if acquire_lock { Some(self.lock(path)?) } else { None };
        let mut attrs = match self.read_record(path) {
            Ok(a) => a,
            Err(AttrError::NotExist(_)) => Attributes::new(),
            Err(e) => return Err(e),
        };
        f(&mut attrs);
        self.write_record(path, attrs)
    }
}

impl MetadataBackend for FileBackend {
    fn name(&self) -> &'static str { "file" }

    fn all(&self, path: &Path) -> AttrResult<Attributes> {
        self.read_record(path)
    }

    fn set_multiple(&self, path: &Path, attrs: &Attributes, acquire_lock: bool) -> AttrResult<()> {
        self.modify(path, acquire_lock, |cur| cur.extend(attrs))
    }

    fn update(&self, path: &Path, remove: &[&str], set: &Attributes, acquire_lock: bool) -> AttrResult<()> {
        self.modify(path, acquire_lock, |cur| {
            for k in remove {
                cur.remove(k);
            }
            cur.extend(set);
        })
    }

    fn lock(&self, path: &Path) -> AttrResult<AttrLock> {
        AttrLock::acquire(&self.lockfile_path(path), self.lock_timeout, self.lock_poll)
    }

    fn purge(&self, path: &Path) -> AttrResult<()> {
        match std::fs::remove_file(self.metadata_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AttrError::Io(e)),
        }
    }

    fn rename(&self, old: &Path, new: &Path) -> AttrResult<()> {
        debug!(target: "spacefs::metadata", "rename record {} -> {}", old.display(), new.display());
        match std::fs::rename(self.metadata_path(old), self.metadata_path(new)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AttrError::NotExist(old.display().to_string())),
            Err(e) => Err(AttrError::Io(e)),
        }
    }

    fn metadata_path(&self, path: &Path) -> PathBuf { sibling(path, META_SUFFIX) }
    fn lockfile_path(&self, path: &Path) -> PathBuf { sibling(path, LOCK_SUFFIX) }

    fn is_metadata_file(&self, path: &Path) -> bool {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        name.ends_with(META_SUFFIX) || name.ends_with(LOCK_SUFFIX) || name.contains(".meta.tmp.")
    }
}
