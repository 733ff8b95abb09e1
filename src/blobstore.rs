//! Blob backend. Blobs are immutable byte payloads addressed by `(space id, blob id)`.

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lookup::pathify;
use crate::metadata::sibling;
use crate::node::Node;

pub trait Blobstore: Send + Sync {
    /// Store the file at `source` as the blob of `node`.
    fn upload(&self, node: &Node, source: &Path) -> Result<()>;
    fn download(&self, node: &Node) -> Result<Box<dyn Read + Send>>;
    /// Remove a blob. A blob that is already gone is not an error.
    fn delete(&self, node: &Node) -> Result<()>;
}

/// Blobs kept under the storage root, next to the space they belong to.
pub struct LocalBlobstore {
    root: PathBuf,
}

impl LocalBlobstore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn blob_path(&self, space_id: &str, blob_id: &str) -> PathBuf {
        self.root
            .join("spaces")
            .join(pathify(space_id, 1, 2))
            .join("blobs")
            .join(pathify(blob_id, 4, 2))
    }

    fn path_for(&self, node: &Node) -> Result<PathBuf> {
        if node.blob_id.is_empty() {
            return Err(Error::invalid(format!("node {} has no blob id", node.id)));
        }
        Ok(self.blob_path(&node.space_id, &node.blob_id))
    }
}

impl Blobstore for LocalBlobstore {
    fn upload(&self, node: &Node, source: &Path) -> Result<()> {
        let dest = self.path_for(node)?;
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = sibling(&dest, ".part");
        fs::copy(source, &tmp)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &dest)?;
        debug!(target: "spacefs::blobstore", "stored blob {} ({} bytes)", node.blob_id, node.blob_size);
        Ok(())
    }

    fn download(&self, node: &Node) -> Result<Box<dyn Read + Send>> {
        let path = self.path_for(node)?;
        match fs::File::open(&path) {
            Ok(f) => Ok(Box::new(std::io::BufReader::new(f))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(format!("blob {}", node.blob_id))),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, node: &Node) -> Result<()> {
        let path = self.path_for(node)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
