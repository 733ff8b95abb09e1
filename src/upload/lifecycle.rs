use chrono::Utc;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, error, info, warn};

use super::{meta, UploadSession};
use crate::error::{Error, Result};
use crate::events::{publish_with_retry, Event};
use crate::metadata::{prefixes, Attributes};
use crate::metrics;
use crate::node::checksums::{Checksums, DeclaredChecksum};
use crate::node::{calculate_etag, times, Node, NodeType};

const CHUNK_BUFFER: usize = 64 * 1024;

impl UploadSession {
    /// Append bytes at `offset`. A stream that ends early is a pause, not a failure:
    /// whatever arrived stays staged and the offset reflects it.
    pub fn write_chunk<R: Read>(&mut self, offset: u64, mut reader: R) -> Result<u64> {
        if offset != self.info.offset {
            return Err(Error::invalid(format!(
                "upload {} is at offset {}, got a chunk for {}",
                self.id(),
                self.info.offset,
                offset
            )));
        }
        let limit = if self.info.size_is_deferred { u64::MAX } else { self.info.size.saturating_sub(offset) };
        let mut file = fs::OpenOptions::new().append(true).open(self.bin_path()).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::not_found(format!("staged bytes of upload {}", self.id())),
            _ => e.into(),
        })?;

        let mut buf = vec![0u8; CHUNK_BUFFER];
        let mut written = 0u64;
        while written < limit {
            let want = (limit - written).min(buf.len() as u64) as usize;
            let n = match reader.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!(target: "spacefs::upload", "stream of {} ended early after {} bytes", self.id(), written);
                    break;
                }
                Err(e) => {
                    file.flush()?;
                    self.info.offset = offset + written;
                    return Err(e.into());
                }
            };
            file.write_all(&buf[..n])?;
            written += n as u64;
        }
        file.sync_data()?;
        self.info.offset = offset + written;
        debug!(target: "spacefs::upload", "upload {} received {} bytes, now at {}", self.id(), written, self.info.offset);
        Ok(written)
    }

    /// Fix the size of an upload created with a deferred length.
    pub fn declare_length(&mut self, length: u64) -> Result<()> {
        if !self.info.size_is_deferred {
            return Err(Error::invalid(format!("upload {} already has a length", self.id())));
        }
        if length < self.info.offset {
            return Err(Error::invalid(format!("length {} is below received {}", length, self.info.offset)));
        }
        self.info.size = length;
        self.info.size_is_deferred = false;
        self.info.meta_data.remove(meta::SIZE_DEFERRED);
        self.persist()
    }

    /// Append the staged bytes of finished partial uploads to this one.
    pub fn concat_uploads(&mut self, partials: &[UploadSession]) -> Result<()> {
        let mut out = fs::OpenOptions::new().append(true).open(self.bin_path())?;
        for p in partials {
            let mut src = fs::File::open(p.bin_path())?;
            let copied = std::io::copy(&mut src, &mut out)?;
            self.info.offset += copied;
            self.info.partial_uploads.push(p.id().to_string());
        }
        out.sync_data()?;
        self.info.is_final = true;
        self.persist()
    }

    /// Remove everything the session created. Safe at any state, also concurrently.
    ///
    /// A session that already committed its node and is waiting for postprocessing takes
    /// back the size it added to the tree.
    pub fn terminate(&self) -> Result<()> {
        match self.node() {
            Ok(n) if n.exists => {
                if n.processing_id()?.as_deref() == Some(self.id()) {
                    metrics::processing_failed();
                    self.store.tree().propagate(&n, -self.size_diff())?;
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match self.cleanup(true, true, true) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// All bytes are in: verify, commit the node and hand over to postprocessing.
    pub fn finish_upload(&mut self) -> Result<Node> {
        let sums = Checksums::compute_file(&self.bin_path())?;
        let declared = self.metadata(meta::CHECKSUM).to_string();
        if !declared.is_empty() {
            let check = DeclaredChecksum::parse(&declared).and_then(|d| sums.verify(&d));
            if let Err(e) = check {
                if let Err(ce) = self.cleanup(false, true, true) {
                    error!(target: "spacefs::upload", "cleanup after checksum failure of {} failed: {}", self.id(), ce);
                }
                return Err(e);
            }
        }

        let mut attrs = Attributes::new();
        sums.to_attributes(&mut attrs);
        let n = self.create_node_for_upload(&attrs)?;

        metrics::upload_received();
        metrics::add_bytes(self.info.size);

        if self.info.size > 0 {
            if let Some(publisher) = self.store.publisher() {
                let ev = Event::BytesReceived {
                    upload_id: self.id().to_string(),
                    space_owner: self.space_owner(),
                    executing_user: Some(self.executant()),
                    resource: self.reference(),
                    filename: self.filename().to_string(),
                    filesize: self.info.size,
                    url: self.url(),
                    timestamp: Utc::now(),
                };
                publish_with_retry(publisher, &ev, self.store.lookup().options().publish_retries)?;
            }
        }

        let opts = self.store.lookup().options();
        if !opts.async_postprocessing || self.info.size == 0 {
            if let Err(e) = self.finalize() {
                error!(target: "spacefs::upload", "finalizing {} failed: {}", self.id(), e);
                if let Err(ce) = self.cleanup(true, false, false) {
                    error!(target: "spacefs::upload", "reverting {} failed: {}", self.id(), ce);
                }
                return Err(e);
            }
            n.unmark_processing(self.id())?;
            metrics::upload_finalized();
            self.cleanup(false, true, true)?;
        }

        self.store.tree().propagate(&n, self.size_diff())?;
        info!(target: "spacefs::upload", "upload {} committed to {} ({} bytes)", self.id(), n.id, self.info.size);
        Ok(n)
    }

    /// Move the staged bytes into the blob store as the node's new content.
    pub(super) fn finalize(&self) -> Result<()> {
        let blob_holder = Node::new(
            self.store.lookup(),
            self.space_id(),
            self.node_id(),
            self.node_parent_id(),
            self.filename(),
            self.info.size,
            self.id(),
            NodeType::File,
            None,
        );
        self.store.tree().write_blob(&blob_holder, &self.bin_path())
    }

    /// Bridge between the session and the tree: create or version the target node and
    /// write its new content attributes, all under the node lock.
    pub fn create_node_for_upload(&mut self, init_attrs: &Attributes) -> Result<Node> {
        let lu = self.store.lookup().clone();
        let ctx = self.context();
        let space_root = lu.node_from_space_id(self.space_id())?;
        space_root.check_lock(&ctx)?;

        let mut n = Node::new(
            &lu,
            self.space_id(),
            self.node_id(),
            self.node_parent_id(),
            self.filename(),
            self.info.size,
            self.id(),
            NodeType::File,
            space_root.owner().cloned(),
        );
        let current = self.node()?;

        let (guard, size_diff) = if !current.exists {
            let guard = self.store.tree().init_new_node(&n, self.info.size)?;
            (guard, self.info.size as i64)
        } else {
            self.update_existing_node(&current, &space_root)?
        };

        let mut attrs = n.node_metadata();
        attrs.extend(init_attrs);
        let mtime = match self.mtime() {
            Some(t) => t,
            None => Utc::now(),
        };
        attrs.set_string(prefixes::MTIME, &times::format_rfc3339_nano(&mtime));
        attrs.set_string(prefixes::STATUS, &format!("{}{}", prefixes::PROCESSING_STATUS, self.id()));
        let written = n.set_xattrs(&attrs, false);
        drop(guard);
        written?;
        n.exists = true;

        self.set_metadata(meta::SIZE_DIFF, &size_diff.to_string());
        self.persist()?;
        debug!(target: "spacefs::upload", "node {} now points at upload {}", n.id, self.id());
        Ok(n)
    }

    fn update_existing_node(&mut self, current: &Node, space_root: &Node) -> Result<(crate::metadata::AttrLock, i64)> {
        current.check_lock(&self.context())?;
        let guard = current.lock()?;
        let old = self.node()?;
        if !old.exists {
            return Err(Error::aborted(format!("node {} disappeared during upload {}", current.id, self.id())));
        }
        if old.is_dir() {
            return Err(Error::invalid(format!("{} is a container", old.id)));
        }
        let old_mtime = old.mtime()?;
        let old_etag = calculate_etag(&old.id, &old_mtime);
        check_preconditions(
            &old_etag,
            &old_mtime,
            self.header_if_match(),
            self.header_if_none_match(),
            self.header_if_unmodified_since(),
        )?;
        self.store.tree().quota_checker().check_quota(space_root, true, old.blob_size, self.info.size)?;

        if !self.store.lookup().options().disable_versioning {
            let rev = self.store.tree().create_revision(&old, &old_mtime)?;
            self.set_metadata(meta::VERSIONS_PATH, &rev.to_string_lossy());
        }
        Ok((guard, self.info.size as i64 - old.blob_size as i64))
    }
}

/// Conditional headers, evaluated as if-match, if-none-match, if-unmodified-since.
/// The first failing one decides.
fn check_preconditions(
    etag: &str,
    mtime: &chrono::DateTime<Utc>,
    if_match: &str,
    if_none_match: &str,
    if_unmodified_since: &str,
) -> Result<()> {
    let bare = etag.trim_matches('"');
    if !if_match.is_empty() && if_match.trim().trim_matches('"') != bare {
        return Err(Error::aborted(format!("etag mismatch: {} != {}", if_match, etag)));
    }
    if !if_none_match.is_empty() {
        for tag in if_none_match.split(',') {
            let tag = tag.trim();
            if tag == "*" || tag.trim_matches('"') == bare {
                return Err(Error::aborted(format!("etag {} matches if-none-match {}", etag, if_none_match)));
            }
        }
    }
    if !if_unmodified_since.is_empty() {
        let since = chrono::DateTime::parse_from_rfc3339(if_unmodified_since.trim())
            .map_err(|e| Error::invalid(format!("malformed if-unmodified-since '{}': {}", if_unmodified_since, e)))?
            .with_timezone(&Utc);
        if *mtime > since {
            warn!(target: "spacefs::upload", "node modified at {} after {}", mtime, since);
            return Err(Error::aborted(format!("resource modified since {}", if_unmodified_since)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn preconditions_in_order() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let etag = "\"abc\"";
        assert!(check_preconditions(etag, &t, "", "", "").is_ok());
        assert!(check_preconditions(etag, &t, "\"abc\"", "", "").is_ok());
        assert!(check_preconditions(etag, &t, "abc", "\"zzz\"", "2024-05-01T12:00:00Z").is_ok());
        assert_eq!(check_preconditions(etag, &t, "\"other\"", "", "").unwrap_err().code_str(), "aborted");
        assert_eq!(check_preconditions(etag, &t, "", "*", "").unwrap_err().code_str(), "aborted");
        assert_eq!(check_preconditions(etag, &t, "", "\"x\", \"abc\"", "").unwrap_err().code_str(), "aborted");
        assert_eq!(check_preconditions(etag, &t, "", "", "2024-05-01T11:59:59Z").unwrap_err().code_str(), "aborted");
        // if-match fails before the malformed date is looked at
        assert_eq!(check_preconditions(etag, &t, "nope", "", "yesterday").unwrap_err().code_str(), "aborted");
        assert_eq!(check_preconditions(etag, &t, "", "", "yesterday").unwrap_err().code_str(), "invalid_argument");
    }
}
