use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::UploadStore;
use crate::error::Result;
use crate::events::{publish_with_retry, Event};
use crate::metrics;

/// Verdict of the external postprocessing pipeline on one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostprocessingOutcome {
    /// Keep the bytes: move them into the blob store and release the node.
    Continue,
    /// Put the node back, keep the staged bytes for a retry.
    Abort,
    /// Put the node back and drop the upload.
    Delete,
}

impl UploadStore {
    pub fn postprocessing_finished(&self, id: &str, outcome: PostprocessingOutcome) -> Result<()> {
        let session = self.get(id)?;
        let n = session.node()?;

        let (failed, keep_upload) = match outcome {
            PostprocessingOutcome::Continue => match session.finalize() {
                Ok(()) => (false, false),
                Err(e) => {
                    error!(target: "spacefs::upload", "finalizing {} after postprocessing failed: {}", id, e);
                    metrics::upload_aborted();
                    (true, true)
                }
            },
            PostprocessingOutcome::Abort => {
                metrics::upload_aborted();
                (true, true)
            }
            PostprocessingOutcome::Delete => {
                metrics::upload_deleted();
                (true, false)
            }
        };
        let is_version = session.node_exists() && !session.versions_path().is_empty();

        if failed {
            metrics::processing_failed();
            if n.exists && n.processing_id()?.as_deref() == Some(id) {
                self.tree().propagate(&n, -session.size_diff())?;
            }
        } else {
            metrics::upload_finalized();
            if n.exists {
                n.unmark_processing(id)?;
                match n.parent() {
                    Ok(p) if p.exists => {
                        p.set_tmtime(Some(&Utc::now()))?;
                        self.tree().propagate(&p, 0)?;
                    }
                    Ok(_) => warn!(target: "spacefs::upload", "parent of {} is gone", n.id),
                    Err(e) => warn!(target: "spacefs::upload", "parent of {} unreadable: {}", n.id, e),
                }
            }
        }

        if let Err(e) = session.cleanup(failed, !keep_upload, !keep_upload) {
            error!(target: "spacefs::upload", "cleanup of {} after postprocessing failed: {}", id, e);
        }

        if let Some(publisher) = self.publisher() {
            let ev = Event::UploadReady {
                upload_id: id.to_string(),
                space_owner: session.space_owner(),
                executing_user: Some(session.executant()),
                resource: session.reference(),
                filename: session.filename().to_string(),
                failed,
                is_version,
                timestamp: Utc::now(),
            };
            if let Err(e) = publish_with_retry(publisher, &ev, self.lookup().options().publish_retries) {
                error!(target: "spacefs::upload", "could not announce {} as ready: {}", id, e);
            }
        }
        info!(target: "spacefs::upload", "postprocessing of {} finished: {:?}", id, outcome);
        Ok(())
    }

    /// Record a virus-scan verdict on the session and on the node it writes.
    pub fn set_scan_result(&self, id: &str, result: &str, date: &DateTime<Utc>) -> Result<()> {
        let mut session = self.get(id)?;
        session.set_scan_data(result, date);
        session.persist()?;
        let n = session.node()?;
        if n.exists {
            n.set_scan_data(result, date)?;
        }
        Ok(())
    }
}
