//! Upload lifecycle events handed to an external postprocessing pipeline.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::identity::UserId;
use crate::lookup::Reference;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// All bytes of an upload arrived; postprocessing may start.
    BytesReceived {
        upload_id: String,
        space_owner: Option<UserId>,
        executing_user: Option<UserId>,
        resource: Reference,
        filename: String,
        filesize: u64,
        url: String,
        timestamp: DateTime<Utc>,
    },
    /// Postprocessing finished and the upload was finalized or discarded.
    UploadReady {
        upload_id: String,
        space_owner: Option<UserId>,
        executing_user: Option<UserId>,
        resource: Reference,
        filename: String,
        failed: bool,
        /// The upload replaced earlier content that was kept as a revision.
        is_version: bool,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn upload_id(&self) -> &str {
        match self {
            Event::BytesReceived { upload_id, .. } | Event::UploadReady { upload_id, .. } => upload_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::BytesReceived { .. } => "bytes_received",
            Event::UploadReady { .. } => "upload_ready",
        }
    }
}

pub trait Publisher: Send + Sync {
    fn publish(&self, event: &Event) -> Result<()>;
}

/// Writes events to the log only.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, event: &Event) -> Result<()> {
        info!(target: "spacefs::events", "{} {}", event.kind(), serde_json::to_string(event)?);
        Ok(())
    }
}

/// Keeps published events in memory. Can be told to fail a number of times.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<Event>>,
    failures: Mutex<u32>,
}

impl MemoryPublisher {
    pub fn new() -> Self { Self::default() }

    pub fn fail_next(&self, times: u32) {
        *self.failures.lock() = times;
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, event: &Event) -> Result<()> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(Error::internal("publisher unavailable"));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Publish with up to `attempts` tries; the last error is returned.
pub fn publish_with_retry(publisher: &dyn Publisher, event: &Event, attempts: u32) -> Result<()> {
    let attempts = attempts.max(1);
    let mut last = None;
    for i in 1..=attempts {
        match publisher.publish(event) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(target: "spacefs::events", "publishing {} for {} failed (attempt {}/{}): {}", event.kind(), event.upload_id(), i, attempts, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::internal("publish failed")))
}
