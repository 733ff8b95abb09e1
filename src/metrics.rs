use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static UPLOADS_ACTIVE: AtomicI64 = AtomicI64::new(0);
static UPLOADS_PROCESSING: AtomicI64 = AtomicI64::new(0);
static UPLOADS_FINISHED: AtomicU64 = AtomicU64::new(0);
static UPLOADS_ABORTED: AtomicU64 = AtomicU64::new(0);
static UPLOADS_DELETED: AtomicU64 = AtomicU64::new(0);
static BYTES_RECEIVED: AtomicU64 = AtomicU64::new(0);

pub fn upload_started() { UPLOADS_ACTIVE.fetch_add(1, Ordering::Relaxed); }
pub fn add_bytes(n: u64) { BYTES_RECEIVED.fetch_add(n, Ordering::Relaxed); }

/// Bytes are in; the session moves from active to processing.
pub fn upload_received() {
    UPLOADS_ACTIVE.fetch_sub(1, Ordering::Relaxed);
    UPLOADS_PROCESSING.fetch_add(1, Ordering::Relaxed);
}

pub fn upload_finalized() {
    UPLOADS_PROCESSING.fetch_sub(1, Ordering::Relaxed);
    UPLOADS_FINISHED.fetch_add(1, Ordering::Relaxed);
}

pub fn upload_aborted() { UPLOADS_ABORTED.fetch_add(1, Ordering::Relaxed); }
pub fn upload_deleted() { UPLOADS_DELETED.fetch_add(1, Ordering::Relaxed); }

/// Postprocessing ended without finalizing the upload.
pub fn processing_failed() { UPLOADS_PROCESSING.fetch_sub(1, Ordering::Relaxed); }

#[derive(Clone, Copy, Debug)]
pub struct Snapshot {
    pub uploads_active: i64,
    pub uploads_processing: i64,
    pub uploads_finished: u64,
    pub uploads_aborted: u64,
    pub uploads_deleted: u64,
    pub bytes_received: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        uploads_active: UPLOADS_ACTIVE.load(Ordering::Relaxed),
        uploads_processing: UPLOADS_PROCESSING.load(Ordering::Relaxed),
        uploads_finished: UPLOADS_FINISHED.load(Ordering::Relaxed),
        uploads_aborted: UPLOADS_ABORTED.load(Ordering::Relaxed),
        uploads_deleted: UPLOADS_DELETED.load(Ordering::Relaxed),
        bytes_received: BYTES_RECEIVED.load(Ordering::Relaxed),
    }
}
