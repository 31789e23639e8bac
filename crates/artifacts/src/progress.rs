//! Progress reporting and cancellation for downloads.
//!
//! The sink and the cancel token are deliberately separate: a sink only
//! observes, cancellation is an explicit signal. The HTTP layer wires
//! "client disconnected" to [`CancelToken::cancel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// A cancellation token checked between download chunks.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// One progress notification.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// A file transfer is about to begin.
    FileStarted {
        file: String,
        file_index: usize,
        total_files: usize,
    },
    /// Bytes landed for the current file.
    Progress {
        file: String,
        file_index: usize,
        total_files: usize,
        bytes_downloaded: u64,
        bytes_total: u64,
        percent: f64,
    },
    /// Every file is on disk and validated.
    Completed,
}

/// Observer for download progress. Implementations must be cheap: events
/// fire from inside the transfer loop.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: DownloadEvent);
}

/// Sink that drops everything (CLI-less pulls, tests).
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: DownloadEvent) {}
}

/// Sink that collects events, for tests.
#[derive(Default)]
pub struct CollectSink(pub parking_lot::Mutex<Vec<DownloadEvent>>);

impl ProgressSink for CollectSink {
    fn emit(&self, event: DownloadEvent) {
        self.0.lock().push(event);
    }
}
