//! Local disk retention.
//!
//! Disk is only reclaimed here, never by the uploader: a segment's file is
//! deleted iff the segment reached `Uploaded` and its retention window has
//! passed, or it is `Failed` and older than the (much longer) grace window
//! kept for operator inspection. `sweep_at` takes the clock as an argument
//! so tests drive time directly.

use crate::config::RetentionConfig;
use crate::segment::{SegmentState, SegmentStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Periodically deletes local files whose data is safely offsite.
pub struct RetentionSweeper {
    store: Arc<SegmentStore>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: Arc<SegmentStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    /// Run sweeps until shutdown.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            self.sweep().await;
        }
    }

    /// One sweep at the current time.
    pub async fn sweep(&self) {
        self.sweep_at(Utc::now()).await;
    }

    /// One sweep, with the clock supplied by the caller.
    pub async fn sweep_at(&self, now: DateTime<Utc>) {
        self.reclaim_uploaded(now).await;
        self.purge_aged_failures(now).await;
    }

    /// Delete uploaded segments past the retention window.
    async fn reclaim_uploaded(&self, now: DateTime<Utc>) {
        let retention = chrono::Duration::hours(self.config.local_retention_hours as i64);
        let mut deleted = 0u64;
        let mut freed_bytes = 0u64;

        for segment in self.store.in_state(SegmentState::Uploaded) {
            if now - segment.created_at <= retention {
                continue;
            }

            match tokio::fs::remove_file(&segment.file_path).await {
                Ok(()) => {}
                // Already reclaimed out-of-band; the record still retires.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(
                        path = %segment.file_path.display(),
                        error = %e,
                        "Could not delete uploaded segment, will retry next sweep"
                    );
                    continue;
                }
            }

            if self
                .store
                .transition(segment.id, SegmentState::Uploaded, SegmentState::Deleted)
                .is_ok()
            {
                deleted += 1;
                freed_bytes += segment.last_size_observed;
                self.store.remove(segment.id);
            }
        }

        if deleted > 0 {
            info!(
                deleted,
                freed_bytes,
                retention_hours = self.config.local_retention_hours,
                "Reclaimed local disk from uploaded segments"
            );
            metrics::counter!("pipeline.retention.deleted").increment(deleted);
            metrics::counter!("pipeline.retention.freed_bytes").increment(freed_bytes);
        }
    }

    /// Second pass: failed segments are kept for inspection, but not
    /// forever.
    async fn purge_aged_failures(&self, now: DateTime<Utc>) {
        let grace = chrono::Duration::hours(self.config.failed_retention_hours as i64);

        for segment in self.store.in_state(SegmentState::Failed) {
            if now - segment.created_at <= grace {
                continue;
            }

            // Best effort: the file may already be gone.
            let _ = tokio::fs::remove_file(&segment.file_path).await;
            warn!(
                camera_id = %segment.camera_id,
                path = %segment.file_path.display(),
                error = ?segment.last_error,
                "Purging failed segment after grace window"
            );
            self.store.remove(segment.id);
            metrics::counter!("pipeline.retention.failed_purged").increment(1);
        }
    }
}
