//! Stability watching: deciding when a segment file is done.
//!
//! The capture process gives no signal when it rotates to a new segment
//! file, so completion is inferred by sampling sizes: a file whose size is
//! unchanged across two checks separated by the quiet interval is no longer
//! being written. The two-sample rule avoids racing the writer's own
//! rotation boundary, where a file can sit briefly unchanged mid-write due
//! to I/O buffering.
//!
//! Every scan is idempotent, and `scan_at` takes the current time as an
//! argument so tests drive the clock instead of sleeping.

use crate::capture::parse_segment_timestamp;
use crate::config::StabilityConfig;
use crate::segment::{Segment, SegmentState, SegmentStore};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Scans the recordings tree and promotes stable files to `Completed`.
pub struct StabilityWatcher {
    store: Arc<SegmentStore>,
    upload_tx: mpsc::Sender<Uuid>,
    recordings_dir: PathBuf,
    config: StabilityConfig,
}

impl StabilityWatcher {
    pub fn new(
        store: Arc<SegmentStore>,
        upload_tx: mpsc::Sender<Uuid>,
        recordings_dir: PathBuf,
        config: StabilityConfig,
    ) -> Self {
        Self {
            store,
            upload_tx,
            recordings_dir,
            config,
        }
    }

    /// Run scan ticks until shutdown.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.scan_interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.scan().await {
                // Slow or flaky storage: skip this tick, the next one
                // re-scans from scratch.
                error!(error = %e, "Recording directory scan failed");
            }
        }
    }

    /// One scan tick at the current time.
    pub async fn scan(&self) -> std::io::Result<()> {
        self.scan_at(Utc::now()).await
    }

    /// One scan tick, with the clock supplied by the caller.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> std::io::Result<()> {
        let mut cameras = match tokio::fs::read_dir(&self.recordings_dir).await {
            Ok(entries) => entries,
            // The writer creates the tree lazily; nothing to scan yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        while let Some(camera_entry) = cameras.next_entry().await? {
            if !camera_entry.file_type().await?.is_dir() {
                continue;
            }
            let camera_id = camera_entry.file_name().to_string_lossy().into_owned();
            let mut files = tokio::fs::read_dir(camera_entry.path()).await?;
            while let Some(file_entry) = files.next_entry().await? {
                let path = file_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
                    continue;
                }
                let Ok(metadata) = file_entry.metadata().await else {
                    continue;
                };
                self.observe_file(&camera_id, &path, metadata.len(), now)
                    .await;
            }
        }

        self.drop_vanished().await;
        Ok(())
    }

    /// Account for one file seen during a scan.
    async fn observe_file(&self, camera_id: &str, path: &Path, size: u64, now: DateTime<Utc>) {
        let Some(segment) = self.store.find_by_path(path) else {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let created_at = parse_segment_timestamp(&file_name, camera_id).unwrap_or(now);
            let id = self
                .store
                .register(Segment::new(camera_id, path, created_at, size, now));
            debug!(
                camera_id = %camera_id,
                segment_id = %id,
                file = %file_name,
                size_bytes = size,
                "New segment file discovered"
            );
            metrics::counter!("pipeline.segments.discovered").increment(1);
            return;
        };

        match segment.state {
            SegmentState::Recording | SegmentState::Stabilizing => {
                self.check_stability(&segment, size, now).await;
            }
            // Already handed off; re-observing is a no-op.
            _ => {}
        }
    }

    /// The two-sample stability check for one tracked file.
    async fn check_stability(&self, segment: &Segment, size: u64, now: DateTime<Utc>) {
        let id = segment.id;

        if size != segment.last_size_observed {
            // Still growing: take a fresh reference sample.
            self.store.record_sample(id, size, now);
            if segment.state == SegmentState::Stabilizing {
                let _ = self
                    .store
                    .transition(id, SegmentState::Stabilizing, SegmentState::Recording);
            }
            return;
        }

        let quiet = chrono::Duration::seconds(self.config.quiet_interval_seconds as i64);
        let elapsed = now - segment.last_size_check_at;

        if elapsed < quiet {
            // Unchanged, but not for long enough yet.
            if segment.state == SegmentState::Recording {
                let _ = self
                    .store
                    .transition(id, SegmentState::Recording, SegmentState::Stabilizing);
            }
            return;
        }

        // Quiet interval elapsed with no growth: the writer is done with
        // this file. Pass through Stabilizing so no edge is skipped.
        if segment.state == SegmentState::Recording {
            let _ = self
                .store
                .transition(id, SegmentState::Recording, SegmentState::Stabilizing);
        }

        if size < self.config.min_viable_size_bytes {
            if self
                .store
                .transition(id, SegmentState::Stabilizing, SegmentState::Failed)
                .is_ok()
            {
                self.store.set_last_error(
                    id,
                    format!(
                        "truncated segment: {size} bytes < minimum {}",
                        self.config.min_viable_size_bytes
                    ),
                );
                warn!(
                    camera_id = %segment.camera_id,
                    segment_id = %id,
                    size_bytes = size,
                    "Segment too small after quiet interval, marking failed"
                );
                metrics::counter!("pipeline.segments.truncated").increment(1);
            }
            return;
        }

        if self
            .store
            .transition(id, SegmentState::Stabilizing, SegmentState::Completed)
            .is_ok()
        {
            info!(
                camera_id = %segment.camera_id,
                segment_id = %id,
                size_bytes = size,
                quiet_secs = elapsed.num_seconds(),
                "Segment completed, queued for upload"
            );
            metrics::counter!("pipeline.segments.completed").increment(1);
            if self.upload_tx.send(id).await.is_err() {
                warn!(segment_id = %id, "Upload queue closed; segment will be retried at next startup");
            }
        }
    }

    /// Forget segments whose files disappeared while still being tracked.
    async fn drop_vanished(&self) {
        for state in [SegmentState::Recording, SegmentState::Stabilizing] {
            for segment in self.store.in_state(state) {
                let exists = tokio::fs::try_exists(&segment.file_path)
                    .await
                    .unwrap_or(true);
                if !exists {
                    debug!(
                        camera_id = %segment.camera_id,
                        segment_id = %segment.id,
                        "Tracked file vanished, dropping record"
                    );
                    self.store.remove(segment.id);
                }
            }
        }
    }
}
