//! Pipeline coordinator: wiring, startup recovery and shutdown.
//!
//! Owns the shared configuration and the segment store, and runs every
//! component as a task on one runtime: a supervisor per camera, the
//! stability watcher, the upload worker pool, the retention sweeper and
//! the status API. Control flow (process supervision) and data flow
//! (segment hand-off) never block each other; they only meet in the store.

use crate::capture::{parse_segment_timestamp, CaptureBackend, FfmpegBackend};
use crate::config::Config;
use crate::retention::RetentionSweeper;
use crate::segment::{Segment, SegmentState, SegmentStore};
use crate::stability::StabilityWatcher;
use crate::status::{start_api_server, AppState};
use crate::supervisor::{CameraSupervisor, SupervisorRegistry};
use crate::uploader::{ObjectStorage, S3Storage, UploadWorkerPool};
use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run the pipeline against real S3 and real capture processes until the
/// cancellation token fires.
pub async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let storage = S3Storage::new(&config.s3, config.upload_timeout()).await;
    storage
        .verify_bucket()
        .await
        .map_err(|e| anyhow::anyhow!("S3 bucket {:?} is not usable: {e}", config.s3.bucket))?;

    let backend = Arc::new(FfmpegBackend::new(config.recording.clone()));
    run_with(config, Arc::new(storage), backend, cancel).await
}

/// Run the pipeline with injected storage and capture backends. This is
/// the full wiring minus the two external dependencies, which keeps it
/// drivable by tests.
pub async fn run_with(
    config: Config,
    storage: Arc<dyn ObjectStorage>,
    backend: Arc<dyn CaptureBackend>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    config.validate()?;

    tokio::fs::create_dir_all(&config.recording.recordings_dir)
        .await
        .context("Could not create recordings directory")?;
    tokio::fs::create_dir_all(&config.recording.uploaded_dir)
        .await
        .context("Could not create uploaded directory")?;

    let store = Arc::new(SegmentStore::new());
    let registry = Arc::new(SupervisorRegistry::new());
    for camera in &config.cameras {
        registry.register(camera);
    }

    let (upload_tx, upload_rx) = mpsc::channel(config.upload.queue_size);

    // Files already under uploaded/ are durable but still bounded by
    // retention; files left under recordings/ (including any interrupted
    // mid-upload last run) are picked up by the watcher's first scan and
    // flow through the normal stabilize-then-upload path again.
    let recovered = recover_uploaded(&config, &store).await?;
    if recovered > 0 {
        info!(
            recovered,
            "Re-registered uploaded segments awaiting retention"
        );
    }

    let mut supervisor_handles = Vec::new();
    for camera in config.cameras.clone() {
        let supervisor = CameraSupervisor::new(
            camera,
            backend.clone(),
            registry.clone(),
            config.recording.clone(),
        );
        supervisor_handles.push(tokio::spawn(supervisor.run(cancel.clone())));
    }

    let watcher = StabilityWatcher::new(
        store.clone(),
        upload_tx.clone(),
        config.recording.recordings_dir.clone(),
        config.stability.clone(),
    );
    let watcher_handle = tokio::spawn(watcher.run(cancel.clone()));

    let pool = Arc::new(UploadWorkerPool::new(
        store.clone(),
        storage,
        config.upload.clone(),
        config.recording.uploaded_dir.clone(),
    ));
    let worker_handles = pool.spawn(upload_rx, cancel.clone());

    let sweeper = RetentionSweeper::new(store.clone(), config.retention.clone());
    let sweeper_handle = tokio::spawn(sweeper.run(cancel.clone()));

    let api_state = AppState {
        store: store.clone(),
        registry: registry.clone(),
        upload_tx,
    };
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_cancel).await {
            error!(error = %e, "Status API server error");
        }
    });

    info!(
        cameras = config.cameras.len(),
        upload_workers = config.upload.worker_count,
        recordings_dir = %config.recording.recordings_dir.display(),
        bucket = %config.s3.bucket,
        "Pipeline started"
    );

    cancel.cancelled().await;
    info!("Shutdown signal received, stopping pipeline");

    // Writers first, so no new segment appears mid-shutdown. Supervisors
    // send the graceful quit and force-kill after the grace period.
    let supervisor_deadline = config.recording.stop_grace_period() + Duration::from_secs(5);
    if tokio::time::timeout(supervisor_deadline, join_all(supervisor_handles))
        .await
        .is_err()
    {
        warn!("Some capture supervisors did not stop in time");
    }

    // In-flight uploads get the shutdown grace; whatever is still
    // Uploading or Completed afterwards is retried at next startup.
    if tokio::time::timeout(config.shutdown_grace_period(), join_all(worker_handles))
        .await
        .is_err()
    {
        warn!("Abandoning in-flight uploads; they will be retried at next startup");
    }

    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        join_all([watcher_handle, sweeper_handle, api_handle]),
    )
    .await;

    info!("Pipeline stopped");
    Ok(())
}

/// Register segments already moved to `uploaded/` by a previous run, so
/// the retention sweeper keeps bounding their disk usage.
async fn recover_uploaded(config: &Config, store: &SegmentStore) -> anyhow::Result<usize> {
    let now = Utc::now();
    let mut recovered = 0;

    let mut cameras = match tokio::fs::read_dir(&config.recording.uploaded_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).context("Could not scan uploaded directory"),
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
            let created_at = file_name_timestamp(&path, &camera_id).unwrap_or(now);
            let mut segment = Segment::new(&camera_id, &path, created_at, metadata.len(), now);
            segment.state = SegmentState::Uploaded;
            store.register(segment);
            recovered += 1;
        }
    }

    Ok(recovered)
}

fn file_name_timestamp(path: &Path, camera_id: &str) -> Option<chrono::DateTime<Utc>> {
    let file_name = path.file_name()?.to_string_lossy();
    parse_segment_timestamp(&file_name, camera_id)
}
