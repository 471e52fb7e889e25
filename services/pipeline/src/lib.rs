//! Camvault Recording & Cloud-Offload Pipeline
//!
//! Continuous, unattended capture of multiple live camera sources, durable
//! hand-off of completed recordings to S3-compatible object storage, and
//! bounded local disk usage. Designed to run 24/7 without a human watching:
//! capture processes are supervised (crashes and zombies both recovered),
//! every segment moves through an explicit state machine, uploads are
//! verified by size before anything is considered durable, and local files
//! are only deleted once their data is safely offsite.
//!
//! ## Architecture
//!
//! ```text
//!  Cameras                 Local disk                      S3 Bucket
//! ┌──────────┐   ffmpeg   ┌─────────────────┐             ┌──────────────┐
//! │ rtsp://  │───────────▶│ recordings/     │             │ {y}/{m}/{d}/ │
//! └──────────┘  segments  │   {camera_id}/  │             │  {camera_id}/│
//!      ▲                  └─────────────────┘             └──────────────┘
//!      │                           │                             ▲
//! ┌──────────────┐                 ▼                             │ verified
//! │ Process      │         ┌──────────────┐   completed   ┌──────────────┐
//! │ Supervisor   │         │ Stability    │──────────────▶│ Upload       │
//! │ (per camera) │         │ Watcher      │    queue      │ Worker Pool  │
//! └──────────────┘         └──────────────┘               └──────────────┘
//!      ▲                                                        │
//!      │ status + commands                                      ▼
//! ┌──────────────┐         ┌──────────────┐   aged-out   ┌──────────────┐
//! │ Status API   │         │ Retention    │◀─────────────│ uploaded/    │
//! │ (dashboard)  │         │ Sweeper      │   deletion   │  {camera_id}/│
//! └──────────────┘         └──────────────┘              └──────────────┘
//! ```
//!
//! ## Segment lifecycle
//!
//! `RECORDING -> STABILIZING -> COMPLETED -> UPLOADING -> UPLOADED ->
//! DELETED`, with `UPLOADING -> COMPLETED` as the bounded retry loop and
//! `FAILED` reachable from `STABILIZING` (truncated file) or `UPLOADING`
//! (exhausted attempts). Every transition is an atomic compare-and-set in
//! the shared [`segment::SegmentStore`].

pub mod capture;
pub mod config;
pub mod pipeline;
pub mod retention;
pub mod segment;
pub mod stability;
pub mod status;
pub mod supervisor;
pub mod uploader;

pub use capture::{CaptureBackend, CaptureError, CaptureProcess, FfmpegBackend};
pub use self::config::{CameraSource, Config};
pub use retention::RetentionSweeper;
pub use segment::{Segment, SegmentState, SegmentStore, StoreStats, TransitionError};
pub use stability::StabilityWatcher;
pub use supervisor::{CameraState, CameraSupervisor, SupervisorRegistry, WriterStatus};
pub use uploader::{ObjectStorage, S3Storage, UploadError, UploadWorkerPool};
