//! Per-camera capture process supervision.
//!
//! Each enabled camera gets one long-lived supervisor task that starts its
//! capture process, health-checks it on a fixed interval, and restarts it
//! with exponential backoff when it crashes or goes zombie. A camera whose
//! process keeps dying is disabled once the consecutive-restart cap is hit,
//! instead of being restarted forever against an unreachable source.
//!
//! Crash: the process has exited. Zombie: the process is alive but has
//! produced no new segment file for longer than twice the segment duration
//! (an RTSP-over-TCP reader can block indefinitely on a stalled socket
//! without exiting). Both trigger the same recovery; the distinction only
//! shows up in logs and metrics.

use crate::capture::{CaptureBackend, CaptureProcess};
use crate::config::{CameraSource, RecordingConfig};
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runtime state of a camera, as exposed on the status feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraState {
    /// Capture process is live
    Recording,
    /// Between process death and the next launch attempt
    Restarting,
    /// Not supervised: configured off, operator-disabled, or cap reached
    Disabled,
}

/// Supervisor-side view of one camera's writer process. Owned exclusively
/// by the supervisor; other components read snapshots via the registry.
#[derive(Debug, Clone, Serialize)]
pub struct WriterStatus {
    pub camera_id: String,
    pub display_name: String,
    pub state: CameraState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_segment_at: Option<DateTime<Utc>>,
    pub consecutive_restarts: u32,
}

struct CameraEntry {
    status: WriterStatus,
    desired_enabled: bool,
}

/// Shared registry of camera runtime state. The supervisor tasks write it;
/// the status API reads it; the enable/disable commands flip the desired
/// flag that each supervisor polls.
#[derive(Default)]
pub struct SupervisorRegistry {
    cameras: RwLock<HashMap<String, CameraEntry>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a camera before its supervisor task starts.
    pub fn register(&self, camera: &CameraSource) {
        let status = WriterStatus {
            camera_id: camera.id.clone(),
            display_name: camera.display_name.clone(),
            state: if camera.enabled {
                CameraState::Restarting
            } else {
                CameraState::Disabled
            },
            pid: None,
            started_at: None,
            last_segment_at: None,
            consecutive_restarts: 0,
        };
        self.cameras.write().insert(
            camera.id.clone(),
            CameraEntry {
                status,
                desired_enabled: camera.enabled,
            },
        );
    }

    /// Snapshot of every camera, ordered by id for stable output.
    pub fn snapshot(&self) -> Vec<WriterStatus> {
        let mut statuses: Vec<WriterStatus> = self
            .cameras
            .read()
            .values()
            .map(|e| e.status.clone())
            .collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    /// Fetch one camera's status.
    pub fn status(&self, camera_id: &str) -> Option<WriterStatus> {
        self.cameras.read().get(camera_id).map(|e| e.status.clone())
    }

    /// Flip a camera's desired state. Enabling also resets the restart
    /// budget so a previously capped camera gets a fresh run. Returns false
    /// for unknown cameras.
    pub fn set_enabled(&self, camera_id: &str, enabled: bool) -> bool {
        let mut cameras = self.cameras.write();
        match cameras.get_mut(camera_id) {
            Some(entry) => {
                entry.desired_enabled = enabled;
                if enabled {
                    entry.status.consecutive_restarts = 0;
                }
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, camera_id: &str) -> bool {
        self.cameras
            .read()
            .get(camera_id)
            .map(|e| e.desired_enabled)
            .unwrap_or(false)
    }

    fn update(&self, camera_id: &str, f: impl FnOnce(&mut WriterStatus)) {
        if let Some(entry) = self.cameras.write().get_mut(camera_id) {
            f(&mut entry.status);
        }
    }
}

/// Why the health loop handed control back to the supervisor loop.
enum WatchOutcome {
    Crashed,
    Zombie,
    DisabledByOperator,
    Cancelled,
}

/// Supervises one camera's capture process for the life of the pipeline.
pub struct CameraSupervisor {
    camera: CameraSource,
    backend: Arc<dyn CaptureBackend>,
    registry: Arc<SupervisorRegistry>,
    config: RecordingConfig,
}

impl CameraSupervisor {
    pub fn new(
        camera: CameraSource,
        backend: Arc<dyn CaptureBackend>,
        registry: Arc<SupervisorRegistry>,
        config: RecordingConfig,
    ) -> Self {
        Self {
            camera,
            backend,
            registry,
            config,
        }
    }

    /// Run until the pipeline shuts down.
    pub async fn run(self, cancel: CancellationToken) {
        let camera_id = self.camera.id.clone();
        let mut restart_backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(self.config.restart_backoff_base_seconds),
            max_interval: Duration::from_secs(self.config.restart_backoff_max_seconds),
            max_elapsed_time: None,
            ..Default::default()
        };
        // Idle poll while disabled; never zero so the loop cannot spin hot.
        let idle_interval = self.config.monitor_interval().max(Duration::from_millis(250));

        loop {
            if cancel.is_cancelled() {
                return;
            }

            if !self.registry.is_enabled(&camera_id) {
                self.registry.update(&camera_id, |s| {
                    s.state = CameraState::Disabled;
                    s.pid = None;
                });
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(idle_interval) => continue,
                }
            }

            let mut process = match self.backend.start(&self.camera).await {
                Ok(process) => process,
                Err(e) => {
                    warn!(
                        camera_id = %camera_id,
                        error = %e,
                        "Failed to start capture process"
                    );
                    metrics::counter!("pipeline.writer.start_failures").increment(1);
                    self.restart_or_disable(&mut restart_backoff, &cancel).await;
                    continue;
                }
            };

            let started_at = Utc::now();
            self.registry.update(&camera_id, |s| {
                s.state = CameraState::Recording;
                s.pid = process.pid();
                s.started_at = Some(started_at);
            });
            info!(
                camera_id = %camera_id,
                camera = %self.camera.display_name,
                pid = ?process.pid(),
                "Capture process started"
            );

            match self
                .watch(process.as_mut(), started_at, &mut restart_backoff, &cancel)
                .await
            {
                WatchOutcome::Cancelled => {
                    process.terminate(self.config.stop_grace_period()).await;
                    return;
                }
                WatchOutcome::DisabledByOperator => {
                    info!(camera_id = %camera_id, "Camera disabled, stopping its writer");
                    process.terminate(self.config.stop_grace_period()).await;
                    continue;
                }
                WatchOutcome::Crashed => {
                    warn!(camera_id = %camera_id, "Capture process crashed");
                    metrics::counter!("pipeline.writer.crashes").increment(1);
                    self.restart_or_disable(&mut restart_backoff, &cancel).await;
                }
                WatchOutcome::Zombie => {
                    warn!(
                        camera_id = %camera_id,
                        "Capture process is a zombie (alive but producing nothing)"
                    );
                    metrics::counter!("pipeline.writer.zombies").increment(1);
                    process.terminate(self.config.stop_grace_period()).await;
                    self.restart_or_disable(&mut restart_backoff, &cancel).await;
                }
            }
        }
    }

    /// Health-check loop for one live process.
    async fn watch(
        &self,
        process: &mut dyn CaptureProcess,
        started_at: DateTime<Utc>,
        restart_backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> WatchOutcome {
        let camera_id = &self.camera.id;
        let zombie_threshold = self.config.zombie_threshold();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                _ = sleep(self.config.monitor_interval()) => {}
            }

            if !self.registry.is_enabled(camera_id) {
                return WatchOutcome::DisabledByOperator;
            }

            if !process.is_alive() {
                return WatchOutcome::Crashed;
            }

            let activity = process.last_output_activity().await;
            self.registry
                .update(camera_id, |s| s.last_segment_at = activity);

            // A segment produced since this launch proves the writer is
            // healthy again; forget the failure streak.
            if activity.map_or(false, |at| at > started_at) {
                self.registry.update(camera_id, |s| {
                    s.consecutive_restarts = 0;
                });
                restart_backoff.reset();
            }

            let reference = activity.filter(|at| *at > started_at).unwrap_or(started_at);
            let silent_for = (Utc::now() - reference)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if silent_for > zombie_threshold {
                return WatchOutcome::Zombie;
            }
        }
    }

    /// Account for one failure: either sleep out the backoff before the
    /// next launch, or hit the cap and disable the camera.
    async fn restart_or_disable(
        &self,
        restart_backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) {
        let camera_id = &self.camera.id;
        let restarts = self
            .registry
            .status(camera_id)
            .map(|s| s.consecutive_restarts)
            .unwrap_or(0);

        if restarts >= self.config.restart_cap {
            error!(
                camera_id = %camera_id,
                camera = %self.camera.display_name,
                consecutive_restarts = restarts,
                "Restart cap reached; disabling camera until an operator intervenes"
            );
            self.registry.set_enabled(camera_id, false);
            self.registry.update(camera_id, |s| {
                s.state = CameraState::Disabled;
                s.pid = None;
            });
            metrics::counter!("pipeline.writer.disabled").increment(1);
            return;
        }

        self.registry.update(camera_id, |s| {
            s.state = CameraState::Restarting;
            s.pid = None;
            s.consecutive_restarts += 1;
        });
        metrics::counter!("pipeline.writer.restarts").increment(1);

        let delay = restart_backoff
            .next_backoff()
            .unwrap_or(Duration::from_secs(self.config.restart_backoff_max_seconds));
        warn!(
            camera_id = %camera_id,
            restart = restarts + 1,
            delay_ms = delay.as_millis() as u64,
            "Restarting capture process"
        );

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scripted capture backend: every start yields a process with the
    /// given liveness and output-activity behavior.
    struct FakeBackend {
        starts: AtomicU32,
        alive: bool,
        activity: Option<DateTime<Utc>>,
        terminated: Arc<AtomicU32>,
    }

    impl FakeBackend {
        fn crashing() -> Self {
            Self {
                starts: AtomicU32::new(0),
                alive: false,
                activity: None,
                terminated: Arc::new(AtomicU32::new(0)),
            }
        }

        fn zombie() -> Self {
            Self {
                starts: AtomicU32::new(0),
                alive: true,
                // Old activity: nothing produced since launch.
                activity: Some(Utc::now() - chrono::Duration::hours(1)),
                terminated: Arc::new(AtomicU32::new(0)),
            }
        }

        fn starts(&self) -> u32 {
            self.starts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CaptureBackend for FakeBackend {
        async fn start(
            &self,
            _camera: &CameraSource,
        ) -> Result<Box<dyn CaptureProcess>, CaptureError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeProcess {
                alive: AtomicBool::new(self.alive),
                activity: self.activity,
                terminated: self.terminated.clone(),
            }))
        }
    }

    struct FakeProcess {
        alive: AtomicBool,
        activity: Option<DateTime<Utc>>,
        terminated: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CaptureProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn last_output_activity(&mut self) -> Option<DateTime<Utc>> {
            self.activity
        }

        async fn terminate(&mut self, _grace: Duration) {
            self.alive.store(false, Ordering::SeqCst);
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> RecordingConfig {
        RecordingConfig {
            monitor_interval_seconds: 0,
            startup_probe_seconds: 0,
            stop_grace_period_seconds: 0,
            restart_backoff_base_seconds: 0,
            restart_backoff_max_seconds: 0,
            restart_cap: 5,
            ..RecordingConfig::default()
        }
    }

    fn test_camera(enabled: bool) -> CameraSource {
        CameraSource {
            id: "cam-1".to_string(),
            display_name: "Front door".to_string(),
            source_url: "rtsp://host:554/stream".to_string(),
            enabled,
        }
    }

    async fn wait_for_state(
        registry: &SupervisorRegistry,
        camera_id: &str,
        state: CameraState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if registry.status(camera_id).map(|s| s.state) == Some(state) {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("camera never reached the expected state");
    }

    #[tokio::test]
    async fn test_crash_loop_disables_camera_at_cap() {
        let camera = test_camera(true);
        let backend = Arc::new(FakeBackend::crashing());
        let registry = Arc::new(SupervisorRegistry::new());
        registry.register(&camera);

        let supervisor = CameraSupervisor::new(
            camera.clone(),
            backend.clone(),
            registry.clone(),
            fast_config(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        wait_for_state(&registry, "cam-1", CameraState::Disabled).await;

        // Initial launch plus exactly restart_cap relaunches; never a sixth.
        assert_eq!(backend.starts(), 6);
        let status = registry.status("cam-1").unwrap();
        assert_eq!(status.consecutive_restarts, 5);
        assert!(!registry.is_enabled("cam-1"));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.starts(), 6, "no restart may happen after the cap");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_zombie_is_terminated_and_restarted() {
        let camera = test_camera(true);
        let mut config = fast_config();
        // Zero segment duration makes any silence immediately zombie-long.
        config.segment_duration_seconds = 0;
        let backend = Arc::new(FakeBackend::zombie());
        let registry = Arc::new(SupervisorRegistry::new());
        registry.register(&camera);

        let supervisor =
            CameraSupervisor::new(camera, backend.clone(), registry.clone(), config);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        wait_for_state(&registry, "cam-1", CameraState::Disabled).await;

        // Every launch was detected as a zombie and explicitly terminated.
        assert_eq!(backend.starts(), 6);
        assert_eq!(backend.terminated.load(Ordering::SeqCst), 6);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_operator_disable_stops_writer() {
        let camera = test_camera(true);
        let mut config = fast_config();
        config.segment_duration_seconds = 3600; // never zombie in this test
        let backend = Arc::new(FakeBackend::zombie()); // alive process
        let registry = Arc::new(SupervisorRegistry::new());
        registry.register(&camera);

        let supervisor =
            CameraSupervisor::new(camera, backend.clone(), registry.clone(), config);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        wait_for_state(&registry, "cam-1", CameraState::Recording).await;
        registry.set_enabled("cam-1", false);
        wait_for_state(&registry, "cam-1", CameraState::Disabled).await;
        assert_eq!(backend.terminated.load(Ordering::SeqCst), 1);

        // Re-enabling resumes supervision with a fresh restart budget.
        registry.set_enabled("cam-1", true);
        wait_for_state(&registry, "cam-1", CameraState::Recording).await;
        assert_eq!(registry.status("cam-1").unwrap().consecutive_restarts, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_camera_never_starts() {
        let camera = test_camera(false);
        let backend = Arc::new(FakeBackend::crashing());
        let registry = Arc::new(SupervisorRegistry::new());
        registry.register(&camera);

        let supervisor = CameraSupervisor::new(
            camera,
            backend.clone(),
            registry.clone(),
            fast_config(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.starts(), 0);
        assert_eq!(
            registry.status("cam-1").unwrap().state,
            CameraState::Disabled
        );

        cancel.cancel();
        handle.await.unwrap();
    }
}
