//! Segment lifecycle and the shared segment store.
//!
//! A segment is one time-bounded video file produced by a camera's capture
//! process. It moves through a strict state machine; every transition is an
//! atomic compare-and-set on `(segment, expected_state) -> new_state`, which
//! is what prevents double-upload and double-delete races between the
//! stability watcher, the upload workers and the retention sweeper.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentState {
    /// The capture process is still appending to the file
    Recording,
    /// Size unchanged on the latest scan, quiet interval not yet elapsed
    Stabilizing,
    /// Stable and viable; queued for upload
    Completed,
    /// An upload worker owns the segment
    Uploading,
    /// Remote copy verified; local file awaits retention
    Uploaded,
    /// Terminal: truncated file or exhausted upload attempts
    Failed,
    /// Terminal: local file reclaimed
    Deleted,
}

impl SegmentState {
    /// Whether `self -> next` is a legal edge of the state machine.
    ///
    /// `Uploading -> Completed` is the retry edge; `Failed -> Completed`
    /// exists only for the operator's force-retry command.
    pub fn can_transition_to(self, next: SegmentState) -> bool {
        use SegmentState::*;
        matches!(
            (self, next),
            (Recording, Stabilizing)
                | (Stabilizing, Recording)
                | (Stabilizing, Completed)
                | (Stabilizing, Failed)
                | (Completed, Uploading)
                | (Uploading, Completed)
                | (Uploading, Uploaded)
                | (Uploading, Failed)
                | (Uploaded, Deleted)
                | (Failed, Completed)
        )
    }

    /// Terminal states are never left by the pipeline itself.
    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentState::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SegmentState::Recording => "RECORDING",
            SegmentState::Stabilizing => "STABILIZING",
            SegmentState::Completed => "COMPLETED",
            SegmentState::Uploading => "UPLOADING",
            SegmentState::Uploaded => "UPLOADED",
            SegmentState::Failed => "FAILED",
            SegmentState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded time-chunk of one camera.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    /// Unique segment id
    pub id: Uuid,
    /// Camera that produced the file
    pub camera_id: String,
    /// Current location of the file on local disk
    pub file_path: PathBuf,
    /// When the segment's recording began (parsed from the file name where
    /// possible); drives the destination key and the retention window
    pub created_at: DateTime<Utc>,
    /// Size recorded by the latest stability sample
    pub last_size_observed: u64,
    /// When the current reference sample was taken
    pub last_size_check_at: DateTime<Utc>,
    /// Lifecycle state
    pub state: SegmentState,
    /// Upload attempts so far
    pub upload_attempts: u32,
    /// Most recent failure, for the status feed and logs
    pub last_error: Option<String>,
    /// Object key recorded on verified upload
    pub remote_key: Option<String>,
}

impl Segment {
    /// Create a new segment record in `Recording` state.
    pub fn new(
        camera_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        created_at: DateTime<Utc>,
        size: u64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera_id: camera_id.into(),
            file_path: file_path.into(),
            created_at,
            last_size_observed: size,
            last_size_check_at: observed_at,
            state: SegmentState::Recording,
            upload_attempts: 0,
            last_error: None,
            remote_key: None,
        }
    }

    /// File name component of the segment's path.
    pub fn file_name(&self) -> Option<String> {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Errors from segment state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("segment {id} not found")]
    NotFound { id: Uuid },
    #[error("segment {id} is {actual}, expected {expected}")]
    StateMismatch {
        id: Uuid,
        expected: SegmentState,
        actual: SegmentState,
    },
    #[error("transition {from} -> {to} is not a legal edge")]
    IllegalEdge { from: SegmentState, to: SegmentState },
}

/// Aggregate counters for the status feed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    /// Segments waiting for an upload worker
    pub pending_upload_count: usize,
    /// Segments in terminal failure, awaiting operator attention
    pub failed_count: usize,
    /// Bytes of segment data still on local disk
    pub local_bytes_used: u64,
}

/// The shared segment state store.
///
/// This is the only resource mutated by more than one component: the
/// stability watcher promotes to `Completed`, upload workers move through
/// `Uploading`/`Uploaded`/`Failed`, and the retention sweeper sets
/// `Deleted`. Nothing else in the pipeline touches segment state directly.
#[derive(Default)]
pub struct SegmentStore {
    segments: RwLock<HashMap<Uuid, Segment>>,
}

impl SegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segment record. Returns its id.
    pub fn register(&self, segment: Segment) -> Uuid {
        let id = segment.id;
        self.segments.write().insert(id, segment);
        id
    }

    /// Fetch a snapshot of one segment.
    pub fn get(&self, id: Uuid) -> Option<Segment> {
        self.segments.read().get(&id).cloned()
    }

    /// Find a segment by its current file path.
    pub fn find_by_path(&self, path: &Path) -> Option<Segment> {
        self.segments
            .read()
            .values()
            .find(|s| s.file_path == path)
            .cloned()
    }

    /// Atomically move a segment from `expected` to `new_state`.
    ///
    /// Fails if the segment is missing, is not in `expected`, or if the
    /// edge is not part of the state machine. The expected-state check is
    /// what makes concurrent dequeue/delete safe without a lock manager.
    pub fn transition(
        &self,
        id: Uuid,
        expected: SegmentState,
        new_state: SegmentState,
    ) -> Result<(), TransitionError> {
        if !expected.can_transition_to(new_state) {
            return Err(TransitionError::IllegalEdge {
                from: expected,
                to: new_state,
            });
        }
        let mut segments = self.segments.write();
        let segment = segments
            .get_mut(&id)
            .ok_or(TransitionError::NotFound { id })?;
        if segment.state != expected {
            return Err(TransitionError::StateMismatch {
                id,
                expected,
                actual: segment.state,
            });
        }
        segment.state = new_state;
        Ok(())
    }

    /// Drop a segment record entirely (vanished file, aged-out failure).
    pub fn remove(&self, id: Uuid) -> Option<Segment> {
        self.segments.write().remove(&id)
    }

    /// All segments currently in `state`.
    pub fn in_state(&self, state: SegmentState) -> Vec<Segment> {
        self.segments
            .read()
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect()
    }

    /// Record a fresh size sample, resetting the quiet-interval reference.
    pub fn record_sample(&self, id: Uuid, size: u64, at: DateTime<Utc>) {
        if let Some(segment) = self.segments.write().get_mut(&id) {
            segment.last_size_observed = size;
            segment.last_size_check_at = at;
        }
    }

    /// Increment the attempt counter at the start of an upload attempt and
    /// return the new count.
    pub fn begin_upload_attempt(&self, id: Uuid) -> u32 {
        let mut segments = self.segments.write();
        match segments.get_mut(&id) {
            Some(segment) => {
                segment.upload_attempts += 1;
                segment.upload_attempts
            }
            None => 0,
        }
    }

    /// Record the most recent error on a segment.
    pub fn set_last_error(&self, id: Uuid, error: impl Into<String>) {
        if let Some(segment) = self.segments.write().get_mut(&id) {
            segment.last_error = Some(error.into());
        }
    }

    /// Record the verified destination key.
    pub fn set_remote_key(&self, id: Uuid, key: impl Into<String>) {
        if let Some(segment) = self.segments.write().get_mut(&id) {
            segment.remote_key = Some(key.into());
        }
    }

    /// Update the local path after the post-upload rename.
    pub fn set_file_path(&self, id: Uuid, path: impl Into<PathBuf>) {
        if let Some(segment) = self.segments.write().get_mut(&id) {
            segment.file_path = path.into();
        }
    }

    /// Operator force-retry: move a failed segment back to `Completed`
    /// with a fresh attempt budget.
    pub fn requeue_failed(&self, id: Uuid) -> Result<(), TransitionError> {
        self.transition(id, SegmentState::Failed, SegmentState::Completed)?;
        let mut segments = self.segments.write();
        if let Some(segment) = segments.get_mut(&id) {
            segment.upload_attempts = 0;
            segment.last_error = None;
        }
        Ok(())
    }

    /// Aggregate counters for the status feed.
    pub fn stats(&self) -> StoreStats {
        let segments = self.segments.read();
        let mut stats = StoreStats::default();
        for segment in segments.values() {
            match segment.state {
                SegmentState::Completed => stats.pending_upload_count += 1,
                SegmentState::Failed => stats.failed_count += 1,
                _ => {}
            }
            if segment.state != SegmentState::Deleted {
                stats.local_bytes_used += segment.last_size_observed;
            }
        }
        stats
    }

    /// Number of registered segments.
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SegmentState::*;

    const ALL_STATES: [SegmentState; 7] = [
        Recording,
        Stabilizing,
        Completed,
        Uploading,
        Uploaded,
        Failed,
        Deleted,
    ];

    const LEGAL_EDGES: [(SegmentState, SegmentState); 10] = [
        (Recording, Stabilizing),
        (Stabilizing, Recording),
        (Stabilizing, Completed),
        (Stabilizing, Failed),
        (Completed, Uploading),
        (Uploading, Completed),
        (Uploading, Uploaded),
        (Uploading, Failed),
        (Uploaded, Deleted),
        (Failed, Completed),
    ];

    fn test_segment(state: SegmentState) -> Segment {
        let mut segment = Segment::new(
            "cam-1",
            "/tmp/recordings/cam-1/cam-1_2026-08-01_12-00-00.mp4",
            Utc::now(),
            52_428_800,
            Utc::now(),
        );
        segment.state = state;
        segment
    }

    #[test]
    fn test_edge_table_is_exhaustive() {
        // Every (from, to) pair is legal iff it appears in the edge table.
        for from in ALL_STATES {
            for to in ALL_STATES {
                let expected = LEGAL_EDGES.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "edge {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_deleted_only_reachable_from_uploaded() {
        for from in ALL_STATES {
            assert_eq!(from.can_transition_to(Deleted), from == Uploaded);
        }
    }

    #[test]
    fn test_no_state_skips_a_predecessor() {
        // The upload path cannot be entered without stabilizing first, and
        // uploaded cannot be reached without passing through uploading.
        assert!(!Recording.can_transition_to(Completed));
        assert!(!Recording.can_transition_to(Uploading));
        assert!(!Completed.can_transition_to(Uploaded));
        assert!(!Stabilizing.can_transition_to(Uploaded));
    }

    #[test]
    fn test_transition_follows_cas_semantics() {
        let store = SegmentStore::new();
        let id = store.register(test_segment(Recording));

        assert!(store.transition(id, Recording, Stabilizing).is_ok());
        // Re-running the same transition is rejected: the state moved on.
        assert_eq!(
            store.transition(id, Recording, Stabilizing),
            Err(TransitionError::StateMismatch {
                id,
                expected: Recording,
                actual: Stabilizing,
            })
        );
        assert_eq!(store.get(id).unwrap().state, Stabilizing);
    }

    #[test]
    fn test_transition_rejects_illegal_edges_before_touching_state() {
        let store = SegmentStore::new();
        let id = store.register(test_segment(Recording));

        assert_eq!(
            store.transition(id, Recording, Uploaded),
            Err(TransitionError::IllegalEdge {
                from: Recording,
                to: Uploaded,
            })
        );
        assert_eq!(store.get(id).unwrap().state, Recording);
    }

    #[test]
    fn test_transition_unknown_segment() {
        let store = SegmentStore::new();
        let id = Uuid::new_v4();
        assert_eq!(
            store.transition(id, Completed, Uploading),
            Err(TransitionError::NotFound { id })
        );
    }

    #[test]
    fn test_concurrent_dequeue_single_winner() {
        // Two workers racing to claim the same completed segment: exactly
        // one compare-and-set wins.
        let store = std::sync::Arc::new(SegmentStore::new());
        let id = store.register(test_segment(Completed));

        let mut wins = 0;
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.transition(id, Completed, Uploading).is_ok()
            }));
        }
        for handle in handles {
            if handle.join().unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.get(id).unwrap().state, Uploading);
    }

    #[test]
    fn test_requeue_failed_resets_attempt_budget() {
        let store = SegmentStore::new();
        let mut segment = test_segment(Failed);
        segment.upload_attempts = 5;
        segment.last_error = Some("upload failed".to_string());
        let id = store.register(segment);

        store.requeue_failed(id).unwrap();

        let segment = store.get(id).unwrap();
        assert_eq!(segment.state, Completed);
        assert_eq!(segment.upload_attempts, 0);
        assert!(segment.last_error.is_none());
    }

    #[test]
    fn test_requeue_failed_requires_failed_state() {
        let store = SegmentStore::new();
        let id = store.register(test_segment(Uploading));
        assert!(store.requeue_failed(id).is_err());
        assert_eq!(store.get(id).unwrap().state, Uploading);
    }

    #[test]
    fn test_stats_aggregation() {
        let store = SegmentStore::new();
        store.register(test_segment(Completed));
        store.register(test_segment(Completed));
        store.register(test_segment(Failed));
        store.register(test_segment(Uploaded));

        let stats = store.stats();
        assert_eq!(stats.pending_upload_count, 2);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.local_bytes_used, 4 * 52_428_800);
    }

    #[test]
    fn test_begin_upload_attempt_counts_up() {
        let store = SegmentStore::new();
        let id = store.register(test_segment(Uploading));
        assert_eq!(store.begin_upload_attempt(id), 1);
        assert_eq!(store.begin_upload_attempt(id), 2);
        assert_eq!(store.get(id).unwrap().upload_attempts, 2);
    }
}
