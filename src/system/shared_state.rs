//! State shared between the fusion worker and its clients.
//!
//! The worker writes the published estimates and lifecycle flags; producers
//! and consumers on other threads only read them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::FusionError;
use crate::fusion::StampedPose;

use super::publisher::PosePublisher;

/// Shared state accessible by the worker and any number of client threads.
pub struct SharedState {
    /// Newest published state estimate.
    pub latest: RwLock<Option<StampedPose>>,

    /// Published path, ordered by state index.
    pub path: RwLock<Vec<StampedPose>>,

    /// First fatal error raised by the worker.
    pub fatal: RwLock<Option<Arc<FusionError>>>,

    /// Request the worker to drain its queue and exit.
    pub shutdown_requested: AtomicBool,

    /// Set once a fatal error stopped the worker. Producers check it before
    /// enqueueing.
    pub halted: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn latest_pose(&self) -> Option<StampedPose> {
        self.latest.read().clone()
    }

    pub fn path(&self) -> Vec<StampedPose> {
        self.path.read().clone()
    }

    pub fn path_len(&self) -> usize {
        self.path.read().len()
    }

    /// Record a fatal error and mark the system halted. Only the first
    /// error is kept.
    pub fn record_fatal(&self, error: FusionError) {
        let mut fatal = self.fatal.write();
        if fatal.is_none() {
            *fatal = Some(Arc::new(error));
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn fatal_error(&self) -> Option<Arc<FusionError>> {
        self.fatal.read().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            latest: RwLock::new(None),
            path: RwLock::new(Vec::new()),
            fatal: RwLock::new(None),
            shutdown_requested: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }
}

impl PosePublisher for SharedState {
    fn publish_latest(&self, pose: &StampedPose) {
        *self.latest.write() = Some(pose.clone());

        let mut path = self.path.write();
        match path.binary_search_by(|p| p.index.cmp(&pose.index)) {
            Ok(i) => path[i] = pose.clone(),
            Err(i) => path.insert(i, pose.clone()),
        }
    }

    fn publish_path(&self, path: &[StampedPose]) {
        *self.path.write() = path.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::solver::StateIndex;
    use nalgebra::{UnitQuaternion, Vector3};

    fn stamped(i: u64, x: f64) -> StampedPose {
        StampedPose {
            index: StateIndex(i),
            timestamp: i as f64 * 0.1,
            pose: SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0)),
        }
    }

    #[test]
    fn test_publish_latest_upserts_by_index() {
        let shared = SharedState::new();
        shared.publish_latest(&stamped(1, 0.0));
        shared.publish_latest(&stamped(2, 1.0));
        shared.publish_latest(&stamped(2, 1.5));

        let path = shared.path();
        assert_eq!(path.len(), 2);
        assert_eq!(path[1].pose.translation.x, 1.5);
        assert_eq!(shared.latest_pose().unwrap().index, StateIndex(2));
    }

    #[test]
    fn test_publish_path_replaces_refined_estimates() {
        let shared = SharedState::new();
        shared.publish_latest(&stamped(1, 0.0));
        shared.publish_path(&[stamped(1, 0.2), stamped(2, 0.9)]);

        assert_eq!(shared.path_len(), 2);
        assert_eq!(shared.path()[0].pose.translation.x, 0.2);
    }

    #[test]
    fn test_first_fatal_error_kept() {
        let shared = SharedState::new();
        assert!(!shared.is_halted());

        shared.record_fatal(FusionError::Disconnected);
        shared.record_fatal(FusionError::Halted);

        assert!(shared.is_halted());
        assert!(matches!(
            shared.fatal_error().as_deref(),
            Some(FusionError::Disconnected)
        ));
    }
}
