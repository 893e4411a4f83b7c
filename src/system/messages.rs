//! Inter-thread message types.

use crate::fusion::StampedPose;

/// Update emitted by the fusion worker to pose consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishedUpdate {
    /// Estimate of the newest state.
    Latest(StampedPose),
    /// Refined estimates of every state, oldest first.
    Path(Vec<StampedPose>),
}

