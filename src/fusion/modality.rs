//! Per-modality continuity cursors.
//!
//! Each modality chains its relative measurements from the state it last
//! contributed to, independent of which modality created the newest state.

use std::ops::{Index, IndexMut};

use crate::geometry::SE3;
use crate::solver::StateIndex;

use super::measurement::Modality;

/// Last state a modality contributed to, and the pose it reported there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModalityCursor {
    pub last_index: Option<StateIndex>,
    pub last_pose: Option<SE3>,
}

impl ModalityCursor {
    /// `(index, pose)` once the modality has contributed.
    pub fn anchor(&self) -> Option<(StateIndex, &SE3)> {
        match (self.last_index, self.last_pose.as_ref()) {
            (Some(index), Some(pose)) => Some((index, pose)),
            _ => None,
        }
    }

    pub fn set(&mut self, index: StateIndex, pose: SE3) {
        self.last_index = Some(index);
        self.last_pose = Some(pose);
    }
}

/// Fixed-size table of cursors keyed by [`Modality`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModalityTable {
    cursors: [ModalityCursor; Modality::COUNT],
}

impl ModalityTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index<Modality> for ModalityTable {
    type Output = ModalityCursor;

    fn index(&self, modality: Modality) -> &ModalityCursor {
        &self.cursors[modality.index()]
    }
}

impl IndexMut<Modality> for ModalityTable {
    fn index_mut(&mut self, modality: Modality) -> &mut ModalityCursor {
        &mut self.cursors[modality.index()]
    }
}
