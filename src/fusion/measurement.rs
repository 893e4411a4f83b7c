use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::solver::StateIndex;

/// Source of a relative-pose measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    VisualOdometry,
    LidarOdometry,
}

impl Modality {
    pub const COUNT: usize = 2;
    pub const ALL: [Modality; Modality::COUNT] = [Modality::VisualOdometry, Modality::LidarOdometry];

    /// Slot of this modality in fixed-size tables.
    pub fn index(self) -> usize {
        match self {
            Modality::VisualOdometry => 0,
            Modality::LidarOdometry => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Modality::VisualOdometry => "visual",
            Modality::LidarOdometry => "lidar",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pose reported by one odometry source at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct OdometryMeasurement {
    pub modality: Modality,
    /// Seconds.
    pub timestamp: f64,
    /// Pose in the source's own frame.
    pub pose: SE3,
    /// False when the source flagged the pose as unusable.
    pub valid: bool,
}

impl OdometryMeasurement {
    pub fn new(modality: Modality, timestamp: f64, pose: SE3) -> Self {
        Self {
            modality,
            timestamp,
            pose,
            valid: true,
        }
    }

    pub fn invalid(modality: Modality, timestamp: f64) -> Self {
        Self {
            modality,
            timestamp,
            pose: SE3::identity(),
            valid: false,
        }
    }
}

/// Estimated pose of one fused state.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedPose {
    pub index: StateIndex,
    pub timestamp: f64,
    pub pose: SE3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_slots_are_distinct() {
        let slots: Vec<usize> = Modality::ALL.iter().map(|m| m.index()).collect();
        assert_eq!(slots, vec![0, 1]);
        assert_eq!(Modality::LidarOdometry.to_string(), "lidar");
    }

    #[test]
    fn test_modality_yaml_names() {
        let m: Modality = serde_yaml::from_str("lidar_odometry").unwrap();
        assert_eq!(m, Modality::LidarOdometry);
    }
}
