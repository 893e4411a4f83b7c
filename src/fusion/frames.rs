//! Conversion of modality-frame poses into the fused world frame.

use parking_lot::RwLock;

use crate::error::FrameError;
use crate::geometry::SE3;

use super::measurement::Modality;

/// Looks up the transform from a modality's frame into the world frame.
///
/// Lookups never block; a missing transform is reported as an error and the
/// measurement is skipped.
pub trait FrameTransformer: Send + Sync {
    fn to_world(&self, modality: Modality, pose: &SE3, timestamp: f64) -> Result<SE3, FrameError>;
}

/// Every modality already reports in the world frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFrames;

impl FrameTransformer for IdentityFrames {
    fn to_world(&self, _modality: Modality, pose: &SE3, _timestamp: f64) -> Result<SE3, FrameError> {
        Ok(pose.clone())
    }
}

#[derive(Debug, Clone)]
struct StaticTransform {
    world_from_source: SE3,
    valid_from: f64,
}

/// Fixed per-modality extrinsics, each available from a given time on.
///
/// Transforms can be registered while the system runs, e.g. once a
/// calibration becomes available.
#[derive(Debug, Default)]
pub struct StaticFrames {
    transforms: RwLock<[Option<StaticTransform>; Modality::COUNT]>,
}

impl StaticFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transform(self, modality: Modality, world_from_source: SE3, valid_from: f64) -> Self {
        self.set_transform(modality, world_from_source, valid_from);
        self
    }

    pub fn set_transform(&self, modality: Modality, world_from_source: SE3, valid_from: f64) {
        self.transforms.write()[modality.index()] = Some(StaticTransform {
            world_from_source,
            valid_from,
        });
    }
}

impl FrameTransformer for StaticFrames {
    fn to_world(&self, modality: Modality, pose: &SE3, timestamp: f64) -> Result<SE3, FrameError> {
        let transforms = self.transforms.read();
        match &transforms[modality.index()] {
            Some(t) if timestamp >= t.valid_from => Ok(t.world_from_source.compose(pose)),
            _ => Err(FrameError::Unavailable {
                modality,
                timestamp,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_static_transform_applied_after_valid_from() {
        let extrinsic = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let frames = StaticFrames::new().with_transform(Modality::LidarOdometry, extrinsic, 10.0);
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));

        let world = frames.to_world(Modality::LidarOdometry, &pose, 10.5).unwrap();
        assert!((world.translation - Vector3::new(1.0, 1.0, 0.0)).norm() < 1e-12);

        assert_eq!(
            frames.to_world(Modality::LidarOdometry, &pose, 9.0),
            Err(FrameError::Unavailable {
                modality: Modality::LidarOdometry,
                timestamp: 9.0
            })
        );
    }

    #[test]
    fn test_unregistered_modality_unavailable() {
        let frames = StaticFrames::new();
        assert!(frames
            .to_world(Modality::VisualOdometry, &SE3::identity(), 0.0)
            .is_err());
    }
}
