use nalgebra::{Isometry3, Matrix4, Quaternion, Translation3, UnitQuaternion, Vector3, Vector6};

use super::so3;

/// Rigid body transform in SE(3).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from homogeneous 4x4 matrix.
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let rotation_mat = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        let rot3 = nalgebra::Rotation3::from_matrix(&rotation_mat);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Convert to homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation).to_homogeneous()
    }

    /// Inverse transform.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms (self @ other).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Relative transform from `self` to `other`: `self⁻¹ · other`.
    ///
    /// This is the measurement carried by a between-factor linking two poses.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    /// Transform a single point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Apply a right perturbation `δ = [δθ, δt]`:
    /// `R' = R · Exp(δθ)`, `t' = t + R · δt`.
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        let dtheta = Vector3::new(delta[0], delta[1], delta[2]);
        let dt = Vector3::new(delta[3], delta[4], delta[5]);
        Self {
            rotation: self.rotation * so3::exp(&dtheta),
            translation: self.translation + self.rotation * dt,
        }
    }

    /// Inverse of [`SE3::retract`]: the perturbation taking `self` to `other`.
    pub fn local(&self, other: &SE3) -> Vector6<f64> {
        let dtheta = so3::log(&(self.rotation.inverse() * other.rotation));
        let dt = self.rotation.inverse() * (other.translation - self.translation);
        Vector6::new(dtheta.x, dtheta.y, dtheta.z, dt.x, dt.y, dt.z)
    }

    /// Whether both rotation angle and translation distance are within `tol`.
    pub fn approx_eq(&self, other: &SE3, tol: f64) -> bool {
        so3::angular_distance(&self.rotation, &other.rotation) <= tol
            && (self.translation - other.translation).norm() <= tol
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.3, 0.7),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_between_recovers_other() {
        let a = sample_pose();
        let b = SE3::new(
            UnitQuaternion::from_euler_angles(-0.2, 0.0, 1.1),
            Vector3::new(3.0, 0.0, -1.0),
        );
        let rel = a.between(&b);
        assert!(a.compose(&rel).approx_eq(&b, 1e-12));
    }

    #[test]
    fn test_retract_local_are_inverse() {
        let a = sample_pose();
        let delta = Vector6::new(0.01, -0.02, 0.03, 0.5, 0.1, -0.2);
        let b = a.retract(&delta);
        assert_relative_eq!(a.local(&b), delta, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_roundtrip() {
        let a = sample_pose();
        assert!(SE3::from_matrix(a.to_matrix()).approx_eq(&a, 1e-12));
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let a = sample_pose();
        assert!(a.compose(&a.inverse()).approx_eq(&SE3::identity(), 1e-12));
    }
}
