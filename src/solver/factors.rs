//! Factors of the fusion pose graph.
//!
//! # Combined IMU residual
//!
//! The inertial factor constrains consecutive states i and j (pose, velocity
//! and bias of both):
//!
//! ```text
//! r_imu = [ Log(ΔR'ᵀ · R_iᵀ · R_j) ]                              // rotation (3)
//!         [ R_iᵀ · (v_j - v_i - g·Δt) - Δv' ]                      // velocity (3)
//!         [ R_iᵀ · (p_j - p_i - v_i·Δt - ½·g·Δt²) - Δp' ]          // position (3)
//!         [ b_j - b_i ]                                            // bias walk (6)
//! ```
//!
//! where ΔR', Δv', Δp' are the preintegrated deltas corrected to first order
//! for `b_i`.

use std::fmt;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::error::SolverError;
use crate::geometry::{so3, SE3};
use crate::imu::types::COMBINED_IMU_DIM;
use crate::imu::{ImuBias, ImuNoise, PreintegratedState};

use super::keys::{FromValue, Key, StateIndex, Values};
use super::noise::NoiseModel;

/// Diagonal regularization added to the inertial covariance before factoring.
const IMU_COVARIANCE_FLOOR: f64 = 1e-12;

/// A constraint between one or more graph variables.
#[derive(Debug, Clone)]
pub enum Factor {
    PriorPose {
        index: StateIndex,
        prior: SE3,
        noise: NoiseModel,
    },
    PriorVelocity {
        index: StateIndex,
        prior: Vector3<f64>,
        noise: NoiseModel,
    },
    PriorBias {
        index: StateIndex,
        prior: ImuBias,
        noise: NoiseModel,
    },
    /// Relative pose `X_from⁻¹ · X_to` measured by an odometry source.
    Between {
        from: StateIndex,
        to: StateIndex,
        measured: SE3,
        noise: NoiseModel,
    },
    /// Preintegrated inertial constraint between consecutive states.
    CombinedImu {
        from: StateIndex,
        to: StateIndex,
        preintegrated: Box<PreintegratedState>,
        noise: NoiseModel,
    },
}

fn fetch<T: FromValue>(values: &Values, key: Key) -> Result<T, SolverError> {
    let value = values.get(&key).ok_or(SolverError::UnknownKey(key))?;
    T::from_value(value).ok_or(SolverError::TypeMismatch {
        key,
        expected: T::TYPE_NAME,
    })
}

fn dvector(parts: &[&[f64]]) -> DVector<f64> {
    DVector::from_iterator(
        parts.iter().map(|p| p.len()).sum(),
        parts.iter().flat_map(|p| p.iter().copied()),
    )
}

impl Factor {
    /// Build the inertial factor between `from` and `to`.
    ///
    /// The noise is the preintegration covariance with the bias random walk
    /// accumulated over the window appended on the diagonal.
    pub fn combined_imu(
        from: StateIndex,
        to: StateIndex,
        preintegrated: PreintegratedState,
        imu_noise: &ImuNoise,
    ) -> Self {
        let dt = preintegrated.dt.max(0.0);
        let mut covariance = DMatrix::zeros(COMBINED_IMU_DIM, COMBINED_IMU_DIM);
        covariance
            .view_mut((0, 0), (9, 9))
            .copy_from(&preintegrated.covariance);

        let accel_walk = imu_noise.sigma_accel_walk.powi(2) * dt;
        let gyro_walk = imu_noise.sigma_gyro_walk.powi(2) * dt;
        for i in 0..3 {
            covariance[(9 + i, 9 + i)] = accel_walk;
            covariance[(12 + i, 12 + i)] = gyro_walk;
        }
        for i in 0..COMBINED_IMU_DIM {
            covariance[(i, i)] += IMU_COVARIANCE_FLOOR;
        }

        let noise = match NoiseModel::from_covariance(covariance.clone()) {
            Some(noise) => noise,
            None => {
                let variances: Vec<f64> = covariance.diagonal().iter().copied().collect();
                NoiseModel::diagonal_variances(&variances)
            }
        };

        Factor::CombinedImu {
            from,
            to,
            preintegrated: Box::new(preintegrated),
            noise,
        }
    }

    /// Variables this factor touches.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Factor::PriorPose { index, .. } => vec![Key::Pose(*index)],
            Factor::PriorVelocity { index, .. } => vec![Key::Velocity(*index)],
            Factor::PriorBias { index, .. } => vec![Key::Bias(*index)],
            Factor::Between { from, to, .. } => vec![Key::Pose(*from), Key::Pose(*to)],
            Factor::CombinedImu { from, to, .. } => vec![
                Key::Pose(*from),
                Key::Velocity(*from),
                Key::Bias(*from),
                Key::Pose(*to),
                Key::Velocity(*to),
                Key::Bias(*to),
            ],
        }
    }

    /// Residual dimension.
    pub fn dim(&self) -> usize {
        match self {
            Factor::PriorPose { .. } | Factor::PriorBias { .. } | Factor::Between { .. } => 6,
            Factor::PriorVelocity { .. } => 3,
            Factor::CombinedImu { .. } => COMBINED_IMU_DIM,
        }
    }

    pub fn noise(&self) -> &NoiseModel {
        match self {
            Factor::PriorPose { noise, .. }
            | Factor::PriorVelocity { noise, .. }
            | Factor::PriorBias { noise, .. }
            | Factor::Between { noise, .. }
            | Factor::CombinedImu { noise, .. } => noise,
        }
    }

    /// Residual before whitening.
    pub fn unwhitened_error(&self, values: &Values) -> Result<DVector<f64>, SolverError> {
        match self {
            Factor::PriorPose { index, prior, .. } => {
                let x: SE3 = fetch(values, Key::Pose(*index))?;
                Ok(dvector(&[prior.local(&x).as_slice()]))
            }
            Factor::PriorVelocity { index, prior, .. } => {
                let v: Vector3<f64> = fetch(values, Key::Velocity(*index))?;
                Ok(dvector(&[(v - prior).as_slice()]))
            }
            Factor::PriorBias { index, prior, .. } => {
                let b: ImuBias = fetch(values, Key::Bias(*index))?;
                Ok(dvector(&[(b.as_vector() - prior.as_vector()).as_slice()]))
            }
            Factor::Between {
                from, to, measured, ..
            } => {
                let xi: SE3 = fetch(values, Key::Pose(*from))?;
                let xj: SE3 = fetch(values, Key::Pose(*to))?;
                Ok(dvector(&[measured.local(&xi.between(&xj)).as_slice()]))
            }
            Factor::CombinedImu {
                from,
                to,
                preintegrated,
                ..
            } => {
                let pose_i: SE3 = fetch(values, Key::Pose(*from))?;
                let vel_i: Vector3<f64> = fetch(values, Key::Velocity(*from))?;
                let bias_i: ImuBias = fetch(values, Key::Bias(*from))?;
                let pose_j: SE3 = fetch(values, Key::Pose(*to))?;
                let vel_j: Vector3<f64> = fetch(values, Key::Velocity(*to))?;
                let bias_j: ImuBias = fetch(values, Key::Bias(*to))?;

                Ok(combined_imu_residual(
                    &pose_i,
                    &vel_i,
                    &bias_i,
                    &pose_j,
                    &vel_j,
                    &bias_j,
                    preintegrated,
                ))
            }
        }
    }

    /// Whitened residual `L⁻¹ r`.
    pub fn whitened_error(&self, values: &Values) -> Result<DVector<f64>, SolverError> {
        Ok(self.noise().whiten(&self.unwhitened_error(values)?))
    }

    /// Cost `½‖L⁻¹ r‖²`.
    pub fn error(&self, values: &Values) -> Result<f64, SolverError> {
        Ok(0.5 * self.whitened_error(values)?.norm_squared())
    }
}

/// 15-dimensional inertial residual between states i and j.
pub fn combined_imu_residual(
    pose_i: &SE3,
    vel_i: &Vector3<f64>,
    bias_i: &ImuBias,
    pose_j: &SE3,
    vel_j: &Vector3<f64>,
    bias_j: &ImuBias,
    preint: &PreintegratedState,
) -> DVector<f64> {
    let dt = preint.dt;
    let g = preint.gravity;
    let (delta_rot, delta_vel, delta_pos) = preint.corrected_deltas(bias_i);
    let r_i_inv = pose_i.rotation.inverse();

    let rotation = so3::log(&(delta_rot.inverse() * r_i_inv * pose_j.rotation));
    let velocity = r_i_inv * (vel_j - vel_i - g * dt) - delta_vel;
    let position = r_i_inv
        * (pose_j.translation - pose_i.translation - vel_i * dt - 0.5 * g * dt * dt)
        - delta_pos;
    let bias = bias_j.as_vector() - bias_i.as_vector();

    dvector(&[
        rotation.as_slice(),
        velocity.as_slice(),
        position.as_slice(),
        bias.as_slice(),
    ])
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Factor::PriorPose { index, prior, .. } => write!(
                f,
                "PriorPose(X{}) t=[{:.4}, {:.4}, {:.4}]",
                index, prior.translation.x, prior.translation.y, prior.translation.z
            ),
            Factor::PriorVelocity { index, prior, .. } => write!(
                f,
                "PriorVelocity(V{}) v=[{:.4}, {:.4}, {:.4}]",
                index, prior.x, prior.y, prior.z
            ),
            Factor::PriorBias { index, .. } => write!(f, "PriorBias(B{})", index),
            Factor::Between {
                from, to, measured, ..
            } => write!(
                f,
                "Between(X{}, X{}) t=[{:.4}, {:.4}, {:.4}]",
                from, to, measured.translation.x, measured.translation.y, measured.translation.z
            ),
            Factor::CombinedImu {
                from,
                to,
                preintegrated,
                ..
            } => write!(
                f,
                "CombinedImu(X{from} V{from} B{from} -> X{to} V{to} B{to}) dt={:.4}s samples={}",
                preintegrated.dt, preintegrated.num_samples
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{NavState, Preintegrator, GRAVITY};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn pose(x: f64, y: f64, yaw: f64) -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
            Vector3::new(x, y, 0.0),
        )
    }

    #[test]
    fn test_between_zero_at_measurement() {
        let xi = pose(1.0, 2.0, 0.3);
        let xj = pose(2.5, 1.0, -0.4);
        let mut values = Values::new();
        values.insert_pose(StateIndex(0), xi.clone());
        values.insert_pose(StateIndex(1), xj.clone());

        let factor = Factor::Between {
            from: StateIndex(0),
            to: StateIndex(1),
            measured: xi.between(&xj),
            noise: NoiseModel::isotropic(6, 0.1),
        };
        assert_relative_eq!(factor.error(&values).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_prior_error_scales_with_noise() {
        let mut values = Values::new();
        values.insert_velocity(StateIndex(0), Vector3::new(0.1, 0.0, 0.0));

        let factor = Factor::PriorVelocity {
            index: StateIndex(0),
            prior: Vector3::zeros(),
            noise: NoiseModel::isotropic(3, 0.1),
        };
        // ½ · (0.1 / 0.1)²
        assert_relative_eq!(factor.error(&values).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_key_reported() {
        let factor = Factor::Between {
            from: StateIndex(0),
            to: StateIndex(1),
            measured: SE3::identity(),
            noise: NoiseModel::isotropic(6, 0.1),
        };
        let mut values = Values::new();
        values.insert_pose(StateIndex(0), SE3::identity());

        assert_eq!(
            factor.error(&values),
            Err(SolverError::UnknownKey(Key::Pose(StateIndex(1))))
        );
    }

    #[test]
    fn test_combined_imu_zero_at_prediction() {
        let bias = ImuBias::zero();
        let mut pre = Preintegrator::new(bias, ImuNoise::default());
        for _ in 0..50 {
            pre.integrate_measurement(
                Vector3::new(0.5, -0.2, 0.0) - GRAVITY,
                Vector3::new(0.0, 0.1, 0.2),
                0.01,
            )
            .unwrap();
        }
        let start = NavState::new(pose(1.0, 0.0, 0.2), Vector3::new(0.3, 0.0, 0.0));
        let end = pre.predict(&start, &bias);

        let mut values = Values::new();
        values.insert_pose(StateIndex(0), start.pose.clone());
        values.insert_velocity(StateIndex(0), start.velocity);
        values.insert_bias(StateIndex(0), bias);
        values.insert_pose(StateIndex(1), end.pose.clone());
        values.insert_velocity(StateIndex(1), end.velocity);
        values.insert_bias(StateIndex(1), bias);

        let factor = Factor::combined_imu(StateIndex(0), StateIndex(1), pre.snapshot(), &ImuNoise::default());
        assert_eq!(factor.dim(), 15);
        assert_eq!(factor.keys().len(), 6);

        let residual = factor.unwhitened_error(&values).unwrap();
        assert_eq!(residual.len(), 15);
        assert!(residual.norm() < 1e-9);
    }

    #[test]
    fn test_combined_imu_penalizes_bias_jump() {
        let pre = Preintegrator::new(ImuBias::zero(), ImuNoise::default());
        let mut values = Values::new();
        for i in 0..2 {
            values.insert_pose(StateIndex(i), SE3::identity());
            values.insert_velocity(StateIndex(i), Vector3::zeros());
        }
        values.insert_bias(StateIndex(0), ImuBias::zero());
        values.insert_bias(
            StateIndex(1),
            ImuBias::new(Vector3::new(0.1, 0.0, 0.0), Vector3::zeros()),
        );

        let factor = Factor::combined_imu(StateIndex(0), StateIndex(1), pre.snapshot(), &ImuNoise::default());
        let residual = factor.unwhitened_error(&values).unwrap();
        assert_relative_eq!(residual[9], 0.1, epsilon = 1e-12);
        assert!(factor.error(&values).unwrap() > 0.0);
    }

    #[test]
    fn test_display_lists_keys() {
        let factor = Factor::PriorBias {
            index: StateIndex(4),
            prior: ImuBias::zero(),
            noise: NoiseModel::isotropic(6, 2.0),
        };
        assert_eq!(factor.to_string(), "PriorBias(B4)");
    }
}
