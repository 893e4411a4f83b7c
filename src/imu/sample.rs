use nalgebra::{Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Gravity vector in world frame (m/s^2).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// IMU noise parameters (1-sigma, continuous-time densities).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    pub sigma_gyro: f64,
    pub sigma_accel: f64,
    /// Gyro bias random walk.
    pub sigma_gyro_walk: f64,
    /// Accel bias random walk.
    pub sigma_accel_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            // Approximate EuRoC noise values
            sigma_gyro: 1.7e-4,
            sigma_accel: 2.0e-3,
            sigma_gyro_walk: 1.9393e-5,
            sigma_accel_walk: 3.0e-3,
        }
    }
}

/// Constant IMU bias over one state interval.
///
/// The flat 6-vector layout is `[accel (3), gyro (3)]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            accel: Vector3::zeros(),
            gyro: Vector3::zeros(),
        }
    }

    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { accel, gyro }
    }

    pub fn as_vector(&self) -> Vector6<f64> {
        Vector6::new(
            self.accel.x,
            self.accel.y,
            self.accel.z,
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
        )
    }

    pub fn from_vector(v: &Vector6<f64>) -> Self {
        Self {
            accel: Vector3::new(v[0], v[1], v[2]),
            gyro: Vector3::new(v[3], v[4], v[5]),
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Single IMU measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_s: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp_s,
            accel,
            gyro,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp_s.is_finite()
            && self.accel.iter().all(|v| v.is_finite())
            && self.gyro.iter().all(|v| v.is_finite())
    }
}

/// Pose and world-frame velocity of the body at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct NavState {
    pub pose: SE3,
    pub velocity: Vector3<f64>,
}

impl NavState {
    pub fn new(pose: SE3, velocity: Vector3<f64>) -> Self {
        Self { pose, velocity }
    }
}
