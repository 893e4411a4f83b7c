//! Type aliases for preintegration covariance blocks.
//!
//! The preintegrated state is ordered `[δθ, δv, δp]`; the combined inertial
//! factor appends the 6-dimensional bias random walk `[δb_a, δb_g]`.

use nalgebra::SMatrix;

/// 9×9 covariance of the preintegrated state.
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// 9×9 state transition of one integration step.
pub type Matrix9x9 = Matrix9;

/// 9×6 noise Jacobian of one integration step (columns: gyro, accel).
pub type Matrix9x6 = SMatrix<f64, 9, 6>;

/// 6×6 discrete measurement noise covariance.
pub type Matrix6 = SMatrix<f64, 6, 6>;

/// Residual dimension of the combined inertial factor.
pub const COMBINED_IMU_DIM: usize = 15;
