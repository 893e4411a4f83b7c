//! IMU preintegration between two state times.
//!
//! Deltas are expressed in the body frame of the first state with gravity
//! removed, so a window can be re-anchored at any prior state:
//!
//! ```text
//! R_j = R_i · ΔR
//! v_j = v_i + g·Δt + R_i · Δv
//! p_j = p_i + v_i·Δt + ½·g·Δt² + R_i · Δp
//! ```
//!
//! Alongside the deltas the integrator propagates the 9×9 covariance of
//! `[δθ, δv, δp]` and the bias Jacobians used for first-order bias correction.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use tracing::warn;

use crate::error::ImuError;
use crate::geometry::{so3, SE3};

use super::sample::{ImuBias, ImuNoise, ImuSample, NavState, GRAVITY};
use super::types::{Matrix6, Matrix9, Matrix9x6, Matrix9x9};

/// Preintegrated motion between two states.
#[derive(Debug, Clone, PartialEq)]
pub struct PreintegratedState {
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,
    /// Covariance of `[δθ, δv, δp]`.
    pub covariance: Matrix9,
    pub j_r_bg: Matrix3<f64>,
    pub j_v_ba: Matrix3<f64>,
    pub j_v_bg: Matrix3<f64>,
    pub j_p_ba: Matrix3<f64>,
    pub j_p_bg: Matrix3<f64>,
    /// Bias the samples were corrected with.
    pub bias: ImuBias,
    pub gravity: Vector3<f64>,
    pub num_samples: usize,
}

impl PreintegratedState {
    pub fn identity(bias: ImuBias, gravity: Vector3<f64>) -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            covariance: Matrix9::zeros(),
            j_r_bg: Matrix3::zeros(),
            j_v_ba: Matrix3::zeros(),
            j_v_bg: Matrix3::zeros(),
            j_p_ba: Matrix3::zeros(),
            j_p_bg: Matrix3::zeros(),
            bias,
            gravity,
            num_samples: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// Deltas re-evaluated for `bias` using the first-order bias Jacobians.
    pub fn corrected_deltas(
        &self,
        bias: &ImuBias,
    ) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let dba = bias.accel - self.bias.accel;
        let dbg = bias.gyro - self.bias.gyro;

        let rot = self.delta_rot * so3::exp(&(self.j_r_bg * dbg));
        let vel = self.delta_vel + self.j_v_ba * dba + self.j_v_bg * dbg;
        let pos = self.delta_pos + self.j_p_ba * dba + self.j_p_bg * dbg;
        (rot, vel, pos)
    }

    /// Propagate `prior` across the window.
    pub fn predict(&self, prior: &NavState, bias: &ImuBias) -> NavState {
        let (d_rot, d_vel, d_pos) = self.corrected_deltas(bias);
        let r_i = prior.pose.rotation;
        let dt = self.dt;

        let rotation = r_i * d_rot;
        let velocity = prior.velocity + self.gravity * dt + r_i * d_vel;
        let translation = prior.pose.translation
            + prior.velocity * dt
            + 0.5 * self.gravity * dt * dt
            + r_i * d_pos;

        NavState::new(SE3::new(rotation, translation), velocity)
    }
}

/// Accumulates raw IMU samples of one open window.
#[derive(Debug, Clone)]
pub struct Preintegrator {
    pub noise: ImuNoise,
    state: PreintegratedState,
    /// Time of the last integrated sample, or the window anchor.
    last_timestamp: Option<f64>,
}

impl Preintegrator {
    pub fn new(bias: ImuBias, noise: ImuNoise) -> Self {
        Self::with_gravity(bias, noise, GRAVITY)
    }

    pub fn with_gravity(bias: ImuBias, noise: ImuNoise, gravity: Vector3<f64>) -> Self {
        Self {
            noise,
            state: PreintegratedState::identity(bias, gravity),
            last_timestamp: None,
        }
    }

    pub fn bias(&self) -> &ImuBias {
        &self.state.bias
    }

    pub fn state(&self) -> &PreintegratedState {
        &self.state
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// Set the window start if no sample has been integrated yet.
    pub fn anchor(&mut self, timestamp_s: f64) {
        if self.last_timestamp.is_none() {
            self.last_timestamp = Some(timestamp_s);
        }
    }

    /// Integrate a timestamped sample.
    ///
    /// The first sample of an unanchored window only sets the window start.
    /// A sample earlier than the last integrated one is rejected and the
    /// window is left untouched.
    pub fn integrate_sample(&mut self, sample: &ImuSample) -> Result<(), ImuError> {
        if !sample.is_finite() {
            warn!("Dropping non-finite IMU sample");
            return Err(ImuError::NonFinite);
        }

        let Some(last) = self.last_timestamp else {
            self.last_timestamp = Some(sample.timestamp_s);
            return Ok(());
        };

        if sample.timestamp_s < last {
            warn!(
                "Got out of order IMU sample at {:.6}s (last integrated {:.6}s)",
                sample.timestamp_s, last
            );
            return Err(ImuError::OutOfOrder {
                timestamp: sample.timestamp_s,
                last,
            });
        }

        self.integrate_measurement(sample.accel, sample.gyro, sample.timestamp_s - last)?;
        self.last_timestamp = Some(sample.timestamp_s);
        Ok(())
    }

    /// Integrate one step of duration `dt`.
    pub fn integrate_measurement(
        &mut self,
        accel: Vector3<f64>,
        gyro: Vector3<f64>,
        dt: f64,
    ) -> Result<(), ImuError> {
        if !dt.is_finite() || accel.iter().chain(gyro.iter()).any(|v| !v.is_finite()) {
            return Err(ImuError::NonFinite);
        }
        if dt < 0.0 {
            warn!("Rejecting IMU step with negative dt {:.6}s", dt);
            return Err(ImuError::NegativeTimeStep { dt });
        }
        if dt == 0.0 {
            return Ok(());
        }

        let acc = accel - self.state.bias.accel;
        let omega = gyro - self.state.bias.gyro;
        let dt2 = dt * dt;

        // Everything below is linearized at the rotation before this step.
        let d_r = self.state.delta_rot.to_rotation_matrix().into_inner();
        let acc_skew = so3::skew(&acc);

        let phi = omega * dt;
        let incr = so3::exp(&phi);
        let incr_t = incr.to_rotation_matrix().into_inner().transpose();
        let jr = so3::right_jacobian(&phi);

        // Covariance: Σ ← A Σ Aᵀ + B Q Bᵀ
        let mut a = Matrix9x9::identity();
        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&incr_t);
        a.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-d_r * acc_skew * dt));
        a.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-0.5 * d_r * acc_skew * dt2));
        a.fixed_view_mut::<3, 3>(6, 3).copy_from(&(Matrix3::identity() * dt));

        let mut b = Matrix9x6::zeros();
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(d_r * dt));
        b.fixed_view_mut::<3, 3>(6, 3).copy_from(&(0.5 * d_r * dt2));

        let gyro_var = self.noise.sigma_gyro.powi(2) / dt;
        let accel_var = self.noise.sigma_accel.powi(2) / dt;
        let mut q = Matrix6::zeros();
        for i in 0..3 {
            q[(i, i)] = gyro_var;
            q[(i + 3, i + 3)] = accel_var;
        }

        self.state.covariance =
            a * self.state.covariance * a.transpose() + b * q * b.transpose();

        // Bias Jacobians (position first: it reads the previous velocity terms)
        let s = &mut self.state;
        s.j_p_ba += s.j_v_ba * dt - 0.5 * d_r * dt2;
        s.j_p_bg += s.j_v_bg * dt - 0.5 * d_r * acc_skew * s.j_r_bg * dt2;
        s.j_v_ba -= d_r * dt;
        s.j_v_bg -= d_r * acc_skew * s.j_r_bg * dt;
        s.j_r_bg = incr_t * s.j_r_bg - jr * dt;

        // Deltas
        s.delta_pos += s.delta_vel * dt + 0.5 * d_r * acc * dt2;
        s.delta_vel += d_r * acc * dt;
        s.delta_rot = s.delta_rot * incr;
        s.dt += dt;
        s.num_samples += 1;

        Ok(())
    }

    /// Predict pose/velocity at the end of the window.
    pub fn predict(&self, prior: &NavState, bias: &ImuBias) -> NavState {
        self.state.predict(prior, bias)
    }

    /// Copy of the accumulated window.
    pub fn snapshot(&self) -> PreintegratedState {
        self.state.clone()
    }

    /// Close the current window and open a new one with an updated bias.
    pub fn reset_and_rebias(&mut self, bias: ImuBias) {
        self.state = PreintegratedState::identity(bias, self.state.gravity);
        self.last_timestamp = None;
    }
}
