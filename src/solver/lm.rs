//! Levenberg-Marquardt incremental solver.
//!
//! Every update runs in three phases:
//!
//! 1. **Collect**: gather the variables of the active window (the newest
//!    `active_window` states plus every new variable) and every factor that
//!    touches one of them. Older variables referenced by those factors are
//!    copied in as fixed.
//! 2. **Solve**: damped Gauss-Newton on the whitened residuals,
//!
//!    ```text
//!    (JᵀJ + λ diag(JᵀJ)) δ = -Jᵀ r
//!    ```
//!
//!    with numerical Jacobians taken on tangent-space perturbations. The
//!    undamped information matrix at the solution must be positive definite,
//!    otherwise the system is indeterminate.
//! 3. **Apply**: write the optimized window back into the joint estimate and
//!    keep the new factors. A failed solve applies nothing.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SolverError;

use super::factors::Factor;
use super::keys::{Key, StateIndex, Value, Values};
use super::{IncrementalSolver, SolveReport, SolverDiagnostics};

/// Step for central-difference Jacobians.
const JACOBIAN_EPS: f64 = 1e-6;

/// Pivots below this fraction of the largest diagonal entry are singular.
const PIVOT_TOLERANCE: f64 = 1e-14;

const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MIN_LAMBDA: f64 = 1e-10;
const MAX_LAMBDA: f64 = 1e10;

/// Configuration for [`LmSolver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmSolverConfig {
    /// Maximum LM iterations per update.
    pub max_iterations: usize,
    /// Initial damping factor.
    pub initial_lambda: f64,
    /// Stop when the gradient norm falls below this.
    pub gradient_tolerance: f64,
    /// Stop when the step norm falls below this.
    pub param_tolerance: f64,
    /// Stop when an accepted step reduces the cost by less than this fraction.
    pub relative_error_tolerance: f64,
    /// Number of newest states re-optimized per update. Older states stay
    /// fixed. 0 re-optimizes the whole graph.
    pub active_window: usize,
}

impl Default for LmSolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            initial_lambda: 1e-3,
            gradient_tolerance: 1e-9,
            param_tolerance: 1e-10,
            relative_error_tolerance: 1e-9,
            active_window: 25,
        }
    }
}

/// Column block of one optimized variable.
#[derive(Debug, Clone, Copy)]
struct Block {
    key: Key,
    offset: usize,
    dim: usize,
}

/// Linearization problem over the active window.
struct Problem<'a> {
    factors: Vec<&'a Factor>,
    blocks: Vec<Block>,
    block_of: HashMap<Key, usize>,
    dim: usize,
    residual_dim: usize,
}

impl Problem<'_> {
    fn residuals(&self, values: &Values) -> Result<DVector<f64>, SolverError> {
        let mut r = DVector::zeros(self.residual_dim);
        let mut row = 0;
        for factor in &self.factors {
            let e = factor.whitened_error(values)?;
            r.rows_mut(row, e.len()).copy_from(&e);
            row += e.len();
        }
        Ok(r)
    }

    /// Central-difference Jacobian of the whitened residuals.
    ///
    /// `values` is perturbed in place and restored before returning.
    fn jacobian(&self, values: &mut Values) -> Result<DMatrix<f64>, SolverError> {
        let mut jacobian = DMatrix::zeros(self.residual_dim, self.dim);
        let mut row = 0;

        for factor in &self.factors {
            let m = factor.dim();
            for key in factor.keys() {
                let Some(&b) = self.block_of.get(&key) else {
                    continue; // fixed
                };
                let block = self.blocks[b];
                let original = values.get(&key).cloned().ok_or(SolverError::UnknownKey(key))?;

                let mut step = vec![0.0; block.dim];
                for d in 0..block.dim {
                    step[d] = JACOBIAN_EPS;
                    values.insert(key, original.retract(&step));
                    let plus = factor.whitened_error(values)?;

                    step[d] = -JACOBIAN_EPS;
                    values.insert(key, original.retract(&step));
                    let minus = factor.whitened_error(values)?;
                    step[d] = 0.0;

                    let column = (plus - minus) / (2.0 * JACOBIAN_EPS);
                    jacobian
                        .view_mut((row, block.offset + d), (m, 1))
                        .copy_from(&column);
                }
                values.insert(key, original);
            }
            row += m;
        }

        Ok(jacobian)
    }

    fn retract(&self, values: &Values, delta: &DVector<f64>) -> Values {
        let mut out = values.clone();
        let delta = delta.as_slice();
        for block in &self.blocks {
            if let Some(v) = values.get(&block.key) {
                out.insert(block.key, v.retract(&delta[block.offset..block.offset + block.dim]));
            }
        }
        out
    }

    fn key_of_column(&self, column: usize) -> Option<Key> {
        self.blocks
            .iter()
            .find(|b| column >= b.offset && column < b.offset + b.dim)
            .map(|b| b.key)
    }
}

/// Index of the first pivot of a Cholesky factorization of `h` that is not
/// safely positive.
fn first_degenerate_pivot(h: &DMatrix<f64>) -> Option<usize> {
    let n = h.nrows();
    let scale = h.diagonal().iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if n > 0 && !(scale > 0.0 && scale.is_finite()) {
        return Some(0);
    }
    let threshold = scale * PIVOT_TOLERANCE;

    // A non-positive pivot turns into NaN (or zero) on the factor diagonal
    let chol = Cholesky::new_unchecked(h.clone());
    chol.l().diagonal().iter().position(|l| !(l * l > threshold))
}

/// Incremental solver keeping every factor and the joint estimate.
pub struct LmSolver {
    config: LmSolverConfig,
    factors: Vec<Factor>,
    estimate: Values,
    rejected: Option<(Vec<Factor>, Values)>,
    updates: usize,
}

impl Default for LmSolver {
    fn default() -> Self {
        Self::new(LmSolverConfig::default())
    }
}

impl LmSolver {
    pub fn new(config: LmSolverConfig) -> Self {
        Self {
            config,
            factors: Vec::new(),
            estimate: Values::new(),
            rejected: None,
            updates: 0,
        }
    }

    pub fn config(&self) -> &LmSolverConfig {
        &self.config
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// The full joint estimate.
    pub fn values(&self) -> &Values {
        &self.estimate
    }

    fn validate(&self, factors: &[Factor], values: &Values) -> Result<(), SolverError> {
        for (key, value) in values.iter() {
            if self.estimate.contains(key) {
                return Err(SolverError::DuplicateKey(*key));
            }
            if !value.matches(key) {
                return Err(SolverError::TypeMismatch {
                    key: *key,
                    expected: key.type_name(),
                });
            }
        }
        for factor in factors {
            for key in factor.keys() {
                if !self.estimate.contains(&key) && !values.contains(&key) {
                    return Err(SolverError::UnknownKey(key));
                }
            }
        }
        Ok(())
    }

    fn window_start(&self, values: &Values) -> StateIndex {
        if self.config.active_window == 0 {
            return StateIndex::ZERO;
        }
        let newest = self
            .estimate
            .last_key()
            .into_iter()
            .chain(values.last_key())
            .map(|k| k.index())
            .max()
            .unwrap_or(StateIndex::ZERO);
        StateIndex(newest.0.saturating_sub(self.config.active_window as u64 - 1))
    }

    /// PHASE 1: gather the active window and its factors.
    fn collect<'a>(&'a self, factors: &'a [Factor], values: &Values) -> (Problem<'a>, Values) {
        let start = self.window_start(values);

        let mut local = Values::new();
        let mut active = BTreeSet::new();
        for (key, value) in self.estimate.iter_from(start).chain(values.iter()) {
            local.insert(*key, value.clone());
            active.insert(*key);
        }

        let mut selected = Vec::new();
        for factor in self.factors.iter().chain(factors.iter()) {
            let keys = factor.keys();
            if !keys.iter().any(|k| active.contains(k)) {
                continue;
            }
            for key in &keys {
                if !local.contains(key) {
                    if let Some(v) = self.estimate.get(key) {
                        local.insert(*key, v.clone());
                    }
                }
            }
            selected.push(factor);
        }

        let mut blocks = Vec::with_capacity(active.len());
        let mut block_of = HashMap::with_capacity(active.len());
        let mut offset = 0;
        for key in active {
            block_of.insert(key, blocks.len());
            blocks.push(Block {
                key,
                offset,
                dim: key.dim(),
            });
            offset += key.dim();
        }
        let residual_dim = selected.iter().map(|f| f.dim()).sum();

        (
            Problem {
                factors: selected,
                blocks,
                block_of,
                dim: offset,
                residual_dim,
            },
            local,
        )
    }

    /// PHASE 2: damped Gauss-Newton over the active window.
    fn optimize(
        &self,
        problem: &Problem<'_>,
        mut values: Values,
    ) -> Result<(Values, SolveReport), SolverError> {
        let mut report = SolveReport {
            active_variables: problem.blocks.len(),
            active_factors: problem.factors.len(),
            ..Default::default()
        };
        if problem.dim == 0 {
            report.converged = true;
            return Ok((values, report));
        }

        let mut residuals = problem.residuals(&values)?;
        let mut current_error_sq = residuals.norm_squared();
        if !current_error_sq.is_finite() {
            return Err(SolverError::IndeterminateSystem { key: None });
        }
        report.initial_error = 0.5 * current_error_sq;

        let mut lambda = self.config.initial_lambda;
        for iter in 0..self.config.max_iterations {
            report.iterations = iter + 1;

            let jacobian = problem.jacobian(&mut values)?;
            let gradient = jacobian.transpose() * &residuals;
            if gradient.norm() < self.config.gradient_tolerance {
                report.converged = true;
                break;
            }

            let mut damped_jtj = jacobian.transpose() * &jacobian;
            for i in 0..problem.dim {
                damped_jtj[(i, i)] += lambda * damped_jtj[(i, i)].max(1e-6);
            }

            let delta = match damped_jtj.lu().solve(&(-&gradient)) {
                Some(d) => d,
                None => break,
            };
            if delta.norm() < self.config.param_tolerance {
                report.converged = true;
                break;
            }

            let trial = problem.retract(&values, &delta);
            let trial_residuals = problem.residuals(&trial)?;
            let trial_error_sq = trial_residuals.norm_squared();

            if trial_error_sq < current_error_sq {
                let decrease = current_error_sq - trial_error_sq;
                let previous = current_error_sq;
                values = trial;
                residuals = trial_residuals;
                current_error_sq = trial_error_sq;
                lambda = (lambda * LAMBDA_DOWN).max(MIN_LAMBDA);
                if decrease <= self.config.relative_error_tolerance * previous {
                    report.converged = true;
                    break;
                }
            } else {
                lambda = (lambda * LAMBDA_UP).min(MAX_LAMBDA);
            }
        }
        report.final_error = 0.5 * current_error_sq;

        // Rank check on the undamped system at the solution
        let jacobian = problem.jacobian(&mut values)?;
        let information = jacobian.transpose() * &jacobian;
        if let Some(column) = first_degenerate_pivot(&information) {
            return Err(SolverError::IndeterminateSystem {
                key: problem.key_of_column(column),
            });
        }

        Ok((values, report))
    }
}

impl IncrementalSolver for LmSolver {
    fn update(&mut self, factors: Vec<Factor>, values: Values) -> Result<SolveReport, SolverError> {
        let result = self.validate(&factors, &values).and_then(|()| {
            let (problem, local) = self.collect(&factors, &values);
            self.optimize(&problem, local)
        });

        match result {
            Ok((optimized, report)) => {
                // PHASE 3: apply
                for (key, value) in optimized {
                    self.estimate.insert(key, value);
                }
                self.factors.extend(factors);
                self.rejected = None;
                self.updates += 1;
                debug!(
                    "[LmSolver] Update {}: {} vars, {} factors, error {:.6} -> {:.6} in {} iterations",
                    self.updates,
                    report.active_variables,
                    report.active_factors,
                    report.initial_error,
                    report.final_error,
                    report.iterations
                );
                Ok(report)
            }
            Err(err) => {
                warn!("[LmSolver] Update rejected: {}", err);
                self.rejected = Some((factors, values));
                Err(err)
            }
        }
    }

    fn value(&self, key: &Key) -> Option<&Value> {
        self.estimate.get(key)
    }

    fn num_factors(&self) -> usize {
        self.factors.len()
    }

    fn num_keys(&self) -> usize {
        self.estimate.len()
    }

    fn diagnostics(&self) -> SolverDiagnostics {
        let (rejected_factors, rejected_values) = self.rejected.clone().unwrap_or_default();
        SolverDiagnostics {
            factors: self.factors.clone(),
            estimate: self.estimate.clone(),
            rejected_factors,
            rejected_values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::imu::{ImuBias, ImuNoise, Preintegrator, GRAVITY};
    use crate::solver::NoiseModel;
    use nalgebra::{UnitQuaternion, Vector3, Vector6};

    fn pose(x: f64, y: f64, yaw: f64) -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
            Vector3::new(x, y, 0.0),
        )
    }

    fn prior(index: u64, p: SE3) -> Factor {
        Factor::PriorPose {
            index: StateIndex(index),
            prior: p,
            noise: NoiseModel::isotropic(6, 1e-4),
        }
    }

    fn between(from: u64, to: u64, measured: SE3) -> Factor {
        Factor::Between {
            from: StateIndex(from),
            to: StateIndex(to),
            measured,
            noise: NoiseModel::diagonal_variances(&[0.1; 6]),
        }
    }

    fn perturbed(p: &SE3) -> SE3 {
        p.retract(&Vector6::new(0.05, -0.03, 0.08, 0.3, -0.2, 0.1))
    }

    #[test]
    fn test_chain_converges_to_noiseless_truth() {
        let truth = [pose(0.0, 0.0, 0.0), pose(1.0, 0.2, 0.3), pose(1.8, 1.0, 0.9)];
        let mut solver = LmSolver::default();

        let mut values = Values::new();
        values.insert_pose(StateIndex(1), truth[0].clone());
        solver.update(vec![prior(1, truth[0].clone())], values).unwrap();

        for i in 1..truth.len() {
            let mut values = Values::new();
            values.insert_pose(StateIndex(i as u64 + 1), perturbed(&truth[i]));
            let factor = between(i as u64, i as u64 + 1, truth[i - 1].between(&truth[i]));
            let report = solver.update(vec![factor], values).unwrap();
            assert!(report.final_error <= report.initial_error);
        }

        for (i, expected) in truth.iter().enumerate() {
            let estimate: SE3 = solver.estimate(Key::Pose(StateIndex(i as u64 + 1))).unwrap();
            assert!(estimate.approx_eq(expected, 1e-6), "X{} off", i + 1);
        }
        assert_eq!(solver.num_factors(), 3);
        assert_eq!(solver.num_keys(), 3);
    }

    #[test]
    fn test_unconstrained_variable_is_indeterminate_and_rolled_back() {
        let mut solver = LmSolver::default();
        let mut values = Values::new();
        values.insert_pose(StateIndex(1), SE3::identity());
        solver.update(vec![prior(1, SE3::identity())], values).unwrap();

        let mut values = Values::new();
        values.insert_pose(StateIndex(2), pose(1.0, 0.0, 0.0));
        let err = solver.update(Vec::new(), values).unwrap_err();

        assert_eq!(
            err,
            SolverError::IndeterminateSystem {
                key: Some(Key::Pose(StateIndex(2)))
            }
        );
        assert_eq!(solver.num_keys(), 1);
        assert_eq!(solver.num_factors(), 1);
        assert_eq!(
            solver.estimate::<SE3>(Key::Pose(StateIndex(2))),
            Err(SolverError::KeyNotFound(Key::Pose(StateIndex(2))))
        );

        let diagnostics = solver.diagnostics();
        assert!(diagnostics.rejected_values.contains(&Key::Pose(StateIndex(2))));
        assert!(diagnostics.to_string().contains("X2"));
    }

    #[test]
    fn test_duplicate_and_unknown_keys_rejected() {
        let mut solver = LmSolver::default();
        let mut values = Values::new();
        values.insert_pose(StateIndex(1), SE3::identity());
        solver.update(vec![prior(1, SE3::identity())], values.clone()).unwrap();

        assert_eq!(
            solver.update(Vec::new(), values),
            Err(SolverError::DuplicateKey(Key::Pose(StateIndex(1))))
        );
        assert_eq!(
            solver.update(vec![between(1, 5, SE3::identity())], Values::new()),
            Err(SolverError::UnknownKey(Key::Pose(StateIndex(5))))
        );
    }

    #[test]
    fn test_mismatched_value_kind_rejected() {
        let mut solver = LmSolver::default();
        let mut values = Values::new();
        values.insert(Key::Velocity(StateIndex(1)), Value::Pose(SE3::identity()));

        assert_eq!(
            solver.update(Vec::new(), values),
            Err(SolverError::TypeMismatch {
                key: Key::Velocity(StateIndex(1)),
                expected: "velocity"
            })
        );
    }

    #[test]
    fn test_typed_estimate_mismatch() {
        let mut solver = LmSolver::default();
        let mut values = Values::new();
        values.insert_pose(StateIndex(1), SE3::identity());
        solver.update(vec![prior(1, SE3::identity())], values).unwrap();

        let wrong = solver.estimate::<ImuBias>(Key::Pose(StateIndex(1)));
        assert_eq!(
            wrong,
            Err(SolverError::TypeMismatch {
                key: Key::Pose(StateIndex(1)),
                expected: "bias"
            })
        );
    }

    #[test]
    fn test_states_outside_window_stay_fixed() {
        let config = LmSolverConfig {
            active_window: 2,
            ..Default::default()
        };
        let mut solver = LmSolver::new(config);

        let mut values = Values::new();
        values.insert_pose(StateIndex(1), SE3::identity());
        solver.update(vec![prior(1, SE3::identity())], values).unwrap();
        for i in 1..4u64 {
            let mut values = Values::new();
            values.insert_pose(StateIndex(i + 1), pose(i as f64, 0.0, 0.0));
            solver
                .update(vec![between(i, i + 1, pose(1.0, 0.0, 0.0))], values)
                .unwrap();
        }
        let x2_before: SE3 = solver.estimate(Key::Pose(StateIndex(2))).unwrap();

        // Conflicting constraint between the two newest states
        solver
            .update(vec![between(3, 4, pose(2.0, 0.0, 0.0))], Values::new())
            .unwrap();

        let x2_after: SE3 = solver.estimate(Key::Pose(StateIndex(2))).unwrap();
        assert_eq!(x2_before, x2_after);
        let x4: SE3 = solver.estimate(Key::Pose(StateIndex(4))).unwrap();
        assert!(x4.translation.x > 3.2);
    }

    #[test]
    fn test_inertial_factor_pulls_stationary_state() {
        let mut solver = LmSolver::default();
        let i1 = StateIndex(1);
        let i2 = StateIndex(2);

        let mut values = Values::new();
        values.insert_pose(i1, SE3::identity());
        values.insert_velocity(i1, Vector3::zeros());
        values.insert_bias(i1, ImuBias::zero());
        let priors = vec![
            prior(1, SE3::identity()),
            Factor::PriorVelocity {
                index: i1,
                prior: Vector3::zeros(),
                noise: NoiseModel::isotropic(3, 0.1),
            },
            Factor::PriorBias {
                index: i1,
                prior: ImuBias::zero(),
                noise: NoiseModel::isotropic(6, 2.0),
            },
        ];
        solver.update(priors, values).unwrap();

        let mut pre = Preintegrator::new(ImuBias::zero(), ImuNoise::default());
        for _ in 0..20 {
            pre.integrate_measurement(-GRAVITY, Vector3::zeros(), 0.005).unwrap();
        }
        let mut values = Values::new();
        values.insert_pose(i2, pose(0.05, -0.02, 0.01));
        values.insert_velocity(i2, Vector3::new(0.1, 0.0, 0.0));
        values.insert_bias(i2, ImuBias::zero());
        let imu = Factor::combined_imu(i1, i2, pre.snapshot(), &ImuNoise::default());
        solver.update(vec![imu], values).unwrap();

        let x2: SE3 = solver.estimate(Key::Pose(i2)).unwrap();
        let v2: Vector3<f64> = solver.estimate(Key::Velocity(i2)).unwrap();
        assert!(x2.approx_eq(&SE3::identity(), 1e-4));
        assert!(v2.norm() < 1e-4);
    }

    #[test]
    fn test_degenerate_pivot_detection() {
        let h = DMatrix::from_row_slice(3, 3, &[4.0, 2.0, 0.0, 2.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(first_degenerate_pivot(&h), Some(1));
        assert_eq!(first_degenerate_pivot(&DMatrix::identity(3, 3)), None);
    }

    #[test]
    fn test_degenerate_pivot_relative_and_indefinite() {
        let spd = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        assert_eq!(first_degenerate_pivot(&spd), None);

        // Positive but negligible against the largest diagonal entry
        let tiny = DMatrix::from_row_slice(2, 2, &[1e6, 0.0, 0.0, 1e-12]);
        assert_eq!(first_degenerate_pivot(&tiny), Some(1));

        let indefinite = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 5.0]);
        assert_eq!(first_degenerate_pivot(&indefinite), Some(1));

        assert_eq!(first_degenerate_pivot(&DMatrix::zeros(2, 2)), Some(0));
    }
}
