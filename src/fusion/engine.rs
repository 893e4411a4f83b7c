//! Fusion state machine.
//!
//! For every odometry measurement the engine decides which constraints to
//! add to the pose graph and how to initialize new unknowns:
//!
//! - **Bootstrap**: the first measurement creates state 1 with the hard prior
//!   bundle (pose, zero velocity, zero bias).
//! - **Extension**: if inertial samples arrived since the last processed
//!   measurement, a new state is created and linked to the previous one by a
//!   combined inertial factor. The modality's own between factor chains from
//!   the state it last contributed to.
//! - **Odometry only**: without inertial samples the index does not advance.
//!   The measurement either chains the modality onto the current state or,
//!   for a modality seen for the first time, anchors it with a pose prior.
//!
//! The engine is single-threaded; the measurement sequencer owns it.

use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{BiasReseedPolicy, FusionConfig};
use crate::error::{FusionError, SolverError};
use crate::geometry::SE3;
use crate::imu::{ImuBias, ImuBuffer, NavState, Preintegrator};
use crate::solver::{Factor, IncrementalSolver, Key, LmSolver, NoiseModel, StateIndex, Values};
use crate::system::publisher::PosePublisher;

use super::frames::FrameTransformer;
use super::measurement::{Modality, OdometryMeasurement, StampedPose};
use super::modality::{ModalityCursor, ModalityTable};

/// Why a measurement was dropped without touching the graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    Invalid,
    OutOfOrder { timestamp: f64, last: f64 },
    FrameUnavailable,
}

/// Result of processing one measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateOutcome {
    /// First state created with the prior bundle.
    Bootstrapped { index: StateIndex },
    /// New state linked by an inertial factor. `chained_from` is where the
    /// modality's between factor starts, `None` if a pose prior was used.
    Extended {
        index: StateIndex,
        chained_from: Option<StateIndex>,
        imu_samples: usize,
    },
    /// Odometry-only between factor onto the current state.
    Chained { index: StateIndex, from: StateIndex },
    /// First contribution of a modality, anchored by a pose prior on the
    /// current state.
    Anchored { index: StateIndex },
    /// Nothing to add.
    Unchanged,
    Skipped(SkipReason),
}

impl UpdateOutcome {
    /// Whether this outcome produced a new state that was published.
    pub fn is_published(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::Bootstrapped { .. } | UpdateOutcome::Extended { .. }
        )
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, UpdateOutcome::Skipped(_))
    }
}

/// Counters over the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub processed: u64,
    pub extensions: u64,
    pub chains: u64,
    pub anchors: u64,
    pub unchanged: u64,
    pub skipped: u64,
}

/// Incremental multi-modality pose-graph fusion.
pub struct FusionEngine<S: IncrementalSolver = LmSolver> {
    config: FusionConfig,
    solver: S,
    imu: Arc<Mutex<ImuBuffer>>,
    frames: Arc<dyn FrameTransformer>,
    publisher: Arc<dyn PosePublisher>,
    integrator: Preintegrator,
    /// Newest state; zero before bootstrap.
    current: StateIndex,
    cursors: ModalityTable,
    /// Timestamp of state `i` at slot `i - 1`.
    timestamps: Vec<f64>,
    last_processed: Option<f64>,
    stats: EngineStats,
    halted: bool,
}

impl FusionEngine<LmSolver> {
    pub fn new(
        config: FusionConfig,
        imu: Arc<Mutex<ImuBuffer>>,
        frames: Arc<dyn FrameTransformer>,
        publisher: Arc<dyn PosePublisher>,
    ) -> Self {
        let solver = LmSolver::new(config.solver.clone());
        Self::with_solver(config, solver, imu, frames, publisher)
    }
}

impl<S: IncrementalSolver> FusionEngine<S> {
    pub fn with_solver(
        config: FusionConfig,
        solver: S,
        imu: Arc<Mutex<ImuBuffer>>,
        frames: Arc<dyn FrameTransformer>,
        publisher: Arc<dyn PosePublisher>,
    ) -> Self {
        let integrator =
            Preintegrator::with_gravity(ImuBias::zero(), config.imu.noise, config.imu.gravity());
        Self {
            config,
            solver,
            imu,
            frames,
            publisher,
            integrator,
            current: StateIndex::ZERO,
            cursors: ModalityTable::new(),
            timestamps: Vec::new(),
            last_processed: None,
            stats: EngineStats::default(),
            halted: false,
        }
    }

    pub fn current_index(&self) -> StateIndex {
        self.current
    }

    pub fn cursor(&self, modality: Modality) -> &ModalityCursor {
        &self.cursors[modality]
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn integrator(&self) -> &Preintegrator {
        &self.integrator
    }

    pub fn last_processed(&self) -> Option<f64> {
        self.last_processed
    }

    pub fn timestamp_of(&self, index: StateIndex) -> Option<f64> {
        let slot = usize::try_from(index.0).ok()?.checked_sub(1)?;
        self.timestamps.get(slot).copied()
    }

    fn stamped(&self, index: StateIndex) -> Option<StampedPose> {
        let pose = self.solver.estimate::<SE3>(Key::Pose(index)).ok()?;
        let timestamp = self.timestamp_of(index)?;
        Some(StampedPose {
            index,
            timestamp,
            pose,
        })
    }

    /// Estimate of the newest state.
    pub fn latest_pose(&self) -> Option<StampedPose> {
        self.stamped(self.current)
    }

    /// Current estimates of every state, oldest first.
    pub fn path(&self) -> Vec<StampedPose> {
        (1..=self.current.0)
            .filter_map(|i| self.stamped(StateIndex(i)))
            .collect()
    }

    /// Process one odometry measurement.
    ///
    /// Recoverable problems are reported as [`UpdateOutcome::Skipped`]. A
    /// solver failure halts the engine and is returned with diagnostics.
    pub fn process_measurement(
        &mut self,
        measurement: OdometryMeasurement,
    ) -> Result<UpdateOutcome, FusionError> {
        if self.halted {
            return Err(FusionError::Halted);
        }
        let OdometryMeasurement {
            modality,
            timestamp,
            pose,
            valid,
        } = measurement;

        if !valid {
            warn!("Dropping invalid {} odometry at {:.6}s", modality, timestamp);
            return Ok(self.skip(SkipReason::Invalid));
        }
        if let Some(last) = self.last_processed {
            if timestamp < last {
                warn!(
                    "Got out of order {} odometry at {:.6}s (last processed {:.6}s)",
                    modality, timestamp, last
                );
                return Ok(self.skip(SkipReason::OutOfOrder { timestamp, last }));
            }
        }

        let (requires_conversion, noise) = {
            let section = self.config.modality(modality);
            (
                section.requires_frame_conversion,
                NoiseModel::diagonal_variances(&section.variances),
            )
        };
        let pose = if requires_conversion {
            match self.frames.to_world(modality, &pose, timestamp) {
                Ok(world) => world,
                Err(e) => {
                    warn!("Skipping {} odometry: {}", modality, e);
                    return Ok(self.skip(SkipReason::FrameUnavailable));
                }
            }
        } else {
            pose
        };

        let outcome = match self.update_state(modality, pose, timestamp, noise) {
            Ok(outcome) => outcome,
            Err(source) => {
                self.halted = true;
                let diagnostics = Box::new(self.solver.diagnostics());
                error!(
                    "[FusionEngine] Caught {} while adding {} odometry at {:.6}s, halting\n{}",
                    source, modality, timestamp, diagnostics
                );
                return Err(FusionError::Solver {
                    source,
                    diagnostics,
                });
            }
        };

        self.last_processed = Some(timestamp);
        self.stats.processed += 1;
        if outcome.is_published() {
            self.publish();
        }
        Ok(outcome)
    }

    fn skip(&mut self, reason: SkipReason) -> UpdateOutcome {
        self.stats.skipped += 1;
        UpdateOutcome::Skipped(reason)
    }

    fn update_state(
        &mut self,
        modality: Modality,
        pose: SE3,
        timestamp: f64,
        noise: NoiseModel,
    ) -> Result<UpdateOutcome, SolverError> {
        if self.current == StateIndex::ZERO {
            return self.bootstrap(modality, pose, timestamp);
        }

        let since = self.last_processed.unwrap_or(timestamp);
        let have_imu = self.imu.lock().has_samples_in_range(since, timestamp);
        if have_imu {
            self.extend(modality, pose, timestamp, noise)
        } else {
            self.attach_without_imu(modality, pose, noise)
        }
    }

    fn bootstrap(
        &mut self,
        modality: Modality,
        pose: SE3,
        timestamp: f64,
    ) -> Result<UpdateOutcome, SolverError> {
        let index = StateIndex(1);
        let priors = &self.config.priors;

        let factors = vec![
            Factor::PriorPose {
                index,
                prior: pose.clone(),
                noise: NoiseModel::diagonal_sigmas(&priors.pose_sigmas),
            },
            Factor::PriorVelocity {
                index,
                prior: Vector3::zeros(),
                noise: NoiseModel::isotropic(3, priors.velocity_sigma),
            },
            Factor::PriorBias {
                index,
                prior: ImuBias::zero(),
                noise: NoiseModel::isotropic(6, priors.bias_sigma),
            },
        ];
        let mut values = Values::new();
        values.insert_pose(index, pose.clone());
        values.insert_velocity(index, Vector3::zeros());
        values.insert_bias(index, ImuBias::zero());

        self.solver.update(factors, values)?;

        // Samples up to the first state can never be integrated
        self.imu.lock().discard_until(timestamp);
        self.integrator.reset_and_rebias(ImuBias::zero());
        self.current = index;
        self.timestamps.push(timestamp);
        self.cursors[modality].set(index, pose);

        info!(
            "[FusionEngine] Bootstrapped state {} from {} odometry at {:.3}s",
            index, modality, timestamp
        );
        Ok(UpdateOutcome::Bootstrapped { index })
    }

    fn secondary_prior(&self, index: StateIndex, pose: &SE3) -> Factor {
        Factor::PriorPose {
            index,
            prior: pose.clone(),
            noise: NoiseModel::diagonal_sigmas(&self.config.priors.secondary_pose_sigmas),
        }
    }

    fn extend(
        &mut self,
        modality: Modality,
        pose: SE3,
        timestamp: f64,
        noise: NoiseModel,
    ) -> Result<UpdateOutcome, SolverError> {
        let prev = self.current;
        let index = prev.next();

        let mut factors = Vec::with_capacity(2);
        let chained_from = match self.cursors[modality].anchor() {
            Some((from, last_pose)) => {
                factors.push(Factor::Between {
                    from,
                    to: index,
                    measured: last_pose.between(&pose),
                    noise,
                });
                Some(from)
            }
            None => {
                factors.push(self.secondary_prior(index, &pose));
                info!("[FusionEngine] Added prior on {} odometry at {}", modality, index);
                None
            }
        };

        let window_start = self.timestamp_of(prev).unwrap_or(timestamp);
        let imu_samples =
            self.imu
                .lock()
                .integrate_range(&mut self.integrator, window_start, timestamp);

        let prev_state = NavState::new(
            self.solver.estimate::<SE3>(Key::Pose(prev))?,
            self.solver.estimate::<Vector3<f64>>(Key::Velocity(prev))?,
        );
        let prev_bias: ImuBias = self.solver.estimate(Key::Bias(prev))?;
        let predicted = self.integrator.predict(&prev_state, &prev_bias);
        factors.push(Factor::combined_imu(
            prev,
            index,
            self.integrator.snapshot(),
            &self.config.imu.noise,
        ));

        let mut values = Values::new();
        values.insert_pose(index, predicted.pose);
        values.insert_velocity(index, predicted.velocity);
        values.insert_bias(index, prev_bias);
        self.solver.update(factors, values)?;

        self.current = index;
        self.timestamps.push(timestamp);
        let bias: ImuBias = self.solver.estimate(Key::Bias(index))?;
        self.integrator.reset_and_rebias(bias);
        self.cursors[modality].set(index, pose);
        self.stats.extensions += 1;

        debug!(
            "[FusionEngine] Extended to state {} with {} odometry ({} IMU samples over {:.3}s)",
            index,
            modality,
            imu_samples,
            timestamp - window_start
        );
        Ok(UpdateOutcome::Extended {
            index,
            chained_from,
            imu_samples,
        })
    }

    fn attach_without_imu(
        &mut self,
        modality: Modality,
        pose: SE3,
        noise: NoiseModel,
    ) -> Result<UpdateOutcome, SolverError> {
        let current = self.current;

        match self.cursors[modality].anchor() {
            Some((from, last_pose)) if from < current => {
                let factor = Factor::Between {
                    from,
                    to: current,
                    measured: last_pose.between(&pose),
                    noise,
                };
                self.solver.update(vec![factor], Values::new())?;
                self.cursors[modality].set(current, pose);
                self.reseed_after_odometry_solve()?;
                self.stats.chains += 1;

                debug!(
                    "[FusionEngine] Added {} between factor without IMU: {} -> {}",
                    modality, from, current
                );
                Ok(UpdateOutcome::Chained {
                    index: current,
                    from,
                })
            }
            None => {
                let factor = self.secondary_prior(current, &pose);
                self.solver.update(vec![factor], Values::new())?;
                self.cursors[modality].set(current, pose);
                self.reseed_after_odometry_solve()?;
                self.stats.anchors += 1;

                info!("[FusionEngine] Added prior on {} odometry at {}", modality, current);
                Ok(UpdateOutcome::Anchored { index: current })
            }
            Some(_) => {
                debug!(
                    "[FusionEngine] Not enough time between IMU measurements, {} odometry stays at {}",
                    modality, current
                );
                self.stats.unchanged += 1;
                Ok(UpdateOutcome::Unchanged)
            }
        }
    }

    fn reseed_after_odometry_solve(&mut self) -> Result<(), SolverError> {
        if self.config.bias_reseed == BiasReseedPolicy::EverySolve {
            let bias: ImuBias = self.solver.estimate(Key::Bias(self.current))?;
            self.integrator.reset_and_rebias(bias);
        }
        Ok(())
    }

    fn publish(&self) {
        let Some(latest) = self.latest_pose() else {
            return;
        };
        self.publisher.publish_latest(&latest);
        if self.config.publish_path {
            self.publisher.publish_path(&self.path());
        }
    }
}
