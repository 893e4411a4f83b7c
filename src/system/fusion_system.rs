//! Fusion system - main entry point and thread orchestration.
//!
//! `FusionSystem` owns the IMU buffer, the shared state and the measurement
//! sequencer whose worker thread runs the [`FusionEngine`]. IMU samples go
//! straight into the buffer from any thread; odometry measurements are
//! serialized through the sequencer.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::FusionConfig;
use crate::error::{FusionError, ImuError};
use crate::fusion::{
    FrameTransformer, FusionEngine, IdentityFrames, Modality, OdometryMeasurement, StampedPose,
};
use crate::geometry::SE3;
use crate::imu::{ImuBuffer, ImuSample};
use crate::solver::{IncrementalSolver, LmSolver};

use super::publisher::PublisherSet;
use super::sequencer::{MeasurementSender, MeasurementSequencer, SequencerStats};
use super::shared_state::SharedState;

/// Producer handle for inertial samples.
#[derive(Clone)]
pub struct ImuSink {
    buffer: Arc<Mutex<ImuBuffer>>,
}

impl ImuSink {
    /// Append a sample. Samples must arrive in time order and after the
    /// last integrated window.
    pub fn add(&self, sample: ImuSample) -> Result<(), ImuError> {
        self.buffer.lock().add(sample)
    }
}

/// Top-level fusion system.
pub struct FusionSystem {
    config: FusionConfig,
    shared: Arc<SharedState>,
    imu: Arc<Mutex<ImuBuffer>>,
    sequencer: MeasurementSequencer,
}

impl FusionSystem {
    /// Create a system with identity frames that only publishes into its
    /// shared state.
    pub fn new(config: FusionConfig) -> Self {
        Self::with_collaborators(config, Arc::new(IdentityFrames), PublisherSet::default())
    }

    pub fn with_collaborators(
        config: FusionConfig,
        frames: Arc<dyn FrameTransformer>,
        publishers: PublisherSet,
    ) -> Self {
        let solver = LmSolver::new(config.solver.clone());
        Self::with_solver(config, solver, frames, publishers)
    }

    /// Create a system around a custom solver and spawn the worker thread.
    pub fn with_solver<S>(
        config: FusionConfig,
        solver: S,
        frames: Arc<dyn FrameTransformer>,
        mut publishers: PublisherSet,
    ) -> Self
    where
        S: IncrementalSolver + 'static,
    {
        let shared = SharedState::new();
        let imu = Arc::new(Mutex::new(ImuBuffer::with_capacity(
            config.imu.max_buffered_samples,
        )));
        publishers.push(shared.clone());

        let mut engine = FusionEngine::with_solver(
            config.clone(),
            solver,
            imu.clone(),
            frames,
            Arc::new(publishers),
        );
        let sequencer = MeasurementSequencer::spawn(&config.queue, shared.clone(), move |m| {
            engine.process_measurement(m)
        });

        info!("Fusion system started");
        Self {
            config,
            shared,
            imu,
            sequencer,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn add_imu_sample(&self, sample: ImuSample) -> Result<(), ImuError> {
        self.imu.lock().add(sample)
    }

    pub fn imu_sink(&self) -> ImuSink {
        ImuSink {
            buffer: self.imu.clone(),
        }
    }

    pub fn buffered_imu_samples(&self) -> usize {
        self.imu.lock().len()
    }

    /// IMU samples dropped because the buffer hit its retention limit.
    pub fn evicted_imu_samples(&self) -> usize {
        self.imu.lock().evicted()
    }

    /// Enqueue an odometry measurement for the worker.
    pub fn add_measurement(&self, measurement: OdometryMeasurement) -> Result<(), FusionError> {
        self.sequencer.send(measurement)
    }

    pub fn add_odometry(
        &self,
        modality: Modality,
        timestamp: f64,
        pose: SE3,
    ) -> Result<(), FusionError> {
        self.add_measurement(OdometryMeasurement::new(modality, timestamp, pose))
    }

    pub fn sender(&self) -> MeasurementSender {
        self.sequencer.sender()
    }

    pub fn latest_pose(&self) -> Option<StampedPose> {
        self.shared.latest_pose()
    }

    pub fn path(&self) -> Vec<StampedPose> {
        self.shared.path()
    }

    pub fn fatal_error(&self) -> Option<Arc<FusionError>> {
        self.shared.fatal_error()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.is_halted()
    }

    pub fn sequencer_stats(&self) -> SequencerStats {
        self.sequencer.stats()
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Process everything already queued, then stop the worker.
    pub fn shutdown(&mut self) {
        self.sequencer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SolverError;
    use crate::imu::GRAVITY;
    use crate::solver::{Factor, Key, SolveReport, SolverDiagnostics, Value, Values};
    use nalgebra::Vector3;
    use std::time::{Duration, Instant};

    fn stationary(system: &FusionSystem, from: f64, to: f64) {
        let sink = system.imu_sink();
        for k in 1..=10 {
            let t = if k == 10 { to } else { from + (to - from) * k as f64 / 10.0 };
            sink.add(ImuSample::new(t, -GRAVITY, Vector3::zeros())).unwrap();
        }
    }

    #[test]
    fn test_stationary_run_publishes_path() {
        let mut system = FusionSystem::new(FusionConfig::default());
        system
            .add_odometry(Modality::VisualOdometry, 0.0, SE3::identity())
            .unwrap();
        for k in 1..=5 {
            let t = k as f64 * 0.1;
            stationary(&system, t - 0.1, t);
            system
                .add_odometry(Modality::VisualOdometry, t, SE3::identity())
                .unwrap();
        }
        system.shutdown();

        assert!(!system.is_halted());
        let path = system.path();
        assert_eq!(path.len(), 6);
        assert!(path.windows(2).all(|w| w[0].index < w[1].index));
        let latest = system.latest_pose().unwrap();
        assert_eq!(latest.index.0, 6);
        assert!(latest.pose.approx_eq(&SE3::identity(), 1e-6));
        assert_eq!(system.sequencer_stats().processed, 6);
        assert_eq!(system.buffered_imu_samples(), 0);
    }

    #[test]
    fn test_late_imu_sample_rejected_after_window() {
        let mut system = FusionSystem::new(FusionConfig::default());
        system
            .add_odometry(Modality::VisualOdometry, 1.0, SE3::identity())
            .unwrap();
        system.shutdown();

        let err = system
            .add_imu_sample(ImuSample::new(0.5, -GRAVITY, Vector3::zeros()))
            .unwrap_err();
        assert!(matches!(err, ImuError::OutOfOrder { .. }));
    }

    #[test]
    fn test_imu_retention_overflow_is_counted() {
        let mut config = FusionConfig::default();
        config.imu.max_buffered_samples = 4;
        let mut system = FusionSystem::new(config);

        for k in 0..10 {
            system
                .add_imu_sample(ImuSample::new(k as f64 * 0.01, -GRAVITY, Vector3::zeros()))
                .unwrap();
        }

        assert_eq!(system.buffered_imu_samples(), 4);
        assert_eq!(system.evicted_imu_samples(), 6);
        system.shutdown();
    }

    struct BrokenSolver;

    impl IncrementalSolver for BrokenSolver {
        fn update(&mut self, _factors: Vec<Factor>, _values: Values) -> Result<SolveReport, SolverError> {
            Err(SolverError::IndeterminateSystem { key: None })
        }

        fn value(&self, _key: &Key) -> Option<&Value> {
            None
        }

        fn num_factors(&self) -> usize {
            0
        }

        fn num_keys(&self) -> usize {
            0
        }

        fn diagnostics(&self) -> SolverDiagnostics {
            SolverDiagnostics::default()
        }
    }

    #[test]
    fn test_solver_failure_surfaces_and_rejects_input() {
        let system = FusionSystem::with_solver(
            FusionConfig::default(),
            BrokenSolver,
            Arc::new(IdentityFrames),
            PublisherSet::default(),
        );
        system
            .add_odometry(Modality::LidarOdometry, 0.0, SE3::identity())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !system.is_halted() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(system.is_halted());
        assert!(matches!(
            system.fatal_error().as_deref(),
            Some(FusionError::Solver { .. })
        ));
        assert!(matches!(
            system.add_odometry(Modality::LidarOdometry, 0.1, SE3::identity()),
            Err(FusionError::Halted)
        ));
        assert!(system.latest_pose().is_none());
    }
}
