//! Fusion configuration loaded from YAML.
//!
//! Every section falls back to its defaults, so a file only needs to list
//! the values it changes.

use std::path::Path;

use nalgebra::Vector3;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::fusion::Modality;
use crate::imu::buffer::DEFAULT_MAX_SAMPLES;
use crate::imu::{ImuNoise, GRAVITY};
use crate::solver::LmSolverConfig;

/// Default location used by [`FusionConfig::load_default`].
pub const DEFAULT_CONFIG_PATH: &str = "configs/fusion.yaml";

/// What the sequencer does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Producer waits for space.
    #[default]
    Block,
    /// Measurement is dropped and counted.
    Reject,
}

/// When the integrator bias is refreshed from the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasReseedPolicy {
    /// Only after a state extension with an inertial factor.
    #[default]
    ImuExtensionOnly,
    /// After every successful solve, including odometry-only updates.
    EverySolve,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Pending measurements held before producers block or are rejected.
    pub capacity: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: 3,
            backpressure: BackpressurePolicy::Block,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuSection {
    pub noise: ImuNoise,
    /// World-frame gravity (m/s^2).
    pub gravity: [f64; 3],
    /// Buffered samples kept while no odometry consumes them.
    pub max_buffered_samples: usize,
}

impl Default for ImuSection {
    fn default() -> Self {
        Self {
            noise: ImuNoise::default(),
            gravity: [GRAVITY.x, GRAVITY.y, GRAVITY.z],
            max_buffered_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

impl ImuSection {
    pub fn gravity(&self) -> Vector3<f64> {
        Vector3::from(self.gravity)
    }
}

/// Priors installed on the first state and on late-joining modalities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorSection {
    /// Pose prior sigmas `[rx, ry, rz, tx, ty, tz]` on the first state.
    pub pose_sigmas: [f64; 6],
    pub velocity_sigma: f64,
    pub bias_sigma: f64,
    /// Pose prior sigmas for a modality's first contribution after bootstrap.
    pub secondary_pose_sigmas: [f64; 6],
}

impl Default for PriorSection {
    fn default() -> Self {
        Self {
            pose_sigmas: [1e-4; 6],
            velocity_sigma: 0.1,
            bias_sigma: 2.0,
            secondary_pose_sigmas: [0.01; 6],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalitySection {
    /// Between-factor variances `[rx, ry, rz, tx, ty, tz]`.
    pub variances: [f64; 6],
    /// Whether poses must go through the frame transformer first.
    pub requires_frame_conversion: bool,
}

impl Default for ModalitySection {
    fn default() -> Self {
        Self {
            variances: [0.1; 6],
            requires_frame_conversion: false,
        }
    }
}

impl ModalitySection {
    fn lidar() -> Self {
        Self {
            variances: [0.2; 6],
            requires_frame_conversion: true,
        }
    }
}

/// Fields present in a modality section; absent ones keep the base values.
#[derive(Debug, Default, Deserialize)]
struct ModalityOverrides {
    variances: Option<[f64; 6]>,
    requires_frame_conversion: Option<bool>,
}

impl ModalityOverrides {
    fn apply(self, base: ModalitySection) -> ModalitySection {
        ModalitySection {
            variances: self.variances.unwrap_or(base.variances),
            requires_frame_conversion: self
                .requires_frame_conversion
                .unwrap_or(base.requires_frame_conversion),
        }
    }
}

fn default_lidar() -> ModalitySection {
    ModalitySection::lidar()
}

/// Merge a (possibly partial or empty) `lidar:` section onto the lidar defaults.
fn lidar_section<'de, D>(deserializer: D) -> Result<ModalitySection, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = Option::<ModalityOverrides>::deserialize(deserializer)?;
    Ok(overrides.unwrap_or_default().apply(ModalitySection::lidar()))
}

fn default_true() -> bool {
    true
}

/// Full fusion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default)]
    pub queue: QueueSection,

    #[serde(default)]
    pub imu: ImuSection,

    #[serde(default)]
    pub priors: PriorSection,

    /// Visual odometry noise and frame handling.
    #[serde(default)]
    pub visual: ModalitySection,

    /// Lidar odometry noise and frame handling.
    #[serde(default = "default_lidar", deserialize_with = "lidar_section")]
    pub lidar: ModalitySection,

    #[serde(default)]
    pub solver: LmSolverConfig,

    #[serde(default)]
    pub bias_reseed: BiasReseedPolicy,

    /// Publish the whole refined path after each extension, not only the
    /// newest pose.
    #[serde(default = "default_true")]
    pub publish_path: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            queue: QueueSection::default(),
            imu: ImuSection::default(),
            priors: PriorSection::default(),
            visual: ModalitySection::default(),
            lidar: ModalitySection::lidar(),
            solver: LmSolverConfig::default(),
            bias_reseed: BiasReseedPolicy::default(),
            publish_path: true,
        }
    }
}

impl FusionConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load from [`DEFAULT_CONFIG_PATH`], or defaults if it does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn modality(&self, modality: Modality) -> &ModalitySection {
        match modality {
            Modality::VisualOdometry => &self.visual,
            Modality::LidarOdometry => &self.lidar,
        }
    }
}
