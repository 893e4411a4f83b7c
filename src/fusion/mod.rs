//! Multi-modality odometry fusion.

pub mod engine;
pub mod frames;
pub mod measurement;
pub mod modality;

pub use engine::{EngineStats, FusionEngine, SkipReason, UpdateOutcome};
pub use frames::{FrameTransformer, IdentityFrames, StaticFrames};
pub use measurement::{Modality, OdometryMeasurement, StampedPose};
pub use modality::{ModalityCursor, ModalityTable};
