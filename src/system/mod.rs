//! Fusion system orchestration and thread management.
//!
//! This module contains the top-level `FusionSystem`, the measurement
//! sequencer that feeds its worker thread, the shared state clients read
//! estimates from, and the pose publishers.

mod fusion_system;
pub mod messages;
pub mod publisher;
pub mod sequencer;
pub mod shared_state;

pub use fusion_system::{FusionSystem, ImuSink};
pub use messages::PublishedUpdate;
pub use publisher::{ChannelPublisher, LogPublisher, PosePublisher, PublisherSet};
pub use sequencer::{MeasurementSender, MeasurementSequencer, SequencerStats};
pub use shared_state::SharedState;
