//! Inertial measurement handling: samples, buffering and preintegration.

pub mod buffer;
pub mod preintegration;
pub mod sample;
pub mod types;

pub use buffer::ImuBuffer;
pub use preintegration::{PreintegratedState, Preintegrator};
pub use sample::{ImuBias, ImuNoise, ImuSample, NavState, GRAVITY};
