//! Geometry utilities: SE3 transforms and SO3 Lie-group helpers.

pub mod se3;
pub mod so3;

pub use se3::SE3;
