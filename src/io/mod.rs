//! Dataset loading and trajectory export.

pub mod euroc;
