pub mod config;
pub mod error;
pub mod fusion;
pub mod geometry;
pub mod imu;
pub mod io;
pub mod solver;
pub mod system;
