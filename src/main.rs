use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use odometry_fusion::config::FusionConfig;
use odometry_fusion::error::FusionError;
use odometry_fusion::fusion::{IdentityFrames, Modality};
use odometry_fusion::io::euroc::{write_trajectory_csv, EurocSequence};
use odometry_fusion::system::{FusionSystem, LogPublisher, MeasurementSender, PublisherSet};

/// Replay a EuRoC-style sequence through the fusion system.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Sequence root containing imu0/ and odometry/
    #[arg(default_value = "data/euroc/MH_01_easy/mav0")]
    dataset: PathBuf,

    /// Fusion config (defaults to configs/fusion.yaml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where the fused trajectory is written
    #[arg(long, default_value = "fused_trajectory.txt")]
    output: PathBuf,

    /// Replay rate relative to real time; 0 replays as fast as possible
    #[arg(long, default_value_t = 1.0)]
    speed: f64,
}

/// Maps dataset time onto wall-clock time for paced replay.
#[derive(Clone, Copy)]
struct ReplayClock {
    wall_start: Instant,
    data_start_ns: u64,
    speed: f64,
}

impl ReplayClock {
    fn wait_until(&self, timestamp_ns: u64) {
        if self.speed <= 0.0 {
            return;
        }
        let elapsed = timestamp_ns.saturating_sub(self.data_start_ns) as f64 * 1e-9;
        let target = self.wall_start + Duration::from_secs_f64(elapsed / self.speed);
        let now = Instant::now();
        if target > now {
            thread::sleep(target - now);
        }
    }
}

fn replay_odometry(
    sequence: &EurocSequence,
    modality: Modality,
    sender: MeasurementSender,
    clock: ReplayClock,
) -> usize {
    let mut sent = 0;
    for (entry, measurement) in sequence
        .odometry(modality)
        .iter()
        .zip(sequence.measurements(modality))
    {
        clock.wait_until(entry.timestamp_ns);
        match sender.send(measurement) {
            Ok(()) => sent += 1,
            Err(FusionError::Backpressure { .. }) => {}
            Err(e) => {
                warn!("Stopping {} replay: {}", modality, e);
                break;
            }
        }
    }
    sent
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => FusionConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FusionConfig::load_default().context("Failed to load default config")?,
    };

    info!("Loading dataset from: {}", args.dataset.display());
    let sequence = EurocSequence::load(&args.dataset)?;
    let Some(data_start_ns) = sequence.start_ns() else {
        bail!("Dataset {} is empty", args.dataset.display());
    };

    let mut system = FusionSystem::with_collaborators(
        config,
        Arc::new(IdentityFrames),
        PublisherSet::new(vec![Arc::new(LogPublisher)]),
    );
    let clock = ReplayClock {
        wall_start: Instant::now(),
        data_start_ns,
        speed: args.speed,
    };

    // One producer per stream, as the sensors would deliver them
    let (imu_sent, visual_sent, lidar_sent) = thread::scope(|s| {
        let imu = {
            let sink = system.imu_sink();
            let sequence = &sequence;
            s.spawn(move || {
                let mut sent = 0usize;
                for entry in &sequence.imu {
                    clock.wait_until(entry.timestamp_ns);
                    if sink.add(entry.sample).is_ok() {
                        sent += 1;
                    }
                }
                sent
            })
        };
        let visual = {
            let sender = system.sender();
            let sequence = &sequence;
            s.spawn(move || replay_odometry(sequence, Modality::VisualOdometry, sender, clock))
        };
        let lidar = {
            let sender = system.sender();
            let sequence = &sequence;
            s.spawn(move || replay_odometry(sequence, Modality::LidarOdometry, sender, clock))
        };
        (
            imu.join().unwrap_or(0),
            visual.join().unwrap_or(0),
            lidar.join().unwrap_or(0),
        )
    });

    system.shutdown();

    let stats = system.sequencer_stats();
    info!(
        "Replayed {} IMU samples, {} visual and {} lidar measurements ({} rejected, {} skipped)",
        imu_sent, visual_sent, lidar_sent, stats.rejected, stats.skipped
    );
    let evicted = system.evicted_imu_samples();
    if evicted > 0 {
        warn!("{} IMU samples evicted by buffer retention", evicted);
    }
    if let Some(fatal) = system.fatal_error() {
        error!("Fusion halted: {}", fatal);
    }

    let path = system.path();
    write_trajectory_csv(&args.output, &path)?;
    info!("Wrote {} fused poses to {}", path.len(), args.output.display());

    if system.is_halted() {
        bail!("Fusion halted before the end of the dataset");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let args = Args::try_parse_from(["odometry-fusion"]).unwrap();
        assert_eq!(args.dataset, PathBuf::from("data/euroc/MH_01_easy/mav0"));
        assert!(args.config.is_none());
        assert_eq!(args.output, PathBuf::from("fused_trajectory.txt"));
        assert_eq!(args.speed, 1.0);
    }

    #[test]
    fn test_cli_options() {
        let args = Args::try_parse_from([
            "odometry-fusion",
            "seq/mav0",
            "--config",
            "fusion.yaml",
            "--output",
            "out.txt",
            "--speed",
            "0",
        ])
        .unwrap();
        assert_eq!(args.dataset, PathBuf::from("seq/mav0"));
        assert_eq!(args.config, Some(PathBuf::from("fusion.yaml")));
        assert_eq!(args.output, PathBuf::from("out.txt"));
        assert_eq!(args.speed, 0.0);

        assert!(Args::try_parse_from(["odometry-fusion", "--speed", "fast"]).is_err());
        assert!(Args::try_parse_from(["odometry-fusion", "--bogus"]).is_err());
    }
}
