//! EuRoC-style dataset replay.
//!
//! Layout under the sequence root:
//!
//! ```text
//! imu0/data.csv                        ts_ns, gyro xyz, accel xyz
//! odometry/visual.csv                  ts_ns, p xyz, q wxyz      (optional)
//! odometry/lidar.csv                   ts_ns, p xyz, q wxyz      (optional)
//! state_groundtruth_estimate0/data.csv used as visual odometry if neither
//!                                      odometry file exists
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use nalgebra::Vector3;
use tracing::{info, warn};

use crate::fusion::{Modality, OdometryMeasurement, StampedPose};
use crate::geometry::SE3;
use crate::imu::ImuSample;

#[derive(Debug, Clone)]
pub struct ImuEntry {
    pub timestamp_ns: u64,
    pub sample: ImuSample,
}

#[derive(Debug, Clone)]
pub struct OdometryEntry {
    pub timestamp_ns: u64,
    pub pose: SE3,
}

impl OdometryEntry {
    pub fn timestamp_s(&self) -> f64 {
        ns_to_s(self.timestamp_ns)
    }
}

fn ns_to_s(ns: u64) -> f64 {
    ns as f64 * 1e-9
}

/// One replayable sequence: an inertial stream plus per-modality odometry.
#[derive(Debug)]
pub struct EurocSequence {
    root: PathBuf,
    pub imu: Vec<ImuEntry>,
    pub visual: Vec<OdometryEntry>,
    pub lidar: Vec<OdometryEntry>,
}

impl EurocSequence {
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let imu = load_imu_csv(&root.join("imu0/data.csv"))?;

        let mut visual = load_optional(&root.join("odometry/visual.csv"))?;
        let lidar = load_optional(&root.join("odometry/lidar.csv"))?;

        if visual.is_empty() && lidar.is_empty() {
            let gt_path = root.join("state_groundtruth_estimate0/data.csv");
            warn!(
                "No odometry files under {}, replaying ground truth as visual odometry",
                root.display()
            );
            visual = load_groundtruth_csv(&gt_path)?;
        }
        if visual.is_empty() && lidar.is_empty() {
            bail!("No odometry measurements found in {}", root.display());
        }

        info!(
            "Loaded {} IMU samples, {} visual and {} lidar odometry entries from {}",
            imu.len(),
            visual.len(),
            lidar.len(),
            root.display()
        );
        Ok(Self {
            root,
            imu,
            visual,
            lidar,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn odometry(&self, modality: Modality) -> &[OdometryEntry] {
        match modality {
            Modality::VisualOdometry => &self.visual,
            Modality::LidarOdometry => &self.lidar,
        }
    }

    /// Odometry of one modality as measurements, in file order.
    pub fn measurements(&self, modality: Modality) -> Vec<OdometryMeasurement> {
        self.odometry(modality)
            .iter()
            .map(|e| OdometryMeasurement::new(modality, e.timestamp_s(), e.pose.clone()))
            .collect()
    }

    /// Earliest timestamp across all streams, in nanoseconds.
    pub fn start_ns(&self) -> Option<u64> {
        let imu = self.imu.first().map(|e| e.timestamp_ns);
        let visual = self.visual.first().map(|e| e.timestamp_ns);
        let lidar = self.lidar.first().map(|e| e.timestamp_ns);
        [imu, visual, lidar].into_iter().flatten().min()
    }
}

fn reader(csv_path: &Path) -> Result<csv::Reader<std::fs::File>> {
    ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))
}

fn load_optional(csv_path: &Path) -> Result<Vec<OdometryEntry>> {
    if csv_path.exists() {
        load_odometry_csv(csv_path)
    } else {
        Ok(Vec::new())
    }
}

fn vector_at(rec: &StringRecord, first: usize) -> Result<Vector3<f64>> {
    Ok(Vector3::new(
        rec[first].parse()?,
        rec[first + 1].parse()?,
        rec[first + 2].parse()?,
    ))
}

/// Position followed by a w-first quaternion starting at column `first`.
fn pose_at(rec: &StringRecord, first: usize) -> Result<SE3> {
    let position = vector_at(rec, first)?;
    let qw: f64 = rec[first + 3].parse()?;
    let qx: f64 = rec[first + 4].parse()?;
    let qy: f64 = rec[first + 5].parse()?;
    let qz: f64 = rec[first + 6].parse()?;
    Ok(SE3::from_quaternion(qw, qx, qy, qz, position))
}

pub fn load_imu_csv(csv_path: &Path) -> Result<Vec<ImuEntry>> {
    let mut rdr = reader(csv_path)?;

    let mut entries = Vec::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec?;
        if rec.len() < 7 {
            continue;
        }
        let ts: u64 = rec[0]
            .parse()
            .with_context(|| format!("{}: bad timestamp on record {}", csv_path.display(), line + 1))?;
        let gyro = vector_at(&rec, 1)?;
        let accel = vector_at(&rec, 4)?;
        entries.push(ImuEntry {
            timestamp_ns: ts,
            sample: ImuSample::new(ns_to_s(ts), accel, gyro),
        });
    }
    Ok(entries)
}

pub fn load_odometry_csv(csv_path: &Path) -> Result<Vec<OdometryEntry>> {
    let mut rdr = reader(csv_path)?;

    let mut entries = Vec::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec?;
        if rec.len() < 8 {
            continue;
        }
        let ts: u64 = rec[0]
            .parse()
            .with_context(|| format!("{}: bad timestamp on record {}", csv_path.display(), line + 1))?;
        entries.push(OdometryEntry {
            timestamp_ns: ts,
            pose: pose_at(&rec, 1)?,
        });
    }
    Ok(entries)
}

/// Ground-truth poses; the velocity and bias columns are ignored.
pub fn load_groundtruth_csv(csv_path: &Path) -> Result<Vec<OdometryEntry>> {
    let mut rdr = reader(csv_path)?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        // timestamp, p_RS_R xyz, q_RS wxyz
        if rec.len() < 8 {
            continue;
        }
        let ts: u64 = rec[0].parse()?;
        entries.push(OdometryEntry {
            timestamp_ns: ts,
            pose: pose_at(&rec, 1)?,
        });
    }
    Ok(entries)
}

/// Write `path` as `timestamp tx ty tz qx qy qz qw` rows (TUM order).
pub fn write_trajectory_csv(csv_path: &Path, path: &[StampedPose]) -> Result<()> {
    if let Some(parent) = csv_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let mut wtr = WriterBuilder::new()
        .delimiter(b' ')
        .from_path(csv_path)
        .with_context(|| format!("Failed to create {}", csv_path.display()))?;

    wtr.write_record(["#timestamp", "tx", "ty", "tz", "qx", "qy", "qz", "qw"])?;
    for stamped in path {
        let t = stamped.pose.translation;
        let q = stamped.pose.rotation;
        wtr.write_record(&[
            format!("{:.9}", stamped.timestamp),
            format!("{:.9}", t.x),
            format!("{:.9}", t.y),
            format!("{:.9}", t.z),
            format!("{:.9}", q.i),
            format!("{:.9}", q.j),
            format!("{:.9}", q.k),
            format!("{:.9}", q.w),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::StateIndex;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use std::fs;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    const IMU_CSV: &str = "\
#timestamp [ns],w_RS_S_x,w_RS_S_y,w_RS_S_z,a_RS_S_x,a_RS_S_y,a_RS_S_z
1000000000,0.1,0.2,0.3,0.0,0.0,9.81
1005000000, 0.1, 0.2, 0.3, 0.0, 0.0, 9.81
";

    #[test]
    fn test_load_imu_csv_splits_gyro_and_accel() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "imu0/data.csv", IMU_CSV);

        let imu = load_imu_csv(&dir.path().join("imu0/data.csv")).unwrap();

        assert_eq!(imu.len(), 2);
        assert_eq!(imu[1].timestamp_ns, 1_005_000_000);
        assert_relative_eq!(imu[1].sample.timestamp_s, 1.005, epsilon = 1e-12);
        assert_eq!(imu[0].sample.gyro, Vector3::new(0.1, 0.2, 0.3));
        assert_eq!(imu[0].sample.accel, Vector3::new(0.0, 0.0, 9.81));
    }

    #[test]
    fn test_sequence_prefers_odometry_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "imu0/data.csv", IMU_CSV);
        write(
            dir.path(),
            "odometry/lidar.csv",
            "# ts,px,py,pz,qw,qx,qy,qz\n1000000000,1.0,2.0,3.0,1.0,0.0,0.0,0.0\n",
        );

        let seq = EurocSequence::load(dir.path()).unwrap();

        assert!(seq.visual.is_empty());
        let lidar = seq.measurements(Modality::LidarOdometry);
        assert_eq!(lidar.len(), 1);
        assert_eq!(lidar[0].modality, Modality::LidarOdometry);
        assert_eq!(lidar[0].pose.translation, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(seq.start_ns(), Some(1_000_000_000));
    }

    #[test]
    fn test_sequence_falls_back_to_groundtruth() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "imu0/data.csv", IMU_CSV);
        write(
            dir.path(),
            "state_groundtruth_estimate0/data.csv",
            "1000000000,0.5,0.0,0.0,0.0,0.0,0.0,1.0,0.1,0.0,0.0,0,0,0,0,0,0\n",
        );

        let seq = EurocSequence::load(dir.path()).unwrap();

        assert_eq!(seq.visual.len(), 1);
        let expected = UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::PI);
        assert!(seq.visual[0].pose.rotation.angle_to(&expected) < 1e-9);
    }

    #[test]
    fn test_groundtruth_needs_only_pose_columns() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "gt.csv",
            "#timestamp,px,py,pz,qw,qx,qy,qz\n\
             1000000000,1.0,0.0,0.0,1.0,0.0,0.0,0.0\n\
             1005000000,2.0,0.0,0.0,1.0,0.0,0.0,0.0,0.3,0.0,0.0\n\
             1010000000,3.0,0.0\n",
        );

        let gt = load_groundtruth_csv(&dir.path().join("gt.csv")).unwrap();

        assert_eq!(gt.len(), 2);
        assert_eq!(gt[0].pose.translation, Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(gt[1].timestamp_ns, 1_005_000_000);
    }

    #[test]
    fn test_sequence_without_odometry_fails() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "imu0/data.csv", IMU_CSV);

        assert!(EurocSequence::load(dir.path()).is_err());
    }

    #[test]
    fn test_write_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out/trajectory.txt");
        let path = vec![StampedPose {
            index: StateIndex(1),
            timestamp: 1.5,
            pose: SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, 2.0, 3.0)),
        }];

        write_trajectory_csv(&out, &path).unwrap();

        let contents = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let fields: Vec<f64> = lines[1].split(' ').map(|f| f.parse().unwrap()).collect();
        assert_eq!(fields, vec![1.5, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 1.0]);
    }
}
