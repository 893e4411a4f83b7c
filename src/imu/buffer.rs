//! Time-ordered store of raw IMU samples awaiting integration.
//!
//! Producers append samples as they arrive; the fusion engine drains the
//! samples of one state interval `(t0, t1]` into a [`Preintegrator`] when an
//! odometry measurement extends the graph. Samples are never integrated
//! before that point, so re-anchoring a window does not double count.
//! Once a window is consumed, samples that arrive late for it are rejected.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::ImuError;

use super::preintegration::Preintegrator;
use super::sample::ImuSample;

/// Default retention (about 100 s at 200 Hz).
pub const DEFAULT_MAX_SAMPLES: usize = 20_000;

#[derive(Debug, Clone)]
pub struct ImuBuffer {
    samples: VecDeque<ImuSample>,
    max_samples: usize,
    evicted: usize,
    /// End of the last consumed window.
    consumed_until: Option<f64>,
}

impl Default for ImuBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_SAMPLES)
    }
}

impl ImuBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that keeps at most `max_samples` samples, dropping the oldest.
    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.max(1),
            evicted: 0,
            consumed_until: None,
        }
    }

    /// Append a sample.
    ///
    /// Samples must arrive in non-decreasing timestamp order. Rejected
    /// samples leave the buffer untouched.
    pub fn add(&mut self, sample: ImuSample) -> Result<(), ImuError> {
        if !sample.is_finite() {
            warn!("Dropping non-finite IMU sample");
            return Err(ImuError::NonFinite);
        }
        if let Some(consumed) = self.consumed_until {
            if sample.timestamp_s <= consumed {
                warn!(
                    "Got IMU sample at {:.6}s for an already integrated window (up to {:.6}s)",
                    sample.timestamp_s, consumed
                );
                return Err(ImuError::OutOfOrder {
                    timestamp: sample.timestamp_s,
                    last: consumed,
                });
            }
        }
        if let Some(last) = self.newest_timestamp() {
            if sample.timestamp_s < last {
                warn!(
                    "Got out of order IMU sample at {:.6}s (newest buffered {:.6}s)",
                    sample.timestamp_s, last
                );
                return Err(ImuError::OutOfOrder {
                    timestamp: sample.timestamp_s,
                    last,
                });
            }
        }

        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
            self.evicted += 1;
            if self.evicted % 1000 == 1 {
                warn!(
                    "[ImuBuffer] Retention full ({} samples), {} evicted so far",
                    self.max_samples, self.evicted
                );
            }
        }
        self.samples.push_back(sample);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        self.samples.back().map(|s| s.timestamp_s)
    }

    pub fn oldest_timestamp(&self) -> Option<f64> {
        self.samples.front().map(|s| s.timestamp_s)
    }

    /// Number of samples dropped because the retention limit was reached.
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    /// Index of the first sample with timestamp strictly greater than `t`.
    fn first_after(&self, t: f64) -> usize {
        self.samples.partition_point(|s| s.timestamp_s <= t)
    }

    /// Number of samples with timestamp in `(t0, t1]`.
    pub fn count_in_range(&self, t0: f64, t1: f64) -> usize {
        if t1 <= t0 {
            return 0;
        }
        self.first_after(t1) - self.first_after(t0)
    }

    /// Whether at least one sample lies in `(t0, t1]`.
    pub fn has_samples_in_range(&self, t0: f64, t1: f64) -> bool {
        self.count_in_range(t0, t1) > 0
    }

    /// Feed every sample in `(t0, t1]` into `integrator` and retire all
    /// samples up to `t1`. Returns the number of samples integrated.
    ///
    /// The integrator is anchored at `t0` so the first step spans from the
    /// previous state time to the first sample. The last sample is held
    /// until `t1` so the window covers the whole interval.
    pub fn integrate_range(&mut self, integrator: &mut Preintegrator, t0: f64, t1: f64) -> usize {
        let start = self.first_after(t0);
        let end = self.first_after(t1);

        integrator.anchor(t0);
        let mut integrated = 0;
        if end > start {
            for sample in self.samples.range(start..end) {
                match integrator.integrate_sample(sample) {
                    Ok(()) => integrated += 1,
                    Err(e) => warn!("Skipping IMU sample during integration: {}", e),
                }
            }
            if let Some(last) = self.samples.get(end - 1) {
                if last.timestamp_s < t1 {
                    let held = ImuSample::new(t1, last.accel, last.gyro);
                    if let Err(e) = integrator.integrate_sample(&held) {
                        warn!("Could not extend IMU window to {:.6}s: {}", t1, e);
                    }
                }
            }
        }

        self.samples.drain(..end);
        self.mark_consumed(t1);
        debug!(
            "[ImuBuffer] Integrated {} samples over ({:.6}, {:.6}], {} remain",
            integrated,
            t0,
            t1,
            self.samples.len()
        );
        integrated
    }

    /// Drop all samples with timestamp at or before `t`.
    pub fn discard_until(&mut self, t: f64) -> usize {
        let end = self.first_after(t);
        self.samples.drain(..end);
        self.mark_consumed(t);
        end
    }

    fn mark_consumed(&mut self, t: f64) {
        self.consumed_until = Some(self.consumed_until.map_or(t, |c| c.max(t)));
    }
}
