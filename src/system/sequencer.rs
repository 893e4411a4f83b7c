//! Bounded FIFO between measurement producers and the fusion worker.
//!
//! Producers on any thread enqueue odometry measurements; a single worker
//! thread dequeues them in arrival order and hands each to the handler, so
//! the engine never sees two measurements at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::{BackpressurePolicy, QueueSection};
use crate::error::FusionError;
use crate::fusion::{OdometryMeasurement, UpdateOutcome};

use super::shared_state::SharedState;

/// Timeout for receiving measurements (allows periodic shutdown checks).
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
}

/// Snapshot of the sequencer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerStats {
    /// Measurements enqueued.
    pub accepted: u64,
    /// Measurements refused because the queue was full.
    pub rejected: u64,
    /// Measurements handled by the worker, including skipped ones.
    pub processed: u64,
    pub skipped: u64,
}

impl Counters {
    fn snapshot(&self) -> SequencerStats {
        SequencerStats {
            accepted: self.accepted.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }
}

/// Producer handle. Cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct MeasurementSender {
    sender: Sender<OdometryMeasurement>,
    policy: BackpressurePolicy,
    shared: Arc<SharedState>,
    counters: Arc<Counters>,
}

impl MeasurementSender {
    /// Enqueue a measurement.
    ///
    /// With [`BackpressurePolicy::Block`] this waits for queue space; with
    /// [`BackpressurePolicy::Reject`] a full queue returns
    /// [`FusionError::Backpressure`].
    pub fn send(&self, measurement: OdometryMeasurement) -> Result<(), FusionError> {
        if self.shared.is_halted() {
            return Err(FusionError::Halted);
        }
        let modality = measurement.modality;

        match self.policy {
            BackpressurePolicy::Block => self
                .sender
                .send(measurement)
                .map_err(|_| self.closed_error())?,
            BackpressurePolicy::Reject => match self.sender.try_send(measurement) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.counters.rejected.fetch_add(1, Ordering::SeqCst);
                    warn!("Measurement queue full, dropping {} odometry", modality);
                    return Err(FusionError::Backpressure { modality });
                }
                Err(TrySendError::Disconnected(_)) => return Err(self.closed_error()),
            },
        }

        self.counters.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Measurements waiting for the worker.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    fn closed_error(&self) -> FusionError {
        if self.shared.is_halted() {
            FusionError::Halted
        } else {
            FusionError::Disconnected
        }
    }
}

/// Owns the worker thread and its queue.
pub struct MeasurementSequencer {
    sender: MeasurementSender,
    shared: Arc<SharedState>,
    handle: Option<JoinHandle<()>>,
}

impl MeasurementSequencer {
    /// Spawn the worker thread.
    ///
    /// `handler` runs on the worker for each measurement in FIFO order. An
    /// error from it is fatal: it is recorded in `shared`, the system is
    /// marked halted and the worker exits.
    pub fn spawn<H>(queue: &QueueSection, shared: Arc<SharedState>, handler: H) -> Self
    where
        H: FnMut(OdometryMeasurement) -> Result<UpdateOutcome, FusionError> + Send + 'static,
    {
        let (sender, receiver) = bounded::<OdometryMeasurement>(queue.capacity.max(1));
        let counters = Arc::new(Counters::default());

        let handle = {
            let shared = shared.clone();
            let counters = counters.clone();
            thread::spawn(move || run(receiver, shared, counters, handler))
        };

        info!(
            "Measurement sequencer started (capacity {}, {:?} on full)",
            queue.capacity.max(1),
            queue.backpressure
        );
        Self {
            sender: MeasurementSender {
                sender,
                policy: queue.backpressure,
                shared: shared.clone(),
                counters,
            },
            shared,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> MeasurementSender {
        self.sender.clone()
    }

    pub fn send(&self, measurement: OdometryMeasurement) -> Result<(), FusionError> {
        self.sender.send(measurement)
    }

    pub fn stats(&self) -> SequencerStats {
        self.sender.counters.snapshot()
    }

    /// Let the worker drain the queue, then wait for it to exit.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Fusion worker panicked");
            }
        }
    }
}

impl Drop for MeasurementSequencer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker loop: runs until shutdown is requested and the queue is empty,
/// every producer is gone, or the handler fails.
fn run<H>(
    receiver: Receiver<OdometryMeasurement>,
    shared: Arc<SharedState>,
    counters: Arc<Counters>,
    mut handler: H,
) where
    H: FnMut(OdometryMeasurement) -> Result<UpdateOutcome, FusionError>,
{
    loop {
        match receiver.recv_timeout(RECV_TIMEOUT) {
            Ok(measurement) => match handler(measurement) {
                Ok(outcome) => {
                    counters.processed.fetch_add(1, Ordering::SeqCst);
                    if outcome.is_skipped() {
                        counters.skipped.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    error!("Fusion worker stopping: {}", e);
                    shared.record_fatal(e);
                    break;
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                if shared.is_shutdown_requested() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("[Sequencer] Worker exited, {} measurements left in queue", receiver.len());
}
