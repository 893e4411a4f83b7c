//! Consumers of fused poses.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info};

use crate::fusion::StampedPose;

use super::messages::PublishedUpdate;

/// Receives the freshest pose and the refined path after each accepted
/// measurement. Implementations must not block the fusion worker.
pub trait PosePublisher: Send + Sync {
    fn publish_latest(&self, pose: &StampedPose);

    fn publish_path(&self, path: &[StampedPose]);
}

/// Logs every published pose.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

impl PosePublisher for LogPublisher {
    fn publish_latest(&self, pose: &StampedPose) {
        let t = pose.pose.translation;
        info!(
            "Published updated pose {} at {:.3}s: [{:.3}, {:.3}, {:.3}]",
            pose.index, pose.timestamp, t.x, t.y, t.z
        );
    }

    fn publish_path(&self, path: &[StampedPose]) {
        debug!("Published path with {} poses", path.len());
    }
}

/// Forwards updates over a bounded channel. Updates are dropped when the
/// consumer falls behind.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: Sender<PublishedUpdate>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, Receiver<PublishedUpdate>) {
        let (sender, receiver) = bounded(capacity.max(1));
        (Self { sender }, receiver)
    }

    fn forward(&self, update: PublishedUpdate) {
        match self.sender.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("[ChannelPublisher] Consumer behind, update dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl PosePublisher for ChannelPublisher {
    fn publish_latest(&self, pose: &StampedPose) {
        self.forward(PublishedUpdate::Latest(pose.clone()));
    }

    fn publish_path(&self, path: &[StampedPose]) {
        self.forward(PublishedUpdate::Path(path.to_vec()));
    }
}

/// Fans every update out to several publishers.
#[derive(Clone, Default)]
pub struct PublisherSet {
    publishers: Vec<Arc<dyn PosePublisher>>,
}

impl PublisherSet {
    pub fn new(publishers: Vec<Arc<dyn PosePublisher>>) -> Self {
        Self { publishers }
    }

    pub fn push(&mut self, publisher: Arc<dyn PosePublisher>) {
        self.publishers.push(publisher);
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

impl PosePublisher for PublisherSet {
    fn publish_latest(&self, pose: &StampedPose) {
        for publisher in &self.publishers {
            publisher.publish_latest(pose);
        }
    }

    fn publish_path(&self, path: &[StampedPose]) {
        for publisher in &self.publishers {
            publisher.publish_path(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::solver::StateIndex;

    fn stamped(i: u64) -> StampedPose {
        StampedPose {
            index: StateIndex(i),
            timestamp: i as f64,
            pose: SE3::identity(),
        }
    }

    #[test]
    fn test_channel_publisher_drops_when_full() {
        let (publisher, receiver) = ChannelPublisher::new(1);
        publisher.publish_latest(&stamped(1));
        publisher.publish_latest(&stamped(2));

        assert_eq!(receiver.len(), 1);
        match receiver.try_recv().unwrap() {
            PublishedUpdate::Latest(p) => assert_eq!(p.index, StateIndex(1)),
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[test]
    fn test_publisher_set_fans_out() {
        let (a, rx_a) = ChannelPublisher::new(4);
        let (b, rx_b) = ChannelPublisher::new(4);
        let set = PublisherSet::new(vec![Arc::new(a), Arc::new(b), Arc::new(LogPublisher)]);

        set.publish_path(&[stamped(1), stamped(2)]);

        for rx in [rx_a, rx_b] {
            match rx.try_recv().unwrap() {
                PublishedUpdate::Path(path) => assert_eq!(path.len(), 2),
                other => panic!("unexpected update {:?}", other),
            }
        }
    }
}
