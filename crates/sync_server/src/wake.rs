//! Advisory wake notifications.
//!
//! After a commit is appended, interested clients get a `(partition, seq)`
//! signal over a broadcast channel. Delivery is best effort: lagging
//! receivers lose signals and correctness never depends on one arriving —
//! the pull loop owns the cursor.

use common::knobs::WAKE_CHANNEL_CAPACITY;
use sync_types::WakeSignal;
use tokio::sync::broadcast;

use crate::metrics;

#[derive(Clone)]
pub struct WakeBroadcast {
    sender: broadcast::Sender<WakeSignal>,
}

impl WakeBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(*WAKE_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, signal: WakeSignal) {
        // No receivers is fine; nobody is listening right now.
        if self.sender.send(signal).is_ok() {
            metrics::log_wake_published();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WakeSignal> {
        self.sender.subscribe()
    }
}
