//! Test helpers: a runtime with a controllable wall clock.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::runtime::{
    Runtime,
    UnixTimestamp,
};

/// Tokio-backed runtime whose wall clock starts at a fixed epoch and only
/// moves when the test advances it. Pair with
/// `#[tokio::test(start_paused = true)]` when sleeps matter.
#[derive(Clone)]
pub struct TestRuntime {
    now: Arc<Mutex<UnixTimestamp>>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self {
            // An arbitrary but readable fixed epoch: 2024-01-01T00:00:00Z.
            now: Arc::new(Mutex::new(UnixTimestamp::from_millis(1_704_067_200_000))),
        }
    }

    pub fn advance_time(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Runtime for TestRuntime {
    fn spawn(
        &self,
        _name: &'static str,
        fut: impl Future<Output = ()> + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(fut)
    }

    fn wait(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn unix_timestamp(&self) -> UnixTimestamp {
        *self.now.lock()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut dyn rand::RngCore) -> T) -> T {
        let mut rng = rand::rng();
        f(&mut rng)
    }
}
