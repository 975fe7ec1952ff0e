//! Runtime abstraction the engines are generic over.
//!
//! Engine code never calls `tokio::spawn`, `SystemTime::now`, or a global
//! RNG directly; it goes through a [`Runtime`] so tests can control time and
//! randomness. `ProdRuntime` is the tokio-backed implementation.

use std::{
    future::Future,
    ops::Add,
    pin::Pin,
    time::{
        Duration,
        Instant,
        SystemTime,
    },
};

use serde::{
    Deserialize,
    Serialize,
};
use tokio::task::JoinHandle;

/// Wall-clock time as milliseconds since the Unix epoch.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: UnixTimestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        UnixTimestamp(self.0 + rhs.as_millis() as u64)
    }
}

pub trait Runtime: Clone + Send + Sync + 'static {
    /// Spawn a long-lived named task.
    fn spawn(
        &self,
        name: &'static str,
        fut: impl Future<Output = ()> + Send + 'static,
    ) -> JoinHandle<()>;

    /// Sleep for `duration`. Respects paused time under `tokio::test`.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

    fn unix_timestamp(&self) -> UnixTimestamp;

    fn monotonic_now(&self) -> Instant;

    fn with_rng<T>(&self, f: impl FnOnce(&mut dyn rand::RngCore) -> T) -> T;
}

#[derive(Clone)]
pub struct ProdRuntime;

impl ProdRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Runtime for ProdRuntime {
    fn spawn(
        &self,
        name: &'static str,
        fut: impl Future<Output = ()> + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!("task {name} started");
            fut.await;
            tracing::debug!("task {name} exited");
        })
    }

    fn wait(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn unix_timestamp(&self) -> UnixTimestamp {
        let since_epoch = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock is before the Unix epoch");
        UnixTimestamp::from_millis(since_epoch.as_millis() as u64)
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut dyn rand::RngCore) -> T) -> T {
        let mut rng = rand::rng();
        f(&mut rng)
    }
}
