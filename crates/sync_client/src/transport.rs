//! The narrow seam between the client engine and the network.
//!
//! An `Err` from any method is a transport-level failure (unreachable,
//! timed out, 429/503 with an `Overloaded` classification) and is always
//! retried with backoff. Protocol-level outcomes, including per-operation
//! errors, travel inside the response types.

use async_trait::async_trait;
use bytes::Bytes;
use sync_types::{
    ChunkId,
    PullRequest,
    PullResponse,
    PushRequest,
    PushResponse,
    WakeSignal,
};
use tokio::sync::broadcast;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(&self, request: PushRequest) -> anyhow::Result<PushResponse>;

    async fn pull(&self, request: PullRequest) -> anyhow::Result<PullResponse>;

    /// Fetch a snapshot chunk body by id (the bootstrap "second GET").
    async fn fetch_chunk(&self, chunk_id: &ChunkId) -> anyhow::Result<Bytes>;

    /// Advisory wake channel, when the transport has one. The engine never
    /// depends on it; absent or lossy channels only cost latency.
    fn wake_signals(&self) -> Option<broadcast::Receiver<WakeSignal>> {
        None
    }
}
