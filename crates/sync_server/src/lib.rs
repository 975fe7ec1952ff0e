//! The server sync engine: validates pushes, applies table handlers inside
//! serialized per-partition commit appends, serves pulls and snapshot
//! chunks, and publishes advisory wake signals.

use std::{
    collections::HashMap,
    sync::Arc,
};

use common::{
    persistence::ServerPersistence,
    runtime::Runtime,
};
use parking_lot::Mutex;
use storage::Storage;
use sync_types::{
    ActorId,
    ClientId,
    PartitionId,
    SchemaVersion,
};
use tokio::sync::broadcast;

pub mod chunk_store;
pub mod handlers;
mod metrics;
mod push;
mod pull;
mod wake;

pub use crate::{
    chunk_store::SnapshotChunkStore,
    handlers::{
        EmittedChange,
        HandlerRegistry,
        JsonTableHandler,
        OpApplication,
        RowReads,
        ScopeResolverFn,
        SnapshotPage,
        SnapshotRequest,
        TableHandler,
    },
    wake::WakeBroadcast,
};

/// Per-request authenticated context. The transport authenticates the actor
/// and client before the engine sees a request.
#[derive(Clone, Debug)]
pub struct SyncContext {
    pub actor_id: ActorId,
    pub client_id: ClientId,
    pub partition_id: PartitionId,
}

impl SyncContext {
    pub fn new(
        actor_id: impl Into<ActorId>,
        client_id: impl Into<ClientId>,
        partition_id: PartitionId,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            client_id: client_id.into(),
            partition_id,
        }
    }
}

pub struct SyncularServer<RT: Runtime> {
    pub(crate) rt: RT,
    pub(crate) persistence: Arc<dyn ServerPersistence>,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) chunk_store: SnapshotChunkStore<RT>,
    pub(crate) wake: WakeBroadcast,
    pub(crate) schema_version: SchemaVersion,
    pub(crate) partition_locks: Mutex<HashMap<PartitionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<RT: Runtime> SyncularServer<RT> {
    pub fn new(
        rt: RT,
        persistence: Arc<dyn ServerPersistence>,
        storage: Arc<dyn Storage>,
        handlers: HandlerRegistry,
        schema_version: SchemaVersion,
    ) -> Self {
        let chunk_store = SnapshotChunkStore::new(rt.clone(), persistence.clone(), storage);
        Self {
            rt,
            persistence,
            handlers,
            chunk_store,
            wake: WakeBroadcast::new(),
            schema_version,
            partition_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    pub fn persistence(&self) -> &Arc<dyn ServerPersistence> {
        &self.persistence
    }

    /// Subscribe to advisory wake signals. Correctness never depends on
    /// delivery.
    pub fn subscribe_wake(&self) -> broadcast::Receiver<sync_types::WakeSignal> {
        self.wake.subscribe()
    }

    /// Collect expired snapshot chunks. Intended for a periodic GC task.
    pub async fn cleanup_expired_chunks(&self) -> anyhow::Result<usize> {
        self.chunk_store.cleanup_expired().await
    }
}

#[cfg(test)]
mod tests;
