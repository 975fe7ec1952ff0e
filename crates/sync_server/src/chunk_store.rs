//! Snapshot chunk store.
//!
//! Chunk metadata lives in the relational store; bodies live in the
//! content-addressed blob substrate under a key derived from
//! `(encoding, compression, sha256)`, so scopes that happen to produce the
//! same bytes share one stored body. Expiry is soft: `find_chunk` stops
//! returning an expired chunk, but an id already handed out keeps working
//! until `cleanup_expired` collects the row.

use std::sync::Arc;

use bytes::Bytes;
use common::{
    knobs::SNAPSHOT_CHUNK_TTL,
    persistence::{
        ChunkKey,
        ServerPersistence,
        SnapshotChunkRow,
    },
    runtime::Runtime,
};
use errors::ErrorMetadata;
use storage::{
    ObjectKey,
    Storage,
};
use sync_types::{
    derived_body_key,
    encode_chunk_frame,
    ChunkCompression,
    ChunkEncoding,
    ChunkId,
    ChunkRef,
};

use crate::{
    handlers::{
        SnapshotRequest,
        TableHandler,
    },
    metrics,
    SyncContext,
};

/// Frame shape served to every client. One knob short of configurable;
/// clients negotiate nothing and verify the declared sha256 either way.
pub const CHUNK_ENCODING: ChunkEncoding = ChunkEncoding::Json;
pub const CHUNK_COMPRESSION: ChunkCompression = ChunkCompression::Gzip;

pub struct SnapshotChunkStore<RT: Runtime> {
    rt: RT,
    persistence: Arc<dyn ServerPersistence>,
    storage: Arc<dyn Storage>,
}

impl<RT: Runtime> SnapshotChunkStore<RT> {
    pub fn new(
        rt: RT,
        persistence: Arc<dyn ServerPersistence>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            rt,
            persistence,
            storage,
        }
    }

    /// Serve the chunk for a page key, generating and caching it on miss.
    pub async fn get_or_create(
        &self,
        ctx: &SyncContext,
        handler: &Arc<dyn TableHandler>,
        request: &SnapshotRequest,
        key: ChunkKey,
    ) -> anyhow::Result<SnapshotChunkRow> {
        let now = self.rt.unix_timestamp();
        if let Some(existing) = self.persistence.find_chunk(&key, now)? {
            metrics::log_chunk_cache_hit();
            return Ok(existing);
        }

        let page = handler.snapshot(ctx, request)?;
        let frame = encode_chunk_frame(&page.rows, key.encoding, key.compression)?;
        let body_ref = derived_body_key(key.encoding, key.compression, &frame.sha256);
        // Content-addressed: the put is idempotent and bodies identical
        // across scope keys collapse to one object.
        self.storage
            .put(&ObjectKey::from(&body_ref), frame.body)
            .await?;

        let chunk = SnapshotChunkRow {
            chunk_id: ChunkId::generate(),
            key,
            sha256: frame.sha256,
            byte_length: frame.byte_length,
            expires_at: now + *SNAPSHOT_CHUNK_TTL,
            body_ref,
            has_more: page.next_row_cursor.is_some(),
        };
        self.persistence.put_chunk(&chunk)?;
        metrics::log_chunk_built();
        Ok(chunk)
    }

    /// Fetch a chunk body by id. Expiry is not enforced here (find-time
    /// only), so an in-flight bootstrap can finish with ids it already
    /// holds.
    pub async fn read_chunk(&self, chunk_id: &ChunkId) -> anyhow::Result<(SnapshotChunkRow, Bytes)> {
        let chunk = self.persistence.get_chunk(chunk_id)?.ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::bootstrap_expired())
                .context(format!("chunk {chunk_id} not found"))
        })?;
        let body = self
            .storage
            .get(&ObjectKey::from(&chunk.body_ref))
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::bootstrap_expired())
                    .context(format!("chunk {chunk_id} body was collected"))
            })?;
        Ok((chunk, body))
    }

    /// Drop expired chunk metadata and best-effort delete bodies no other
    /// live chunk references. Blob-delete failures are logged and left for
    /// the next pass.
    pub async fn cleanup_expired(&self) -> anyhow::Result<usize> {
        let now = self.rt.unix_timestamp();
        let expired = self.persistence.expired_chunks(now)?;
        if expired.is_empty() {
            return Ok(0);
        }
        let ids: Vec<ChunkId> = expired.iter().map(|c| c.chunk_id.clone()).collect();
        let deleted = self.persistence.delete_chunks(&ids)?;
        for chunk in expired {
            // The body may be shared with a chunk that is still live.
            let still_referenced = self
                .persistence
                .find_chunk(&chunk.key, now)?
                .map(|live| live.body_ref == chunk.body_ref)
                .unwrap_or(false);
            if still_referenced {
                continue;
            }
            if let Err(e) = self
                .storage
                .delete(&ObjectKey::from(&chunk.body_ref))
                .await
            {
                tracing::error!("Failed to delete chunk body {}: {e:#}", chunk.body_ref);
            }
        }
        tracing::info!("Collected {deleted} expired snapshot chunks");
        Ok(deleted)
    }

    pub fn chunk_ref(&self, chunk: &SnapshotChunkRow) -> ChunkRef {
        ChunkRef {
            chunk_id: chunk.chunk_id.clone(),
            encoding: chunk.key.encoding,
            compression: chunk.key.compression,
            sha256: chunk.sha256.clone(),
            byte_length: chunk.byte_length,
            inline_body: None,
        }
    }
}
