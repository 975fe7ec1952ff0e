//! The pull path: incremental change delivery, snapshot bootstrap, and
//! scope-change handling (delta bootstrap on widening, forced resync on
//! contraction).

use bytes::Bytes;
use common::{
    knobs::{
        PULL_MAX_COMMITS,
        SNAPSHOT_CHUNK_ROW_LIMIT,
    },
    persistence::{
        ChunkKey,
        ServerPersistence,
    },
    runtime::Runtime,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use sync_types::{
    BootstrapState,
    ChunkId,
    ChunkRef,
    PullRequest,
    PullResponse,
    ScopeChange,
    ScopeSelector,
    SubscriptionRequest,
    SubscriptionUpdate,
    WireChange,
    WireError,
};

use crate::{
    chunk_store::{
        CHUNK_COMPRESSION,
        CHUNK_ENCODING,
    },
    handlers::{
        SnapshotRequest,
        TableHandler,
    },
    metrics,
    SyncContext,
    SyncularServer,
};

impl<RT: Runtime> SyncularServer<RT> {
    /// Handle one pull. Per-subscription classified failures become
    /// per-subscription error fields; only internal faults propagate.
    pub async fn pull(
        &self,
        ctx: &SyncContext,
        request: &PullRequest,
    ) -> anyhow::Result<PullResponse> {
        let timer = metrics::pull_timer();
        anyhow::ensure!(
            request.client_id == ctx.client_id,
            ErrorMetadata::forbidden("pull client_id does not match the authenticated client")
        );
        let mut subscriptions = Vec::with_capacity(request.subscriptions.len());
        for subscription in &request.subscriptions {
            let update = match self
                .pull_subscription(ctx, subscription, request.limit_snapshot_rows)
                .await
            {
                Ok(update) => update,
                Err(e) => match e.error_metadata() {
                    Some(metadata) => SubscriptionUpdate::error(
                        subscription.id.clone(),
                        WireError {
                            code: metadata.short_msg.to_string(),
                            retriable: metadata.code.is_retriable(),
                            message: metadata.msg.to_string(),
                        },
                    ),
                    None => return Err(e),
                },
            };
            subscriptions.push(update);
        }
        timer.finish();
        Ok(PullResponse { subscriptions })
    }

    async fn pull_subscription(
        &self,
        ctx: &SyncContext,
        subscription: &SubscriptionRequest,
        limit_snapshot_rows: Option<usize>,
    ) -> anyhow::Result<SubscriptionUpdate> {
        let handler = self.handlers.get(&subscription.table)?;
        let resolved = handler.resolve_scopes(ctx)?;
        let effective = subscription.scopes.intersect(&resolved);
        let row_limit = limit_snapshot_rows.unwrap_or(*SNAPSHOT_CHUNK_ROW_LIMIT);

        // The server observes the client's cursor read-only; the record
        // exists to size responses and for operability.
        if let Some(cursor) = subscription.cursor {
            self.persistence
                .advance_client_cursor(&ctx.client_id, &ctx.partition_id, cursor)?;
        }

        // An in-flight bootstrap continues, unless the actor's access
        // contracted underneath it.
        if let Some(token) = &subscription.bootstrap_state {
            let state = BootstrapState::decode(token)
                .map_err(|e| e.context(ErrorMetadata::invalid_request("bad bootstrap token")))?;
            if !state.scopes.is_subset_of(&effective) {
                metrics::log_resync_required();
                return Ok(resync_update(subscription));
            }
            return self
                .serve_bootstrap_page(ctx, subscription, &effective, state, row_limit)
                .await;
        }

        // A subscription with no cursor starts with a full bootstrap.
        let Some(cursor) = subscription.cursor else {
            let as_of = self.persistence.max_commit_seq(&ctx.partition_id)?;
            let state = BootstrapState::initial(as_of, effective.clone());
            return self
                .serve_bootstrap_page(ctx, subscription, &effective, state, row_limit)
                .await;
        };

        // Steady state: compare against the selector last served.
        let previous = self
            .persistence
            .subscription_scopes(&ctx.client_id, &subscription.id)?;
        let change = match &previous {
            Some(previous) => ScopeSelector::change_from(previous, &effective),
            // No record (e.g. cursor predates scope tracking): adopt the
            // current selector as the baseline.
            None => ScopeChange::Unchanged,
        };
        match change {
            ScopeChange::Unchanged => {
                if previous.is_none() {
                    self.persistence.set_subscription_scopes(
                        &ctx.client_id,
                        &subscription.id,
                        &effective,
                    )?;
                }
                self.serve_changes(ctx, subscription, &effective, cursor)
            },
            ScopeChange::Contracted => {
                metrics::log_resync_required();
                tracing::info!(
                    "Subscription {} of {} contracted; forcing resync",
                    subscription.id,
                    ctx.client_id
                );
                Ok(resync_update(subscription))
            },
            ScopeChange::Widened(Some(delta)) if !delta.is_vacuous() => {
                // Bootstrap only the newly covered values. The cursor is
                // preserved, so changes keep flowing from where the client
                // left off once the delta lands.
                let as_of = self.persistence.max_commit_seq(&ctx.partition_id)?;
                let state = BootstrapState::initial(as_of, delta);
                self.serve_bootstrap_page(ctx, subscription, &effective, state, row_limit)
                    .await
            },
            ScopeChange::Widened(_) => {
                // Not enumerable (wildcard growth or multi-dimension move):
                // a full resync is the safe way to cover it.
                metrics::log_resync_required();
                Ok(resync_update(subscription))
            },
        }
    }

    async fn serve_bootstrap_page(
        &self,
        ctx: &SyncContext,
        subscription: &SubscriptionRequest,
        effective: &ScopeSelector,
        state: BootstrapState,
        row_limit: usize,
    ) -> anyhow::Result<SubscriptionUpdate> {
        let handler = self.handlers.get(&subscription.table)?;
        let request = SnapshotRequest {
            scopes: state.scopes.clone(),
            row_cursor: state.row_cursor,
            limit: row_limit,
        };
        let key = ChunkKey {
            partition_id: ctx.partition_id.clone(),
            scope_key: state.scopes.scope_key(),
            table: subscription.table.clone(),
            as_of_commit_seq: state.as_of_commit_seq,
            row_cursor: state.row_cursor,
            row_limit: row_limit as u64,
            encoding: CHUNK_ENCODING,
            compression: CHUNK_COMPRESSION,
        };
        let chunk = self
            .chunk_store
            .get_or_create(ctx, handler, &request, key)
            .await?;
        let chunk_ref = self.chunk_store.chunk_ref(&chunk);

        let next_bootstrap_state = chunk.has_more.then(|| {
            BootstrapState {
                as_of_commit_seq: state.as_of_commit_seq,
                row_cursor: state.row_cursor + row_limit as u64,
                scopes: state.scopes.clone(),
            }
            .encode()
        });
        let new_cursor = if next_bootstrap_state.is_none() {
            // Bootstrap complete: the served selector becomes the baseline
            // for future contraction/widening detection. A delta bootstrap
            // keeps the existing cursor; a fresh one starts at the cut.
            self.persistence
                .set_subscription_scopes(&ctx.client_id, &subscription.id, effective)?;
            Some(subscription.cursor.unwrap_or(state.as_of_commit_seq))
        } else {
            None
        };
        Ok(SubscriptionUpdate {
            id: subscription.id.clone(),
            changes: Vec::new(),
            snapshot_chunk_ref: Some(chunk_ref),
            next_bootstrap_state,
            new_cursor,
            resync_required: false,
            error: None,
        })
    }

    fn serve_changes(
        &self,
        ctx: &SyncContext,
        subscription: &SubscriptionRequest,
        effective: &ScopeSelector,
        cursor: sync_types::CommitSeq,
    ) -> anyhow::Result<SubscriptionUpdate> {
        let commits =
            self.persistence
                .commits_since(&ctx.partition_id, cursor, *PULL_MAX_COMMITS)?;
        let new_cursor = commits
            .last()
            .map(|c| c.commit.commit_seq)
            .unwrap_or(cursor);
        let mut changes = Vec::new();
        for commit in commits {
            for change in commit.changes {
                if change.table != subscription.table {
                    continue;
                }
                if !effective.covers(&change.scopes) {
                    continue;
                }
                changes.push(WireChange {
                    commit_seq: change.commit_seq,
                    change_id: change.change_id,
                    table: change.table,
                    row_id: change.row_id,
                    op: change.op,
                    row_json: change.row_json,
                    row_version: change.row_version,
                    scopes: change.scopes,
                });
            }
        }
        metrics::log_changes_delivered(changes.len());
        Ok(SubscriptionUpdate {
            id: subscription.id.clone(),
            changes,
            snapshot_chunk_ref: None,
            next_bootstrap_state: None,
            new_cursor: Some(new_cursor),
            resync_required: false,
            error: None,
        })
    }

    /// Serve a chunk body by id (the "second GET" of the bootstrap
    /// protocol). Expiry is enforced at find time, not here.
    pub async fn fetch_chunk(
        &self,
        _ctx: &SyncContext,
        chunk_id: &ChunkId,
    ) -> anyhow::Result<(ChunkRef, Bytes)> {
        let (chunk, body) = self.chunk_store.read_chunk(chunk_id).await?;
        Ok((self.chunk_store.chunk_ref(&chunk), body))
    }
}

fn resync_update(subscription: &SubscriptionRequest) -> SubscriptionUpdate {
    SubscriptionUpdate {
        id: subscription.id.clone(),
        changes: Vec::new(),
        snapshot_chunk_ref: None,
        next_bootstrap_state: None,
        new_cursor: None,
        resync_required: true,
        error: None,
    }
}
