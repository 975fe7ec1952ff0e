//! The client sync engine: a durable outbox pushing local commits, and a
//! pull loop that bootstraps subscriptions from snapshot chunks and applies
//! incremental changes in commit order. The pull loop is the sole owner of
//! every cursor; wake signals only shorten the wait.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use common::{
    knobs::{
        BOOTSTRAP_MAX_CHUNK_RETRIES,
        OUTBOX_SENDING_GRACE,
    },
    persistence::{
        ClientPersistence,
        RowWrite,
        StoredRow,
        SubscriptionStateRow,
    },
    runtime::Runtime,
};
use parking_lot::Mutex;
use sync_types::{
    backoff::Backoff,
    decode_chunk_frame,
    ChunkRef,
    ClientCommitId,
    ClientId,
    CommitSeq,
    OpType,
    PartitionId,
    PullRequest,
    SchemaVersion,
    ScopeSelector,
    SubscriptionId,
    SubscriptionRequest,
    SubscriptionUpdate,
    TableName,
    WireChange,
};

mod metrics;
mod outbox;
mod proxy;
mod transport;

pub use crate::{
    outbox::PushOutcome,
    proxy::OutboxMutationSink,
    transport::Transport,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(15);
const PULL_INTERVAL: Duration = Duration::from_secs(30);

/// A declared subscription: which table, through which scopes.
#[derive(Clone, Debug)]
pub struct SubscriptionSpec {
    pub id: SubscriptionId,
    pub table: TableName,
    pub scopes: ScopeSelector,
}

/// What one pull round did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub chunks_applied: usize,
    pub commits_applied: usize,
    pub resyncs: usize,
    pub chunk_failures: usize,
    /// A bootstrap token is still outstanding; pull again.
    pub bootstrapping: bool,
}

impl PullProgress {
    pub fn quiescent(&self) -> bool {
        self.chunks_applied == 0
            && self.commits_applied == 0
            && self.resyncs == 0
            && self.chunk_failures == 0
            && !self.bootstrapping
    }
}

pub struct SyncularClient<RT: Runtime> {
    pub(crate) rt: RT,
    pub(crate) persistence: Arc<dyn ClientPersistence>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) client_id: ClientId,
    pub(crate) partition_id: PartitionId,
    pub(crate) schema_version: SchemaVersion,
    subscriptions: Mutex<Vec<SubscriptionSpec>>,
    /// The `sending` commit this pump instance owns, if any.
    pub(crate) in_flight: Mutex<Option<ClientCommitId>>,
    pub(crate) push_backoff: Mutex<Backoff>,
    pull_backoff: Mutex<Backoff>,
    chunk_backoff: Mutex<Backoff>,
    chunk_retries: Mutex<HashMap<SubscriptionId, u32>>,
}

impl<RT: Runtime> SyncularClient<RT> {
    pub fn new(
        rt: RT,
        persistence: Arc<dyn ClientPersistence>,
        transport: Arc<dyn Transport>,
        client_id: impl Into<ClientId>,
        partition_id: PartitionId,
        schema_version: SchemaVersion,
    ) -> anyhow::Result<Self> {
        // Restart recovery: stale `sending` rows from a previous process go
        // back to `pending` once the grace has passed.
        let now = rt.unix_timestamp();
        persistence.recover_stale_sending(now, *OUTBOX_SENDING_GRACE)?;
        Ok(Self {
            rt,
            persistence,
            transport,
            client_id: client_id.into(),
            partition_id,
            schema_version,
            subscriptions: Mutex::new(Vec::new()),
            in_flight: Mutex::new(None),
            push_backoff: Mutex::new(Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF)),
            pull_backoff: Mutex::new(Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF)),
            chunk_backoff: Mutex::new(Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF)),
            chunk_retries: Mutex::new(HashMap::new()),
        })
    }

    pub fn persistence(&self) -> &Arc<dyn ClientPersistence> {
        &self.persistence
    }

    pub fn subscribe(&self, spec: SubscriptionSpec) {
        self.subscriptions.lock().push(spec);
    }

    /// Local read of a synced table.
    pub fn table_rows(&self, table: &TableName) -> anyhow::Result<Vec<StoredRow>> {
        self.persistence.table_rows(table)
    }

    /// One full cycle: drain the outbox, then pull until quiescent. This is
    /// the unit the background loop (and tests) drive.
    pub async fn sync(&self) -> anyhow::Result<()> {
        self.flush_outbox().await?;
        loop {
            match self.pull_once().await {
                Ok(progress) if progress.quiescent() => return Ok(()),
                Ok(progress) => {
                    // Chunk fetches back off independently of the pull
                    // itself, so a flaky body store does not spin the loop.
                    if progress.chunk_failures > 0 {
                        let delay = self
                            .rt
                            .with_rng(|mut rng| self.chunk_backoff.lock().fail(&mut rng));
                        self.rt.wait(delay).await;
                    }
                },
                Err(e) => {
                    let delay = self
                        .rt
                        .with_rng(|mut rng| self.pull_backoff.lock().fail(&mut rng));
                    tracing::warn!("Pull failed: {e:#}; backing off {delay:?}");
                    self.rt.wait(delay).await;
                },
            }
        }
    }

    /// Issue one pull and apply whatever came back. Never advances a cursor
    /// on failure.
    pub async fn pull_once(&self) -> anyhow::Result<PullProgress> {
        let specs = self.subscriptions.lock().clone();
        if specs.is_empty() {
            return Ok(PullProgress::default());
        }
        let timer = metrics::pull_timer();
        let mut requests = Vec::with_capacity(specs.len());
        for spec in &specs {
            let state = self
                .persistence
                .subscription_state(&spec.id)?
                .unwrap_or_default();
            requests.push(SubscriptionRequest {
                id: spec.id.clone(),
                table: spec.table.clone(),
                scopes: spec.scopes.clone(),
                cursor: state.cursor,
                bootstrap_state: state.bootstrap_state,
            });
        }
        let response = self
            .transport
            .pull(PullRequest {
                client_id: self.client_id.clone(),
                subscriptions: requests,
                limit_snapshot_rows: None,
            })
            .await?;
        self.pull_backoff.lock().reset();

        let mut progress = PullProgress::default();
        for update in response.subscriptions {
            let Some(spec) = specs.iter().find(|s| s.id == update.id) else {
                continue;
            };
            self.apply_subscription_update(spec, update, &mut progress)
                .await?;
        }
        timer.finish();
        Ok(progress)
    }

    async fn apply_subscription_update(
        &self,
        spec: &SubscriptionSpec,
        update: SubscriptionUpdate,
        progress: &mut PullProgress,
    ) -> anyhow::Result<()> {
        if let Some(error) = &update.error {
            tracing::warn!(
                "Subscription {} errored: {} ({})",
                spec.id,
                error.code,
                error.message
            );
            // Expired bootstraps and corrupt chunks follow the same path:
            // retry from the last successful chunk, rebootstrap after the
            // cap.
            self.note_chunk_failure(spec, progress)?;
            return Ok(());
        }
        if update.resync_required {
            tracing::info!("Subscription {} must resync; clearing local state", spec.id);
            self.rebootstrap(spec)?;
            progress.resyncs += 1;
            return Ok(());
        }

        let prior_state = self
            .persistence
            .subscription_state(&spec.id)?
            .unwrap_or_default();

        if let Some(chunk_ref) = &update.snapshot_chunk_ref {
            match self.apply_chunk(spec, &prior_state, chunk_ref, &update).await {
                Ok(()) => {
                    self.chunk_retries.lock().remove(&spec.id);
                    self.chunk_backoff.lock().reset();
                    progress.chunks_applied += 1;
                    progress.bootstrapping |= update.next_bootstrap_state.is_some();
                },
                Err(e) => {
                    tracing::warn!("Chunk apply failed for {}: {e:#}", spec.id);
                    self.note_chunk_failure(spec, progress)?;
                },
            }
            return Ok(());
        }

        progress.commits_applied += self.apply_changes(&prior_state, spec, &update)?;
        Ok(())
    }

    /// Fetch, verify, and apply one snapshot chunk, then persist the resume
    /// token. The chunk is applied atomically; a fresh full bootstrap clears
    /// the table before its first chunk so the table ends up reflecting
    /// exactly the snapshot.
    async fn apply_chunk(
        &self,
        spec: &SubscriptionSpec,
        prior_state: &SubscriptionStateRow,
        chunk_ref: &ChunkRef,
        update: &SubscriptionUpdate,
    ) -> anyhow::Result<()> {
        let body = match &chunk_ref.inline_body {
            Some(inline) => bytes::Bytes::from(base64::decode(inline)?),
            None => self.transport.fetch_chunk(&chunk_ref.chunk_id).await?,
        };
        let rows = decode_chunk_frame(
            &body,
            chunk_ref.encoding,
            chunk_ref.compression,
            &chunk_ref.sha256,
        )?;

        let fresh_full_bootstrap =
            prior_state.cursor.is_none() && prior_state.bootstrap_state.is_none();
        if fresh_full_bootstrap {
            self.persistence.clear_table(&spec.table)?;
        }
        let writes: Vec<RowWrite> = rows
            .into_iter()
            .map(|row| RowWrite {
                table: spec.table.clone(),
                row_id: row.row_id.clone(),
                op: OpType::Upsert,
                row: Some(StoredRow {
                    row_id: row.row_id,
                    row_json: row.row_json,
                    row_version: row.row_version,
                    scopes: row.scopes,
                    last_writer: None,
                }),
            })
            .collect();
        self.persistence.apply_row_writes(&writes)?;

        let cursor = match update.new_cursor {
            // Bootstrap complete; adopt the handed-off cursor.
            Some(new_cursor) => {
                self.persistence
                    .advance_partition_cursor(&self.partition_id, new_cursor)?;
                Some(new_cursor)
            },
            None => prior_state.cursor,
        };
        self.persistence.set_subscription_state(
            &spec.id,
            &SubscriptionStateRow {
                cursor,
                bootstrap_state: update.next_bootstrap_state.clone(),
            },
        )?;
        Ok(())
    }

    /// Apply delivered changes in commit order, one commit atomically, then
    /// advance the cursor. A stale or duplicate delivery never moves the
    /// cursor backwards.
    fn apply_changes(
        &self,
        prior_state: &SubscriptionStateRow,
        spec: &SubscriptionSpec,
        update: &SubscriptionUpdate,
    ) -> anyhow::Result<usize> {
        let mut commits_applied = 0;
        let mut batch: Vec<RowWrite> = Vec::new();
        let mut batch_seq: Option<CommitSeq> = None;
        let cursor = prior_state.cursor.unwrap_or(CommitSeq::MIN);

        let mut flush = |batch: &mut Vec<RowWrite>| -> anyhow::Result<()> {
            if !batch.is_empty() {
                self.persistence.apply_row_writes(batch)?;
                batch.clear();
            }
            Ok(())
        };
        for change in &update.changes {
            // Replays below the cursor are duplicates.
            if change.commit_seq <= cursor {
                continue;
            }
            if batch_seq != Some(change.commit_seq) {
                flush(&mut batch)?;
                if batch_seq.is_some() {
                    commits_applied += 1;
                }
                batch_seq = Some(change.commit_seq);
            }
            batch.push(change_to_write(spec, change));
        }
        flush(&mut batch)?;
        if batch_seq.is_some() {
            commits_applied += 1;
        }

        if let Some(new_cursor) = update.new_cursor {
            if new_cursor > cursor {
                self.persistence.set_subscription_state(
                    &spec.id,
                    &SubscriptionStateRow {
                        cursor: Some(new_cursor),
                        bootstrap_state: None,
                    },
                )?;
                self.persistence
                    .advance_partition_cursor(&self.partition_id, new_cursor)?;
            }
        }
        Ok(commits_applied)
    }

    fn note_chunk_failure(
        &self,
        spec: &SubscriptionSpec,
        progress: &mut PullProgress,
    ) -> anyhow::Result<()> {
        metrics::log_chunk_retry();
        progress.chunk_failures += 1;
        let mut retries = self.chunk_retries.lock();
        let count = retries.entry(spec.id.clone()).or_insert(0);
        *count += 1;
        if *count > *BOOTSTRAP_MAX_CHUNK_RETRIES {
            retries.remove(&spec.id);
            drop(retries);
            tracing::warn!(
                "Subscription {} exhausted chunk retries; rebootstrapping",
                spec.id
            );
            self.rebootstrap(spec)?;
        }
        Ok(())
    }

    /// Drop all local state of a subscription so the next pull starts a
    /// fresh bootstrap.
    fn rebootstrap(&self, spec: &SubscriptionSpec) -> anyhow::Result<()> {
        metrics::log_rebootstrap();
        self.persistence.clear_table(&spec.table)?;
        self.persistence
            .set_subscription_state(&spec.id, &SubscriptionStateRow::default())?;
        self.chunk_retries.lock().remove(&spec.id);
        Ok(())
    }

    /// Start the background engine: an outbox pump and a pull loop woken by
    /// advisory signals or the poll interval, whichever comes first.
    pub fn start(self: &Arc<Self>) {
        let pump = self.clone();
        self.rt.spawn("outbox_pump", async move {
            loop {
                match pump.push_once().await {
                    Ok(PushOutcome::Idle) => pump.rt.wait(PULL_INTERVAL).await,
                    Ok(PushOutcome::Backoff(delay)) => pump.rt.wait(delay).await,
                    Ok(_) => {},
                    Err(e) => {
                        tracing::error!("Outbox pump failed: {e:#}");
                        pump.rt.wait(MAX_BACKOFF).await;
                    },
                }
            }
        });

        let puller = self.clone();
        let mut wake = self.transport.wake_signals();
        self.rt.spawn("pull_loop", async move {
            loop {
                if let Err(e) = puller.sync().await {
                    tracing::error!("Sync cycle failed: {e:#}");
                }
                let mut wake_closed = false;
                match &mut wake {
                    Some(receiver) => {
                        // A wake only shortens the wait; a lagging or closed
                        // channel degrades to polling.
                        let sleep = puller.rt.wait(PULL_INTERVAL);
                        tokio::select! {
                            _ = sleep => {},
                            result = receiver.recv() => {
                                wake_closed = matches!(
                                    result,
                                    Err(tokio::sync::broadcast::error::RecvError::Closed)
                                );
                            },
                        }
                    },
                    None => puller.rt.wait(PULL_INTERVAL).await,
                }
                if wake_closed {
                    wake = None;
                }
            }
        });
    }
}

fn change_to_write(spec: &SubscriptionSpec, change: &WireChange) -> RowWrite {
    match change.op {
        OpType::Upsert => RowWrite {
            table: spec.table.clone(),
            row_id: change.row_id.clone(),
            op: OpType::Upsert,
            row: Some(StoredRow {
                row_id: change.row_id.clone(),
                row_json: change.row_json.clone().unwrap_or(serde_json::Value::Null),
                row_version: change.row_version.unwrap_or(sync_types::RowVersion(0)),
                scopes: change.scopes.clone(),
                last_writer: None,
            }),
        },
        OpType::Delete => RowWrite {
            table: spec.table.clone(),
            row_id: change.row_id.clone(),
            op: OpType::Delete,
            row: None,
        },
    }
}

#[cfg(test)]
mod tests;
