//! The push path: validation, idempotent replay, serialized commit append.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use common::{
    knobs::PUSH_MAX_OPERATIONS,
    persistence::{
        ActorIdOrSystem,
        ChangeRow,
        CommitRow,
        PushOutcomeRow,
        RowWrite,
        ServerPersistence,
        StoredRow,
    },
    runtime::Runtime,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use sync_types::{
    OpResult,
    PartitionId,
    PerOpResult,
    PushRequest,
    PushResponse,
    PushStatus,
    RowId,
    TableName,
    WakeSignal,
    WireError,
};

use crate::{
    handlers::{
        RowReads,
        TableHandler,
    },
    metrics,
    SyncContext,
    SyncularServer,
};

/// Row state as seen mid-commit: the store overlaid with the effects of
/// earlier operations in the same push.
struct TxnReads<'a> {
    persistence: &'a dyn ServerPersistence,
    overlay: BTreeMap<(TableName, RowId), Option<StoredRow>>,
}

impl RowReads for TxnReads<'_> {
    fn current_row(
        &self,
        table: &TableName,
        row_id: &RowId,
    ) -> anyhow::Result<Option<StoredRow>> {
        if let Some(pending) = self.overlay.get(&(table.clone(), row_id.clone())) {
            return Ok(pending.clone());
        }
        self.persistence.load_row(table, row_id)
    }
}

impl<RT: Runtime> SyncularServer<RT> {
    /// Handle one push. Classified failures come back as an error response;
    /// only internal faults propagate as `Err`.
    pub async fn push(
        &self,
        ctx: &SyncContext,
        request: &PushRequest,
    ) -> anyhow::Result<PushResponse> {
        let timer = metrics::push_timer();
        match self.push_inner(ctx, request).await {
            Ok(response) => {
                timer.finish_with(match response.status {
                    PushStatus::Applied | PushStatus::Cached => "success",
                    PushStatus::Conflict => "conflict",
                    PushStatus::Error => "error",
                });
                Ok(response)
            },
            Err(e) => match e.error_metadata() {
                Some(metadata) => {
                    tracing::info!("Rejected push: {}", metadata.msg);
                    Ok(PushResponse {
                        status: PushStatus::Error,
                        commit_seq: None,
                        per_op_results: Vec::new(),
                        error: Some(WireError {
                            code: metadata.short_msg.to_string(),
                            retriable: metadata.code.is_retriable(),
                            message: metadata.msg.to_string(),
                        }),
                    })
                },
                None => Err(e),
            },
        }
    }

    async fn push_inner(
        &self,
        ctx: &SyncContext,
        request: &PushRequest,
    ) -> anyhow::Result<PushResponse> {
        anyhow::ensure!(
            request.client_id == ctx.client_id,
            ErrorMetadata::forbidden("push client_id does not match the authenticated client")
        );
        let push = &request.push;
        anyhow::ensure!(
            !push.operations.is_empty(),
            ErrorMetadata::missing_field("operations")
        );
        anyhow::ensure!(
            push.operations.len() <= *PUSH_MAX_OPERATIONS,
            ErrorMetadata::invalid_request(format!(
                "push carries {} operations, limit is {}",
                push.operations.len(),
                *PUSH_MAX_OPERATIONS
            ))
        );
        anyhow::ensure!(
            push.schema_version == self.schema_version,
            ErrorMetadata::invalid_request(format!(
                "push declares schema version {}, server is at {}",
                push.schema_version, self.schema_version
            ))
        );
        let partition = push
            .partition_id
            .clone()
            .unwrap_or_else(|| ctx.partition_id.clone());

        // Appends within a partition are serialized; partitions are
        // independent.
        let lock = self.partition_lock(&partition);
        let _guard = lock.lock().await;

        if let Some(cached) = self
            .persistence
            .load_push_outcome(&ctx.client_id, &push.client_commit_id)?
        {
            let mut response: PushResponse = serde_json::from_value(cached.response_json)?;
            if response.status == PushStatus::Applied {
                response.status = PushStatus::Cached;
            }
            metrics::log_push_replayed();
            return Ok(response);
        }

        let commit_seq = self.persistence.max_commit_seq(&partition)?.succ();
        let mut reads = TxnReads {
            persistence: self.persistence.as_ref(),
            overlay: BTreeMap::new(),
        };
        let mut per_op_results = Vec::with_capacity(push.operations.len());
        let mut row_writes: Vec<RowWrite> = Vec::new();
        let mut changes: Vec<ChangeRow> = Vec::new();
        let mut tables: BTreeSet<TableName> = BTreeSet::new();
        let mut conflicted = false;
        let mut first_error: Option<WireError> = None;

        for (index, op) in push.operations.iter().enumerate() {
            let handler = self.handlers.get(&op.table)?;
            let application = handler.apply_operation(ctx, &reads, op)?;
            per_op_results.push(PerOpResult {
                op_index: index as u32,
                result: application.result.clone(),
            });
            match &application.result {
                OpResult::Applied { .. } => {
                    for write in &application.writes {
                        reads.overlay.insert(
                            (write.table.clone(), write.row_id.clone()),
                            write.row.clone(),
                        );
                    }
                    row_writes.extend(application.writes);
                    for emitted in application.changes {
                        tables.insert(emitted.table.clone());
                        changes.push(ChangeRow {
                            partition_id: partition.clone(),
                            commit_seq,
                            change_id: changes.len() as u32,
                            table: emitted.table,
                            row_id: emitted.row_id,
                            op: emitted.op,
                            row_json: emitted.row_json,
                            row_version: emitted.row_version,
                            scopes: emitted.scopes,
                        });
                    }
                },
                OpResult::Conflict { .. } => conflicted = true,
                OpResult::Error {
                    code,
                    retriable,
                    message,
                } => {
                    first_error = Some(WireError {
                        code: code.clone(),
                        retriable: *retriable,
                        message: message.clone(),
                    });
                    // A handler error fails the whole commit; later
                    // operations are not evaluated.
                    break;
                },
            }
        }

        if let Some(error) = first_error {
            // Deterministic rejection; not cached, a retry re-evaluates.
            return Ok(PushResponse {
                status: PushStatus::Error,
                commit_seq: None,
                per_op_results,
                error: Some(error),
            });
        }

        if conflicted {
            // A conflicting commit applies nothing: atomicity over partial
            // progress. The outcome is recorded so retries replay it.
            let response = PushResponse {
                status: PushStatus::Conflict,
                commit_seq: None,
                per_op_results,
                error: None,
            };
            self.persistence.record_push_outcome(&PushOutcomeRow {
                client_id: ctx.client_id.clone(),
                client_commit_id: push.client_commit_id.clone(),
                response_json: serde_json::to_value(&response)?,
                created_at: self.rt.unix_timestamp(),
            })?;
            return Ok(response);
        }

        let response = PushResponse {
            status: PushStatus::Applied,
            commit_seq: Some(commit_seq),
            per_op_results,
            error: None,
        };
        let commit = CommitRow {
            partition_id: partition.clone(),
            commit_seq,
            client_id: ctx.client_id.clone(),
            client_commit_id: push.client_commit_id.clone(),
            actor_id: ActorIdOrSystem::Actor(ctx.actor_id.clone()),
            created_at: self.rt.unix_timestamp(),
            schema_version: push.schema_version,
            tables,
        };
        let outcome = PushOutcomeRow {
            client_id: ctx.client_id.clone(),
            client_commit_id: push.client_commit_id.clone(),
            response_json: serde_json::to_value(&response)?,
            created_at: commit.created_at,
        };
        self.persistence
            .write_commit(&commit, &changes, &row_writes, &outcome)?;
        metrics::log_commit_appended();
        tracing::debug!(
            "Appended commit {commit_seq} to {partition} ({} changes)",
            changes.len()
        );

        self.wake.publish(WakeSignal {
            partition_id: partition,
            commit_seq,
        });
        Ok(response)
    }

    pub(crate) fn partition_lock(
        &self,
        partition: &PartitionId,
    ) -> std::sync::Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.partition_locks.lock();
        locks
            .entry(partition.clone())
            .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
