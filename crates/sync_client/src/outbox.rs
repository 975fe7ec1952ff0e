//! The durable outbox and its push pump.
//!
//! Local writes enter as `pending` rows and leave as `acked`, `failed`, or
//! `conflict`. The pump owns at most one in-flight commit at a time and
//! drives it through the transport; a transport failure leaves the row in
//! `sending` (grace-based recovery picks it up after a crash, the in-process
//! pump simply retries it).

use common::{
    persistence::{
        ClientPersistence,
        ConflictRow,
        OutboxCommitRow,
        OutboxState,
        RowWrite,
        StoredRow,
    },
    runtime::Runtime,
};
use sync_types::{
    ClientCommitId,
    ClientPush,
    OpResult,
    OpType,
    PushOperation,
    PushRequest,
    PushStatus,
    RowVersion,
};

use crate::{
    metrics,
    SyncularClient,
    Transport,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Nothing pending.
    Idle,
    Acked(ClientCommitId),
    Conflicted(ClientCommitId),
    Failed(ClientCommitId),
    /// Transport failure or retriable server error; retry after the delay.
    Backoff(std::time::Duration),
}

impl<RT: Runtime> SyncularClient<RT> {
    /// Enqueue a commit of local operations and apply them optimistically
    /// to the local tables. Returns the idempotency key assigned to the
    /// commit.
    pub fn enqueue(&self, operations: Vec<PushOperation>) -> anyhow::Result<ClientCommitId> {
        anyhow::ensure!(!operations.is_empty(), "refusing to enqueue an empty commit");
        let client_commit_id = ClientCommitId::from(uuid::Uuid::new_v4().to_string());
        self.persistence.enqueue_outbox(&OutboxCommitRow {
            client_commit_id: client_commit_id.clone(),
            state: OutboxState::Pending,
            schema_version: self.schema_version,
            partition_id: Some(self.partition_id.clone()),
            operations: operations.clone(),
            created_at: self.rt.unix_timestamp(),
            last_attempt_at: None,
            attempts: 0,
            server_commit_seq: None,
        })?;

        // Optimistic local application so reads see the write immediately.
        // The authoritative row version arrives with the ack or the next
        // pull.
        let mut writes = Vec::with_capacity(operations.len());
        for op in &operations {
            match op.op {
                OpType::Upsert => {
                    let Some(payload) = &op.payload else { continue };
                    let current = self.persistence.local_row(&op.table, &op.row_id)?;
                    let row_version = current
                        .map(|row| row.row_version.succ())
                        .unwrap_or(RowVersion::INITIAL);
                    writes.push(RowWrite {
                        table: op.table.clone(),
                        row_id: op.row_id.clone(),
                        op: OpType::Upsert,
                        row: Some(StoredRow {
                            row_id: op.row_id.clone(),
                            row_json: payload.clone(),
                            row_version,
                            scopes: Default::default(),
                            last_writer: Some(self.client_id.clone()),
                        }),
                    });
                },
                OpType::Delete => writes.push(RowWrite {
                    table: op.table.clone(),
                    row_id: op.row_id.clone(),
                    op: OpType::Delete,
                    row: None,
                }),
            }
        }
        self.persistence.apply_row_writes(&writes)?;
        Ok(client_commit_id)
    }

    /// One push attempt: pick up the in-flight commit (or promote the
    /// oldest pending one) and run it through the transport.
    pub async fn push_once(&self) -> anyhow::Result<PushOutcome> {
        let row = match self.take_in_flight()? {
            Some(row) => row,
            None => return Ok(PushOutcome::Idle),
        };
        let timer = metrics::push_attempt_timer();
        let client_commit_id = row.client_commit_id.clone();
        self.persistence
            .record_outbox_attempt(&client_commit_id, self.rt.unix_timestamp())?;

        let request = PushRequest {
            client_id: self.client_id.clone(),
            push: ClientPush {
                client_commit_id: client_commit_id.clone(),
                schema_version: row.schema_version,
                operations: row.operations.clone(),
                partition_id: row.partition_id.clone(),
            },
        };
        let response = match self.transport.push(request).await {
            Ok(response) => response,
            Err(e) => {
                // The row stays `sending`; this pump instance retries it,
                // and grace recovery covers a crash.
                let delay = self
                    .rt
                    .with_rng(|mut rng| self.push_backoff.lock().fail(&mut rng));
                tracing::warn!(
                    "Push of {client_commit_id} failed in transport: {e:#}; retrying in {delay:?}"
                );
                timer.finish_with("transport_error");
                return Ok(PushOutcome::Backoff(delay));
            },
        };

        match response.status {
            PushStatus::Applied | PushStatus::Cached => {
                self.push_backoff.lock().reset();
                self.persistence
                    .mark_outbox_acked(&client_commit_id, response.commit_seq)?;
                // Stamp authoritative versions over the optimistic ones.
                let mut writes = Vec::new();
                for per_op in &response.per_op_results {
                    let OpResult::Applied {
                        new_version: Some(version),
                    } = &per_op.result
                    else {
                        continue;
                    };
                    let Some(op) = row.operations.get(per_op.op_index as usize) else {
                        continue;
                    };
                    if let Some(mut local) = self.persistence.local_row(&op.table, &op.row_id)? {
                        local.row_version = *version;
                        writes.push(RowWrite {
                            table: op.table.clone(),
                            row_id: op.row_id.clone(),
                            op: OpType::Upsert,
                            row: Some(local),
                        });
                    }
                }
                self.persistence.apply_row_writes(&writes)?;
                *self.in_flight.lock() = None;
                metrics::log_commit_acked();
                timer.finish();
                Ok(PushOutcome::Acked(client_commit_id))
            },
            PushStatus::Conflict => {
                self.push_backoff.lock().reset();
                self.persistence.transition_outbox(
                    &client_commit_id,
                    OutboxState::Sending,
                    OutboxState::Conflict,
                )?;
                for per_op in &response.per_op_results {
                    let OpResult::Conflict {
                        server_version,
                        server_row,
                    } = &per_op.result
                    else {
                        continue;
                    };
                    let Some(op) = row.operations.get(per_op.op_index as usize) else {
                        continue;
                    };
                    self.persistence.insert_conflict(&ConflictRow {
                        client_commit_id: client_commit_id.clone(),
                        op_index: per_op.op_index,
                        table: op.table.clone(),
                        row_id: op.row_id.clone(),
                        server_version: *server_version,
                        server_row: server_row.clone(),
                        created_at: self.rt.unix_timestamp(),
                    })?;
                }
                *self.in_flight.lock() = None;
                metrics::log_conflict();
                timer.finish_with("conflict");
                Ok(PushOutcome::Conflicted(client_commit_id))
            },
            PushStatus::Error => {
                let error = response.error.unwrap_or_else(|| sync_types::WireError {
                    code: "INTERNAL".to_owned(),
                    retriable: true,
                    message: "push failed without an error payload".to_owned(),
                });
                if error.retriable {
                    let delay = self
                        .rt
                        .with_rng(|mut rng| self.push_backoff.lock().fail(&mut rng));
                    tracing::warn!(
                        "Push of {client_commit_id} rejected with retriable {}: {}; backing off \
                         {delay:?}",
                        error.code,
                        error.message
                    );
                    timer.finish_with("retriable_error");
                    Ok(PushOutcome::Backoff(delay))
                } else {
                    tracing::error!(
                        "Push of {client_commit_id} permanently rejected with {}: {}",
                        error.code,
                        error.message
                    );
                    self.persistence.transition_outbox(
                        &client_commit_id,
                        OutboxState::Sending,
                        OutboxState::Failed,
                    )?;
                    *self.in_flight.lock() = None;
                    timer.finish_with("failed");
                    Ok(PushOutcome::Failed(client_commit_id))
                }
            },
        }
    }

    /// Push until the queue is drained or a commit is parked. Returns how
    /// many commits were acknowledged.
    pub async fn flush_outbox(&self) -> anyhow::Result<usize> {
        let mut acked = 0;
        loop {
            match self.push_once().await? {
                PushOutcome::Idle => return Ok(acked),
                PushOutcome::Acked(_) => acked += 1,
                PushOutcome::Conflicted(_) | PushOutcome::Failed(_) => {},
                PushOutcome::Backoff(delay) => self.rt.wait(delay).await,
            }
        }
    }

    fn take_in_flight(&self) -> anyhow::Result<Option<OutboxCommitRow>> {
        if let Some(client_commit_id) = self.in_flight.lock().clone() {
            if let Some(row) = self.persistence.outbox_commit(&client_commit_id)? {
                if row.state == OutboxState::Sending {
                    return Ok(Some(row));
                }
            }
            *self.in_flight.lock() = None;
        }
        let Some(row) = self.persistence.oldest_pending()? else {
            return Ok(None);
        };
        if !self.persistence.transition_outbox(
            &row.client_commit_id,
            OutboxState::Pending,
            OutboxState::Sending,
        )? {
            return Ok(None);
        }
        *self.in_flight.lock() = Some(row.client_commit_id.clone());
        Ok(Some(OutboxCommitRow {
            state: OutboxState::Sending,
            ..row
        }))
    }

    /// Surfaced conflicts awaiting application-driven resolution.
    pub fn conflicts(&self) -> anyhow::Result<Vec<ConflictRow>> {
        self.persistence.conflicts()
    }

    /// Discard a conflicted commit after the application resolved it (for
    /// example by enqueueing a fresh commit with an updated base version).
    pub fn discard_conflict(&self, client_commit_id: &ClientCommitId) -> anyhow::Result<()> {
        for conflict in self.persistence.conflicts()? {
            if conflict.client_commit_id == *client_commit_id {
                self.persistence
                    .delete_conflict(client_commit_id, conflict.op_index)?;
            }
        }
        self.persistence.transition_outbox(
            client_commit_id,
            OutboxState::Conflict,
            OutboxState::Failed,
        )?;
        Ok(())
    }
}
