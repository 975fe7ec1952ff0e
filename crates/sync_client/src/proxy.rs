//! Bridge from the SQL passthrough into the outbox.
//!
//! Admin tooling that mutates synced tables with raw SQL still has to show
//! up in the commit log. The proxy hands every affected row (via
//! `RETURNING *`) to this sink, which enqueues an equivalent outbox commit,
//! exactly as if the write had gone through a table handler.

use std::sync::Arc;

use common::runtime::Runtime;
use serde_json::Value as JsonValue;
use sql_proxy::MutationSink;
use sync_types::{
    OpType,
    PushOperation,
    RowId,
    TableName,
};

use crate::SyncularClient;

pub struct OutboxMutationSink<RT: Runtime> {
    client: Arc<SyncularClient<RT>>,
}

impl<RT: Runtime> OutboxMutationSink<RT> {
    pub fn new(client: Arc<SyncularClient<RT>>) -> Self {
        Self { client }
    }
}

impl<RT: Runtime> MutationSink for OutboxMutationSink<RT> {
    fn record_mutation(
        &self,
        table: &TableName,
        op: OpType,
        row_id: &RowId,
        row: &JsonValue,
    ) -> anyhow::Result<()> {
        // Raw-SQL writes carry no base version: the operator has already
        // decided what the row should look like.
        let operation = PushOperation {
            table: table.clone(),
            row_id: row_id.clone(),
            op,
            payload: match op {
                OpType::Upsert => Some(row.clone()),
                OpType::Delete => None,
            },
            base_version: None,
        };
        self.client.enqueue(vec![operation])?;
        Ok(())
    }
}
