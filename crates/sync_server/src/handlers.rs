//! Table handlers: the per-table capability objects the server engine
//! drives. A handler owns payload validation, authorization, scope
//! extraction, snapshot paging, and the translation of a push operation
//! into row effects and emitted changes.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::persistence::{
    RowWrite,
    ServerPersistence,
    StoredRow,
};
use errors::ErrorMetadata;
use serde_json::Value as JsonValue;
use sync_types::{
    OpResult,
    OpType,
    PushOperation,
    RowVersion,
    ScopeDimension,
    ScopeMap,
    ScopeSelector,
    SnapshotRow,
    TableName,
};

use crate::SyncContext;

/// Read access to the current row state, overlaid with the effects of
/// earlier operations in the same commit.
pub trait RowReads {
    fn current_row(
        &self,
        table: &TableName,
        row_id: &sync_types::RowId,
    ) -> anyhow::Result<Option<StoredRow>>;
}

#[derive(Clone, Debug)]
pub struct SnapshotRequest {
    /// The effective (declared ∩ authorized) selector to serve.
    pub scopes: ScopeSelector,
    pub row_cursor: u64,
    pub limit: usize,
}

#[derive(Clone, Debug)]
pub struct SnapshotPage {
    pub rows: Vec<SnapshotRow>,
    pub next_row_cursor: Option<u64>,
}

/// What applying one operation produced. A conflict or error outcome
/// carries no writes and no changes.
#[derive(Clone, Debug)]
pub struct OpApplication {
    pub result: OpResult,
    pub writes: Vec<RowWrite>,
    pub changes: Vec<EmittedChange>,
}

impl OpApplication {
    pub fn outcome_only(result: OpResult) -> Self {
        Self {
            result,
            writes: Vec::new(),
            changes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EmittedChange {
    pub table: TableName,
    pub row_id: sync_types::RowId,
    pub op: OpType,
    pub row_json: Option<JsonValue>,
    pub row_version: Option<RowVersion>,
    pub scopes: ScopeMap,
}

pub trait TableHandler: Send + Sync {
    fn table(&self) -> &TableName;

    /// Read-only handlers reject every write with `READ_ONLY`.
    fn read_only(&self) -> bool {
        false
    }

    /// The scope values this actor may see. Intersected with a
    /// subscription's declared scopes to form the served selector.
    fn resolve_scopes(&self, ctx: &SyncContext) -> anyhow::Result<ScopeSelector>;

    /// The scope tags of a row, used to tag emitted changes.
    fn extract_scopes(&self, row: &JsonValue) -> ScopeMap;

    /// One page of bootstrap rows for the given selector, ordered by row id.
    fn snapshot(&self, ctx: &SyncContext, request: &SnapshotRequest)
        -> anyhow::Result<SnapshotPage>;

    /// Apply one operation. Reads go through `reads` so an operation sees
    /// the effects of earlier operations in the same commit.
    fn apply_operation(
        &self,
        ctx: &SyncContext,
        reads: &dyn RowReads,
        op: &PushOperation,
    ) -> anyhow::Result<OpApplication>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<TableName, Arc<dyn TableHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TableHandler>) {
        self.handlers.insert(handler.table().clone(), handler);
    }

    pub fn get(&self, table: &TableName) -> anyhow::Result<&Arc<dyn TableHandler>> {
        self.handlers
            .get(table)
            .ok_or_else(|| anyhow::anyhow!(ErrorMetadata::unknown_table(table.as_str())))
    }
}

pub type ScopeResolverFn =
    Arc<dyn Fn(&SyncContext) -> anyhow::Result<ScopeSelector> + Send + Sync>;

/// The common case: a synced table whose rows live in the generic row store
/// as JSON, with scope tags read from configured top-level row fields.
pub struct JsonTableHandler {
    table: TableName,
    persistence: Arc<dyn ServerPersistence>,
    scope_dimensions: Vec<ScopeDimension>,
    resolver: ScopeResolverFn,
    read_only: bool,
}

impl JsonTableHandler {
    pub fn new(
        table: impl Into<TableName>,
        persistence: Arc<dyn ServerPersistence>,
        scope_dimensions: Vec<ScopeDimension>,
        resolver: ScopeResolverFn,
    ) -> Self {
        Self {
            table: table.into(),
            persistence,
            scope_dimensions,
            resolver,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// The conflict rule: a declared base version that no longer matches is
    /// a conflict unless the stored version was produced by this same
    /// client. A client pipelining edits ahead of its own acks never
    /// conflicts with itself.
    fn base_version_conflict(
        &self,
        ctx: &SyncContext,
        op: &PushOperation,
        current: Option<&StoredRow>,
    ) -> Option<OpResult> {
        let base_version = op.base_version?;
        match current {
            Some(row) => {
                if row.row_version == base_version {
                    return None;
                }
                if row.last_writer.as_ref() == Some(&ctx.client_id) {
                    return None;
                }
                Some(OpResult::Conflict {
                    server_version: Some(row.row_version),
                    server_row: Some(row.row_json.clone()),
                })
            },
            None => Some(OpResult::Conflict {
                server_version: None,
                server_row: None,
            }),
        }
    }
}

impl TableHandler for JsonTableHandler {
    fn table(&self) -> &TableName {
        &self.table
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn resolve_scopes(&self, ctx: &SyncContext) -> anyhow::Result<ScopeSelector> {
        (self.resolver)(ctx)
    }

    fn extract_scopes(&self, row: &JsonValue) -> ScopeMap {
        let mut scopes = ScopeMap::new();
        for dimension in &self.scope_dimensions {
            if let Some(value) = row.get(dimension.as_str()).and_then(|v| v.as_str()) {
                scopes.insert(dimension.clone(), value);
            }
        }
        scopes
    }

    fn snapshot(
        &self,
        _ctx: &SyncContext,
        request: &SnapshotRequest,
    ) -> anyhow::Result<SnapshotPage> {
        let rows = self.persistence.table_rows(&self.table)?;
        let mut visible: Vec<SnapshotRow> = rows
            .into_iter()
            .filter(|row| request.scopes.covers(&row.scopes))
            .map(|row| SnapshotRow {
                row_id: row.row_id,
                row_json: row.row_json,
                row_version: row.row_version,
                scopes: row.scopes,
            })
            .collect();
        let total = visible.len() as u64;
        let start = request.row_cursor.min(total) as usize;
        let end = (request.row_cursor + request.limit as u64).min(total) as usize;
        let page: Vec<SnapshotRow> = visible.drain(..end).skip(start).collect();
        let next_row_cursor = (end < total as usize).then_some(end as u64);
        Ok(SnapshotPage {
            rows: page,
            next_row_cursor,
        })
    }

    fn apply_operation(
        &self,
        ctx: &SyncContext,
        reads: &dyn RowReads,
        op: &PushOperation,
    ) -> anyhow::Result<OpApplication> {
        if self.read_only {
            return Ok(OpApplication::outcome_only(OpResult::Error {
                code: "READ_ONLY".to_owned(),
                retriable: false,
                message: format!("table {} is read-only", self.table),
            }));
        }
        let current = reads.current_row(&self.table, &op.row_id)?;
        if let Some(conflict) = self.base_version_conflict(ctx, op, current.as_ref()) {
            return Ok(OpApplication::outcome_only(conflict));
        }

        match op.op {
            OpType::Upsert => {
                let payload = op.payload.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(ErrorMetadata::invalid_request(format!(
                        "upsert on {} without a payload",
                        self.table
                    )))
                })?;
                anyhow::ensure!(
                    payload.is_object(),
                    ErrorMetadata::invalid_request(format!(
                        "upsert payload for {} must be a JSON object",
                        self.table
                    ))
                );
                let new_version = current
                    .map(|row| row.row_version.succ())
                    .unwrap_or(RowVersion::INITIAL);
                let scopes = self.extract_scopes(payload);
                let stored = StoredRow {
                    row_id: op.row_id.clone(),
                    row_json: payload.clone(),
                    row_version: new_version,
                    scopes: scopes.clone(),
                    last_writer: Some(ctx.client_id.clone()),
                };
                Ok(OpApplication {
                    result: OpResult::Applied {
                        new_version: Some(new_version),
                    },
                    writes: vec![RowWrite {
                        table: self.table.clone(),
                        row_id: op.row_id.clone(),
                        op: OpType::Upsert,
                        row: Some(stored),
                    }],
                    changes: vec![EmittedChange {
                        table: self.table.clone(),
                        row_id: op.row_id.clone(),
                        op: OpType::Upsert,
                        row_json: Some(payload.clone()),
                        row_version: Some(new_version),
                        scopes,
                    }],
                })
            },
            OpType::Delete => {
                // Deleting an absent row is applied idempotently; the change
                // still fans out so subscribers converge.
                let scopes = current.map(|row| row.scopes).unwrap_or_default();
                Ok(OpApplication {
                    result: OpResult::Applied { new_version: None },
                    writes: vec![RowWrite {
                        table: self.table.clone(),
                        row_id: op.row_id.clone(),
                        op: OpType::Delete,
                        row: None,
                    }],
                    changes: vec![EmittedChange {
                        table: self.table.clone(),
                        row_id: op.row_id.clone(),
                        op: OpType::Delete,
                        row_json: None,
                        row_version: None,
                        scopes,
                    }],
                })
            },
        }
    }
}
