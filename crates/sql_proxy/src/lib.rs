//! SQL passthrough with automatic oplog synthesis.
//!
//! Admin tooling executes raw SQL against the local database instead of
//! going through table handlers. The proxy classifies each statement; a
//! mutation against a synced table is rewritten to carry `RETURNING *` and
//! the affected rows are handed to a [`MutationSink`] so oplog entries are
//! synthesized exactly as if the writes had flowed through a handler.

use std::{
    collections::BTreeSet,
    sync::Arc,
};

use common::knobs::PROXY_CONNECTION_LIMIT;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use rusqlite::{
    types::ValueRef,
    Connection,
};
use serde_json::{
    Map,
    Value as JsonValue,
};
use sync_types::{
    OpType,
    RowId,
    TableName,
};
use tokio::sync::Semaphore;

mod detector;

pub use crate::detector::{
    detect_statement,
    ensure_returning_star,
    DetectedStatement,
    StatementKind,
};

/// Receives synthesized row effects from proxied mutations. The client's
/// outbox implements this to enqueue the effects for push.
pub trait MutationSink: Send + Sync {
    fn record_mutation(
        &self,
        table: &TableName,
        op: OpType,
        row_id: &RowId,
        row: &JsonValue,
    ) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProxyOutcome {
    pub kind: StatementKind,
    pub rows: Vec<JsonValue>,
    /// Oplog entries synthesized for a synced-table mutation.
    pub synthesized: usize,
}

pub struct SqlProxy {
    connection: Arc<Mutex<Connection>>,
    synced_tables: BTreeSet<TableName>,
    /// Column carrying the row id in synced tables.
    id_column: String,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl SqlProxy {
    pub fn new(
        connection: Arc<Mutex<Connection>>,
        synced_tables: impl IntoIterator<Item = TableName>,
    ) -> Self {
        let limit = *PROXY_CONNECTION_LIMIT;
        Self {
            connection,
            synced_tables: synced_tables.into_iter().collect(),
            id_column: "id".to_owned(),
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn id_column(mut self, column: &str) -> Self {
        self.id_column = column.to_owned();
        self
    }

    pub async fn execute(
        &self,
        sql: &str,
        sink: &dyn MutationSink,
    ) -> anyhow::Result<ProxyOutcome> {
        let _permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| anyhow::anyhow!(ErrorMetadata::proxy_connection_limit(self.limit)))?;

        let detected = detect_statement(sql)?;
        let synced_target = detected
            .table
            .as_deref()
            .map(TableName::from)
            .filter(|t| self.synced_tables.contains(t));

        let (sql, synthesize) = match (&detected.kind, &synced_target) {
            (kind, Some(_)) if kind.is_mutation() => (ensure_returning_star(sql)?, true),
            _ => (sql.to_owned(), false),
        };

        let rows = {
            let connection = self.connection.lock();
            run_statement(&connection, &sql)?
        };

        let mut synthesized = 0;
        if synthesize {
            let table = synced_target.expect("synthesize implies a synced target");
            let op = match detected.kind {
                StatementKind::Delete => OpType::Delete,
                _ => OpType::Upsert,
            };
            for row in &rows {
                let row_id = row
                    .get(&self.id_column)
                    .and_then(row_id_string)
                    .ok_or_else(|| {
                        anyhow::anyhow!(ErrorMetadata::invalid_request(format!(
                            "synced table {table} row lacks a usable {} column",
                            self.id_column,
                        )))
                    })?;
                sink.record_mutation(&table, op, &RowId::from(row_id), row)?;
                synthesized += 1;
            }
            tracing::debug!(
                "Proxied {:?} on {table}: {synthesized} oplog entries",
                detected.kind
            );
        }

        Ok(ProxyOutcome {
            kind: detected.kind,
            rows,
            synthesized,
        })
    }
}

fn row_id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Execute one statement and collect its result rows as JSON objects keyed
/// by column name. Statements without result columns yield no rows.
fn run_statement(connection: &Connection, sql: &str) -> anyhow::Result<Vec<JsonValue>> {
    let mut stmt = connection.prepare(sql)?;
    if stmt.column_count() == 0 {
        stmt.execute([])?;
        return Ok(Vec::new());
    }
    let column_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_owned())
        .collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::new();
        for (i, name) in column_names.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => JsonValue::Null,
                ValueRef::Integer(v) => JsonValue::from(v),
                ValueRef::Real(v) => JsonValue::from(v),
                ValueRef::Text(v) => JsonValue::from(String::from_utf8_lossy(v).into_owned()),
                ValueRef::Blob(v) => JsonValue::from(base64::encode(v)),
            };
            object.insert(name.clone(), value);
        }
        out.push(JsonValue::Object(object));
    }
    Ok(out)
}
