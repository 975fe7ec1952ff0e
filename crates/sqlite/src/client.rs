use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use common::{
    persistence::{
        ClientPersistence,
        ConflictRow,
        OutboxCommitRow,
        OutboxState,
        RowWrite,
        StoredRow,
        SubscriptionStateRow,
    },
    runtime::UnixTimestamp,
};
use parking_lot::Mutex;
use rusqlite::{
    params,
    Connection,
    OptionalExtension,
    Row,
};
use sync_types::{
    ClientCommitId,
    ClientId,
    CommitSeq,
    PartitionId,
    RowId,
    RowVersion,
    SchemaVersion,
    SubscriptionId,
    TableName,
};

use crate::{
    from_json_text,
    to_json_text,
};

const CLIENT_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_commits (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    client_commit_id TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL
        CHECK (state IN ('pending', 'sending', 'acked', 'failed', 'conflict')),
    schema_version INTEGER NOT NULL,
    partition_id TEXT,
    operations_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_attempt_at INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    server_commit_seq INTEGER
);
CREATE INDEX IF NOT EXISTS outbox_by_state ON outbox_commits (state, seq);

CREATE TABLE IF NOT EXISTS partition_cursors (
    partition_id TEXT PRIMARY KEY,
    cursor INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscription_states (
    subscription_id TEXT PRIMARY KEY,
    cursor INTEGER,
    bootstrap_state TEXT
);

CREATE TABLE IF NOT EXISTS local_rows (
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    row_json TEXT NOT NULL,
    row_version INTEGER NOT NULL,
    scopes_json TEXT NOT NULL,
    last_writer TEXT,
    PRIMARY KEY (table_name, row_id)
);

CREATE TABLE IF NOT EXISTS conflicts (
    client_commit_id TEXT NOT NULL,
    op_index INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    server_version INTEGER,
    server_row_json TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (client_commit_id, op_index)
);
"#;

pub struct SqliteClientPersistence {
    inner: Arc<Mutex<Connection>>,
}

impl SqliteClientPersistence {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn new_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> anyhow::Result<Self> {
        connection.execute_batch(CLIENT_INIT)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(connection)),
        })
    }
}

const OUTBOX_COLUMNS: &str = "client_commit_id, state, schema_version, partition_id, \
                              operations_json, created_at, last_attempt_at, attempts, \
                              server_commit_seq";

fn outbox_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxRaw> {
    Ok(OutboxRaw {
        client_commit_id: row.get(0)?,
        state: row.get(1)?,
        schema_version: row.get(2)?,
        partition_id: row.get(3)?,
        operations_json: row.get(4)?,
        created_at: row.get(5)?,
        last_attempt_at: row.get(6)?,
        attempts: row.get(7)?,
        server_commit_seq: row.get(8)?,
    })
}

struct OutboxRaw {
    client_commit_id: String,
    state: String,
    schema_version: u32,
    partition_id: Option<String>,
    operations_json: String,
    created_at: u64,
    last_attempt_at: Option<u64>,
    attempts: u32,
    server_commit_seq: Option<u64>,
}

impl OutboxRaw {
    fn parse(self) -> anyhow::Result<OutboxCommitRow> {
        Ok(OutboxCommitRow {
            client_commit_id: ClientCommitId::from(self.client_commit_id),
            state: self.state.parse()?,
            schema_version: SchemaVersion(self.schema_version),
            partition_id: self.partition_id.map(PartitionId::from),
            operations: from_json_text(&self.operations_json)?,
            created_at: UnixTimestamp::from_millis(self.created_at),
            last_attempt_at: self.last_attempt_at.map(UnixTimestamp::from_millis),
            attempts: self.attempts,
            server_commit_seq: self.server_commit_seq.map(CommitSeq),
        })
    }
}

impl ClientPersistence for SqliteClientPersistence {
    fn enqueue_outbox(&self, row: &OutboxCommitRow) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT INTO outbox_commits
                 (client_commit_id, state, schema_version, partition_id, operations_json,
                  created_at, last_attempt_at, attempts, server_commit_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.client_commit_id.as_str(),
                row.state.to_string(),
                row.schema_version.0,
                row.partition_id.as_ref().map(|p| p.as_str()),
                to_json_text(&row.operations)?,
                row.created_at.as_millis(),
                row.last_attempt_at.map(|t| t.as_millis()),
                row.attempts,
                row.server_commit_seq.map(|s| s.0),
            ],
        )?;
        Ok(())
    }

    fn outbox_commit(
        &self,
        client_commit_id: &ClientCommitId,
    ) -> anyhow::Result<Option<OutboxCommitRow>> {
        let connection = self.inner.lock();
        let query =
            format!("SELECT {OUTBOX_COLUMNS} FROM outbox_commits WHERE client_commit_id = ?1");
        let raw = connection
            .query_row(&query, params![client_commit_id.as_str()], outbox_from_row)
            .optional()?;
        raw.map(OutboxRaw::parse).transpose()
    }

    fn oldest_pending(&self) -> anyhow::Result<Option<OutboxCommitRow>> {
        let connection = self.inner.lock();
        let query = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_commits
             WHERE state = 'pending' ORDER BY seq ASC LIMIT 1"
        );
        let raw = connection.query_row(&query, [], outbox_from_row).optional()?;
        raw.map(OutboxRaw::parse).transpose()
    }

    fn transition_outbox(
        &self,
        client_commit_id: &ClientCommitId,
        from: OutboxState,
        to: OutboxState,
    ) -> anyhow::Result<bool> {
        let connection = self.inner.lock();
        let changed = connection.execute(
            "UPDATE outbox_commits SET state = ?1
             WHERE client_commit_id = ?2 AND state = ?3",
            params![
                to.to_string(),
                client_commit_id.as_str(),
                from.to_string()
            ],
        )?;
        Ok(changed > 0)
    }

    fn record_outbox_attempt(
        &self,
        client_commit_id: &ClientCommitId,
        at: UnixTimestamp,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "UPDATE outbox_commits SET last_attempt_at = ?1, attempts = attempts + 1
             WHERE client_commit_id = ?2",
            params![at.as_millis(), client_commit_id.as_str()],
        )?;
        Ok(())
    }

    fn mark_outbox_acked(
        &self,
        client_commit_id: &ClientCommitId,
        server_commit_seq: Option<CommitSeq>,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "UPDATE outbox_commits SET state = 'acked', server_commit_seq = ?1
             WHERE client_commit_id = ?2",
            params![server_commit_seq.map(|s| s.0), client_commit_id.as_str()],
        )?;
        Ok(())
    }

    fn recover_stale_sending(
        &self,
        now: UnixTimestamp,
        grace: Duration,
    ) -> anyhow::Result<usize> {
        let connection = self.inner.lock();
        let threshold = now.as_millis().saturating_sub(grace.as_millis() as u64);
        let recovered = connection.execute(
            "UPDATE outbox_commits SET state = 'pending'
             WHERE state = 'sending'
               AND (last_attempt_at IS NULL OR last_attempt_at <= ?1)",
            params![threshold],
        )?;
        if recovered > 0 {
            tracing::info!("Recovered {recovered} stale sending outbox commits");
        }
        Ok(recovered)
    }

    fn outbox_counts(&self) -> anyhow::Result<BTreeMap<OutboxState, usize>> {
        let connection = self.inner.lock();
        let mut stmt =
            connection.prepare("SELECT state, COUNT(*) FROM outbox_commits GROUP BY state")?;
        let raw = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(state, count)| Ok((state.parse::<OutboxState>()?, count as usize)))
            .collect()
    }

    fn partition_cursor(&self, partition_id: &PartitionId) -> anyhow::Result<Option<CommitSeq>> {
        let connection = self.inner.lock();
        let cursor = connection
            .query_row(
                "SELECT cursor FROM partition_cursors WHERE partition_id = ?1",
                params![partition_id.as_str()],
                |row| row.get::<_, u64>(0),
            )
            .optional()?;
        Ok(cursor.map(CommitSeq))
    }

    fn advance_partition_cursor(
        &self,
        partition_id: &PartitionId,
        cursor: CommitSeq,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT INTO partition_cursors (partition_id, cursor)
             VALUES (?1, ?2)
             ON CONFLICT (partition_id)
             DO UPDATE SET cursor = MAX(cursor, excluded.cursor)",
            params![partition_id.as_str(), cursor.0],
        )?;
        Ok(())
    }

    fn subscription_state(
        &self,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Option<SubscriptionStateRow>> {
        let connection = self.inner.lock();
        let raw = connection
            .query_row(
                "SELECT cursor, bootstrap_state FROM subscription_states
                 WHERE subscription_id = ?1",
                params![subscription_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<u64>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()?;
        Ok(raw.map(|(cursor, bootstrap_state)| SubscriptionStateRow {
            cursor: cursor.map(CommitSeq),
            bootstrap_state,
        }))
    }

    fn set_subscription_state(
        &self,
        subscription_id: &SubscriptionId,
        state: &SubscriptionStateRow,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT OR REPLACE INTO subscription_states
                 (subscription_id, cursor, bootstrap_state)
             VALUES (?1, ?2, ?3)",
            params![
                subscription_id.as_str(),
                state.cursor.map(|c| c.0),
                state.bootstrap_state,
            ],
        )?;
        Ok(())
    }

    fn local_row(&self, table: &TableName, row_id: &RowId) -> anyhow::Result<Option<StoredRow>> {
        let connection = self.inner.lock();
        let raw = connection
            .query_row(
                "SELECT row_id, row_json, row_version, scopes_json, last_writer
                 FROM local_rows WHERE table_name = ?1 AND row_id = ?2",
                params![table.as_str(), row_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        raw.map(|(row_id, row_json, row_version, scopes_json, last_writer)| {
            Ok(StoredRow {
                row_id: RowId::from(row_id),
                row_json: from_json_text(&row_json)?,
                row_version: RowVersion(row_version),
                scopes: from_json_text(&scopes_json)?,
                last_writer: last_writer.map(ClientId::from),
            })
        })
        .transpose()
    }

    fn table_rows(&self, table: &TableName) -> anyhow::Result<Vec<StoredRow>> {
        let connection = self.inner.lock();
        let mut stmt = connection.prepare(
            "SELECT row_id, row_json, row_version, scopes_json, last_writer
             FROM local_rows WHERE table_name = ?1 ORDER BY row_id",
        )?;
        let raw = stmt
            .query_map(params![table.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(row_id, row_json, row_version, scopes_json, last_writer)| {
                Ok(StoredRow {
                    row_id: RowId::from(row_id),
                    row_json: from_json_text(&row_json)?,
                    row_version: RowVersion(row_version),
                    scopes: from_json_text(&scopes_json)?,
                    last_writer: last_writer.map(ClientId::from),
                })
            })
            .collect()
    }

    fn apply_row_writes(&self, writes: &[RowWrite]) -> anyhow::Result<()> {
        let mut connection = self.inner.lock();
        let tx = connection.transaction()?;
        for write in writes {
            crate::server::apply_row_write(&tx, "local_rows", write)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear_table(&self, table: &TableName) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "DELETE FROM local_rows WHERE table_name = ?1",
            params![table.as_str()],
        )?;
        Ok(())
    }

    fn insert_conflict(&self, conflict: &ConflictRow) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT OR REPLACE INTO conflicts
                 (client_commit_id, op_index, table_name, row_id, server_version,
                  server_row_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conflict.client_commit_id.as_str(),
                conflict.op_index,
                conflict.table.as_str(),
                conflict.row_id.as_str(),
                conflict.server_version.map(|v| v.0),
                crate::opt_json_text(&conflict.server_row)?,
                conflict.created_at.as_millis(),
            ],
        )?;
        Ok(())
    }

    fn conflicts(&self) -> anyhow::Result<Vec<ConflictRow>> {
        let connection = self.inner.lock();
        let mut stmt = connection.prepare(
            "SELECT client_commit_id, op_index, table_name, row_id, server_version,
                    server_row_json, created_at
             FROM conflicts ORDER BY created_at, op_index",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<u64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, u64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(
                |(ccid, op_index, table, row_id, server_version, server_row, created_at)| {
                    Ok(ConflictRow {
                        client_commit_id: ClientCommitId::from(ccid),
                        op_index,
                        table: TableName::from(table),
                        row_id: RowId::from(row_id),
                        server_version: server_version.map(RowVersion),
                        server_row: server_row.map(|j| from_json_text(&j)).transpose()?,
                        created_at: UnixTimestamp::from_millis(created_at),
                    })
                },
            )
            .collect()
    }

    fn delete_conflict(
        &self,
        client_commit_id: &ClientCommitId,
        op_index: u32,
    ) -> anyhow::Result<bool> {
        let connection = self.inner.lock();
        Ok(connection.execute(
            "DELETE FROM conflicts WHERE client_commit_id = ?1 AND op_index = ?2",
            params![client_commit_id.as_str(), op_index],
        )? > 0)
    }
}
