use std::sync::Arc;

use common::{
    persistence::{
        ActorIdOrSystem,
        BlobRow,
        BlobUploadRow,
        ChangeRow,
        ChunkKey,
        CommitRow,
        CommitWithChanges,
        PushOutcomeRow,
        RowWrite,
        ServerPersistence,
        SnapshotChunkRow,
        StoredRow,
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
    BlobHash,
    ChunkId,
    ClientCommitId,
    ClientId,
    CommitSeq,
    OpType,
    PartitionId,
    RowId,
    RowVersion,
    SchemaVersion,
    ScopeSelector,
    SubscriptionId,
    TableName,
};

use crate::{
    from_json_text,
    to_json_text,
};

const SERVER_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS commits (
    partition_id TEXT NOT NULL,
    commit_seq INTEGER NOT NULL,
    client_id TEXT NOT NULL,
    client_commit_id TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    schema_version INTEGER NOT NULL,
    tables_json TEXT NOT NULL,
    PRIMARY KEY (partition_id, commit_seq)
);
CREATE UNIQUE INDEX IF NOT EXISTS commits_by_client
    ON commits (client_id, client_commit_id);

CREATE TABLE IF NOT EXISTS table_commits (
    partition_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    commit_seq INTEGER NOT NULL,
    PRIMARY KEY (partition_id, table_name, commit_seq)
);

CREATE TABLE IF NOT EXISTS changes (
    partition_id TEXT NOT NULL,
    commit_seq INTEGER NOT NULL,
    change_id INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    op TEXT NOT NULL CHECK (op IN ('upsert', 'delete')),
    row_json TEXT,
    row_version INTEGER,
    scopes_json TEXT NOT NULL,
    PRIMARY KEY (partition_id, commit_seq, change_id)
);

CREATE TABLE IF NOT EXISTS push_outcomes (
    client_id TEXT NOT NULL,
    client_commit_id TEXT NOT NULL,
    response_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (client_id, client_commit_id)
);

CREATE TABLE IF NOT EXISTS client_cursors (
    client_id TEXT NOT NULL,
    partition_id TEXT NOT NULL,
    cursor INTEGER NOT NULL,
    PRIMARY KEY (client_id, partition_id)
);

CREATE TABLE IF NOT EXISTS rows (
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    row_json TEXT NOT NULL,
    row_version INTEGER NOT NULL,
    scopes_json TEXT NOT NULL,
    last_writer TEXT,
    PRIMARY KEY (table_name, row_id)
);

CREATE TABLE IF NOT EXISTS snapshot_chunks (
    chunk_id TEXT PRIMARY KEY,
    partition_id TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    table_name TEXT NOT NULL,
    as_of_commit_seq INTEGER NOT NULL,
    row_cursor INTEGER NOT NULL,
    row_limit INTEGER NOT NULL,
    encoding TEXT NOT NULL,
    compression TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    byte_length INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    body_ref TEXT NOT NULL,
    has_more INTEGER NOT NULL,
    UNIQUE (partition_id, scope_key, table_name, as_of_commit_seq,
            row_cursor, row_limit, encoding, compression)
);

CREATE TABLE IF NOT EXISTS blobs (
    hash TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    mime_type TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blob_uploads (
    hash TEXT PRIMARY KEY,
    declared_size INTEGER NOT NULL,
    mime_type TEXT,
    actor_id TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscription_scopes (
    client_id TEXT NOT NULL,
    subscription_id TEXT NOT NULL,
    scopes_json TEXT NOT NULL,
    PRIMARY KEY (client_id, subscription_id)
);
"#;

pub struct SqliteServerPersistence {
    inner: Arc<Mutex<Connection>>,
}

impl SqliteServerPersistence {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn new_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> anyhow::Result<Self> {
        // Idempotent DDL; safe to run on every open.
        connection.execute_batch(SERVER_INIT)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(connection)),
        })
    }
}

fn stored_row_from(row: &Row<'_>) -> rusqlite::Result<(String, String, u64, String, Option<String>)>
{
    Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, u64>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, Option<String>>(4)?,
    ))
}

fn parse_stored_row(
    (row_id, row_json, row_version, scopes_json, last_writer): (
        String,
        String,
        u64,
        String,
        Option<String>,
    ),
) -> anyhow::Result<StoredRow> {
    Ok(StoredRow {
        row_id: RowId::from(row_id),
        row_json: from_json_text(&row_json)?,
        row_version: RowVersion(row_version),
        scopes: from_json_text(&scopes_json)?,
        last_writer: last_writer.map(ClientId::from),
    })
}

fn chunk_from_row(row: &Row<'_>) -> anyhow::Result<SnapshotChunkRow> {
    let encoding: String = row.get(7)?;
    let compression: String = row.get(8)?;
    let sha256: String = row.get(9)?;
    let body_ref: String = row.get(12)?;
    Ok(SnapshotChunkRow {
        chunk_id: ChunkId::from(row.get::<_, String>(0)?),
        key: ChunkKey {
            partition_id: PartitionId::from(row.get::<_, String>(1)?),
            scope_key: row.get(2)?,
            table: TableName::from(row.get::<_, String>(3)?),
            as_of_commit_seq: CommitSeq(row.get(4)?),
            row_cursor: row.get(5)?,
            row_limit: row.get(6)?,
            encoding: encoding.parse()?,
            compression: compression.parse()?,
        },
        sha256: sync_types::Sha256Digest::from_hex(&sha256)?,
        byte_length: row.get(10)?,
        expires_at: UnixTimestamp::from_millis(row.get(11)?),
        body_ref: body_ref.parse()?,
        has_more: row.get::<_, i64>(13)? != 0,
    })
}

const CHUNK_COLUMNS: &str = "chunk_id, partition_id, scope_key, table_name, as_of_commit_seq, \
                             row_cursor, row_limit, encoding, compression, sha256, byte_length, \
                             expires_at, body_ref, has_more";

impl ServerPersistence for SqliteServerPersistence {
    fn load_push_outcome(
        &self,
        client_id: &ClientId,
        client_commit_id: &ClientCommitId,
    ) -> anyhow::Result<Option<PushOutcomeRow>> {
        let connection = self.inner.lock();
        let result = connection
            .query_row(
                "SELECT response_json, created_at FROM push_outcomes
                 WHERE client_id = ?1 AND client_commit_id = ?2",
                params![client_id.as_str(), client_commit_id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)),
            )
            .optional()?;
        result
            .map(|(response_json, created_at)| {
                Ok(PushOutcomeRow {
                    client_id: client_id.clone(),
                    client_commit_id: client_commit_id.clone(),
                    response_json: from_json_text(&response_json)?,
                    created_at: UnixTimestamp::from_millis(created_at),
                })
            })
            .transpose()
    }

    fn max_commit_seq(&self, partition_id: &PartitionId) -> anyhow::Result<CommitSeq> {
        let connection = self.inner.lock();
        let max: Option<u64> = connection.query_row(
            "SELECT MAX(commit_seq) FROM commits WHERE partition_id = ?1",
            params![partition_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(max.map(CommitSeq).unwrap_or(CommitSeq::MIN))
    }

    fn load_row(&self, table: &TableName, row_id: &RowId) -> anyhow::Result<Option<StoredRow>> {
        let connection = self.inner.lock();
        let raw = connection
            .query_row(
                "SELECT row_id, row_json, row_version, scopes_json, last_writer
                 FROM rows WHERE table_name = ?1 AND row_id = ?2",
                params![table.as_str(), row_id.as_str()],
                stored_row_from,
            )
            .optional()?;
        raw.map(parse_stored_row).transpose()
    }

    fn table_rows(&self, table: &TableName) -> anyhow::Result<Vec<StoredRow>> {
        let connection = self.inner.lock();
        let mut stmt = connection.prepare(
            "SELECT row_id, row_json, row_version, scopes_json, last_writer
             FROM rows WHERE table_name = ?1 ORDER BY row_id",
        )?;
        let raw = stmt
            .query_map(params![table.as_str()], stored_row_from)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(parse_stored_row).collect()
    }

    fn write_commit(
        &self,
        commit: &CommitRow,
        changes: &[ChangeRow],
        row_writes: &[RowWrite],
        outcome: &PushOutcomeRow,
    ) -> anyhow::Result<()> {
        let mut connection = self.inner.lock();
        let tx = connection.transaction()?;
        tx.execute(
            "INSERT INTO commits (partition_id, commit_seq, client_id, client_commit_id,
                                  actor_id, created_at, schema_version, tables_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                commit.partition_id.as_str(),
                commit.commit_seq.0,
                commit.client_id.as_str(),
                commit.client_commit_id.as_str(),
                commit.actor_id.as_str(),
                commit.created_at.as_millis(),
                commit.schema_version.0,
                to_json_text(&commit.tables)?,
            ],
        )?;
        for table in &commit.tables {
            tx.execute(
                "INSERT INTO table_commits (partition_id, table_name, commit_seq)
                 VALUES (?1, ?2, ?3)",
                params![commit.partition_id.as_str(), table.as_str(), commit.commit_seq.0],
            )?;
        }
        for change in changes {
            tx.execute(
                "INSERT INTO changes (partition_id, commit_seq, change_id, table_name,
                                      row_id, op, row_json, row_version, scopes_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    change.partition_id.as_str(),
                    change.commit_seq.0,
                    change.change_id,
                    change.table.as_str(),
                    change.row_id.as_str(),
                    change.op.to_string(),
                    crate::opt_json_text(&change.row_json)?,
                    change.row_version.map(|v| v.0),
                    to_json_text(&change.scopes)?,
                ],
            )?;
        }
        for write in row_writes {
            apply_row_write(&tx, "rows", write)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO push_outcomes
                 (client_id, client_commit_id, response_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                outcome.client_id.as_str(),
                outcome.client_commit_id.as_str(),
                to_json_text(&outcome.response_json)?,
                outcome.created_at.as_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn record_push_outcome(&self, outcome: &PushOutcomeRow) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT OR REPLACE INTO push_outcomes
                 (client_id, client_commit_id, response_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                outcome.client_id.as_str(),
                outcome.client_commit_id.as_str(),
                to_json_text(&outcome.response_json)?,
                outcome.created_at.as_millis(),
            ],
        )?;
        Ok(())
    }

    fn commits_since(
        &self,
        partition_id: &PartitionId,
        cursor: CommitSeq,
        limit: usize,
    ) -> anyhow::Result<Vec<CommitWithChanges>> {
        let connection = self.inner.lock();
        let mut stmt = connection.prepare(
            "SELECT partition_id, commit_seq, client_id, client_commit_id, actor_id,
                    created_at, schema_version, tables_json
             FROM commits WHERE partition_id = ?1 AND commit_seq > ?2
             ORDER BY commit_seq ASC LIMIT ?3",
        )?;
        let commits = stmt
            .query_map(
                params![partition_id.as_str(), cursor.0, limit as u64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, u64>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut change_stmt = connection.prepare(
            "SELECT change_id, table_name, row_id, op, row_json, row_version, scopes_json
             FROM changes WHERE partition_id = ?1 AND commit_seq = ?2
             ORDER BY change_id ASC",
        )?;
        let mut out = Vec::with_capacity(commits.len());
        for (
            partition,
            commit_seq,
            client_id,
            client_commit_id,
            actor_id,
            created_at,
            schema_version,
            tables_json,
        ) in commits
        {
            let changes = change_stmt
                .query_map(params![partition.as_str(), commit_seq], |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<u64>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let changes = changes
                .into_iter()
                .map(
                    |(change_id, table, row_id, op, row_json, row_version, scopes_json)| {
                        Ok(ChangeRow {
                            partition_id: PartitionId::from(partition.clone()),
                            commit_seq: CommitSeq(commit_seq),
                            change_id,
                            table: TableName::from(table),
                            row_id: RowId::from(row_id),
                            op: parse_op(&op)?,
                            row_json: row_json.map(|j| from_json_text(&j)).transpose()?,
                            row_version: row_version.map(RowVersion),
                            scopes: from_json_text(&scopes_json)?,
                        })
                    },
                )
                .collect::<anyhow::Result<Vec<_>>>()?;
            let actor_id = if actor_id == "_system" {
                ActorIdOrSystem::System
            } else {
                ActorIdOrSystem::Actor(actor_id.into())
            };
            out.push(CommitWithChanges {
                commit: CommitRow {
                    partition_id: PartitionId::from(partition),
                    commit_seq: CommitSeq(commit_seq),
                    client_id: ClientId::from(client_id),
                    client_commit_id: ClientCommitId::from(client_commit_id),
                    actor_id,
                    created_at: UnixTimestamp::from_millis(created_at),
                    schema_version: SchemaVersion(schema_version),
                    tables: from_json_text(&tables_json)?,
                },
                changes,
            });
        }
        Ok(out)
    }

    fn client_cursor(
        &self,
        client_id: &ClientId,
        partition_id: &PartitionId,
    ) -> anyhow::Result<Option<CommitSeq>> {
        let connection = self.inner.lock();
        let cursor = connection
            .query_row(
                "SELECT cursor FROM client_cursors WHERE client_id = ?1 AND partition_id = ?2",
                params![client_id.as_str(), partition_id.as_str()],
                |row| row.get::<_, u64>(0),
            )
            .optional()?;
        Ok(cursor.map(CommitSeq))
    }

    fn advance_client_cursor(
        &self,
        client_id: &ClientId,
        partition_id: &PartitionId,
        cursor: CommitSeq,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT INTO client_cursors (client_id, partition_id, cursor)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (client_id, partition_id)
             DO UPDATE SET cursor = MAX(cursor, excluded.cursor)",
            params![client_id.as_str(), partition_id.as_str(), cursor.0],
        )?;
        Ok(())
    }

    fn subscription_scopes(
        &self,
        client_id: &ClientId,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Option<ScopeSelector>> {
        let connection = self.inner.lock();
        let raw = connection
            .query_row(
                "SELECT scopes_json FROM subscription_scopes
                 WHERE client_id = ?1 AND subscription_id = ?2",
                params![client_id.as_str(), subscription_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|json| from_json_text(&json)).transpose()
    }

    fn set_subscription_scopes(
        &self,
        client_id: &ClientId,
        subscription_id: &SubscriptionId,
        scopes: &ScopeSelector,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT OR REPLACE INTO subscription_scopes
                 (client_id, subscription_id, scopes_json)
             VALUES (?1, ?2, ?3)",
            params![
                client_id.as_str(),
                subscription_id.as_str(),
                to_json_text(scopes)?,
            ],
        )?;
        Ok(())
    }

    fn find_chunk(
        &self,
        key: &ChunkKey,
        now: UnixTimestamp,
    ) -> anyhow::Result<Option<SnapshotChunkRow>> {
        let connection = self.inner.lock();
        let query = format!(
            "SELECT {CHUNK_COLUMNS} FROM snapshot_chunks
             WHERE partition_id = ?1 AND scope_key = ?2 AND table_name = ?3
               AND as_of_commit_seq = ?4 AND row_cursor = ?5 AND row_limit = ?6
               AND encoding = ?7 AND compression = ?8 AND expires_at > ?9"
        );
        let mut stmt = connection.prepare(&query)?;
        let mut rows = stmt.query(params![
            key.partition_id.as_str(),
            key.scope_key,
            key.table.as_str(),
            key.as_of_commit_seq.0,
            key.row_cursor,
            key.row_limit,
            key.encoding.to_string(),
            key.compression.to_string(),
            now.as_millis(),
        ])?;
        match rows.next()? {
            Some(row) => Ok(Some(chunk_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_chunk(&self, chunk_id: &ChunkId) -> anyhow::Result<Option<SnapshotChunkRow>> {
        let connection = self.inner.lock();
        let query = format!("SELECT {CHUNK_COLUMNS} FROM snapshot_chunks WHERE chunk_id = ?1");
        let mut stmt = connection.prepare(&query)?;
        let mut rows = stmt.query(params![chunk_id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(chunk_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn put_chunk(&self, chunk: &SnapshotChunkRow) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT OR REPLACE INTO snapshot_chunks
                 (chunk_id, partition_id, scope_key, table_name, as_of_commit_seq,
                  row_cursor, row_limit, encoding, compression, sha256, byte_length,
                  expires_at, body_ref, has_more)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                chunk.chunk_id.as_str(),
                chunk.key.partition_id.as_str(),
                chunk.key.scope_key,
                chunk.key.table.as_str(),
                chunk.key.as_of_commit_seq.0,
                chunk.key.row_cursor,
                chunk.key.row_limit,
                chunk.key.encoding.to_string(),
                chunk.key.compression.to_string(),
                chunk.sha256.as_hex(),
                chunk.byte_length,
                chunk.expires_at.as_millis(),
                chunk.body_ref.to_string(),
                chunk.has_more as i64,
            ],
        )?;
        Ok(())
    }

    fn expired_chunks(&self, now: UnixTimestamp) -> anyhow::Result<Vec<SnapshotChunkRow>> {
        let connection = self.inner.lock();
        let query =
            format!("SELECT {CHUNK_COLUMNS} FROM snapshot_chunks WHERE expires_at <= ?1");
        let mut stmt = connection.prepare(&query)?;
        let mut rows = stmt.query(params![now.as_millis()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(chunk_from_row(row)?);
        }
        Ok(out)
    }

    fn delete_chunks(&self, chunk_ids: &[ChunkId]) -> anyhow::Result<usize> {
        let connection = self.inner.lock();
        let mut deleted = 0;
        for chunk_id in chunk_ids {
            deleted += connection.execute(
                "DELETE FROM snapshot_chunks WHERE chunk_id = ?1",
                params![chunk_id.as_str()],
            )?;
        }
        Ok(deleted)
    }

    fn blob(&self, hash: &BlobHash) -> anyhow::Result<Option<BlobRow>> {
        let connection = self.inner.lock();
        let raw = connection
            .query_row(
                "SELECT size, mime_type, created_at FROM blobs WHERE hash = ?1",
                params![hash.to_string()],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, u64>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(raw.map(|(size, mime_type, created_at)| BlobRow {
            hash: hash.clone(),
            size,
            mime_type,
            created_at: UnixTimestamp::from_millis(created_at),
        }))
    }

    fn put_blob(&self, blob: &BlobRow) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT OR REPLACE INTO blobs (hash, size, mime_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                blob.hash.to_string(),
                blob.size,
                blob.mime_type,
                blob.created_at.as_millis(),
            ],
        )?;
        Ok(())
    }

    fn delete_blob(&self, hash: &BlobHash) -> anyhow::Result<bool> {
        let connection = self.inner.lock();
        Ok(connection.execute("DELETE FROM blobs WHERE hash = ?1", params![hash.to_string()])?
            > 0)
    }

    fn blobs(&self) -> anyhow::Result<Vec<BlobRow>> {
        let connection = self.inner.lock();
        let mut stmt =
            connection.prepare("SELECT hash, size, mime_type, created_at FROM blobs")?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, u64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(hash, size, mime_type, created_at)| {
                Ok(BlobRow {
                    hash: hash.parse()?,
                    size,
                    mime_type,
                    created_at: UnixTimestamp::from_millis(created_at),
                })
            })
            .collect()
    }

    fn blob_upload(&self, hash: &BlobHash) -> anyhow::Result<Option<BlobUploadRow>> {
        let connection = self.inner.lock();
        let raw = connection
            .query_row(
                "SELECT declared_size, mime_type, actor_id, expires_at
                 FROM blob_uploads WHERE hash = ?1",
                params![hash.to_string()],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u64>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(
            raw.map(|(declared_size, mime_type, actor_id, expires_at)| BlobUploadRow {
                hash: hash.clone(),
                declared_size,
                mime_type,
                actor_id,
                expires_at: UnixTimestamp::from_millis(expires_at),
            }),
        )
    }

    fn put_blob_upload(&self, upload: &BlobUploadRow) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT OR REPLACE INTO blob_uploads
                 (hash, declared_size, mime_type, actor_id, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                upload.hash.to_string(),
                upload.declared_size,
                upload.mime_type,
                upload.actor_id,
                upload.expires_at.as_millis(),
            ],
        )?;
        Ok(())
    }

    fn delete_blob_upload(&self, hash: &BlobHash) -> anyhow::Result<bool> {
        let connection = self.inner.lock();
        Ok(connection.execute(
            "DELETE FROM blob_uploads WHERE hash = ?1",
            params![hash.to_string()],
        )? > 0)
    }

    fn expired_blob_uploads(&self, now: UnixTimestamp) -> anyhow::Result<Vec<BlobUploadRow>> {
        let connection = self.inner.lock();
        let mut stmt = connection.prepare(
            "SELECT hash, declared_size, mime_type, actor_id, expires_at
             FROM blob_uploads WHERE expires_at <= ?1",
        )?;
        let raw = stmt
            .query_map(params![now.as_millis()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(hash, declared_size, mime_type, actor_id, expires_at)| {
                Ok(BlobUploadRow {
                    hash: hash.parse()?,
                    declared_size,
                    mime_type,
                    actor_id,
                    expires_at: UnixTimestamp::from_millis(expires_at),
                })
            })
            .collect()
    }
}

pub(crate) fn parse_op(op: &str) -> anyhow::Result<OpType> {
    match op {
        "upsert" => Ok(OpType::Upsert),
        "delete" => Ok(OpType::Delete),
        other => anyhow::bail!("unknown change op {other:?}"),
    }
}

pub(crate) fn apply_row_write(
    tx: &rusqlite::Transaction<'_>,
    table_name: &str,
    write: &RowWrite,
) -> anyhow::Result<()> {
    match write.op {
        OpType::Upsert => {
            let row = write
                .row
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("upsert write without a row"))?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {table_name}
                         (table_name, row_id, row_json, row_version, scopes_json, last_writer)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    write.table.as_str(),
                    write.row_id.as_str(),
                    to_json_text(&row.row_json)?,
                    row.row_version.0,
                    to_json_text(&row.scopes)?,
                    row.last_writer.as_ref().map(|c| c.as_str()),
                ],
            )?;
        },
        OpType::Delete => {
            tx.execute(
                &format!("DELETE FROM {table_name} WHERE table_name = ?1 AND row_id = ?2"),
                params![write.table.as_str(), write.row_id.as_str()],
            )?;
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;
    use sync_types::ScopeMap;

    use super::*;

    fn ts(millis: u64) -> UnixTimestamp {
        UnixTimestamp::from_millis(millis)
    }

    fn commit(seq: u64, ccid: &str) -> CommitRow {
        CommitRow {
            partition_id: PartitionId::global(),
            commit_seq: CommitSeq(seq),
            client_id: "c1".into(),
            client_commit_id: ccid.into(),
            actor_id: ActorIdOrSystem::Actor("a1".into()),
            created_at: ts(1),
            schema_version: SchemaVersion(1),
            tables: BTreeSet::from([TableName::from("tasks")]),
        }
    }

    fn outcome(ccid: &str) -> PushOutcomeRow {
        PushOutcomeRow {
            client_id: "c1".into(),
            client_commit_id: ccid.into(),
            response_json: serde_json::json!({"status": "applied"}),
            created_at: ts(1),
        }
    }

    #[test]
    fn test_commit_roundtrip() -> anyhow::Result<()> {
        let persistence = SqliteServerPersistence::new_in_memory()?;
        let partition = PartitionId::global();
        assert_eq!(persistence.max_commit_seq(&partition)?, CommitSeq::MIN);

        let mut scopes = ScopeMap::new();
        scopes.insert("user_id", "u1");
        let change = ChangeRow {
            partition_id: partition.clone(),
            commit_seq: CommitSeq(1),
            change_id: 0,
            table: "tasks".into(),
            row_id: "t1".into(),
            op: OpType::Upsert,
            row_json: Some(serde_json::json!({"title": "X"})),
            row_version: Some(RowVersion(1)),
            scopes: scopes.clone(),
        };
        let write = RowWrite {
            table: "tasks".into(),
            row_id: "t1".into(),
            op: OpType::Upsert,
            row: Some(StoredRow {
                row_id: "t1".into(),
                row_json: serde_json::json!({"title": "X"}),
                row_version: RowVersion(1),
                scopes,
                last_writer: Some("c1".into()),
            }),
        };
        persistence.write_commit(&commit(1, "ccid-1"), &[change], &[write], &outcome("ccid-1"))?;

        assert_eq!(persistence.max_commit_seq(&partition)?, CommitSeq(1));
        let row = persistence
            .load_row(&"tasks".into(), &"t1".into())?
            .expect("row written");
        assert_eq!(row.row_version, RowVersion(1));

        let since = persistence.commits_since(&partition, CommitSeq::MIN, 10)?;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].changes.len(), 1);
        assert_eq!(since[0].changes[0].row_id, RowId::from("t1"));

        let cached = persistence
            .load_push_outcome(&"c1".into(), &"ccid-1".into())?
            .expect("outcome recorded");
        assert_eq!(cached.response_json["status"], "applied");
        Ok(())
    }

    #[test]
    fn test_cursor_is_monotone() -> anyhow::Result<()> {
        let persistence = SqliteServerPersistence::new_in_memory()?;
        let partition = PartitionId::global();
        let client = ClientId::from("c1");
        persistence.advance_client_cursor(&client, &partition, CommitSeq(5))?;
        persistence.advance_client_cursor(&client, &partition, CommitSeq(3))?;
        assert_eq!(
            persistence.client_cursor(&client, &partition)?,
            Some(CommitSeq(5))
        );
        Ok(())
    }
}
