//! Storage-agnostic persistence surface.
//!
//! The sync core never talks to a SQL engine directly; it consumes these
//! record types and store traits. The `sqlite` crate provides the reference
//! implementation. All methods are synchronous: implementations keep their
//! critical sections short and the engines call them between suspension
//! points.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;
use sync_types::{
    BlobHash,
    ChunkCompression,
    ChunkEncoding,
    ChunkId,
    ClientCommitId,
    ClientId,
    CommitSeq,
    OpType,
    PartitionId,
    PushOperation,
    RowId,
    RowVersion,
    SchemaVersion,
    ScopeMap,
    ScopeSelector,
    Sha256Digest,
    SubscriptionId,
    TableName,
};

use crate::runtime::UnixTimestamp;

/// An appended commit. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRow {
    pub partition_id: PartitionId,
    pub commit_seq: CommitSeq,
    pub client_id: ClientId,
    pub client_commit_id: ClientCommitId,
    pub actor_id: ActorIdOrSystem,
    pub created_at: UnixTimestamp,
    pub schema_version: SchemaVersion,
    /// Tables touched by this commit; persisted as `table_commits` links.
    pub tables: BTreeSet<TableName>,
}

/// Commits are normally created on behalf of an authenticated actor; the
/// SQL proxy and admin tooling append as `System`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorIdOrSystem {
    Actor(sync_types::ActorId),
    System,
}

impl ActorIdOrSystem {
    pub fn as_str(&self) -> &str {
        match self {
            ActorIdOrSystem::Actor(actor) => actor.as_str(),
            ActorIdOrSystem::System => "_system",
        }
    }
}

/// A row-level effect within a commit, tagged with the scopes that drive
/// subscription fan-out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub partition_id: PartitionId,
    pub commit_seq: CommitSeq,
    /// Dense within the commit, preserving handler emission order.
    pub change_id: u32,
    pub table: TableName,
    pub row_id: RowId,
    pub op: OpType,
    pub row_json: Option<JsonValue>,
    pub row_version: Option<RowVersion>,
    pub scopes: ScopeMap,
}

/// Current state of a synced row in the generic row store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub row_id: RowId,
    pub row_json: JsonValue,
    pub row_version: RowVersion,
    pub scopes: ScopeMap,
    /// Client that produced the current version. Drives self-conflict
    /// avoidance: a writer never conflicts with its own unseen versions.
    pub last_writer: Option<ClientId>,
}

/// A pending write against the row store, applied atomically with its
/// commit.
#[derive(Clone, Debug, PartialEq)]
pub struct RowWrite {
    pub table: TableName,
    pub row_id: RowId,
    pub op: OpType,
    /// `None` for deletes.
    pub row: Option<StoredRow>,
}

/// The recorded outcome of a push, replayed verbatim for idempotent
/// retries. `response_json` is the serialized `PushResponse`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushOutcomeRow {
    pub client_id: ClientId,
    pub client_commit_id: ClientCommitId,
    pub response_json: JsonValue,
    pub created_at: UnixTimestamp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitWithChanges {
    pub commit: CommitRow,
    pub changes: Vec<ChangeRow>,
}

/// Logical identity of a snapshot chunk's content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub partition_id: PartitionId,
    pub scope_key: String,
    pub table: TableName,
    pub as_of_commit_seq: CommitSeq,
    pub row_cursor: u64,
    pub row_limit: u64,
    pub encoding: ChunkEncoding,
    pub compression: ChunkCompression,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotChunkRow {
    pub chunk_id: ChunkId,
    pub key: ChunkKey,
    /// Digest of the decoded frame.
    pub sha256: Sha256Digest,
    pub byte_length: u64,
    pub expires_at: UnixTimestamp,
    /// Content address of the body in the blob substrate.
    pub body_ref: BlobHash,
    /// Whether the snapshot continues past this page.
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobRow {
    pub hash: BlobHash,
    pub size: u64,
    pub mime_type: Option<String>,
    pub created_at: UnixTimestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobUploadRow {
    pub hash: BlobHash,
    pub declared_size: u64,
    pub mime_type: Option<String>,
    pub actor_id: String,
    pub expires_at: UnixTimestamp,
}

/// Server-side store. One implementation owns all system tables plus the
/// generic row store for synced tables.
pub trait ServerPersistence: Send + Sync + 'static {
    // Commit log ----------------------------------------------------------

    fn load_push_outcome(
        &self,
        client_id: &ClientId,
        client_commit_id: &ClientCommitId,
    ) -> anyhow::Result<Option<PushOutcomeRow>>;

    /// Highest assigned sequence in the partition, `CommitSeq::MIN` when the
    /// log is empty.
    fn max_commit_seq(&self, partition_id: &PartitionId) -> anyhow::Result<CommitSeq>;

    fn load_row(&self, table: &TableName, row_id: &RowId) -> anyhow::Result<Option<StoredRow>>;

    /// All current rows of a table ordered by `row_id`, for snapshot paging.
    fn table_rows(&self, table: &TableName) -> anyhow::Result<Vec<StoredRow>>;

    /// Atomically persist a commit: the commit row, its per-table links, its
    /// changes, the row effects, and the cached outcome. The caller has
    /// already serialized appends for this partition.
    fn write_commit(
        &self,
        commit: &CommitRow,
        changes: &[ChangeRow],
        row_writes: &[RowWrite],
        outcome: &PushOutcomeRow,
    ) -> anyhow::Result<()>;

    /// Record an outcome with no commit attached (conflict or rejected
    /// push), so retries replay it.
    fn record_push_outcome(&self, outcome: &PushOutcomeRow) -> anyhow::Result<()>;

    /// Commits with `commit_seq > cursor` in ascending order, with their
    /// changes in emission order.
    fn commits_since(
        &self,
        partition_id: &PartitionId,
        cursor: CommitSeq,
        limit: usize,
    ) -> anyhow::Result<Vec<CommitWithChanges>>;

    // Client cursors ------------------------------------------------------

    fn client_cursor(
        &self,
        client_id: &ClientId,
        partition_id: &PartitionId,
    ) -> anyhow::Result<Option<CommitSeq>>;

    /// Record the highest delivered sequence. Implementations must keep the
    /// cursor monotone: a lower value is a no-op.
    fn advance_client_cursor(
        &self,
        client_id: &ClientId,
        partition_id: &PartitionId,
        cursor: CommitSeq,
    ) -> anyhow::Result<()>;

    // Subscription scope tracking -----------------------------------------

    /// The effective scope selector last served to this subscription, used
    /// to detect contraction (revocation) and widening between pulls.
    fn subscription_scopes(
        &self,
        client_id: &ClientId,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Option<ScopeSelector>>;

    fn set_subscription_scopes(
        &self,
        client_id: &ClientId,
        subscription_id: &SubscriptionId,
        scopes: &ScopeSelector,
    ) -> anyhow::Result<()>;

    // Snapshot chunk metadata ---------------------------------------------

    /// Look up a chunk by its page key. Chunks past `expires_at` are
    /// invisible here (but still served by id until collected).
    fn find_chunk(
        &self,
        key: &ChunkKey,
        now: UnixTimestamp,
    ) -> anyhow::Result<Option<SnapshotChunkRow>>;

    fn get_chunk(&self, chunk_id: &ChunkId) -> anyhow::Result<Option<SnapshotChunkRow>>;

    fn put_chunk(&self, chunk: &SnapshotChunkRow) -> anyhow::Result<()>;

    fn expired_chunks(&self, now: UnixTimestamp) -> anyhow::Result<Vec<SnapshotChunkRow>>;

    fn delete_chunks(&self, chunk_ids: &[ChunkId]) -> anyhow::Result<usize>;

    // Blobs ---------------------------------------------------------------

    fn blob(&self, hash: &BlobHash) -> anyhow::Result<Option<BlobRow>>;

    fn put_blob(&self, blob: &BlobRow) -> anyhow::Result<()>;

    fn delete_blob(&self, hash: &BlobHash) -> anyhow::Result<bool>;

    fn blobs(&self) -> anyhow::Result<Vec<BlobRow>>;

    fn blob_upload(&self, hash: &BlobHash) -> anyhow::Result<Option<BlobUploadRow>>;

    fn put_blob_upload(&self, upload: &BlobUploadRow) -> anyhow::Result<()>;

    fn delete_blob_upload(&self, hash: &BlobHash) -> anyhow::Result<bool>;

    fn expired_blob_uploads(&self, now: UnixTimestamp) -> anyhow::Result<Vec<BlobUploadRow>>;
}

/// Durable state of an outbox commit.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Sending,
    Acked,
    Failed,
    Conflict,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxCommitRow {
    pub client_commit_id: ClientCommitId,
    pub state: OutboxState,
    pub schema_version: SchemaVersion,
    pub partition_id: Option<PartitionId>,
    pub operations: Vec<PushOperation>,
    pub created_at: UnixTimestamp,
    pub last_attempt_at: Option<UnixTimestamp>,
    pub attempts: u32,
    pub server_commit_seq: Option<CommitSeq>,
}

/// A surfaced conflict awaiting application-driven resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictRow {
    pub client_commit_id: ClientCommitId,
    pub op_index: u32,
    pub table: TableName,
    pub row_id: RowId,
    pub server_version: Option<RowVersion>,
    pub server_row: Option<JsonValue>,
    pub created_at: UnixTimestamp,
}

/// Per-subscription sync state on the client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStateRow {
    pub cursor: Option<CommitSeq>,
    pub bootstrap_state: Option<String>,
}

/// Client-side store: outbox, cursors, conflicts, and the local copies of
/// synced tables.
pub trait ClientPersistence: Send + Sync + 'static {
    // Outbox --------------------------------------------------------------

    fn enqueue_outbox(&self, row: &OutboxCommitRow) -> anyhow::Result<()>;

    fn outbox_commit(
        &self,
        client_commit_id: &ClientCommitId,
    ) -> anyhow::Result<Option<OutboxCommitRow>>;

    /// Oldest commit in `pending`, by enqueue order.
    fn oldest_pending(&self) -> anyhow::Result<Option<OutboxCommitRow>>;

    /// Compare-and-swap the state of a commit. Returns false if the commit
    /// is not currently in `from`.
    fn transition_outbox(
        &self,
        client_commit_id: &ClientCommitId,
        from: OutboxState,
        to: OutboxState,
    ) -> anyhow::Result<bool>;

    fn record_outbox_attempt(
        &self,
        client_commit_id: &ClientCommitId,
        at: UnixTimestamp,
    ) -> anyhow::Result<()>;

    fn mark_outbox_acked(
        &self,
        client_commit_id: &ClientCommitId,
        server_commit_seq: Option<CommitSeq>,
    ) -> anyhow::Result<()>;

    /// Move `sending` commits whose last attempt is older than the grace
    /// back to `pending`. Returns how many were recovered.
    fn recover_stale_sending(
        &self,
        now: UnixTimestamp,
        grace: std::time::Duration,
    ) -> anyhow::Result<usize>;

    fn outbox_counts(&self) -> anyhow::Result<BTreeMap<OutboxState, usize>>;

    // Cursors and subscriptions ------------------------------------------

    fn partition_cursor(&self, partition_id: &PartitionId) -> anyhow::Result<Option<CommitSeq>>;

    /// Monotone: a lower value is a no-op.
    fn advance_partition_cursor(
        &self,
        partition_id: &PartitionId,
        cursor: CommitSeq,
    ) -> anyhow::Result<()>;

    fn subscription_state(
        &self,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Option<SubscriptionStateRow>>;

    fn set_subscription_state(
        &self,
        subscription_id: &SubscriptionId,
        state: &SubscriptionStateRow,
    ) -> anyhow::Result<()>;

    // Local rows ----------------------------------------------------------

    fn local_row(&self, table: &TableName, row_id: &RowId) -> anyhow::Result<Option<StoredRow>>;

    fn table_rows(&self, table: &TableName) -> anyhow::Result<Vec<StoredRow>>;

    /// Apply a batch of row effects atomically (one commit's worth, or one
    /// snapshot chunk's worth).
    fn apply_row_writes(&self, writes: &[RowWrite]) -> anyhow::Result<()>;

    /// Drop every local row of a table. Used when a snapshot restarts from
    /// the beginning and on forced resync.
    fn clear_table(&self, table: &TableName) -> anyhow::Result<()>;

    // Conflicts -----------------------------------------------------------

    fn insert_conflict(&self, conflict: &ConflictRow) -> anyhow::Result<()>;

    fn conflicts(&self) -> anyhow::Result<Vec<ConflictRow>>;

    fn delete_conflict(
        &self,
        client_commit_id: &ClientCommitId,
        op_index: u32,
    ) -> anyhow::Result<bool>;
}
