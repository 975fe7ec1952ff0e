//! Wire frames for the push/pull protocol. All frames are JSON via serde
//! with snake_case field names; payloads are opaque `serde_json::Value`
//! mappings validated by table handlers.

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    ids::{
        ChunkId,
        ClientCommitId,
        ClientId,
        CommitSeq,
        PartitionId,
        RowId,
        RowVersion,
        SchemaVersion,
        SubscriptionId,
        TableName,
    },
    scopes::{
        ScopeMap,
        ScopeSelector,
    },
    sha256::Sha256Digest,
    ChunkCompression,
    ChunkEncoding,
};

/// Row-level effect kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OpType {
    Upsert,
    Delete,
}

/// One declared operation within a push.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushOperation {
    pub table: TableName,
    pub row_id: RowId,
    pub op: OpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<RowVersion>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientPush {
    pub client_commit_id: ClientCommitId,
    pub schema_version: SchemaVersion,
    pub operations: Vec<PushOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_id: Option<PartitionId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub client_id: ClientId,
    pub push: ClientPush,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PushStatus {
    Applied,
    Cached,
    Conflict,
    Error,
}

/// Outcome of a single operation. `Conflict` is a first-class outcome
/// carrying the server's current row, never an error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OpResult {
    Applied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_version: Option<RowVersion>,
    },
    Conflict {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<RowVersion>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_row: Option<JsonValue>,
    },
    Error {
        code: String,
        retriable: bool,
        message: String,
    },
}

impl OpResult {
    pub fn is_conflict(&self) -> bool {
        matches!(self, OpResult::Conflict { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OpResult::Error { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerOpResult {
    pub op_index: u32,
    #[serde(flatten)]
    pub result: OpResult,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: PushStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_seq: Option<CommitSeq>,
    #[serde(default)]
    pub per_op_results: Vec<PerOpResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Classified error surfaced on the wire; `code` is one of the stable
/// strings from the `errors` crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub retriable: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub id: SubscriptionId,
    pub table: TableName,
    #[serde(default)]
    pub scopes: ScopeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CommitSeq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_state: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullRequest {
    pub client_id: ClientId,
    pub subscriptions: Vec<SubscriptionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_snapshot_rows: Option<usize>,
}

/// A change as delivered to a subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireChange {
    pub commit_seq: CommitSeq,
    pub change_id: u32,
    pub table: TableName,
    pub row_id: RowId,
    pub op: OpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_json: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_version: Option<RowVersion>,
    #[serde(default)]
    pub scopes: ScopeMap,
}

/// One row within a snapshot chunk body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub row_id: RowId,
    pub row_json: JsonValue,
    pub row_version: RowVersion,
    #[serde(default)]
    pub scopes: ScopeMap,
}

/// Reference to a snapshot chunk. The body is either inline (base64 of the
/// encoded frame) or fetched by id in a second request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: ChunkId,
    pub encoding: ChunkEncoding,
    pub compression: ChunkCompression,
    /// Digest of the decoded frame, verified by the client after fetch.
    pub sha256: Sha256Digest,
    pub byte_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_body: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub id: SubscriptionId,
    /// Changes past the subscription's cursor, ascending, never mixing
    /// partitions against one cursor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<WireChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_chunk_ref: Option<ChunkRef>,
    /// Present while a bootstrap is in progress; the client re-issues pull
    /// with this token until it is null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_bootstrap_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_cursor: Option<CommitSeq>,
    /// The actor's resolved scopes contracted since this cursor was
    /// established; the client must drop this subscription's rows and
    /// rebootstrap.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resync_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl SubscriptionUpdate {
    pub fn error(id: SubscriptionId, error: WireError) -> Self {
        Self {
            id,
            changes: Vec::new(),
            snapshot_chunk_ref: None,
            next_bootstrap_state: None,
            new_cursor: None,
            resync_required: false,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullResponse {
    pub subscriptions: Vec<SubscriptionUpdate>,
}

/// Advisory notification that new commits exist in a partition. Correctness
/// never depends on delivery; the pull loop owns the cursor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeSignal {
    pub partition_id: PartitionId,
    pub commit_seq: CommitSeq,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_push_request_wire_shape() {
        let request = PushRequest {
            client_id: "c1".into(),
            push: ClientPush {
                client_commit_id: "ccid-1".into(),
                schema_version: SchemaVersion(3),
                operations: vec![PushOperation {
                    table: "tasks".into(),
                    row_id: "t1".into(),
                    op: OpType::Upsert,
                    payload: Some(serde_json::json!({"title": "X"})),
                    base_version: None,
                }],
                partition_id: None,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "client_id": "c1",
                "push": {
                    "client_commit_id": "ccid-1",
                    "schema_version": 3,
                    "operations": [{
                        "table": "tasks",
                        "row_id": "t1",
                        "op": "upsert",
                        "payload": {"title": "X"},
                    }],
                },
            })
        );
    }

    #[test]
    fn test_op_result_status_tagging() {
        let conflict = PerOpResult {
            op_index: 2,
            result: OpResult::Conflict {
                server_version: Some(RowVersion(4)),
                server_row: Some(serde_json::json!({"title": "theirs"})),
            },
        };
        let json = serde_json::to_value(&conflict).unwrap();
        assert_eq!(json["status"], "conflict");
        assert_eq!(json["op_index"], 2);
        assert_eq!(json["server_version"], 4);
        let back: PerOpResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, conflict);
    }
}
