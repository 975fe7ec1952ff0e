//! Shared types for the Syncular wire protocol: identifiers, scope maps,
//! wire messages, the snapshot chunk frame codec, and client backoff.

pub mod backoff;
mod bootstrap;
mod frame;
mod ids;
mod scopes;
mod sha256;
mod wire;

pub use crate::{
    bootstrap::BootstrapState,
    frame::{
        decode_chunk_frame,
        derived_body_key,
        encode_chunk_frame,
        ChunkCompression,
        ChunkEncoding,
        EncodedFrame,
    },
    ids::{
        ActorId,
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
        ScopeChange,
        ScopeDimension,
        ScopeMap,
        ScopeSelector,
        ScopeValue,
        ScopeValues,
    },
    sha256::{
        BlobHash,
        Sha256,
        Sha256Digest,
    },
    wire::{
        ChunkRef,
        ClientPush,
        OpResult,
        OpType,
        PerOpResult,
        PullRequest,
        PullResponse,
        PushOperation,
        PushRequest,
        PushResponse,
        PushStatus,
        SnapshotRow,
        SubscriptionRequest,
        SubscriptionUpdate,
        WakeSignal,
        WireChange,
        WireError,
    },
};
