use serde::{
    Deserialize,
    Serialize,
};

/// Position of a commit in a partition's log. Dense and strictly increasing
/// within a partition; assigned only by the server.
#[cfg_attr(
    any(test, feature = "testing"),
    derive(proptest_derive::Arbitrary)
)]
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct CommitSeq(pub u64);

impl CommitSeq {
    pub const MIN: CommitSeq = CommitSeq(0);

    pub fn succ(&self) -> CommitSeq {
        CommitSeq(self.0 + 1)
    }
}

/// Version counter on a synced row, bumped on every applied upsert.
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
    derive_more::Display,
)]
#[serde(transparent)]
pub struct RowVersion(pub u64);

impl RowVersion {
    pub const INITIAL: RowVersion = RowVersion(1);

    pub fn succ(&self) -> RowVersion {
        RowVersion(self.0 + 1)
    }
}

/// Declared schema version a client pushes against.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            derive_more::Display,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Stable identifier of a syncing device/installation.
    ClientId
);
string_id!(
    /// Authenticated identity on whose behalf a client acts.
    ActorId
);
string_id!(
    /// Client-chosen idempotency key for a commit, unique per client.
    ClientCommitId
);
string_id!(
    /// Logical table a change applies to.
    TableName
);
string_id!(
    /// Primary key of a synced row, stringified.
    RowId
);
string_id!(
    /// Client-chosen identifier of a subscription within a pull.
    SubscriptionId
);

/// Isolation unit for commit sequencing. Sequences are monotonic within a
/// partition and independent across partitions.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// The partition used when a push does not name one.
    pub fn global() -> Self {
        Self("_global".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PartitionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a snapshot chunk's metadata row.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChunkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
