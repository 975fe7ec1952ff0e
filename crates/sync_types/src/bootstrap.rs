//! Opaque bootstrap resume tokens.
//!
//! The server hands the client a token after each snapshot chunk; the client
//! echoes it back verbatim on the next pull. Only the server interprets the
//! contents. Encoded as base64 of a JSON document so a token survives any
//! transport that can carry a string.

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    ids::CommitSeq,
    scopes::ScopeSelector,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapState {
    /// The log position the snapshot was cut at. A fresh subscription's
    /// cursor starts here once the bootstrap completes.
    pub as_of_commit_seq: CommitSeq,
    /// Row offset of the next page within the snapshot.
    pub row_cursor: u64,
    /// The selector this snapshot is being served for. For a widening
    /// bootstrap this is the delta, not the subscription's full selector.
    pub scopes: ScopeSelector,
}

impl BootstrapState {
    pub fn initial(as_of_commit_seq: CommitSeq, scopes: ScopeSelector) -> Self {
        Self {
            as_of_commit_seq,
            row_cursor: 0,
            scopes,
        }
    }

    pub fn encode(&self) -> String {
        base64::encode(serde_json::to_vec(self).expect("bootstrap state serializes"))
    }

    pub fn decode(token: &str) -> anyhow::Result<Self> {
        let bytes = base64::decode(token).context("bootstrap token is not base64")?;
        serde_json::from_slice(&bytes).context("bootstrap token payload is malformed")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::scopes::ScopeValues;

    #[test]
    fn test_token_roundtrip() {
        let state = BootstrapState {
            as_of_commit_seq: CommitSeq(42),
            row_cursor: 500,
            scopes: ScopeSelector::new().with("user_id", ScopeValues::one("u1")),
        };
        let token = state.encode();
        assert_eq!(BootstrapState::decode(&token).unwrap(), state);
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(BootstrapState::decode("not-a-token!").is_err());
        assert!(BootstrapState::decode(&base64::encode(b"{}")).is_err());
    }
}
