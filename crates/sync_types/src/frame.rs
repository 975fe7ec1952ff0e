//! Snapshot chunk frame codec.
//!
//! A chunk body is a frame of snapshot rows, JSON-encoded and optionally
//! compressed. The declared sha256 is always computed over the *decoded*
//! (decompressed) frame, so the same logical content hashes identically
//! under any compression. Bodies are stored content-addressed under a key
//! derived from `(encoding, compression, sha256)`.

use std::io::{
    Read,
    Write,
};

use anyhow::Context;
use bytes::Bytes;
use flate2::{
    read::GzDecoder,
    write::GzEncoder,
    Compression,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    sha256::{
        BlobHash,
        Sha256,
        Sha256Digest,
    },
    wire::SnapshotRow,
};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChunkEncoding {
    Json,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChunkCompression {
    None,
    Gzip,
}

/// An encoded chunk body ready for storage or inline delivery.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    /// Encoded (and possibly compressed) bytes as stored/transferred.
    pub body: Bytes,
    /// Digest of the decoded frame.
    pub sha256: Sha256Digest,
    /// Length of `body` in bytes.
    pub byte_length: u64,
}

pub fn encode_chunk_frame(
    rows: &[SnapshotRow],
    encoding: ChunkEncoding,
    compression: ChunkCompression,
) -> anyhow::Result<EncodedFrame> {
    let decoded = match encoding {
        ChunkEncoding::Json => serde_json::to_vec(rows)?,
    };
    let sha256 = Sha256::hash(&decoded);
    let body = match compression {
        ChunkCompression::None => decoded,
        ChunkCompression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&decoded)?;
            encoder.finish()?
        },
    };
    let byte_length = body.len() as u64;
    Ok(EncodedFrame {
        body: body.into(),
        sha256,
        byte_length,
    })
}

/// Decode a fetched chunk body, verifying the declared digest of the decoded
/// frame. Truncated or corrupted bodies fail here rather than during row
/// application.
pub fn decode_chunk_frame(
    body: &[u8],
    encoding: ChunkEncoding,
    compression: ChunkCompression,
    expected_sha256: &Sha256Digest,
) -> anyhow::Result<Vec<SnapshotRow>> {
    let decoded = match compression {
        ChunkCompression::None => body.to_vec(),
        ChunkCompression::Gzip => {
            let mut decoder = GzDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .context("chunk body is not valid gzip")?;
            out
        },
    };
    let actual = Sha256::hash(&decoded);
    anyhow::ensure!(
        actual == *expected_sha256,
        "chunk checksum mismatch: declared {expected_sha256}, decoded frame hashes to {actual}",
    );
    match encoding {
        ChunkEncoding::Json => {
            serde_json::from_slice(&decoded).context("chunk frame is not a JSON row array")
        },
    }
}

/// Content address for a chunk body in the blob substrate. Two chunks whose
/// `(encoding, compression, sha256)` agree share one stored body.
pub fn derived_body_key(
    encoding: ChunkEncoding,
    compression: ChunkCompression,
    sha256: &Sha256Digest,
) -> BlobHash {
    let preimage = format!("{encoding}:{compression}:{}", sha256.as_hex());
    BlobHash::of(preimage.as_bytes())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        RowVersion,
        ScopeMap,
    };

    fn rows() -> Vec<SnapshotRow> {
        vec![
            SnapshotRow {
                row_id: "t1".into(),
                row_json: json!({"title": "first"}),
                row_version: RowVersion(1),
                scopes: ScopeMap::new(),
            },
            SnapshotRow {
                row_id: "t2".into(),
                row_json: json!({"title": "second"}),
                row_version: RowVersion(7),
                scopes: ScopeMap::new(),
            },
        ]
    }

    #[test]
    fn test_gzip_frame_hashes_decoded_bytes() {
        let rows = rows();
        let plain = encode_chunk_frame(&rows, ChunkEncoding::Json, ChunkCompression::None).unwrap();
        let gzip = encode_chunk_frame(&rows, ChunkEncoding::Json, ChunkCompression::Gzip).unwrap();
        // Same logical content, same digest, different bodies.
        assert_eq!(plain.sha256, gzip.sha256);
        assert_ne!(plain.body, gzip.body);

        let decoded = decode_chunk_frame(
            &gzip.body,
            ChunkEncoding::Json,
            ChunkCompression::Gzip,
            &gzip.sha256,
        )
        .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].row_version, RowVersion(7));
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let frame = encode_chunk_frame(&rows(), ChunkEncoding::Json, ChunkCompression::None).unwrap();
        let truncated = &frame.body[..frame.body.len() - 3];
        let err = decode_chunk_frame(
            truncated,
            ChunkEncoding::Json,
            ChunkCompression::None,
            &frame.sha256,
        )
        .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_derived_key_separates_compressions() {
        let sha = Sha256::hash(b"frame");
        let a = derived_body_key(ChunkEncoding::Json, ChunkCompression::None, &sha);
        let b = derived_body_key(ChunkEncoding::Json, ChunkCompression::Gzip, &sha);
        assert_ne!(a, b);
        // Deterministic for equal inputs.
        assert_eq!(
            a,
            derived_body_key(ChunkEncoding::Json, ChunkCompression::None, &sha)
        );
    }
}
