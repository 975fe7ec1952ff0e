//! Ergonomic wrappers on top of the `sha2` crate, which is a bit too generic
//! to be nice to use, plus the `sha256:<hex>` blob addressing scheme.

use std::{
    fmt,
    ops::Deref,
    str::FromStr,
};

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};
use sha2::Digest;

#[must_use]
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha256Digest([u8; 32]);

impl Sha256Digest {
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(v: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(v)?;
        let arr: [u8; 32] = bytes.try_into().ok().context("sha256 not 32 bytes")?;
        Ok(Sha256Digest(arr))
    }

    pub fn as_base64(&self) -> String {
        base64::encode(self.0)
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.as_hex())
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl Deref for Sha256Digest {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for Sha256Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Sha256Digest {
    fn from(d: [u8; 32]) -> Self {
        Self(d)
    }
}

impl TryFrom<Vec<u8>> for Sha256Digest {
    type Error = anyhow::Error;

    fn try_from(sha256: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(Sha256Digest(
            (*sha256).try_into().context("Sha256 wasn't 32 bytes")?,
        ))
    }
}

// Digests travel on the wire and in metadata rows as lowercase hex.
impl Serialize for Sha256Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_hex())
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sha256Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug)]
pub struct Sha256 {
    inner: sha2::Sha256,
}

impl Sha256 {
    pub fn new() -> Self {
        Self {
            inner: sha2::Sha256::new(),
        }
    }

    pub fn hash(buf: &[u8]) -> Sha256Digest {
        let mut hasher = Self::new();
        hasher.update(buf);
        hasher.finalize()
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.inner.update(buf)
    }

    pub fn finalize(self) -> Sha256Digest {
        Sha256Digest(self.inner.finalize().into())
    }
}

/// Content address of a blob: `sha256:<64 hex chars>`. The only addressing
/// scheme the blob manager accepts.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobHash(Sha256Digest);

impl BlobHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::hash(bytes))
    }

    pub fn digest(&self) -> &Sha256Digest {
        &self.0
    }
}

impl From<Sha256Digest> for BlobHash {
    fn from(digest: Sha256Digest) -> Self {
        Self(digest)
    }
}

impl FromStr for BlobHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("sha256:")
            .with_context(|| format!("blob hash {s:?} is not sha256-addressed"))?;
        Ok(Self(Sha256Digest::from_hex(hex)?))
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0.as_hex())
    }
}

impl fmt::Debug for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobHash({self})")
    }
}

impl Serialize for BlobHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlobHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
