//! Presigned single-object URLs for blob upload and download.
//!
//! Tokens are HMAC-SHA256 over the JSON payload `{hash, action, expires_at}`
//! and travel as `base64(payload) "." hex(signature)`. Verification is
//! self-contained: any node holding the signing secret can validate a token
//! without a store round trip.

use anyhow::Context;
use hmac::{
    Hmac,
    Mac,
};
use serde::{
    Deserialize,
    Serialize,
};
use sha2::Sha256;
use sync_types::BlobHash;

use common::runtime::UnixTimestamp;

type HmacSha256 = Hmac<Sha256>;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum BlobAction {
    Upload,
    Download,
}

impl BlobAction {
    pub fn http_method(&self) -> &'static str {
        match self {
            BlobAction::Upload => "PUT",
            BlobAction::Download => "GET",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrlPayload {
    pub hash: BlobHash,
    pub action: BlobAction,
    pub expires_at: UnixTimestamp,
}

#[derive(Clone, Debug)]
pub struct SignedUrl {
    pub url: String,
    pub method: &'static str,
    pub expires_at: UnixTimestamp,
}

pub struct UrlSigner {
    secret: Vec<u8>,
    base_url: url::Url,
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            secret: secret.into(),
            base_url: url::Url::parse(base_url).context("invalid blob base url")?,
        })
    }

    fn mac(&self, payload_b64: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(payload_b64.as_bytes());
        mac
    }

    pub fn sign(&self, payload: &SignedUrlPayload) -> String {
        let payload_b64 =
            base64::encode(serde_json::to_vec(payload).expect("payload serializes"));
        let signature = self.mac(&payload_b64).finalize().into_bytes();
        format!("{payload_b64}.{}", hex::encode(signature))
    }

    pub fn verify(&self, token: &str, now: UnixTimestamp) -> anyhow::Result<SignedUrlPayload> {
        let (payload_b64, signature_hex) = token
            .split_once('.')
            .context("token is not payload.signature")?;
        let signature = hex::decode(signature_hex).context("token signature is not hex")?;
        self.mac(payload_b64)
            .verify_slice(&signature)
            .map_err(|_| anyhow::anyhow!("token signature mismatch"))?;
        let payload: SignedUrlPayload =
            serde_json::from_slice(&base64::decode(payload_b64).context("payload not base64")?)
                .context("token payload is malformed")?;
        anyhow::ensure!(now <= payload.expires_at, "token expired");
        Ok(payload)
    }

    pub fn presigned_url(
        &self,
        hash: &BlobHash,
        action: BlobAction,
        expires_at: UnixTimestamp,
    ) -> SignedUrl {
        let payload = SignedUrlPayload {
            hash: hash.clone(),
            action,
            expires_at,
        };
        let token = self.sign(&payload);
        let mut url = self.base_url.clone();
        url.set_path(&format!("/blobs/{hash}"));
        url.set_query(Some(&format!("token={token}")));
        SignedUrl {
            url: url.to_string(),
            method: action.http_method(),
            expires_at,
        }
    }
}
