//! Content-addressed blob manager.
//!
//! Blobs are addressed exclusively by `sha256:<hex>`. Upload is a
//! three-step handshake: `initiate_upload` hands out a presigned PUT URL
//! (or short-circuits when the content already exists), the client uploads
//! directly to the substrate, and `complete_upload` verifies presence and
//! size before the blob becomes downloadable.

use std::sync::Arc;

use common::{
    knobs::{
        BLOB_UPLOAD_TTL,
        BLOB_URL_TTL,
    },
    persistence::{
        BlobRow,
        BlobUploadRow,
        ServerPersistence,
    },
    runtime::Runtime,
};
use errors::ErrorMetadata;
use storage::{
    BlobAction,
    ObjectKey,
    SignedUrl,
    Storage,
    UrlSigner,
};
use sync_types::{
    ActorId,
    BlobHash,
};

mod metrics;

#[derive(Debug)]
pub enum InitiateUpload {
    /// The content is already stored; no upload needed.
    Exists,
    /// Upload the body with a PUT to this URL, then call `complete_upload`.
    Upload(SignedUrl),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_uploads: usize,
    pub removed_blobs: usize,
}

pub struct BlobManager<RT: Runtime> {
    rt: RT,
    persistence: Arc<dyn ServerPersistence>,
    storage: Arc<dyn Storage>,
    signer: Arc<UrlSigner>,
}

impl<RT: Runtime> BlobManager<RT> {
    pub fn new(
        rt: RT,
        persistence: Arc<dyn ServerPersistence>,
        storage: Arc<dyn Storage>,
        signer: Arc<UrlSigner>,
    ) -> Self {
        Self {
            rt,
            persistence,
            storage,
            signer,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub async fn initiate_upload(
        &self,
        hash: &BlobHash,
        size: u64,
        mime_type: Option<String>,
        actor: &ActorId,
    ) -> anyhow::Result<InitiateUpload> {
        let timer = metrics::initiate_upload_timer();
        if self.persistence.blob(hash)?.is_some() {
            metrics::log_upload_deduplicated();
            timer.finish();
            return Ok(InitiateUpload::Exists);
        }

        // The body may already be in the substrate under this content
        // address (another tenant's upload, or a crashed complete_upload).
        // Back-fill the record rather than asking for bytes we hold.
        if let Some(attributes) = self.storage.attributes(&ObjectKey::from(hash)).await? {
            self.persistence.put_blob(&BlobRow {
                hash: hash.clone(),
                size: attributes.size,
                mime_type,
                created_at: self.rt.unix_timestamp(),
            })?;
            self.persistence.delete_blob_upload(hash)?;
            metrics::log_upload_deduplicated();
            timer.finish();
            return Ok(InitiateUpload::Exists);
        }

        let now = self.rt.unix_timestamp();
        self.persistence.put_blob_upload(&BlobUploadRow {
            hash: hash.clone(),
            declared_size: size,
            mime_type,
            actor_id: actor.as_str().to_owned(),
            expires_at: now + *BLOB_UPLOAD_TTL,
        })?;
        let url = self
            .signer
            .presigned_url(hash, BlobAction::Upload, now + *BLOB_URL_TTL);
        timer.finish();
        Ok(InitiateUpload::Upload(url))
    }

    pub async fn complete_upload(&self, hash: &BlobHash) -> anyhow::Result<BlobRow> {
        let timer = metrics::complete_upload_timer();
        if let Some(existing) = self.persistence.blob(hash)? {
            timer.finish();
            return Ok(existing);
        }
        let upload = self.persistence.blob_upload(hash)?.ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "MISSING_UPLOAD",
                format!("no pending upload for {hash}"),
            ))
        })?;

        let attributes = self
            .storage
            .attributes(&ObjectKey::from(hash))
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::not_found(
                    "MISSING_BLOB",
                    format!("{hash} was never uploaded to storage"),
                ))
            })?;
        if attributes.size != upload.declared_size {
            anyhow::bail!(ErrorMetadata::invalid_request(format!(
                "declared size {} does not match stored size {} for {hash}",
                upload.declared_size, attributes.size,
            )));
        }

        let blob = BlobRow {
            hash: hash.clone(),
            size: attributes.size,
            mime_type: upload.mime_type,
            created_at: self.rt.unix_timestamp(),
        };
        self.persistence.put_blob(&blob)?;
        self.persistence.delete_blob_upload(hash)?;
        tracing::info!("Blob {hash} complete ({} bytes)", blob.size);
        timer.finish();
        Ok(blob)
    }

    /// Presigned GET URL. Only complete blobs are downloadable.
    pub fn get_download_url(&self, hash: &BlobHash) -> anyhow::Result<SignedUrl> {
        if self.persistence.blob(hash)?.is_none() {
            anyhow::bail!(ErrorMetadata::not_found(
                "MISSING_BLOB",
                format!("{hash} is not a complete blob"),
            ));
        }
        let expires_at = self.rt.unix_timestamp() + *BLOB_URL_TTL;
        Ok(self
            .signer
            .presigned_url(hash, BlobAction::Download, expires_at))
    }

    /// Remove expired pending uploads, and (when a referenced-by predicate
    /// is supplied) unreferenced complete blobs. Substrate deletes are best
    /// effort; GC retries on the next pass.
    pub async fn cleanup(
        &self,
        referenced: Option<&dyn Fn(&BlobHash) -> anyhow::Result<bool>>,
    ) -> anyhow::Result<CleanupReport> {
        let _timer = metrics::cleanup_timer();
        let now = self.rt.unix_timestamp();
        let mut report = CleanupReport::default();

        for upload in self.persistence.expired_blob_uploads(now)? {
            self.persistence.delete_blob_upload(&upload.hash)?;
            report.expired_uploads += 1;
        }

        if let Some(referenced) = referenced {
            for blob in self.persistence.blobs()? {
                if referenced(&blob.hash)? {
                    continue;
                }
                self.persistence.delete_blob(&blob.hash)?;
                if let Err(e) = self.storage.delete(&ObjectKey::from(&blob.hash)).await {
                    tracing::error!("Failed to delete blob body {}: {e:#}", blob.hash);
                }
                report.removed_blobs += 1;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests;
