use std::{
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use common::testing::TestRuntime;
use errors::ErrorMetadataAnyhowExt;
use pretty_assertions::assert_eq;
use sqlite::SqliteServerPersistence;
use storage::{
    MemoryStorage,
    ObjectKey,
    Storage,
    UrlSigner,
};
use sync_types::{
    ActorId,
    BlobHash,
};

use crate::{
    BlobManager,
    InitiateUpload,
};

fn manager(rt: TestRuntime) -> (BlobManager<TestRuntime>, Arc<MemoryStorage>) {
    let persistence = Arc::new(SqliteServerPersistence::new_in_memory().unwrap());
    let storage = Arc::new(MemoryStorage::new());
    let signer = Arc::new(UrlSigner::new(b"secret".to_vec(), "https://sync.example").unwrap());
    (
        BlobManager::new(rt, persistence, storage.clone(), signer),
        storage,
    )
}

fn actor() -> ActorId {
    ActorId::from("a1")
}

#[tokio::test]
async fn test_upload_handshake() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let (manager, storage) = manager(rt);
    let body = Bytes::from_static(b"attachment");
    let hash = BlobHash::of(&body);

    let initiated = manager
        .initiate_upload(&hash, body.len() as u64, Some("text/plain".into()), &actor())
        .await?;
    let InitiateUpload::Upload(url) = initiated else {
        panic!("expected an upload URL for fresh content");
    };
    assert_eq!(url.method, "PUT");

    // Completing before the body arrives fails.
    let err = manager.complete_upload(&hash).await.unwrap_err();
    assert_eq!(err.short_msg(), Some("MISSING_BLOB"));

    storage.put(&ObjectKey::from(&hash), body.clone()).await?;
    let blob = manager.complete_upload(&hash).await?;
    assert_eq!(blob.size, body.len() as u64);
    assert_eq!(blob.mime_type.as_deref(), Some("text/plain"));

    // Re-initiating the same content short-circuits.
    let again = manager
        .initiate_upload(&hash, body.len() as u64, None, &actor())
        .await?;
    assert!(matches!(again, InitiateUpload::Exists));

    let download = manager.get_download_url(&hash)?;
    assert_eq!(download.method, "GET");
    Ok(())
}

#[tokio::test]
async fn test_substrate_presence_is_backfilled() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let (manager, storage) = manager(rt);
    let body = Bytes::from_static(b"already here");
    let hash = BlobHash::of(&body);
    storage.put(&ObjectKey::from(&hash), body.clone()).await?;

    let initiated = manager
        .initiate_upload(&hash, body.len() as u64, None, &actor())
        .await?;
    assert!(matches!(initiated, InitiateUpload::Exists));
    // The record exists now, so downloads work without any upload step.
    manager.get_download_url(&hash)?;
    Ok(())
}

#[tokio::test]
async fn test_size_mismatch_is_rejected() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let (manager, storage) = manager(rt);
    let body = Bytes::from_static(b"short");
    let hash = BlobHash::of(&body);

    manager.initiate_upload(&hash, 999, None, &actor()).await?;
    storage.put(&ObjectKey::from(&hash), body).await?;
    let err = manager.complete_upload(&hash).await.unwrap_err();
    assert_eq!(err.short_msg(), Some("INVALID_REQUEST"));
    Ok(())
}

#[tokio::test]
async fn test_download_requires_complete_blob() {
    let rt = TestRuntime::new();
    let (manager, _storage) = manager(rt);
    let err = manager
        .get_download_url(&BlobHash::of(b"nothing"))
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("MISSING_BLOB"));
}

#[tokio::test]
async fn test_cleanup_expires_pending_and_collects_unreferenced() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let (manager, storage) = manager(rt.clone());

    // A pending upload that never completes.
    let stale = BlobHash::of(b"never finished");
    manager.initiate_upload(&stale, 10, None, &actor()).await?;

    // A completed blob nothing references.
    let body = Bytes::from_static(b"orphan");
    let orphan = BlobHash::of(&body);
    manager
        .initiate_upload(&orphan, body.len() as u64, None, &actor())
        .await?;
    storage.put(&ObjectKey::from(&orphan), body).await?;
    manager.complete_upload(&orphan).await?;

    rt.advance_time(Duration::from_secs(7200));
    let report = manager.cleanup(Some(&|_hash: &BlobHash| Ok(false))).await?;
    assert_eq!(report.expired_uploads, 1);
    assert_eq!(report.removed_blobs, 1);
    assert!(storage.get(&ObjectKey::from(&orphan)).await?.is_none());

    // A second pass has nothing left to do.
    let report = manager.cleanup(Some(&|_hash: &BlobHash| Ok(false))).await?;
    assert_eq!(report, crate::CleanupReport::default());
    Ok(())
}
