//! Retention Integration Tests
//!
//! Dropping runs, reconciling reference counts and sweeping abandoned
//! temp files.

use std::time::{Duration, SystemTime};

use capvault::{BlobHash, FetchResult, FetchedAsset, Relation, RunId, Vault, VaultConfig, VaultError};
use filetime::FileTime;
use tempfile::TempDir;

const LOGO: &[u8] = b"\x89PNG shared logo";

async fn capture_run(vault: &Vault, run: &RunId, body: &str) {
    vault
        .capture(
            FetchResult::new(run.clone(), "https://a.example/", 200, body.as_bytes().to_vec())
                .with_asset(FetchedAsset::new(
                    "https://a.example/logo.png",
                    Relation::Image,
                    LOGO.to_vec(),
                )),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_drop_run_keeps_shared_blobs() {
    let temp = TempDir::new().unwrap();
    let vault = Vault::open(VaultConfig::new(temp.path()))
        .unwrap()
        .with_builtin_processors()
        .unwrap();
    let old = RunId::new("crawl-1").unwrap();
    let new = RunId::new("crawl-2").unwrap();

    capture_run(&vault, &old, "old home").await;
    capture_run(&vault, &new, "new home").await;
    vault.process_run(&old, &[]).await.unwrap();

    let logo = BlobHash::of(LOGO);
    let old_body = BlobHash::of(b"old home");
    assert_eq!(vault.blob_store().refcount(&logo).await.unwrap(), 2);

    let report = vault.retention().drop_run(&old).await.unwrap();
    assert_eq!(report.manifests_removed, 1);
    assert_eq!(report.references_released, 2);
    assert_eq!(report.blobs_removed, 1);
    assert_eq!(report.missing_blobs, 0);

    // Shared asset survives with one reference, the old body is gone
    assert_eq!(vault.blob_store().refcount(&logo).await.unwrap(), 1);
    assert!(vault.blob_store().exists(&logo).await.unwrap());
    assert!(!vault.blob_store().exists(&old_body).await.unwrap());

    assert_eq!(vault.list_runs().await.unwrap(), vec![new.clone()]);
    assert!(!vault.layout().derived_dir().join("crawl-1").exists());
    assert!(vault
        .find_by_url("https://a.example/", Some(&old))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        vault.find_by_url("https://a.example/", None).await.unwrap().len(),
        1
    );

    assert!(matches!(
        vault.retention().drop_run(&old).await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_reconcile_repairs_counts() {
    let temp = TempDir::new().unwrap();
    let vault = Vault::open(VaultConfig::new(temp.path())).unwrap();
    let run = RunId::new("crawl-1").unwrap();
    capture_run(&vault, &run, "home").await;

    let logo = BlobHash::of(LOGO);
    let store = vault.blob_store();

    // A crashed capture left an extra reference and an orphan blob
    store.put(LOGO.to_vec()).await.unwrap();
    let orphan = store.put(b"never committed".to_vec()).await.unwrap().hash;
    assert_eq!(store.refcount(&logo).await.unwrap(), 2);

    let report = vault.retention().reconcile().await.unwrap();
    assert_eq!(report.blobs_checked, 3);
    assert_eq!(report.refcounts_fixed, 2);
    assert_eq!(report.blobs_removed, 1);
    assert!(report.missing.is_empty());

    assert_eq!(store.refcount(&logo).await.unwrap(), 1);
    assert!(!store.exists(&orphan).await.unwrap());

    // Idempotent once consistent
    let again = vault.retention().reconcile().await.unwrap();
    assert_eq!(again.refcounts_fixed, 0);
}

#[tokio::test]
async fn test_reconcile_reports_missing_blob() {
    let temp = TempDir::new().unwrap();
    let vault = Vault::open(VaultConfig::new(temp.path())).unwrap();
    let run = RunId::new("crawl-1").unwrap();
    capture_run(&vault, &run, "home").await;

    let body = BlobHash::of(b"home");
    std::fs::remove_file(vault.blob_store().object_path(&body)).unwrap();

    let report = vault.retention().reconcile().await.unwrap();
    assert_eq!(report.missing, vec![body]);
}

#[tokio::test]
async fn test_sweep_removes_only_stale_temp_files() {
    let temp = TempDir::new().unwrap();
    let vault = Vault::open(VaultConfig::new(temp.path())).unwrap();
    let tmp_dir = vault.layout().tmp_dir();

    let stale = tmp_dir.join(".tmpSTALE");
    let fresh = tmp_dir.join(".tmpFRESH");
    std::fs::write(&stale, b"partial").unwrap();
    std::fs::write(&fresh, b"in flight").unwrap();

    let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 3600);
    filetime::set_file_mtime(&stale, FileTime::from_system_time(two_hours_ago)).unwrap();

    let removed = vault
        .retention()
        .sweep_temp(Duration::from_secs(3600))
        .await
        .unwrap();

    assert_eq!(removed, 1);
    assert!(!stale.exists());
    assert!(fresh.exists());
}
