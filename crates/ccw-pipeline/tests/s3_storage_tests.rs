//! S3 storage and gateway tests against MinIO
//!
//! Run with `cargo test -- --ignored` on a machine with Docker.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use ccw_common::types::RifFileType;
use ccw_pipeline::{
    gateway::ObjectStoreGateway,
    manifest::{DataSetLocation, DataSetManifest, DataSetManifestEntry, FileTypeFilter, ManifestKey},
    storage::{ObjectStore, S3Storage, StorageConfig},
};
use std::sync::Arc;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

const BUCKET: &str = "ccw-rif-test";

struct TestMinio {
    _container: ContainerAsync<GenericImage>,
    storage: S3Storage,
}

impl TestMinio {
    async fn start() -> Result<Self> {
        let container = GenericImage::new("minio/minio", "latest")
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("MinIO Object Storage Server"))
            .with_env_var("MINIO_ROOT_USER", "minioadmin")
            .with_env_var("MINIO_ROOT_PASSWORD", "minioadmin")
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .context("Failed to start MinIO container")?;

        let host = container.get_host().await.context("Failed to get MinIO host")?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .context("Failed to get MinIO port")?;

        let config = StorageConfig::for_minio(format!("http://{}:{}", host, port), BUCKET);
        let storage = S3Storage::new(config).await?;
        storage
            .client()
            .create_bucket()
            .bucket(BUCKET)
            .send()
            .await
            .context("Failed to create bucket")?;

        Ok(Self {
            _container: container,
            storage,
        })
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_object_operations() {
    let minio = TestMinio::start().await.expect("Failed to start MinIO");
    let s3 = &minio.storage;

    assert!(!s3.exists("Incoming/a.rif").await.unwrap());
    s3.upload("Incoming/a.rif", b"HDR\nrow\n".to_vec()).await.unwrap();
    assert!(s3.exists("Incoming/a.rif").await.unwrap());
    assert_eq!(s3.download("Incoming/a.rif").await.unwrap(), b"HDR\nrow\n");

    let listed = s3.list("Incoming/").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size, 8);

    // Key with characters that need escaping in the copy source.
    let odd = "Incoming/2024-01-01T00:00:00Z/bene ficiaries+1.rif";
    s3.upload(odd, b"x".to_vec()).await.unwrap();
    s3.copy(odd, "Done/copied.rif").await.unwrap();
    assert_eq!(s3.download("Done/copied.rif").await.unwrap(), b"x");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.rif");
    let downloaded = s3.download_to("Incoming/a.rif", &path).await.unwrap();
    assert_eq!(downloaded.size, 8);
    assert_eq!(downloaded.sha256.len(), 64);
    assert_eq!(std::fs::read(&path).unwrap(), b"HDR\nrow\n");

    s3.delete("Incoming/a.rif").await.unwrap();
    s3.delete("Incoming/a.rif").await.unwrap();
    assert!(!s3.exists("Incoming/a.rif").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_gateway_fetch_and_relocate() {
    let minio = TestMinio::start().await.expect("Failed to start MinIO");
    let storage: Arc<dyn ObjectStore> = Arc::new(minio.storage.clone());

    let manifest = DataSetManifest::new(
        ManifestKey::new("Incoming", "2024-01-01T00:00:00Z", 0).unwrap(),
        DataSetLocation::regular(),
        false,
        vec![
            DataSetManifestEntry {
                name: "beneficiaries.rif".to_string(),
                file_type: RifFileType::Beneficiary,
            },
            DataSetManifestEntry {
                name: "carrier.rif".to_string(),
                file_type: RifFileType::Carrier,
            },
        ],
    );
    storage
        .upload(&manifest.manifest_key(), manifest.to_xml().unwrap().into_bytes())
        .await
        .unwrap();
    for entry in manifest.entries() {
        storage
            .upload(&manifest.entry_key(entry), b"HDR\nrow\n".to_vec())
            .await
            .unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let gateway = ObjectStoreGateway::new(storage.clone(), 2, dir.path()).unwrap();

    let keys = gateway.list_manifest_keys(&DataSetLocation::regular()).await.unwrap();
    assert_eq!(keys.len(), 1);
    let fetched = gateway
        .fetch_manifest(&keys[0], &DataSetLocation::regular())
        .await
        .unwrap();
    assert_eq!(fetched.entries().len(), 2);
    assert!(gateway.missing_entries(&fetched).await.unwrap().is_empty());

    let files = gateway
        .fetch_entries(&fetched, &FileTypeFilter::allow_all())
        .await
        .unwrap();
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.local_path.exists()));

    let summary = gateway.relocate(&fetched).await.unwrap();
    assert_eq!(summary.copied, 3);
    // Running it again finds nothing left to move.
    let again = gateway.relocate(&fetched).await.unwrap();
    assert_eq!(again.copied, 0);

    assert!(storage.list("Incoming/").await.unwrap().is_empty());
    assert_eq!(storage.list("Done/").await.unwrap().len(), 3);

    gateway.close();
    assert!(!gateway.download_root().exists());
}
