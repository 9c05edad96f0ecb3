//! S3 storage integration tests
//!
//! **Requirements**:
//! - MinIO or S3 reachable, bucket already created
//! - `S3_ENDPOINT` set (e.g. "http://localhost:9000"); tests are skipped otherwise

use paddock_common::types::ArtifactName;
use paddock_ingest::storage::{config::StorageConfig, ArtifactWriter, ObjectStore, S3Store};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

async fn setup_store() -> Option<S3Store> {
    if std::env::var("S3_ENDPOINT").is_err() {
        return None;
    }

    match S3Store::new(StorageConfig::from_env()).await {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("Failed to create storage client: {}", e);
            None
        }
    }
}

fn test_prefix() -> String {
    format!("test/{}/", Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_put_list_read_delete() {
    let Some(store) = setup_store().await else {
        println!("Skipping test: S3_ENDPOINT not configured");
        return;
    };

    let prefix = test_prefix();
    let key = format!("{}horse_data_1_to_2_0000000000001.ndjson", prefix);
    store
        .put_bytes(&key, b"{\"id\":1}\n{\"id\":2}".to_vec())
        .await
        .expect("Upload should succeed");

    let keys = store.list(&prefix).await.expect("List should succeed");
    assert_eq!(keys, vec![key.clone()]);

    let mut body = String::new();
    store
        .reader(&key)
        .await
        .expect("Reader should open")
        .read_to_string(&mut body)
        .await
        .unwrap();
    assert_eq!(body, "{\"id\":1}\n{\"id\":2}");

    store.delete(&key).await.expect("Delete should succeed");
    assert!(store.list(&prefix).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_artifact_writer_publishes_whole_object() {
    let Some(store) = setup_store().await else {
        println!("Skipping test: S3_ENDPOINT not configured");
        return;
    };

    let prefix = test_prefix();
    let name = ArtifactName::master(&prefix, chrono::Utc::now());
    let mut writer = ArtifactWriter::create(name.clone()).await.unwrap();
    writer.write_line("{\"id\":1}").await.unwrap();
    writer.write_line("{\"id\":2}").await.unwrap();

    assert!(store.list(&prefix).await.unwrap().is_empty());
    let published = writer.finish(&store).await.unwrap();
    assert_eq!(published, name);

    let mut body = String::new();
    store
        .reader(name.as_str())
        .await
        .unwrap()
        .read_to_string(&mut body)
        .await
        .unwrap();
    assert_eq!(body, "{\"id\":1}\n{\"id\":2}\n");

    store.delete(name.as_str()).await.unwrap();
}
