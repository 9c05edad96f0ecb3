//! Object storage seam
//!
//! Stages only talk to storage through [`ObjectStore`]. [`S3Store`] is the
//! production backend; [`MemoryStore`] backs tests and local dry runs.
//!
//! Artifacts are immutable once published. Multi-part outputs go through an
//! [`ArtifactWriter`], which spools to a local temp file and publishes with a
//! single upload, so a reader either sees the complete object or nothing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use paddock_common::types::ArtifactName;
use std::path::Path;
use std::pin::Pin;
use tempfile::TempPath;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWriteExt, BufWriter};
use tracing::debug;

pub mod config;
pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// Streamed object body
pub type ObjectReader = Pin<Box<dyn AsyncBufRead + Send>>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Every key under `prefix`, in no particular order
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn reader(&self, key: &str) -> Result<ObjectReader>;

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket(), key)
    }
}

/// Buffered writer for one artifact; nothing is visible until [`finish`](Self::finish).
pub struct ArtifactWriter {
    name: ArtifactName,
    file: BufWriter<tokio::fs::File>,
    path: TempPath,
    bytes: u64,
}

impl ArtifactWriter {
    pub async fn create(name: ArtifactName) -> Result<Self> {
        let path = tempfile::Builder::new()
            .prefix("paddock-")
            .suffix(".ndjson")
            .tempfile()
            .context("Failed to create spool file")?
            .into_temp_path();
        let file = tokio::fs::File::create(&path)
            .await
            .context("Failed to open spool file")?;

        Ok(Self {
            name,
            file: BufWriter::new(file),
            path,
            bytes: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Write `line` followed by `\n`
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.write_all(line.as_bytes()).await?;
        self.write_all(b"\n").await
    }

    /// Stream a whole reader into the artifact
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let copied = tokio::io::copy(reader, &mut self.file).await?;
        self.bytes += copied;
        Ok(copied)
    }

    /// Flush the spool file and publish it under the artifact name
    pub async fn finish(mut self, store: &dyn ObjectStore) -> Result<ArtifactName> {
        self.file.flush().await.context("Failed to flush spool file")?;
        self.file
            .get_mut()
            .sync_all()
            .await
            .context("Failed to sync spool file")?;

        debug!(
            artifact = %self.name,
            bytes = self.bytes,
            "Publishing artifact"
        );

        store
            .put_file(self.name.as_str(), &self.path)
            .await
            .with_context(|| format!("Failed to publish {}", self.name))?;

        Ok(self.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_publishes_only_on_finish() {
        let store = MemoryStore::new("bucket");
        let name = ArtifactName::parse("horse_data/out.ndjson").unwrap();

        let mut writer = ArtifactWriter::create(name.clone()).await.unwrap();
        writer.write_line(r#"{"id":1}"#).await.unwrap();
        writer.write_all(b"tail").await.unwrap();
        assert_eq!(writer.bytes_written(), 13);
        assert!(store.get(name.as_str()).await.is_none());

        let published = writer.finish(&store).await.unwrap();
        assert_eq!(published, name);
        assert_eq!(
            store.get_string(name.as_str()).await.unwrap(),
            "{\"id\":1}\ntail"
        );
    }

    #[tokio::test]
    async fn test_uri() {
        let store = MemoryStore::new("paddock-data");
        assert_eq!(store.uri("a/b.ndjson"), "s3://paddock-data/a/b.ndjson");
    }
}
