//! Shard merge stage

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use paddock_common::types::ArtifactName;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{CleanupReport, CleanupWarning};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Stage};
use crate::storage::{ArtifactWriter, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub master: ArtifactName,
    /// Inputs in the order they were appended
    pub shards: Vec<ArtifactName>,
    pub bytes: u64,
    pub cleanup: CleanupReport,
}

pub struct MergeStage {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl MergeStage {
    pub fn new(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: config.data_prefix.clone(),
        }
    }

    /// Shards directly under the prefix, in merge order
    pub async fn pending_shards(&self) -> Result<Vec<ArtifactName>, PipelineError> {
        let keys = self
            .store
            .list(&self.prefix)
            .await
            .map_err(PipelineError::in_stage(Stage::Merge))?;

        let mut shards: Vec<ArtifactName> = keys
            .iter()
            .filter_map(|key| ArtifactName::parse(key).ok())
            .filter(|name| name.is_shard() && name.dir() == self.prefix)
            .collect();
        shards.sort();
        Ok(shards)
    }

    /// Concatenate every pending shard into a new master artifact, then
    /// retire the shards.
    ///
    /// Each shard is followed by `\n` so records never join across a shard
    /// boundary. Shards are deleted only after the master is published; a
    /// failed delete becomes a [`CleanupWarning`].
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn merge_shards(&self) -> Result<MergeReport, PipelineError> {
        let shards = self.pending_shards().await?;
        if shards.is_empty() {
            info!("No shards to merge");
            return Err(PipelineError::NothingToMerge {
                prefix: self.prefix.clone(),
            });
        }

        info!("Merging {} shards", shards.len());

        let master = ArtifactName::master(&self.prefix, Utc::now());
        let mut writer = ArtifactWriter::create(master)
            .await
            .map_err(PipelineError::in_stage(Stage::Merge))?;

        for shard in &shards {
            let mut reader = self
                .store
                .reader(shard.as_str())
                .await
                .map_err(PipelineError::in_stage(Stage::Merge))?;
            writer
                .copy_from(&mut reader)
                .await
                .with_context(|| format!("Failed to append {}", shard))
                .map_err(PipelineError::in_stage(Stage::Merge))?;
            writer
                .write_all(b"\n")
                .await
                .map_err(PipelineError::in_stage(Stage::Merge))?;
        }

        let bytes = writer.bytes_written();
        let master = writer
            .finish(self.store.as_ref())
            .await
            .map_err(PipelineError::in_stage(Stage::Merge))?;

        info!(
            master = %master,
            bytes,
            "Merged {} shards into {}",
            shards.len(),
            self.store.uri(master.as_str())
        );

        let cleanup = self.retire(&shards).await;

        Ok(MergeReport {
            master,
            shards,
            bytes,
            cleanup,
        })
    }

    async fn retire(&self, shards: &[ArtifactName]) -> CleanupReport {
        let results = join_all(shards.iter().map(|shard| async move {
            (shard, self.store.delete(shard.as_str()).await)
        }))
        .await;

        let mut report = CleanupReport::default();
        for (shard, result) in results {
            match result {
                Ok(()) => report.removed.push(shard.to_string()),
                Err(e) => {
                    warn!(shard = %shard, error = %e, "Failed to delete merged shard");
                    report.warnings.push(CleanupWarning {
                        target: shard.to_string(),
                        message: format!("{:#}", e),
                    });
                }
            }
        }
        report
    }
}
