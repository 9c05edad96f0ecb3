//! Bounded fetch stage

use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use paddock_common::types::{ArtifactName, Record};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Stage};
use crate::retry::RetryPolicy;
use crate::source::{FetchOutcome, RecordSource};
use crate::storage::ObjectStore;

/// What happened to one id after retries
enum ItemOutcome {
    Fetched(Box<Record>),
    NotFound,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReport {
    pub artifact: ArtifactName,
    pub start_id: u64,
    pub batch_size: u64,
    pub attempted: u64,
    pub fetched: u64,
    pub not_found: u64,
    /// Ids that kept failing after every retry
    pub dropped: u64,
}

pub struct FetchStage {
    source: Arc<dyn RecordSource>,
    store: Arc<dyn ObjectStore>,
    prefix: String,
    concurrency: usize,
    retry: RetryPolicy,
}

impl FetchStage {
    pub fn new(
        config: &PipelineConfig,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            source,
            store,
            prefix: config.data_prefix.clone(),
            concurrency: config.fetch.concurrency.max(1),
            retry: config.fetch.retry,
        }
    }

    /// Fetch every id in `[start_id, start_id + batch_size)` and write the
    /// successes as one shard artifact.
    ///
    /// Per-id failures never fail the batch. The shard is written even when
    /// nothing was fetched.
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn fetch_batch(
        &self,
        start_id: u64,
        batch_size: u64,
    ) -> Result<FetchReport, PipelineError> {
        if start_id == 0 || batch_size == 0 {
            return Err(PipelineError::Validation(
                "startId and batchSize must be positive integers".to_string(),
            ));
        }
        let end_exclusive = start_id.checked_add(batch_size).ok_or_else(|| {
            PipelineError::Validation(format!(
                "id range starting at {} with size {} overflows",
                start_id, batch_size
            ))
        })?;

        let started = Instant::now();
        info!(
            "Starting fetch batch: ids {} to {} (concurrency={})",
            start_id,
            end_exclusive - 1,
            self.concurrency
        );

        let outcomes: Vec<ItemOutcome> = stream::iter(start_id..end_exclusive)
            .map(|id| self.fetch_one(id))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut records = Vec::new();
        let (mut not_found, mut dropped) = (0u64, 0u64);
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Fetched(record) => records.push(record),
                ItemOutcome::NotFound => not_found += 1,
                ItemOutcome::Dropped => dropped += 1,
            }
        }

        let mut lines = Vec::with_capacity(records.len());
        for record in &records {
            lines.push(
                serde_json::to_string(record)
                    .context("Failed to serialize record")
                    .map_err(PipelineError::in_stage(Stage::Fetch))?,
            );
        }

        let artifact = ArtifactName::shard(&self.prefix, start_id, batch_size, Utc::now());
        self.store
            .put_bytes(artifact.as_str(), lines.join("\n").into_bytes())
            .await
            .map_err(PipelineError::in_stage(Stage::Fetch))?;

        let report = FetchReport {
            artifact,
            start_id,
            batch_size,
            attempted: batch_size,
            fetched: records.len() as u64,
            not_found,
            dropped,
        };

        info!(
            artifact = %report.artifact,
            fetched = report.fetched,
            not_found = report.not_found,
            dropped = report.dropped,
            "Fetch batch complete in {:.2}s: {}",
            started.elapsed().as_secs_f64(),
            self.store.uri(report.artifact.as_str())
        );

        Ok(report)
    }

    async fn fetch_one(&self, id: u64) -> ItemOutcome {
        let result = self.retry.run(|_| self.source.fetch(id)).await;

        match result {
            Ok(FetchOutcome::Found(record)) => ItemOutcome::Fetched(record),
            Ok(FetchOutcome::NotFound) => {
                info!(id, "Record not found, skipping");
                ItemOutcome::NotFound
            }
            Err(e) => {
                error!(id, error = %e, "Fetch failed after retries, dropping id");
                ItemOutcome::Dropped
            }
        }
    }
}
