//! Pipeline orchestrator
//!
//! Runs `fetch (x max_batches) -> merge -> clean -> upsert` strictly in
//! sequence. Every stage is submitted through a [`JobRunner`] and awaited
//! before the next one starts. The first failure aborts the run; stages that
//! already completed are not rolled back.
//!
//! The upsert input is not taken from the clean stage's output. It is looked
//! up again by listing the namespace and taking the latest cleaned artifact,
//! so cleaning and upserting can run in different processes.

use anyhow::anyhow;
use paddock_common::types::{ArtifactKind, ArtifactName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::error::{PipelineError, Stage};
use crate::jobs::{JobRunner, StageJob, StageOutput};
use crate::stages::{
    CleanReport, CleanupWarning, DedupeCounts, FetchReport, MergeReport, UpsertReport,
};
use crate::storage::ObjectStore;

/// Validated run parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub start_id: u64,
    pub batch_size: u64,
    pub max_batches: u64,
}

impl RunParams {
    /// All three values must be positive, and the last id of the last batch
    /// must fit in a `u64`.
    pub fn new(start_id: i64, batch_size: i64, max_batches: i64) -> Result<Self, PipelineError> {
        let start_id = positive("startId", start_id)?;
        let batch_size = positive("batchSize", batch_size)?;
        let max_batches = positive("maxBatches", max_batches)?;

        batch_size
            .checked_mul(max_batches)
            .and_then(|span| start_id.checked_add(span))
            .ok_or_else(|| {
                PipelineError::Validation("id range exceeds the supported maximum".to_string())
            })?;

        Ok(Self {
            start_id,
            batch_size,
            max_batches,
        })
    }

    /// Single-batch variant
    pub fn single(start_id: i64, batch_size: i64) -> Result<Self, PipelineError> {
        Self::new(start_id, batch_size, 1)
    }

    /// First id of batch `index` (zero-based)
    pub fn batch_start(&self, index: u64) -> u64 {
        self.start_id + index * self.batch_size
    }
}

fn positive(field: &str, value: i64) -> Result<u64, PipelineError> {
    if value <= 0 {
        return Err(PipelineError::Validation(format!(
            "{} must be a positive integer, got {}",
            field, value
        )));
    }
    Ok(value as u64)
}

/// Run parameters as they arrive from a query string or JSON body.
///
/// Each value may be a JSON integer or a string holding one. Fractions,
/// booleans and other shapes are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRunParams {
    pub start_id: Option<Value>,
    pub batch_size: Option<Value>,
    pub max_batches: Option<Value>,
}

impl RawRunParams {
    pub fn validate(&self) -> Result<RunParams, PipelineError> {
        let start_id = required_int("startId", &self.start_id)?;
        let batch_size = required_int("batchSize", &self.batch_size)?;
        let max_batches = match &self.max_batches {
            None | Some(Value::Null) => 1,
            Some(value) => as_int("maxBatches", value)?,
        };
        RunParams::new(start_id, batch_size, max_batches)
    }

    /// Same as [`validate`](Self::validate) with `maxBatches` forced to 1
    pub fn validate_single(&self) -> Result<RunParams, PipelineError> {
        let start_id = required_int("startId", &self.start_id)?;
        let batch_size = required_int("batchSize", &self.batch_size)?;
        RunParams::single(start_id, batch_size)
    }
}

fn required_int(field: &str, value: &Option<Value>) -> Result<i64, PipelineError> {
    match value {
        None | Some(Value::Null) => Err(PipelineError::Validation(format!(
            "{} is required",
            field
        ))),
        Some(value) => as_int(field, value),
    }
}

fn as_int(field: &str, value: &Value) -> Result<i64, PipelineError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        PipelineError::Validation(format!("{} must be an integer, got {}", field, value))
    })
}

/// Orchestrator state; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Validating,
    Fetching { batch: u64, of: u64 },
    Merging,
    Cleaning,
    Upserting,
    Done,
    Failed,
}

impl RunState {
    fn rank(self) -> (u8, u64) {
        match self {
            RunState::Validating => (0, 0),
            RunState::Fetching { batch, .. } => (1, batch),
            RunState::Merging => (2, 0),
            RunState::Cleaning => (3, 0),
            RunState::Upserting => (4, 0),
            RunState::Done => (5, 0),
            RunState::Failed => (6, 0),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// Forward-only state holder for one run
#[derive(Debug)]
pub struct RunTracker {
    state: RunState,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self {
            state: RunState::Validating,
        }
    }
}

impl RunTracker {
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Move to `next`. Backward moves and moves out of a terminal state are
    /// ignored and return `false`.
    pub fn advance(&mut self, next: RunState) -> bool {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            warn!(from = ?self.state, to = ?next, "Ignoring backward run transition");
            return false;
        }
        info!(from = ?self.state, to = ?next, "Run state changed");
        self.state = next;
        true
    }

    pub fn fail(&mut self, error: &PipelineError) {
        if !self.state.is_terminal() {
            error!(state = ?self.state, error = %error, "Pipeline run failed");
            self.state = RunState::Failed;
        }
    }
}

/// Operation names of every job a run waited on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOperations {
    pub fetch: Vec<String>,
    pub merge: String,
    pub clean: String,
    pub upsert: String,
    /// Warehouse job ids of the upsert, in execution order
    pub warehouse_jobs: Vec<String>,
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub start_id: u64,
    pub batch_size: u64,
    pub max_batches: u64,
    pub shard_files: Vec<ArtifactName>,
    pub master_file: ArtifactName,
    /// Every shard folded into the master, leftovers from earlier runs included
    pub shards_merged: Vec<ArtifactName>,
    pub cleaned_file: ArtifactName,
    pub counts: DedupeCounts,
    pub destination: String,
    pub staging_table: String,
    pub inserted: u64,
    pub updated: u64,
    pub operations: RunOperations,
    pub warnings: Vec<CleanupWarning>,
}

pub struct PipelineOrchestrator {
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl PipelineOrchestrator {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            store,
            prefix: prefix.into(),
        }
    }

    /// Validate raw parameters, then run
    pub async fn run(&self, raw: &RawRunParams) -> Result<RunSummary, PipelineError> {
        let params = raw.validate().inspect_err(|e| {
            warn!(error = %e, "Rejected pipeline parameters");
        })?;
        self.run_pipeline(params).await
    }

    #[instrument(skip(self), fields(start_id = params.start_id, batch_size = params.batch_size, max_batches = params.max_batches))]
    pub async fn run_pipeline(&self, params: RunParams) -> Result<RunSummary, PipelineError> {
        let mut tracker = RunTracker::default();
        match self.execute(params, &mut tracker).await {
            Ok(summary) => {
                tracker.advance(RunState::Done);
                info!(
                    cleaned = %summary.cleaned_file,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "Pipeline run completed"
                );
                Ok(summary)
            }
            Err(e) => {
                tracker.fail(&e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        params: RunParams,
        tracker: &mut RunTracker,
    ) -> Result<RunSummary, PipelineError> {
        let mut operations = RunOperations::default();
        let mut shard_files = Vec::new();

        for index in 0..params.max_batches {
            tracker.advance(RunState::Fetching {
                batch: index + 1,
                of: params.max_batches,
            });
            let (name, output) = self
                .submit_and_wait(StageJob::Fetch {
                    start_id: params.batch_start(index),
                    batch_size: params.batch_size,
                })
                .await?;
            let report = expect_fetch(output)?;
            operations.fetch.push(name);
            shard_files.push(report.artifact);
        }

        tracker.advance(RunState::Merging);
        let (name, output) = self.submit_and_wait(StageJob::Merge).await?;
        let merge = expect_merge(output)?;
        operations.merge = name;

        tracker.advance(RunState::Cleaning);
        let (name, output) = self
            .submit_and_wait(StageJob::Clean {
                artifact: merge.master.as_str().to_string(),
            })
            .await?;
        let clean = expect_clean(output)?;
        operations.clean = name;

        tracker.advance(RunState::Upserting);
        let cleaned = self.latest_cleaned().await?;
        if cleaned != clean.output {
            warn!(
                produced = %clean.output,
                latest = %cleaned,
                "Latest cleaned artifact differs from the one just produced"
            );
        }
        let (name, output) = self
            .submit_and_wait(StageJob::Upsert {
                bucket: self.store.bucket().to_string(),
                artifact: cleaned.as_str().to_string(),
            })
            .await?;
        let upsert = expect_upsert(output)?;
        operations.upsert = name;
        operations.warehouse_jobs = upsert.jobs.iter().map(|j| j.job_id.clone()).collect();

        let mut warnings = merge.cleanup.warnings;
        warnings.extend(upsert.cleanup);

        Ok(RunSummary {
            start_id: params.start_id,
            batch_size: params.batch_size,
            max_batches: params.max_batches,
            shard_files,
            master_file: merge.master,
            shards_merged: merge.shards,
            cleaned_file: cleaned,
            counts: clean.counts,
            destination: upsert.destination,
            staging_table: upsert.staging_table,
            inserted: upsert.inserted,
            updated: upsert.updated,
            operations,
            warnings,
        })
    }

    async fn submit_and_wait(&self, job: StageJob) -> Result<(String, StageOutput), PipelineError> {
        let operation = self.runner.submit(job).await?;
        let name = operation.name().to_string();
        info!(operation = %name, "Waiting for operation");
        let output = operation.wait().await?;
        Ok((name, output))
    }

    /// Most recent cleaned artifact directly under the prefix
    pub async fn latest_cleaned(&self) -> Result<ArtifactName, PipelineError> {
        let keys = self
            .store
            .list(&self.prefix)
            .await
            .map_err(PipelineError::in_stage(Stage::Upsert))?;

        keys.iter()
            .filter_map(|key| ArtifactName::parse(key).ok())
            .filter(|name| name.kind() == ArtifactKind::Cleaned && name.dir() == self.prefix)
            .max()
            .ok_or_else(|| PipelineError::NoCleanedArtifact {
                prefix: self.prefix.clone(),
            })
    }
}

fn unexpected(expected: Stage, output: &StageOutput) -> PipelineError {
    PipelineError::stage(
        expected,
        anyhow!("operation returned {} output", output.stage()),
    )
}

fn expect_fetch(output: StageOutput) -> Result<FetchReport, PipelineError> {
    match output {
        StageOutput::Fetch(report) => Ok(report),
        other => Err(unexpected(Stage::Fetch, &other)),
    }
}

fn expect_merge(output: StageOutput) -> Result<MergeReport, PipelineError> {
    match output {
        StageOutput::Merge(report) => Ok(report),
        other => Err(unexpected(Stage::Merge, &other)),
    }
}

fn expect_clean(output: StageOutput) -> Result<CleanReport, PipelineError> {
    match output {
        StageOutput::Clean(report) => Ok(report),
        other => Err(unexpected(Stage::Clean, &other)),
    }
}

fn expect_upsert(output: StageOutput) -> Result<UpsertReport, PipelineError> {
    match output {
        StageOutput::Upsert(report) => Ok(report),
        other => Err(unexpected(Stage::Upsert, &other)),
    }
}
