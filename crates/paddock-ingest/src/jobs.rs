//! Asynchronous stage jobs
//!
//! A stage is submitted as a [`StageJob`] and comes back as an [`Operation`]:
//! a named handle whose [`wait`](Operation::wait) resolves to the stage's
//! [`StageOutput`] or to the failure it raised. [`LocalJobRunner`] executes
//! jobs as tokio tasks and records every operation in an
//! [`OperationRegistry`] so callers that only kept the name can poll it.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use paddock_common::types::ArtifactName;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{PipelineError, Stage};
use crate::stages::{CleanReport, FetchReport, MergeReport, PipelineStages, UpsertReport};

/// Finished operations kept for polling before the oldest are evicted.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 1024;

/// Parameters for one stage execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StageJob {
    Fetch { start_id: u64, batch_size: u64 },
    Merge,
    Clean { artifact: String },
    Upsert { bucket: String, artifact: String },
}

impl StageJob {
    pub fn stage(&self) -> Stage {
        match self {
            StageJob::Fetch { .. } => Stage::Fetch,
            StageJob::Merge => Stage::Merge,
            StageJob::Clean { .. } => Stage::Clean,
            StageJob::Upsert { .. } => Stage::Upsert,
        }
    }

    /// Run the job in-process against `stages`
    pub async fn execute(&self, stages: &PipelineStages) -> Result<StageOutput, PipelineError> {
        match self {
            StageJob::Fetch {
                start_id,
                batch_size,
            } => stages
                .fetch
                .fetch_batch(*start_id, *batch_size)
                .await
                .map(StageOutput::Fetch),
            StageJob::Merge => stages.merge.merge_shards().await.map(StageOutput::Merge),
            StageJob::Clean { artifact } => {
                let artifact = parse_artifact(artifact)?;
                stages
                    .clean
                    .clean_and_dedupe(&artifact)
                    .await
                    .map(StageOutput::Clean)
            }
            StageJob::Upsert { bucket, artifact } => {
                let configured = stages.store().bucket();
                if bucket != configured {
                    return Err(PipelineError::Validation(format!(
                        "artifact bucket {} is not the configured bucket {}",
                        bucket, configured
                    )));
                }
                let artifact = parse_artifact(artifact)?;
                stages
                    .upsert
                    .upsert(&artifact)
                    .await
                    .map(StageOutput::Upsert)
            }
        }
    }
}

fn parse_artifact(key: &str) -> Result<ArtifactName, PipelineError> {
    ArtifactName::parse(key).map_err(|e| PipelineError::Validation(e.to_string()))
}

/// What a finished stage produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageOutput {
    Fetch(FetchReport),
    Merge(MergeReport),
    Clean(CleanReport),
    Upsert(UpsertReport),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Fetch(_) => Stage::Fetch,
            StageOutput::Merge(_) => Stage::Merge,
            StageOutput::Clean(_) => Stage::Clean,
            StageOutput::Upsert(_) => Stage::Upsert,
        }
    }
}

/// Handle to a submitted job
pub struct Operation {
    name: String,
    completion: BoxFuture<'static, Result<StageOutput, PipelineError>>,
}

impl Operation {
    pub fn new(
        name: impl Into<String>,
        completion: BoxFuture<'static, Result<StageOutput, PipelineError>>,
    ) -> Self {
        Self {
            name: name.into(),
            completion,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the job to finish
    pub async fn wait(self) -> Result<StageOutput, PipelineError> {
        self.completion.await
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation").field("name", &self.name).finish()
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Start `job` and return its handle without waiting for it
    async fn submit(&self, job: StageJob) -> Result<Operation, PipelineError>;

    /// Latest known state of a submitted operation
    async fn status(&self, name: &str) -> Option<OperationRecord>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum OperationState {
    Running,
    Succeeded {
        output: Box<StageOutput>,
    },
    Failed {
        error: String,
        stage: Option<Stage>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub name: String,
    pub job: StageJob,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub state: OperationState,
}

impl OperationRecord {
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, OperationState::Running)
    }
}

struct RegistryInner {
    records: HashMap<String, OperationRecord>,
    order: VecDeque<String>,
    capacity: usize,
}

/// Shared table of operations by name. Once more than `capacity` operations
/// are known, the oldest finished ones are forgotten.
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_REGISTRY_CAPACITY)
    }
}

impl OperationRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                records: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    pub async fn start(&self, name: &str, job: StageJob) {
        let mut inner = self.inner.write().await;

        while inner.records.len() >= inner.capacity {
            let Some(pos) = inner.order.iter().position(|n| {
                inner
                    .records
                    .get(n)
                    .is_some_and(OperationRecord::is_finished)
            }) else {
                break;
            };
            if let Some(evicted) = inner.order.remove(pos) {
                inner.records.remove(&evicted);
            }
        }

        inner.order.push_back(name.to_string());
        inner.records.insert(
            name.to_string(),
            OperationRecord {
                name: name.to_string(),
                job,
                submitted_at: Utc::now(),
                finished_at: None,
                state: OperationState::Running,
            },
        );
    }

    pub async fn finish(&self, name: &str, result: &Result<StageOutput, PipelineError>) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.records.get_mut(name) {
            record.finished_at = Some(Utc::now());
            record.state = match result {
                Ok(output) => OperationState::Succeeded {
                    output: Box::new(output.clone()),
                },
                Err(e) => OperationState::Failed {
                    error: e.to_string(),
                    stage: e.failing_stage(),
                },
            };
        }
    }

    pub async fn get(&self, name: &str) -> Option<OperationRecord> {
        self.inner.read().await.records.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Runs stage jobs as tokio tasks in this process
#[derive(Clone)]
pub struct LocalJobRunner {
    stages: Arc<PipelineStages>,
    registry: OperationRegistry,
}

impl LocalJobRunner {
    pub fn new(stages: Arc<PipelineStages>) -> Self {
        Self::with_registry(stages, OperationRegistry::default())
    }

    pub fn with_registry(stages: Arc<PipelineStages>, registry: OperationRegistry) -> Self {
        Self { stages, registry }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }
}

#[async_trait]
impl JobRunner for LocalJobRunner {
    async fn submit(&self, job: StageJob) -> Result<Operation, PipelineError> {
        let stage = job.stage();
        let name = format!("operations/{}-{}", stage, Uuid::new_v4());
        self.registry.start(&name, job.clone()).await;
        info!(operation = %name, ?job, "Operation started");

        let stages = self.stages.clone();
        let registry = self.registry.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = job.execute(&stages).await;
            match &result {
                Ok(_) => info!(operation = %task_name, "Operation succeeded"),
                Err(e) => error!(operation = %task_name, error = %e, "Operation failed"),
            }
            registry.finish(&task_name, &result).await;
            result
        });

        let completion = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::stage(
                    stage,
                    anyhow!("operation task did not complete: {}", e),
                )),
            }
        }
        .boxed();

        Ok(Operation::new(name, completion))
    }

    async fn status(&self, name: &str) -> Option<OperationRecord> {
        self.registry.get(name).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::source::{FetchOutcome, RecordSource, SourceError};
    use crate::storage::MemoryStore;
    use crate::warehouse::MemoryWarehouse;

    struct NothingSource;

    #[async_trait]
    impl RecordSource for NothingSource {
        async fn fetch(&self, _id: u64) -> Result<FetchOutcome, SourceError> {
            Ok(FetchOutcome::NotFound)
        }
    }

    fn runner(store: &MemoryStore) -> LocalJobRunner {
        let stages = PipelineStages::new(
            &PipelineConfig::default(),
            Arc::new(NothingSource),
            Arc::new(store.clone()),
            Arc::new(MemoryWarehouse::new()),
        );
        LocalJobRunner::new(Arc::new(stages))
    }

    #[test]
    fn test_stage_job_wire_format() {
        let job = StageJob::Fetch {
            start_id: 1,
            batch_size: 1000,
        };
        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            serde_json::json!({"stage": "fetch", "startId": 1, "batchSize": 1000})
        );
        let parsed: StageJob =
            serde_json::from_str(r#"{"stage":"upsert","bucket":"b","artifact":"k"}"#).unwrap();
        assert_eq!(parsed.stage(), Stage::Upsert);
    }

    #[tokio::test]
    async fn test_operation_success_is_recorded() {
        let store = MemoryStore::new("b");
        let runner = runner(&store);

        let op = runner
            .submit(StageJob::Fetch {
                start_id: 1,
                batch_size: 2,
            })
            .await
            .unwrap();
        let name = op.name().to_string();
        assert!(name.starts_with("operations/fetch-"));

        let output = op.wait().await.unwrap();
        assert_eq!(output.stage(), Stage::Fetch);

        let record = runner.status(&name).await.unwrap();
        assert!(matches!(record.state, OperationState::Succeeded { .. }));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_operation_failure_propagates() {
        let store = MemoryStore::new("b");
        let runner = runner(&store);

        let op = runner.submit(StageJob::Merge).await.unwrap();
        let name = op.name().to_string();
        let err = op.wait().await.unwrap_err();
        assert!(matches!(err, PipelineError::NothingToMerge { .. }));

        let record = runner.status(&name).await.unwrap();
        match record.state {
            OperationState::Failed { stage, .. } => assert_eq!(stage, Some(Stage::Merge)),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upsert_rejects_foreign_bucket() {
        let store = MemoryStore::new("b");
        let runner = runner(&store);

        let err = runner
            .submit(StageJob::Upsert {
                bucket: "someone-else".into(),
                artifact: "horse_data/x_cleaned_deduped_y.ndjson".into(),
            })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_registry_evicts_oldest_finished() {
        let registry = OperationRegistry::with_capacity(2);
        registry.start("a", StageJob::Merge).await;
        registry.start("b", StageJob::Merge).await;
        registry
            .finish(
                "a",
                &Err(PipelineError::NothingToMerge {
                    prefix: "p/".into(),
                }),
            )
            .await;

        registry.start("c", StageJob::Merge).await;
        assert!(registry.get("a").await.is_none());
        assert!(registry.get("b").await.is_some());
        assert!(registry.get("c").await.is_some());

        // nothing finished: grow past capacity rather than drop a running operation
        registry.start("d", StageJob::Merge).await;
        assert_eq!(registry.len().await, 3);
    }
}
