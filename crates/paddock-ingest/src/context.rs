//! Wiring of adapters, stages, job runner and orchestrator
//!
//! Binaries build one [`PipelineContext`] at startup and share it. Tests build
//! one from in-memory adapters with [`PipelineContext::from_parts`].

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::jobs::{JobRunner, LocalJobRunner};
use crate::orchestrator::PipelineOrchestrator;
use crate::source::{HttpRecordSource, RecordSource};
use crate::stages::PipelineStages;
use crate::storage::{ObjectStore, S3Store};
use crate::warehouse::{PostgresWarehouse, Warehouse};

#[derive(Clone)]
pub struct PipelineContext {
    config: Arc<PipelineConfig>,
    stages: Arc<PipelineStages>,
    runner: Arc<LocalJobRunner>,
    orchestrator: Arc<PipelineOrchestrator>,
}

impl PipelineContext {
    /// Connect the production adapters: S3 storage, the HTTP registry and
    /// the Postgres warehouse.
    pub async fn connect(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let store = S3Store::new(config.storage.clone())
            .await
            .context("Failed to initialize object storage")
            .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;

        let source = HttpRecordSource::new(config.source.base_url.clone(), config.request_timeout())
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let warehouse = PostgresWarehouse::connect(&config.warehouse)
            .await
            .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;

        info!(
            bucket = %config.storage.bucket,
            prefix = %config.data_prefix,
            destination = %config.warehouse.destination_table,
            "Pipeline context ready"
        );

        Ok(Self::from_parts(
            config,
            Arc::new(source),
            Arc::new(store),
            Arc::new(warehouse),
        ))
    }

    pub fn from_parts(
        config: PipelineConfig,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        let stages = Arc::new(PipelineStages::new(&config, source, store.clone(), warehouse));
        let runner = Arc::new(LocalJobRunner::new(stages.clone()));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            runner.clone() as Arc<dyn JobRunner>,
            store,
            config.data_prefix.clone(),
        ));

        Self {
            config: Arc::new(config),
            stages,
            runner,
            orchestrator,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stages(&self) -> &PipelineStages {
        &self.stages
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        self.stages.store()
    }

    pub fn runner(&self) -> &LocalJobRunner {
        &self.runner
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }
}
