//! Upsert stage

use chrono::Utc;
use paddock_common::types::ArtifactName;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::CleanupWarning;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Stage};
use crate::storage::ObjectStore;
use crate::warehouse::{staging_table_name, Warehouse, WarehouseJob};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertReport {
    pub artifact: ArtifactName,
    pub destination: String,
    pub staging_table: String,
    /// create, load, merge and drop jobs in execution order
    pub jobs: Vec<WarehouseJob>,
    pub inserted: u64,
    pub updated: u64,
    /// Set when the staging table could not be dropped
    pub cleanup: Option<CleanupWarning>,
}

pub struct UpsertStage {
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn ObjectStore>,
    destination: String,
}

impl UpsertStage {
    pub fn new(
        config: &PipelineConfig,
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            warehouse,
            store,
            destination: config.warehouse.destination_table.clone(),
        }
    }

    /// Stage `artifact` in a run-scoped table, merge it into the destination
    /// by key, then drop the staging table.
    ///
    /// The drop is attempted whatever happened before it. Failures creating,
    /// loading or merging fail the stage; a failed drop only produces a
    /// [`CleanupWarning`].
    #[instrument(skip(self, artifact), fields(artifact = %artifact, destination = %self.destination))]
    pub async fn upsert(&self, artifact: &ArtifactName) -> Result<UpsertReport, PipelineError> {
        let staging = staging_table_name(&self.destination, Utc::now());
        info!(staging = %staging, "Starting upsert");

        let mut jobs = Vec::new();
        let outcome = self.stage_and_merge(&staging, artifact, &mut jobs).await;

        let cleanup = match self.warehouse.drop_table(&staging).await {
            Ok(job) => {
                jobs.push(job);
                None
            }
            Err(e) => {
                warn!(staging = %staging, error = %e, "Failed to drop staging table");
                Some(CleanupWarning {
                    target: staging.clone(),
                    message: format!("{:#}", e),
                })
            }
        };

        let (inserted, updated) = outcome?;

        info!(inserted, updated, "Upsert complete");

        Ok(UpsertReport {
            artifact: artifact.clone(),
            destination: self.destination.clone(),
            staging_table: staging,
            jobs,
            inserted,
            updated,
            cleanup,
        })
    }

    async fn stage_and_merge(
        &self,
        staging: &str,
        artifact: &ArtifactName,
        jobs: &mut Vec<WarehouseJob>,
    ) -> Result<(u64, u64), PipelineError> {
        let stage_err = || PipelineError::in_stage(Stage::Upsert);

        self.warehouse
            .ensure_destination(&self.destination)
            .await
            .map_err(stage_err())?;

        jobs.push(
            self.warehouse
                .create_staging(staging)
                .await
                .map_err(stage_err())?,
        );

        jobs.push(
            self.warehouse
                .load_staging(staging, self.store.as_ref(), artifact)
                .await
                .map_err(stage_err())?,
        );

        let merge = self
            .warehouse
            .merge_staging(staging, &self.destination)
            .await
            .map_err(stage_err())?;
        jobs.push(merge.job);

        Ok((merge.inserted, merge.updated))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::warehouse::{JobKind, MemoryWarehouse};

    const CLEANED: &str =
        "horse_data/master_horse_data_2025-01-01_00:00:00_cleaned_deduped_2025-01-01T00_00_01_000Z.ndjson";

    async fn setup() -> (MemoryStore, MemoryWarehouse, UpsertStage) {
        let store = MemoryStore::new("b");
        store.insert(CLEANED, "{\"id\":1}\n{\"id\":3}\n").await;
        let warehouse = MemoryWarehouse::new();
        let stage = UpsertStage::new(
            &PipelineConfig::default(),
            Arc::new(warehouse.clone()),
            Arc::new(store.clone()),
        );
        (store, warehouse, stage)
    }

    #[tokio::test]
    async fn test_upsert_runs_all_jobs_and_drops_staging() {
        let (_store, warehouse, stage) = setup().await;

        let report = stage
            .upsert(&ArtifactName::parse(CLEANED).unwrap())
            .await
            .unwrap();

        let kinds: Vec<JobKind> = report.jobs.iter().map(|j| j.kind).collect();
        assert_eq!(
            kinds,
            vec![
                JobKind::CreateTable,
                JobKind::Load,
                JobKind::Merge,
                JobKind::DropTable
            ]
        );
        assert_eq!(report.inserted, 2);
        assert!(report.staging_table.starts_with("horse_records_staging_"));
        assert!(report.cleanup.is_none());
        assert!(warehouse.staging_tables().await.is_empty());
        assert_eq!(warehouse.row_count("horse_records").await, 2);
    }

    #[tokio::test]
    async fn test_failed_merge_still_drops_staging() {
        let (_store, warehouse, stage) = setup().await;
        warehouse.fail_merges(true);

        let err = stage
            .upsert(&ArtifactName::parse(CLEANED).unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.failing_stage(), Some(Stage::Upsert));
        assert!(warehouse.staging_tables().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_drop_is_only_a_warning() {
        let (_store, warehouse, stage) = setup().await;
        warehouse.fail_drops(true);

        let report = stage
            .upsert(&ArtifactName::parse(CLEANED).unwrap())
            .await
            .unwrap();

        let warning = report.cleanup.unwrap();
        assert_eq!(warning.target, report.staging_table);
        assert_eq!(warehouse.staging_tables().await, vec![report.staging_table]);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_the_stage() {
        let (_store, warehouse, stage) = setup().await;

        let err = stage
            .upsert(&ArtifactName::parse("horse_data/missing_cleaned_deduped_x.ndjson").unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.failing_stage(), Some(Stage::Upsert));
        assert!(warehouse.staging_tables().await.is_empty());
    }
}
