//! The four pipeline stages
//!
//! Each stage is a plain struct built from [`crate::config::PipelineConfig`]
//! plus the adapters it needs, with one async entry point. Stages can be run
//! directly, through a [`crate::jobs::JobRunner`], or from the CLI.

use serde::Serialize;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::source::RecordSource;
use crate::storage::ObjectStore;
use crate::warehouse::Warehouse;

pub mod clean;
pub mod fetch;
pub mod merge;
pub mod upsert;

pub use clean::{CleanReport, CleanStage, DedupeCounts};
pub use fetch::{FetchReport, FetchStage};
pub use merge::{MergeReport, MergeStage};
pub use upsert::{UpsertReport, UpsertStage};

/// A best-effort post-action that did not succeed. Logged and reported,
/// never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupWarning {
    /// Object key or table name that was left behind
    pub target: String,
    pub message: String,
}

/// Outcome of retiring a set of inputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub warnings: Vec<CleanupWarning>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// All four stages wired to the same adapters
pub struct PipelineStages {
    pub fetch: FetchStage,
    pub merge: MergeStage,
    pub clean: CleanStage,
    pub upsert: UpsertStage,
    store: Arc<dyn ObjectStore>,
}

impl PipelineStages {
    pub fn new(
        config: &PipelineConfig,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            fetch: FetchStage::new(config, source, store.clone()),
            merge: MergeStage::new(config, store.clone()),
            clean: CleanStage::new(config, store.clone()),
            upsert: UpsertStage::new(config, warehouse, store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}
