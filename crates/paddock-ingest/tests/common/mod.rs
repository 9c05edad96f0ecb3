//! Shared helpers for paddock-ingest integration tests

#![allow(dead_code)]

use paddock_ingest::config::PipelineConfig;
use paddock_ingest::context::PipelineContext;
use paddock_ingest::retry::RetryPolicy;
use paddock_ingest::source::RecordSource;
use paddock_ingest::storage::MemoryStore;
use paddock_ingest::warehouse::MemoryWarehouse;
use std::sync::Arc;
use std::time::Duration;

pub const BUCKET: &str = "paddock-test";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,paddock_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Default configuration with a short retry delay
pub fn test_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_bucket(BUCKET)
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(10)))
}

/// In-memory adapters plus a context wired to them
pub struct Harness {
    pub context: PipelineContext,
    pub store: MemoryStore,
    pub warehouse: MemoryWarehouse,
}

impl Harness {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self::with_config(test_config(), source)
    }

    pub fn with_config(config: PipelineConfig, source: Arc<dyn RecordSource>) -> Self {
        let store = MemoryStore::new(BUCKET);
        let warehouse = MemoryWarehouse::new();
        let context = PipelineContext::from_parts(
            config,
            source,
            Arc::new(store.clone()),
            Arc::new(warehouse.clone()),
        );
        Self {
            context,
            store,
            warehouse,
        }
    }
}
