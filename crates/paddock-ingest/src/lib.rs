//! Paddock ingestion pipeline
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch pipeline that pulls horse records from the remote registry by
//! numeric id range and lands them in the warehouse.
//!
//! # Stages
//!
//! - **Fetch**: one shard artifact per id range, fetched under a concurrency cap
//! - **Merge**: every pending shard concatenated into a master artifact
//! - **Clean**: malformed lines and duplicate keys removed, first seen wins
//! - **Upsert**: cleaned artifact staged in the warehouse and merged by key
//!
//! Stages never share in-memory state; they hand work to each other through
//! object-storage keys (see [`paddock_common::types::ArtifactName`]). The
//! [`orchestrator::PipelineOrchestrator`] submits each stage as a job through a
//! [`jobs::JobRunner`] and waits for it before moving on.
//!
//! # Example
//!
//! ```no_run
//! use paddock_ingest::{config::PipelineConfig, context::PipelineContext, orchestrator::RunParams};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let context = PipelineContext::connect(config).await?;
//!     let summary = context
//!         .orchestrator()
//!         .run_pipeline(RunParams::new(1, 1000, 1)?)
//!         .await?;
//!     println!("{}", summary.cleaned_file);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod retry;
pub mod source;
pub mod stages;
pub mod storage;
pub mod warehouse;

pub use error::{PipelineError, Stage};
