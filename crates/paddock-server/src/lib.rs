//! Paddock Server Library
//!
//! HTTP trigger surface for the Paddock ingestion pipeline.
//!
//! # Endpoints
//!
//! - `GET|POST /pipeline/run`: full run over `maxBatches` batches
//! - `GET|POST /pipeline/run-batch`: full run over a single batch
//! - `POST /pipeline/trigger`: submit one fetch batch, return its operation name
//! - `POST /pipeline/merge`: run the merge stage on its own
//! - `GET /operations/:id`: poll a submitted operation
//! - `GET /health`
//!
//! Parameters (`startId`, `batchSize`, `maxBatches`) come from the query string
//! or a JSON body; numbers and numeric strings are both accepted. Failures are
//! returned as `{"error": {"message", "status", "stage"}}`.
//!
//! # Example
//!
//! ```no_run
//! use paddock_ingest::{config::PipelineConfig, context::PipelineContext};
//! use paddock_server::{config::Config, routes};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let context = PipelineContext::connect(PipelineConfig::from_env()?).await?;
//!     let app = routes::router(routes::AppState::new(context), &config);
//!     let listener = tokio::net::TcpListener::bind(config.server.addr()?).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;

pub use error::AppError;
