//! Pipeline trigger routes

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use paddock_common::types::ArtifactName;
use paddock_ingest::context::PipelineContext;
use paddock_ingest::jobs::{JobRunner, OperationRecord, StageJob, StageOutput};
use paddock_ingest::orchestrator::{RawRunParams, RunSummary};
use paddock_ingest::{PipelineError, Stage};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tower_http::compression::CompressionLayer;
use tracing::info;

use crate::config::Config;
use crate::error::AppError;
use crate::middleware;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub context: PipelineContext,
}

impl AppState {
    pub fn new(context: PipelineContext) -> Self {
        Self { context }
    }
}

/// Router with every pipeline route and the middleware stack
pub fn router(state: AppState, config: &Config) -> Router {
    routes(state)
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(&config.cors))
}

/// Routes without middleware
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/pipeline/run", get(run_pipeline).post(run_pipeline))
        .route("/pipeline/run-batch", get(run_batch).post(run_batch))
        .route("/pipeline/trigger", post(trigger_batch))
        .route("/pipeline/merge", post(merge_shards))
        .route("/operations/:id", get(get_operation))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "bucket": state.context.store().bucket(),
        "prefix": state.context.config().data_prefix,
    }))
}

/// Parameters from the query string, overridden by any JSON body fields
fn run_params(query: HashMap<String, String>, body: &[u8]) -> Result<RawRunParams, AppError> {
    let from_query = |key: &str| query.get(key).map(|v| Value::String(v.clone()));
    let mut params = RawRunParams {
        start_id: from_query("startId"),
        batch_size: from_query("batchSize"),
        max_batches: from_query("maxBatches"),
    };

    if body.iter().any(|b| !b.is_ascii_whitespace()) {
        let from_body: RawRunParams = serde_json::from_slice(body)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))?;
        if from_body.start_id.is_some() {
            params.start_id = from_body.start_id;
        }
        if from_body.batch_size.is_some() {
            params.batch_size = from_body.batch_size;
        }
        if from_body.max_batches.is_some() {
            params.max_batches = from_body.max_batches;
        }
    }

    Ok(params)
}

async fn run_pipeline(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<RunSummary>, AppError> {
    let params = run_params(query, &body)?.validate()?;
    let summary = state.context.orchestrator().run_pipeline(params).await?;
    Ok(Json(summary))
}

async fn run_batch(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<RunSummary>, AppError> {
    let params = run_params(query, &body)?.validate_single()?;
    let summary = state.context.orchestrator().run_pipeline(params).await?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    operation_name: String,
}

/// Submit one fetch batch and return without waiting for it
async fn trigger_batch(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<TriggerResponse>, AppError> {
    let params = run_params(query, &body)?.validate_single()?;
    let operation = state
        .context
        .runner()
        .submit(StageJob::Fetch {
            start_id: params.start_id,
            batch_size: params.batch_size,
        })
        .await?;

    info!(operation = %operation.name(), "Fetch batch triggered");
    Ok(Json(TriggerResponse {
        operation_name: operation.name().to_string(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MergeResponse {
    operation_name: String,
    master_file: ArtifactName,
    shards_merged: Vec<ArtifactName>,
}

async fn merge_shards(State(state): State<AppState>) -> Result<Json<MergeResponse>, AppError> {
    let operation = state.context.runner().submit(StageJob::Merge).await?;
    let operation_name = operation.name().to_string();

    match operation.wait().await? {
        StageOutput::Merge(report) => Ok(Json(MergeResponse {
            operation_name,
            master_file: report.master,
            shards_merged: report.shards,
        })),
        other => Err(PipelineError::stage(
            Stage::Merge,
            anyhow::anyhow!("merge operation returned {} output", other.stage()),
        )
        .into()),
    }
}

async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OperationRecord>, AppError> {
    let name = format!("operations/{}", id);
    state
        .context
        .runner()
        .status(&name)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("operation {} does not exist", name)))
}
