//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use paddock_ingest::{PipelineError, Stage};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Pipeline(PipelineError::Validation(_)) => StatusCode::BAD_REQUEST,
            AppError::Pipeline(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            AppError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn stage(&self) -> Option<Stage> {
        match self {
            AppError::Pipeline(e) => e.failing_stage(),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut error = json!({
            "message": self.to_string(),
            "status": status.as_u16(),
        });
        if let Some(stage) = self.stage() {
            error["stage"] = json!(stage);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                AppError::from(PipelineError::Validation("startId is required".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::from(PipelineError::NothingToMerge {
                    prefix: "horse_data/".into(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(PipelineError::NoCleanedArtifact {
                    prefix: "horse_data/".into(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(PipelineError::stage(
                    Stage::Upsert,
                    anyhow::anyhow!("merge rejected"),
                )),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::NotFound("operations/x".into()),
                StatusCode::NOT_FOUND,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.status(), status, "{}", err);
        }
    }

    #[tokio::test]
    async fn test_error_body_names_stage() {
        let response = AppError::from(PipelineError::stage(
            Stage::Clean,
            anyhow::anyhow!("disk full"),
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["stage"], "clean");
        assert_eq!(json["error"]["status"], 500);
        assert_eq!(json["error"]["message"], "clean stage failed: disk full");
    }
}
