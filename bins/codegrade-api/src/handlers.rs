// HTTP route handlers for the Codegrade API

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use codegrade_common::types::Submission;
use codegrade_engine::GradingError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub exercise_id: String,
    pub language: String,
    pub source_code: String,
    /// Attribution only
    #[serde(default)]
    pub submitter: String,
}

#[derive(Debug, Serialize)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub compiled: bool,
}

/// POST /execute - Grade a submission and return its verdict.
///
/// If the client disconnects, this future is dropped together with the
/// submission handle, which cancels the submission.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> Response {
    let submission = Submission::new(
        payload.exercise_id,
        payload.language,
        payload.source_code,
        payload.submitter,
    );
    let submission_id = submission.id;

    let handle = match state.scheduler.submit(submission).await {
        Ok(handle) => handle,
        Err(e) => return error_response(&e),
    };
    info!(submission_id = %submission_id, "Submission accepted");

    match handle.verdict().await {
        Ok(verdict) => (StatusCode::OK, Json(verdict)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /status - Health and scheduler load
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.scheduler.stats();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "workers": stats.workers,
            "active": stats.active,
            "queued": stats.queued,
        })),
    )
}

/// GET /languages - Configured language profiles
pub async fn languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut languages: Vec<LanguageInfo> = state
        .scheduler
        .registry()
        .profiles()
        .map(|p| LanguageInfo {
            name: p.name.to_lowercase(),
            version: p.version.clone(),
            compiled: p.compile.is_some(),
        })
        .collect();
    languages.sort_by(|a, b| a.name.cmp(&b.name));

    (StatusCode::OK, Json(languages))
}

fn status_for(err: &GradingError) -> StatusCode {
    match err {
        GradingError::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
        GradingError::ExerciseNotFound(_) => StatusCode::NOT_FOUND,
        GradingError::SourceTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        GradingError::EmptyExercise(_) | GradingError::DuplicateCase { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        GradingError::QueueClosed | GradingError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        GradingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &GradingError) -> Response {
    let status = status_for(err);
    let body = match err {
        // Infrastructure details stay in the logs
        GradingError::Internal(e) => {
            error!(error = %format!("{:#}", e), "Grading could not complete");
            json!({
                "outcome": "internal_error",
                "message": "grading could not complete",
            })
        }
        other => {
            warn!(error = %other, status = status.as_u16(), "Submission rejected");
            json!({ "error": other.to_string() })
        }
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_map_to_client_errors() {
        assert_eq!(
            status_for(&GradingError::UnsupportedLanguage("cobol".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&GradingError::ExerciseNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&GradingError::SourceTooLarge { size: 2, limit: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&GradingError::EmptyExercise("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&GradingError::DuplicateCase {
                exercise: "x".into(),
                case: 3
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(&GradingError::QueueClosed), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let err = GradingError::Internal(anyhow::anyhow!("mkdtemp /var/tmp/codegrade-x: ENOSPC"));

        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["outcome"], "internal_error");
        assert_eq!(body["message"], "grading could not complete");
        assert!(!body.to_string().contains("ENOSPC"));
    }

    #[test]
    fn test_request_submitter_is_optional() {
        let request: ExecuteRequest = serde_json::from_str(
            r#"{"exercise_id": "hello", "language": "python", "source_code": "print(1)"}"#,
        )
        .unwrap();

        assert_eq!(request.submitter, "");
    }
}
