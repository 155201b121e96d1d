use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::github_client::UpstreamError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation_error: {0}")]
    Validation(String),
    #[error("authentication_error")]
    Authentication,
    #[error("upstream_error: {0}")]
    Upstream(anyhow::Error),
    #[error("internal_server_error: {0}")]
    InternalServerError(#[from] anyhow::Error),
}

impl AppError {
    /// GitHub API failures become `Upstream`, anything else is ours.
    pub fn from_handler_error(e: anyhow::Error) -> Self {
        let upstream = e.chain().any(|c| {
            c.is::<UpstreamError>() || c.is::<reqwest_middleware::Error>() || c.is::<reqwest::Error>()
        });
        if upstream {
            Self::Upstream(e)
        } else {
            Self::InternalServerError(e)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::Validation(reason) => {
                warn!("rejected invalid request: {reason}");
                (StatusCode::BAD_REQUEST, "bad_request", reason.clone())
            }
            Self::Authentication => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "authentication failed".to_owned(),
            ),
            Self::Upstream(inner) => {
                error!(error = ?inner, "GitHub API call failed while handling request");
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    #[cfg(debug_assertions)]
                    format!("GitHub API call failed:\n{inner:#}"),
                    #[cfg(not(debug_assertions))]
                    "GitHub API call failed".to_owned(),
                )
            }
            Self::InternalServerError(inner) => {
                error!(error = ?inner, "handler failed to process request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_server_error",
                    #[cfg(debug_assertions)]
                    format!("something went wrong:\n{inner:#}"),
                    #[cfg(not(debug_assertions))]
                    "something went wrong".to_owned(),
                )
            }
        };

        let body = Json(json!({
            "error_code": code,
            "message": message,
        }));
        (status, body).into_response()
    }
}
