//! The small error envelope every handler's failure path returns, matching
//! the teacher's `ErrorEnvelope` shape in `tandem-server/src/http.rs`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub struct ApiError {
    pub status: StatusCode,
    pub envelope: ErrorEnvelope,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            status,
            envelope: ErrorEnvelope {
                error: error.into(),
                code: code.map(str::to_string),
            },
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, Some("BAD_REQUEST"))
    }

    pub fn forbidden(error: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error, Some("FORBIDDEN"))
    }

    pub fn unauthorized(error: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, error, Some("AUTH_REQUIRED"))
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error, Some("NOT_FOUND"))
    }

    pub fn internal(error: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error, Some("INTERNAL"))
    }
}

impl From<orgx_cloud::CloudError> for ApiError {
    fn from(err: orgx_cloud::CloudError) -> Self {
        if err.is_unauthorized() {
            ApiError::unauthorized(err.to_string())
        } else {
            ApiError::new(StatusCode::BAD_GATEWAY, err.to_string(), Some("CLOUD_ERROR"))
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}
