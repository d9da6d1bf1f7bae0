// Response envelope and engine-error mapping shared by every handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use opsflow_engine::EngineError;

/// Uniform envelope: `{ status, code, message, data }`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: String,
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            status: "OK".to_string(),
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        })
    }
}

impl ApiResponse<()> {
    pub fn success() -> Json<Self> {
        Json(Self {
            status: "OK".to_string(),
            code: 0,
            message: "success".to_string(),
            data: None,
        })
    }
}

/// Engine errors rendered through the envelope with the status code the
/// error kind dictates.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, 400),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, 404),
            EngineError::Repository(_) | EngineError::Plugin(_) | EngineError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, 500)
            }
        };
        let body = Json(ApiResponse::<()> {
            status: "ERROR".to_string(),
            code,
            message: self.0.to_string(),
            data: None,
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let response = ApiError(EngineError::Validation("bad act".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = ApiError(EngineError::NotFound("instance x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn repository_maps_to_500() {
        let response = ApiError(EngineError::Repository("db down".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
