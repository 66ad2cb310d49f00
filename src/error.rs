use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    /// 上游返回非2xx状态，403意味着会话过期
    #[error("Upstream unavailable: status {0}")]
    UpstreamUnavailable(u16),

    #[error("Malformed upstream payload: {0}")]
    MalformedPayload(String),

    #[error("Challenge unsolved: {0}")]
    ChallengeUnsolved(String),

    /// 连接中断、解码失败等
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] reqwest::Error),

    #[error("Credential persistence failed: {0}")]
    PersistenceFailure(#[from] std::io::Error),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::MalformedPayload(_) => StatusCode::BAD_GATEWAY,
            ApiError::ChallengeUnsolved(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::TransportFailure(_) => StatusCode::BAD_GATEWAY,
            ApiError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Browser(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::JsonError(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ApiError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": "api_error",
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}
