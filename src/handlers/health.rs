use axum::{http::StatusCode, response::Json};
use serde_json::{json, Value};

/// 根路径处理器
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Perplexity Free API Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "healthy"
    }))
}

/// 健康检查
pub async fn ping() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "message": "pong",
            "timestamp": chrono::Utc::now().timestamp(),
            "status": "healthy"
        }))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_reports_healthy() {
        let (status, Json(body)) = ping().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "pong");

        let Json(body) = root().await;
        assert_eq!(body["status"], "healthy");
    }
}
