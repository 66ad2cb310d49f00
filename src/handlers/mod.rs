pub mod chat;
pub mod health;

use crate::config::Config;
use crate::error::ApiResult;
use crate::services::browser::{BrowserLauncher, ChromeLauncher};
use crate::services::{SessionManager, StreamTranscoder};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub transcoder: Arc<StreamTranscoder>,
    pub session: Arc<SessionManager>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> ApiResult<Self> {
        let launcher: Arc<dyn BrowserLauncher> = Arc::new(ChromeLauncher::new(&config.browser));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: Config, launcher: Arc<dyn BrowserLauncher>) -> ApiResult<Self> {
        let session = Arc::new(SessionManager::from_config(&config, launcher));
        let transcoder = Arc::new(StreamTranscoder::new(&config.perplexity, session.clone())?);

        Ok(Self {
            transcoder,
            session,
            config,
        })
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        // 健康检查
        .route("/", get(health::root))
        .route("/ping", get(health::ping))

        // 聊天API - OpenAI兼容
        .route("/v1/chat/completions", post(chat::completions))

        // 模型列表 - OpenAI兼容
        .route("/v1/models", get(chat::models))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
        )
        .with_state(state)
}
