use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::handlers::AppState;
use crate::models::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatMessageContent,
    ChatUsage, ModelCard, ModelList,
};
use crate::services::stream_transcoder::{collect_text, FrameStream, StreamFrame};
use crate::utils::{generate_request_id, unix_timestamp};
use axum::{
    extract::State,
    response::{sse::Event, IntoResponse, Json, Response, Sse},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;

/// 聊天补全处理器
pub async fn completions(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Json(request): Json<ChatCompletionRequest>,
) -> ApiResult<Response> {
    authorize(&state.config, bearer.as_ref().map(|TypedHeader(auth)| auth.token()))?;

    // 验证请求
    if request.messages.is_empty() {
        return Err(ApiError::InvalidRequest("Messages cannot be empty".to_string()));
    }
    let query = request
        .last_user_query()
        .ok_or_else(|| ApiError::InvalidRequest("No user message found".to_string()))?;

    let model = request
        .model
        .clone()
        .filter(|model| !model.trim().is_empty())
        .unwrap_or_else(|| state.config.perplexity.default_model.clone());
    let request_id = generate_request_id();
    let created = unix_timestamp();

    let frames = state
        .transcoder
        .transcode(request_id.clone(), model.clone(), query);

    if request.stream.unwrap_or(true) {
        return Ok(Sse::new(create_sse_stream(frames, created)).into_response());
    }

    // 非流式响应
    let content = collect_text(frames).await;
    let response = ChatCompletionResponse {
        id: request_id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: ChatMessageContent::Text(content),
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(ChatUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }),
    };

    Ok(Json(response).into_response())
}

/// 获取模型列表
pub async fn models(State(state): State<AppState>) -> Json<ModelList> {
    let created = unix_timestamp();
    Json(ModelList {
        object: "list".to_string(),
        data: state
            .config
            .perplexity
            .models
            .iter()
            .map(|id| ModelCard {
                id: id.clone(),
                object: "model".to_string(),
                created,
                owned_by: "perplexity".to_string(),
            })
            .collect(),
    })
}

/// 校验主密钥；未配置时放行
fn authorize(config: &Config, token: Option<&str>) -> ApiResult<()> {
    if !config.master_key_enabled() {
        return Ok(());
    }
    match token {
        Some(token) if token == config.server.api_master_key => Ok(()),
        _ => Err(ApiError::Unauthorized("Invalid API Key".to_string())),
    }
}

/// 创建SSE流
fn create_sse_stream(frames: FrameStream, created: u64) -> impl Stream<Item = Result<Event, Infallible>> {
    frames.map(move |frame| match frame {
        StreamFrame::Chunk(chunk) => {
            let data = serde_json::to_string(&chunk.to_stream_chunk(created)).unwrap_or_default();
            Ok(Event::default().data(data))
        }
        StreamFrame::Done => Ok(Event::default().data("[DONE]")),
    })
}
