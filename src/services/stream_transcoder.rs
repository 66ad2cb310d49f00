use crate::config::PerplexityConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{ChatMessageDelta, PerplexityQuery, QueryParams, StreamChoice, StreamChunk};
use crate::services::answer_parser::extract_cumulative_text;
use crate::services::session_manager::SessionManager;
use crate::utils::{generate_uuid, preview};
use axum::body::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{future, stream, FutureExt, Stream, StreamExt};
use reqwest::header::HeaderValue;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

pub type FrameStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

const NO_CONTENT_WARNING: &str = "[Warning: No content returned]";

/// 首次输入到提交的耗时（毫秒）
const TIME_FROM_FIRST_TYPE_MS: f64 = 1344.2;

/// 流结束时补一个空行，让未以空行结尾的最后一条 `data:` 也被分发
const EOF_DISPATCH: &[u8] = b"\n\n";

const SUPPORTED_BLOCK_USE_CASES: [&str; 26] = [
    "answer_modes",
    "media_items",
    "knowledge_cards",
    "inline_entity_cards",
    "place_widgets",
    "finance_widgets",
    "prediction_market_widgets",
    "sports_widgets",
    "flight_status_widgets",
    "news_widgets",
    "shopping_widgets",
    "jobs_widgets",
    "search_result_widgets",
    "clarification_responses",
    "inline_images",
    "inline_assets",
    "placeholder_cards",
    "diff_blocks",
    "inline_knowledge_cards",
    "entity_group_v2",
    "refinement_filters",
    "canvas_mode",
    "maps_preview",
    "answer_tabs",
    "price_comparison_widgets",
    "preserve_latex",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FinishReason {
    Stop,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
        }
    }
}

/// 输出片段
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub request_id: String,
    pub model: String,
    pub delta_text: String,
    pub finish_reason: Option<FinishReason>,
}

impl OutputChunk {
    pub fn to_stream_chunk(&self, created: u64) -> StreamChunk {
        StreamChunk {
            id: self.request_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta: ChatMessageDelta {
                    role: Some("assistant".to_string()),
                    content: (!self.delta_text.is_empty()).then(|| self.delta_text.clone()),
                },
                finish_reason: self.finish_reason.map(|reason| reason.as_str().to_string()),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Chunk(OutputChunk),
    Done,
}

/// 单次转码的状态；累积文本只增不减
#[derive(Debug)]
pub struct StreamSession {
    pub request_id: String,
    pub model: String,
    pub accumulated_text: String,
    pub has_emitted_content: bool,
    accumulated_chars: usize,
}

impl StreamSession {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            accumulated_text: String::new(),
            has_emitted_content: false,
            accumulated_chars: 0,
        }
    }

    /// 新累积文本更长（按字符计）时返回超出部分；相等或更短时忽略
    pub fn advance(&mut self, cumulative: &str) -> Option<OutputChunk> {
        let chars = cumulative.chars().count();
        if chars <= self.accumulated_chars {
            return None;
        }

        let delta: String = cumulative.chars().skip(self.accumulated_chars).collect();
        self.accumulated_text = cumulative.to_string();
        self.accumulated_chars = chars;
        self.has_emitted_content = true;
        Some(self.chunk(delta, None))
    }

    pub fn chunk(&self, delta_text: impl Into<String>, finish_reason: Option<FinishReason>) -> OutputChunk {
        OutputChunk {
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            delta_text: delta_text.into(),
            finish_reason,
        }
    }
}

/// 转码结束方式
#[derive(Debug)]
enum PumpEnd {
    Completed,
    Cancelled,
    Failed(ApiError),
}

/// 上游流式请求转码器
pub struct StreamTranscoder {
    client: Client,
    api_url: String,
    language: String,
    timezone: String,
    session: Arc<SessionManager>,
}

impl StreamTranscoder {
    pub fn new(config: &PerplexityConfig, session: Arc<SessionManager>) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            language: config.language.clone(),
            timezone: config.timezone.clone(),
            session,
        })
    }

    /// 构造上游查询
    pub fn build_query(&self, model: &str, query: &str) -> PerplexityQuery {
        PerplexityQuery {
            params: QueryParams {
                attachments: Vec::new(),
                language: self.language.clone(),
                timezone: self.timezone.clone(),
                search_focus: "internet".to_string(),
                sources: ["edgar", "social", "web", "scholar"].into_iter().map(String::from).collect(),
                frontend_uuid: generate_uuid(),
                frontend_context_uuid: generate_uuid(),
                mode: "copilot".to_string(),
                model_preference: model.to_string(),
                is_related_query: false,
                is_sponsored: false,
                prompt_source: "user".to_string(),
                query_source: "home".to_string(),
                is_incognito: false,
                time_from_first_type: TIME_FROM_FIRST_TYPE_MS,
                local_search_enabled: false,
                use_schematized_api: true,
                send_back_text_in_streaming_api: false,
                supported_block_use_cases: SUPPORTED_BLOCK_USE_CASES.into_iter().map(String::from).collect(),
                client_coordinates: None,
                mentions: Vec::new(),
                skip_search_enabled: true,
                is_nav_suggestions_disabled: false,
                always_search_override: false,
                override_no_search: false,
                should_ask_for_mcp_tool_confirmation: true,
                supported_features: vec!["browser_agent_permission_banner".to_string()],
                version: "2.18".to_string(),
            },
            query_str: query.to_string(),
        }
    }

    /// 发起上游请求并返回输出帧流，最后两帧总是结束片段与 `Done`
    pub fn transcode(&self, request_id: String, model: String, query: String) -> FrameStream {
        let (tx, rx) = mpsc::channel(100);
        let payload = self.build_query(&model, &query);
        let client = self.client.clone();
        let api_url = self.api_url.clone();
        let manager = self.session.clone();

        info!("Sending upstream request [{}]: {}", request_id, preview(&query, 50));

        tokio::spawn(async move {
            let mut session = StreamSession::new(request_id, model);

            let result = AssertUnwindSafe(pump(&client, &api_url, &payload, &manager, &mut session, &tx))
                .catch_unwind()
                .await;
            let end = result.unwrap_or_else(|_| {
                error!("Transcoder task panicked [{}]", session.request_id);
                PumpEnd::Failed(ApiError::Internal("transcoder task panicked".to_string()))
            });

            debug!("Upstream stream ended [{}]: {:?}", session.request_id, end);
            for frame in closing_frames(&session, end) {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

/// 结束帧：错误/警告片段、结束片段、`Done`
fn closing_frames(session: &StreamSession, end: PumpEnd) -> Vec<StreamFrame> {
    let mut frames = Vec::new();
    match end {
        PumpEnd::Cancelled => return frames,
        PumpEnd::Failed(ApiError::UpstreamUnavailable(status)) => {
            frames.push(StreamFrame::Chunk(session.chunk(
                format!("[Error: Upstream {}]", status),
                Some(FinishReason::Stop),
            )));
            frames.push(StreamFrame::Done);
            return frames;
        }
        PumpEnd::Failed(e) => {
            frames.push(StreamFrame::Chunk(session.chunk(format!("[Error: {}]", e), None)));
        }
        PumpEnd::Completed if !session.has_emitted_content => {
            frames.push(StreamFrame::Chunk(session.chunk(NO_CONTENT_WARNING, None)));
        }
        PumpEnd::Completed => {}
    }
    frames.push(StreamFrame::Chunk(session.chunk("", Some(FinishReason::Stop))));
    frames.push(StreamFrame::Done);
    frames
}

async fn pump(
    client: &Client,
    api_url: &str,
    payload: &PerplexityQuery,
    manager: &Arc<SessionManager>,
    session: &mut StreamSession,
    tx: &mpsc::Sender<StreamFrame>,
) -> PumpEnd {
    if !manager.ensure_fresh(false).await {
        warn!("Session refresh failed, continuing with the last known credential");
    }

    let mut headers = manager.headers();
    if let Ok(value) = HeaderValue::from_str(&session.request_id) {
        headers.insert("x-request-id", value);
    }
    match HeaderValue::from_str(&manager.cookie_header()) {
        Ok(value) => {
            headers.insert("Cookie", value);
        }
        Err(e) => warn!("Cookie header rejected: {}", e),
    }

    let request = client.post(api_url).headers(headers).json(payload).send();
    let response = tokio::select! {
        _ = tx.closed() => return PumpEnd::Cancelled,
        result = request => match result {
            Ok(response) => response,
            Err(e) => {
                error!("Upstream request failed [{}]: {}", session.request_id, e);
                return PumpEnd::Failed(e.into());
            }
        },
    };

    let status = response.status();
    if !status.is_success() {
        error!("Upstream error {} [{}]", status.as_u16(), session.request_id);
        if status == StatusCode::FORBIDDEN {
            manager.schedule_forced_refresh();
        }
        return PumpEnd::Failed(ApiError::UpstreamUnavailable(status.as_u16()));
    }

    let trailer = stream::once(future::ready(Ok(Bytes::from_static(EOF_DISPATCH))));
    let mut events = Box::pin(response.bytes_stream().chain(trailer).eventsource());
    loop {
        let event = tokio::select! {
            _ = tx.closed() => return PumpEnd::Cancelled,
            event = events.next() => event,
        };

        let event = match event {
            None => return PumpEnd::Completed,
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                error!("Upstream stream broken [{}]: {}", session.request_id, e);
                return PumpEnd::Failed(stream_error(e));
            }
        };

        for line in event.data.lines() {
            let Some(chunk) = process_line(session, line) else {
                continue;
            };
            if tx.send(StreamFrame::Chunk(chunk)).await.is_err() {
                return PumpEnd::Cancelled;
            }
        }
    }
}

fn stream_error(error: EventStreamError<reqwest::Error>) -> ApiError {
    match error {
        EventStreamError::Transport(e) => ApiError::TransportFailure(e),
        other => ApiError::MalformedPayload(other.to_string()),
    }
}

fn process_line(session: &mut StreamSession, line: &str) -> Option<OutputChunk> {
    let line = line.trim();
    if line.is_empty() || line == "[DONE]" {
        return None;
    }

    let payload: Value = match serde_json::from_str(line) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Unparsable event line [{}]: {}", session.request_id, e);
            return None;
        }
    };

    let extraction = extract_cumulative_text(&payload)?;
    if extraction.is_fallback() {
        debug!("Falling back to raw answer text [{}]", session.request_id);
    }
    session.advance(extraction.text())
}

/// 非流式场景：把帧流聚合为完整文本
pub async fn collect_text(mut frames: FrameStream) -> String {
    let mut text = String::new();
    while let Some(frame) = frames.next().await {
        if let StreamFrame::Chunk(chunk) = frame {
            text.push_str(&chunk.delta_text);
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::challenge_solver::tests::{fast_timing, FakeLauncher, FakeScript};
    use crate::services::challenge_solver::ChallengeSolver;
    use crate::services::credential_store::CredentialStore;
    use crate::services::session_manager::ANCHOR_COOKIE;
    use axum::{
        body::Body,
        http::{header, HeaderMap},
        routing::post,
        Router,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct Harness {
        transcoder: StreamTranscoder,
        manager: Arc<SessionManager>,
        script: Arc<FakeScript>,
        _dir: TempDir,
    }

    fn harness(api_url: String) -> Harness {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "PPLX_COOKIE=\"pplx.visitor-id=v0; session=s0\"\n").unwrap();

        let script = Arc::new(FakeScript {
            titles: Mutex::new(vec!["Perplexity".to_string()]),
            cookies: [(ANCHOR_COOKIE, "v1"), ("session", "s1")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        });
        let solver = ChallengeSolver::new(
            Arc::new(FakeLauncher(script.clone())),
            "https://www.perplexity.ai".to_string(),
            fast_timing(),
        );
        let manager = Arc::new(SessionManager::new(
            CredentialStore::new(path),
            solver,
            Duration::from_secs(300),
            "https://www.perplexity.ai".to_string(),
        ));

        let config = PerplexityConfig {
            target_url: "https://www.perplexity.ai".to_string(),
            api_url,
            credential_file: dir.path().join(".env"),
            refresh_interval_secs: 300,
            request_timeout_secs: 10,
            language: "zh-CN".to_string(),
            timezone: "Asia/Shanghai".to_string(),
            default_model: "gemini30pro".to_string(),
            models: vec!["gemini30pro".to_string()],
            warmup_on_start: false,
        };
        let transcoder = StreamTranscoder::new(&config, manager.clone()).unwrap();

        Harness {
            transcoder,
            manager,
            script,
            _dir: dir,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/rest/sse/perplexity_ask", addr)
    }

    async fn fake_upstream(status: u16, body: &'static str) -> String {
        let app = Router::new().route(
            "/rest/sse/perplexity_ask",
            post(move || async move {
                (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    body,
                )
            }),
        );
        serve(app).await
    }

    fn texts(frames: &[StreamFrame]) -> Vec<(String, Option<FinishReason>)> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                StreamFrame::Chunk(chunk) => Some((chunk.delta_text.clone(), chunk.finish_reason)),
                StreamFrame::Done => None,
            })
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_forbidden_emits_error_and_schedules_refresh() {
        let url = fake_upstream(403, "Forbidden").await;
        let h = harness(url);

        let frames: Vec<StreamFrame> = h
            .transcoder
            .transcode("req-1".to_string(), "gemini30pro".to_string(), "hi".to_string())
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(
            texts(&frames),
            vec![("[Error: Upstream 403]".to_string(), Some(FinishReason::Stop))]
        );
        assert_eq!(frames.last(), Some(&StreamFrame::Done));

        // 首次请求刷新一次，403再强制刷新一次
        let script = h.script.clone();
        assert!(wait_until(|| script.launches.load(Ordering::SeqCst) == 2).await);
    }

    #[tokio::test]
    async fn test_cumulative_text_becomes_deltas() {
        let body = concat!(
            "data: {\"text\":\"{\\\"answer\\\":\\\"Hel\\\"}\"}\n\n",
            "event: ping\n\n",
            "data: {\"text\":\"{\\\"answer\\\":\\\"Hello\\\"}\"}\n\n",
            "data: [DONE]\n\n",
        );
        let url = fake_upstream(200, body).await;
        let h = harness(url);

        let frames: Vec<StreamFrame> = h
            .transcoder
            .transcode("req-2".to_string(), "gemini30pro".to_string(), "hi".to_string())
            .collect()
            .await;

        assert_eq!(
            texts(&frames),
            vec![
                ("Hel".to_string(), None),
                ("lo".to_string(), None),
                (String::new(), Some(FinishReason::Stop)),
            ]
        );
        assert_eq!(frames.last(), Some(&StreamFrame::Done));
        assert_eq!(frames.iter().filter(|f| **f == StreamFrame::Done).count(), 1);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_processed() {
        for body in ["data: {\"answer\":\"Hello\"}\n", "data: {\"answer\":\"Hello\"}"] {
            let url = fake_upstream(200, body).await;
            let h = harness(url);

            let frames: Vec<StreamFrame> = h
                .transcoder
                .transcode("req-7".to_string(), "gemini30pro".to_string(), "hi".to_string())
                .collect()
                .await;

            assert_eq!(
                texts(&frames),
                vec![
                    ("Hello".to_string(), None),
                    (String::new(), Some(FinishReason::Stop)),
                ]
            );
            assert_eq!(frames.last(), Some(&StreamFrame::Done));
        }
    }

    #[tokio::test]
    async fn test_no_content_yields_single_warning() {
        let body = "data: {\"status\":\"PENDING\"}\n\ndata: not-json\n\ndata: [DONE]\n\n";
        let url = fake_upstream(200, body).await;
        let h = harness(url);

        let frames: Vec<StreamFrame> = h
            .transcoder
            .transcode("req-3".to_string(), "gemini30pro".to_string(), "hi".to_string())
            .collect()
            .await;

        assert_eq!(
            texts(&frames),
            vec![
                (NO_CONTENT_WARNING.to_string(), None),
                (String::new(), Some(FinishReason::Stop)),
            ]
        );
        assert_eq!(frames.last(), Some(&StreamFrame::Done));
    }

    #[tokio::test]
    async fn test_request_carries_session_headers_and_query() {
        let seen: Arc<Mutex<Option<(HeaderMap, Value)>>> = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let app = Router::new().route(
            "/rest/sse/perplexity_ask",
            post(move |headers: HeaderMap, axum::Json(body): axum::Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock() = Some((headers, body));
                    "data: {\"answer\":\"ok\"}\n\n"
                }
            }),
        );
        let h = harness(serve(app).await);

        let text = collect_text(h.transcoder.transcode(
            "req-4".to_string(),
            "claude45sonnet".to_string(),
            "what is rust".to_string(),
        ))
        .await;
        assert_eq!(text, "ok");

        let (headers, body) = seen.lock().clone().unwrap();
        assert_eq!(headers["x-request-id"], "req-4");
        assert!(headers["cookie"].to_str().unwrap().contains("pplx.visitor-id=v1"));
        assert_eq!(body["query_str"], "what is rust");
        assert_eq!(body["params"]["model_preference"], "claude45sonnet");
        assert_eq!(body["params"]["version"], "2.18");
        assert_eq!(body["params"]["time_from_first_type"], 1344.2);
        assert_eq!(headers["referer"], "https://www.perplexity.ai/search/new");
    }

    #[tokio::test]
    async fn test_broken_stream_still_terminates() {
        let app = Router::new().route(
            "/rest/sse/perplexity_ask",
            post(|| async {
                let chunks = stream::iter(vec![
                    Ok(Bytes::from_static(b"data: {\"answer\":\"partial\"}\n\n")),
                    Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
                ]);
                Body::from_stream(chunks)
            }),
        );
        let h = harness(serve(app).await);

        let frames: Vec<StreamFrame> = h
            .transcoder
            .transcode("req-5".to_string(), "gemini30pro".to_string(), "hi".to_string())
            .collect()
            .await;

        let texts = texts(&frames);
        assert_eq!(texts[0], ("partial".to_string(), None));
        assert!(texts[1].0.starts_with("[Error: "));
        assert_eq!(texts[2], (String::new(), Some(FinishReason::Stop)));
        assert_eq!(texts.len(), 3);
        assert_eq!(frames.last(), Some(&StreamFrame::Done));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_the_pump() {
        let app = Router::new().route(
            "/rest/sse/perplexity_ask",
            post(|| async {
                let first = stream::once(async {
                    Ok::<_, std::io::Error>(Bytes::from_static(b"data: {\"answer\":\"Hi\"}\n\n"))
                });
                Body::from_stream(first.chain(stream::pending()))
            }),
        );
        let h = harness(serve(app).await);

        let mut frames = h
            .transcoder
            .transcode("req-6".to_string(), "gemini30pro".to_string(), "hi".to_string());
        let first = frames.next().await;
        assert!(matches!(first, Some(StreamFrame::Chunk(ref c)) if c.delta_text == "Hi"));
        drop(frames);

        // 后台任务结束后释放对会话管理器的引用
        let manager = h.manager.clone();
        assert!(wait_until(|| Arc::strong_count(&manager) == 3).await);
    }

    #[test]
    fn test_shorter_or_equal_text_is_suppressed() {
        let mut session = StreamSession::new("req", "model");
        assert_eq!(session.advance("Hello").unwrap().delta_text, "Hello");
        assert!(session.advance("Hel").is_none());
        assert!(session.advance("Hallo").is_none());
        assert_eq!(session.advance("Hello, 世界").unwrap().delta_text, ", 世界");
        assert_eq!(session.advance("Hello, 世界!").unwrap().delta_text, "!");
        assert_eq!(session.accumulated_text, "Hello, 世界!");
    }

    #[test]
    fn test_multiline_payload_processed_line_by_line() {
        let mut session = StreamSession::new("req", "model");
        let data = "{\"answer\":\"a\"}\n{\"answer\":\"ab\"}";
        let deltas: Vec<String> = data
            .lines()
            .filter_map(|line| process_line(&mut session, line))
            .map(|chunk| chunk.delta_text)
            .collect();
        assert_eq!(deltas, vec!["a", "b"]);
    }

    #[test]
    fn test_chunk_rendering() {
        let session = StreamSession::new("req-9", "gemini30pro");
        let rendered = session.chunk("", Some(FinishReason::Stop)).to_stream_chunk(42);
        assert_eq!(rendered.object, "chat.completion.chunk");
        assert_eq!(rendered.id, "req-9");
        assert_eq!(rendered.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(rendered.choices[0].delta.content.is_none());

        let value = serde_json::to_value(session.chunk("x", None).to_stream_chunk(42)).unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"], "x");
        assert!(value["choices"][0]["finish_reason"].is_null());
    }
}
