use serde::{Deserialize, Serialize};

// OpenAI兼容的聊天请求结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub stream: Option<bool>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: ChatMessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatMessageContent {
    Text(String),
    Array(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
}

impl ChatMessageContent {
    /// 提取纯文本内容
    pub fn text(&self) -> String {
        match self {
            ChatMessageContent::Text(text) => text.clone(),
            ChatMessageContent::Array(parts) => parts
                .iter()
                .filter(|part| part.content_type == "text")
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ChatCompletionRequest {
    /// 最后一条用户消息的文本
    pub fn last_user_query(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.text())
    }
}

// OpenAI兼容的响应结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// 流式响应数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: ChatMessageDelta,
    pub finish_reason: Option<String>,
}

// 模型列表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

// Perplexity 查询请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerplexityQuery {
    pub params: QueryParams,
    pub query_str: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParams {
    pub attachments: Vec<String>,
    pub language: String,
    pub timezone: String,
    pub search_focus: String,
    pub sources: Vec<String>,
    pub frontend_uuid: String,
    pub frontend_context_uuid: String,
    pub mode: String,
    pub model_preference: String,
    pub is_related_query: bool,
    pub is_sponsored: bool,
    pub prompt_source: String,
    pub query_source: String,
    pub is_incognito: bool,
    pub time_from_first_type: f64,
    pub local_search_enabled: bool,
    pub use_schematized_api: bool,
    pub send_back_text_in_streaming_api: bool,
    pub supported_block_use_cases: Vec<String>,
    pub client_coordinates: Option<serde_json::Value>,
    pub mentions: Vec<String>,
    pub skip_search_enabled: bool,
    pub is_nav_suggestions_disabled: bool,
    pub always_search_override: bool,
    pub override_no_search: bool,
    pub should_ask_for_mcp_tool_confirmation: bool,
    pub supported_features: Vec<String>,
    pub version: String,
}
