//! 上游事件负载解析
//!
//! 累积文本可能出现在 `answer` 或 `text` 字段中，字段值可以是纯文本、
//! JSON 对象字符串（含 `answer` 或 `chunks`）、步骤数组字符串，
//! 也可能已经是解码后的数组/对象。每一层解析失败都退回最近一层的原始字符串。

use serde_json::{Map, Value};

/// 解析结果：`Fallback` 表示某一层解析失败，使用了原始字符串
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Parsed(String),
    Fallback(String),
}

impl Extraction {
    pub fn text(&self) -> &str {
        match self {
            Extraction::Parsed(text) | Extraction::Fallback(text) => text,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Extraction::Fallback(_))
    }
}

/// 从一个事件负载中提取当前累积文本
pub fn extract_cumulative_text(payload: &Value) -> Option<Extraction> {
    let field = payload.get("answer").or_else(|| payload.get("text"))?;
    extract_field(field)
}

fn extract_field(value: &Value) -> Option<Extraction> {
    match value {
        Value::String(raw) => {
            let trimmed = raw.trim_start();
            if trimmed.starts_with('[') {
                match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Array(steps)) => Some(render_steps(&steps)),
                    _ => Some(Extraction::Fallback(raw.clone())),
                }
            } else if trimmed.starts_with('{') {
                match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(object)) => object_text(&object).map(Extraction::Parsed),
                    _ => Some(Extraction::Fallback(raw.clone())),
                }
            } else {
                Some(Extraction::Parsed(raw.clone()))
            }
        }
        Value::Array(steps) => Some(render_steps(steps)),
        Value::Object(object) => object_text(object).map(Extraction::Parsed),
        Value::Null => None,
        other => Some(Extraction::Parsed(other.to_string())),
    }
}

/// 对象形式：优先 `answer`，其次拼接 `chunks`
fn object_text(object: &Map<String, Value>) -> Option<String> {
    if let Some(answer) = object.get("answer") {
        return scalar_text(answer);
    }
    object.get("chunks").and_then(Value::as_array).map(|chunks| {
        chunks
            .iter()
            .filter_map(Value::as_str)
            .collect::<String>()
    })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// 步骤数组：搜索提示、来源数量、最终答案依次拼接
fn render_steps(steps: &[Value]) -> Extraction {
    let mut text = String::new();
    let mut degraded = false;

    for step in steps {
        let content = step.get("content").unwrap_or(&Value::Null);
        match step.get("step_type").and_then(Value::as_str) {
            Some("SEARCH_WEB") => {
                let queries = content
                    .get("queries")
                    .and_then(Value::as_array)
                    .map(|queries| {
                        queries
                            .iter()
                            .filter_map(|q| q.get("query").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                text.push_str(&format!("> 🔍 Searching: {}\n\n", queries));
            }
            Some("SEARCH_RESULTS") => {
                let count = content
                    .get("web_results")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                if count > 0 {
                    text.push_str(&format!("> 📚 Found {} sources\n\n", count));
                }
            }
            Some("FINAL") => match final_answer(content.get("answer")) {
                Some(Extraction::Parsed(answer)) => text.push_str(&answer),
                Some(Extraction::Fallback(raw)) => {
                    degraded = true;
                    text.push_str(&raw);
                }
                None => {}
            },
            _ => {}
        }
    }

    if degraded {
        Extraction::Fallback(text)
    } else {
        Extraction::Parsed(text)
    }
}

/// FINAL 步骤的答案可能再包一层 JSON 字符串
fn final_answer(value: Option<&Value>) -> Option<Extraction> {
    match value? {
        Value::String(raw) if !raw.trim_start().starts_with(['{', '"']) => {
            Some(Extraction::Parsed(raw.clone()))
        }
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(object)) => object
                .get("answer")
                .and_then(scalar_text)
                .map(Extraction::Parsed),
            Ok(Value::String(inner)) => Some(Extraction::Parsed(inner)),
            Ok(_) => Some(Extraction::Parsed(raw.clone())),
            Err(_) => Some(Extraction::Fallback(raw.clone())),
        },
        Value::Object(object) => object.get("answer").and_then(scalar_text).map(Extraction::Parsed),
        other => scalar_text(other).map(Extraction::Parsed),
    }
}
