use crate::config::DEFAULT_USER_AGENT;
use crate::error::ApiResult;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub const COOKIE_KEY: &str = "PPLX_COOKIE";
pub const USER_AGENT_KEY: &str = "PPLX_USER_AGENT";

/// 会话凭证
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    pub cookies: HashMap<String, String>,
    pub user_agent: String,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

/// 凭证持久化（key=value 文本文件）
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取凭证；文件缺失的键回退到环境变量
    pub fn load(&self) -> Credential {
        let persisted: HashMap<String, String> = match dotenv::from_path_iter(&self.path) {
            Ok(entries) => entries
                .filter_map(|entry| match entry {
                    Ok(pair) => Some(pair),
                    Err(e) => {
                        warn!("Skipping malformed line in {}: {}", self.path.display(), e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                debug!("Credential file {} not readable: {}", self.path.display(), e);
                HashMap::new()
            }
        };

        let lookup = |key: &str| {
            persisted
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
                .filter(|value| !value.trim().is_empty())
        };

        let cookies = lookup(COOKIE_KEY)
            .map(|raw| parse_cookie_string(&raw))
            .unwrap_or_default();
        let user_agent = lookup(USER_AGENT_KEY)
            .map(|raw| strip_quotes(raw.trim()).to_string())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        info!(
            "Loaded credential from {}: {} cookies",
            self.path.display(),
            cookies.len()
        );

        Credential {
            cookies,
            user_agent,
            last_refresh_at: None,
        }
    }

    /// 合并更新：只改写识别的键，其余行原样保留
    pub fn save(&self, credential: &Credential) -> ApiResult<()> {
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let updates = [
            (COOKIE_KEY, serialize_cookies(&credential.cookies)),
            (USER_AGENT_KEY, credential.user_agent.clone()),
        ];
        let merged = merge_env_lines(&existing, &updates);

        std::fs::write(&self.path, merged)?;
        info!("Credential persisted to {}", self.path.display());
        Ok(())
    }
}

/// 解析 "a=1; b=2" 形式的Cookie字符串
pub fn parse_cookie_string(raw: &str) -> HashMap<String, String> {
    strip_quotes(raw.trim())
        .split(';')
        .filter_map(|item| {
            let (name, value) = item.trim().split_once('=')?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// 序列化Cookie，按名称排序保证输出稳定
pub fn serialize_cookies(cookies: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = cookies.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=(.*)$").ok())
        .as_ref()
}

/// 行首的键名；无法识别的行原样保留
fn line_key(line: &str) -> Option<&str> {
    key_pattern()?.captures(line)?.get(1).map(|m| m.as_str())
}

fn merge_env_lines(existing: &str, updates: &[(&str, String)]) -> String {
    let mut written = vec![false; updates.len()];
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            match line_key(line).and_then(|key| updates.iter().position(|(k, _)| *k == key)) {
                Some(index) => {
                    written[index] = true;
                    format_entry(updates[index].0, &updates[index].1)
                }
                _ => line.to_string(),
            }
        })
        .collect();

    for (index, (key, value)) in updates.iter().enumerate() {
        if !written[index] {
            lines.push(format_entry(key, value));
        }
    }

    let mut merged = lines.join("\n");
    merged.push('\n');
    merged
}

fn format_entry(key: &str, value: &str) -> String {
    format!("{}=\"{}\"", key, value)
}
