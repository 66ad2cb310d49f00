use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    pub server: ServerConfig,
    pub perplexity: PerplexityConfig,
    pub browser: BrowserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_master_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerplexityConfig {
    pub target_url: String,
    pub api_url: String,
    pub credential_file: PathBuf,
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub language: String,
    pub timezone: String,
    pub default_model: String,
    pub models: Vec<String>,
    pub warmup_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub executable: Option<String>,
    pub headless: bool,
    pub challenge_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                api_master_key: "1".to_string(),
            },
            perplexity: PerplexityConfig {
                target_url: "https://www.perplexity.ai".to_string(),
                api_url: "https://www.perplexity.ai/rest/sse/perplexity_ask".to_string(),
                credential_file: PathBuf::from(".env"),
                refresh_interval_secs: 300,
                request_timeout_secs: 300,
                language: "zh-CN".to_string(),
                timezone: "Asia/Shanghai".to_string(),
                default_model: "gemini30pro".to_string(),
                models: vec![
                    "gemini30pro".to_string(),
                    "gpt-4o".to_string(),
                    "claude-3-opus".to_string(),
                    "sonar-reasoning-pro".to_string(),
                    "sonar-pro".to_string(),
                ],
                warmup_on_start: true,
            },
            browser: BrowserConfig {
                executable: None,
                headless: true,
                challenge_timeout_secs: 120,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // 服务配置
        if let Ok(port) = env::var("PORT") {
            config.server.port = port.parse().context("PORT must be a port number")?;
        }

        if let Ok(host) = env::var("HOST") {
            config.server.host = host;
        }

        if let Ok(env_type) = env::var("ENVIRONMENT") {
            config.environment = env_type;
        }

        if let Ok(key) = env::var("API_MASTER_KEY") {
            config.server.api_master_key = key;
        }

        // Perplexity相关配置
        if let Ok(url) = env::var("PPLX_TARGET_URL") {
            config.perplexity.target_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(url) = env::var("PPLX_API_URL") {
            config.perplexity.api_url = url;
        }

        if let Ok(path) = env::var("CREDENTIAL_FILE") {
            config.perplexity.credential_file = PathBuf::from(path);
        }

        if let Ok(secs) = env::var("REFRESH_INTERVAL_SECS") {
            config.perplexity.refresh_interval_secs = secs
                .parse()
                .context("REFRESH_INTERVAL_SECS must be an integer")?;
        }

        if let Ok(secs) = env::var("REQUEST_TIMEOUT_SECS") {
            config.perplexity.request_timeout_secs = secs
                .parse()
                .context("REQUEST_TIMEOUT_SECS must be an integer")?;
        }

        if let Ok(language) = env::var("PPLX_LANGUAGE") {
            config.perplexity.language = language;
        }

        if let Ok(timezone) = env::var("PPLX_TIMEZONE") {
            config.perplexity.timezone = timezone;
        }

        if let Ok(model) = env::var("DEFAULT_MODEL") {
            config.perplexity.default_model = model;
        }

        if let Ok(models) = env::var("MODELS") {
            let models = parse_list(&models);
            if !models.is_empty() {
                config.perplexity.models = models;
            }
        }

        if let Ok(flag) = env::var("WARMUP_ON_START") {
            config.perplexity.warmup_on_start = parse_bool(&flag);
        }

        // 浏览器配置
        if let Ok(path) = env::var("BROWSER_PATH") {
            if !path.trim().is_empty() {
                config.browser.executable = Some(path);
            }
        }

        if let Ok(flag) = env::var("BROWSER_HEADLESS") {
            config.browser.headless = parse_bool(&flag);
        }

        if let Ok(secs) = env::var("CHALLENGE_TIMEOUT_SECS") {
            config.browser.challenge_timeout_secs = secs
                .parse()
                .context("CHALLENGE_TIMEOUT_SECS must be an integer")?;
        }

        Ok(config)
    }

    /// 是否启用API密钥校验（"1"表示关闭）
    pub fn master_key_enabled(&self) -> bool {
        !self.server.api_master_key.is_empty() && self.server.api_master_key != "1"
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.perplexity.refresh_interval_secs, 300);
        assert_eq!(config.perplexity.request_timeout_secs, 300);
        assert_eq!(config.perplexity.models.len(), 5);
        assert!(!config.master_key_enabled());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("off"));
    }
}
