//! 本地 Chromium 启动与页面控制

use super::cdp::CdpConnection;
use super::finder::find_chromium;
use super::{BoundingBox, BrowserLauncher, BrowserPage, LaunchOptions};
use crate::config::BrowserConfig;
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_ATTEMPTS: usize = 40;
const STARTUP_POLL: Duration = Duration::from_millis(250);
const IDLE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    #[serde(rename = "type")]
    target_type: String,
    web_socket_debugger_url: Option<String>,
}

/// 通过 CDP 驱动的 Chromium 启动器
pub struct ChromeLauncher {
    executable: Option<String>,
    headless: bool,
}

impl ChromeLauncher {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            headless: config.headless,
        }
    }

    fn build_command(&self, executable: &Path, profile: &Path, options: &LaunchOptions) -> Command {
        let mut command = Command::new(executable);
        if self.headless {
            command.arg("--headless=new");
        }
        command
            .args([
                "--no-sandbox",
                "--disable-setuid-sandbox",
                "--disable-blink-features=AutomationControlled",
                "--no-first-run",
                "--no-default-browser-check",
                "--remote-debugging-port=0",
            ])
            .arg(format!("--user-data-dir={}", profile.display()))
            .arg(format!("--window-size={},{}", options.viewport.0, options.viewport.1))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, options: &LaunchOptions) -> ApiResult<Box<dyn BrowserPage>> {
        let executable = find_chromium(self.executable.as_deref()).ok_or_else(|| {
            ApiError::Browser("Chromium executable not found, set BROWSER_PATH".to_string())
        })?;

        let profile = tempfile::Builder::new()
            .prefix("pplx-profile-")
            .tempdir()
            .map_err(|e| ApiError::Browser(format!("Failed to create profile dir: {}", e)))?;

        let child = self
            .build_command(&executable, profile.path(), options)
            .spawn()
            .map_err(|e| {
                ApiError::Browser(format!("Failed to launch {}: {}", executable.display(), e))
            })?;
        info!("Launched browser {} (pid {:?})", executable.display(), child.id());

        // 此后任何错误都会drop进程（kill_on_drop）和临时目录
        let mut process = BrowserProcess {
            child,
            profile: Some(profile),
        };
        let ws_url = process.wait_for_page_target().await?;
        let connection = CdpConnection::connect(&ws_url).await?;

        let mut page = ChromePage {
            process,
            connection,
            pointer: (0.0, 0.0),
        };
        page.prepare(options).await?;

        Ok(Box::new(page))
    }
}

struct BrowserProcess {
    child: Child,
    profile: Option<TempDir>,
}

impl BrowserProcess {
    /// 从 DevToolsActivePort 读取端口，再从 /json/list 找到页面target
    async fn wait_for_page_target(&mut self) -> ApiResult<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()?;
        let port_file = self
            .profile
            .as_ref()
            .map(|dir| dir.path().join("DevToolsActivePort"))
            .ok_or_else(|| ApiError::Browser("Browser profile already released".to_string()))?;
        let mut last_error = "endpoint not reachable".to_string();

        for _ in 0..STARTUP_ATTEMPTS {
            tokio::time::sleep(STARTUP_POLL).await;

            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(ApiError::Browser(format!(
                    "Browser exited before debugging endpoint became available (status: {})",
                    status
                )));
            }

            let port = match tokio::fs::read_to_string(&port_file).await {
                Ok(content) => match content.lines().next().and_then(|l| l.trim().parse::<u16>().ok()) {
                    Some(port) => port,
                    None => continue,
                },
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            let url = format!("http://127.0.0.1:{}/json/list", port);
            let targets = match client.get(&url).send().await {
                Ok(response) => match response.json::<Vec<TargetInfo>>().await {
                    Ok(targets) => targets,
                    Err(e) => {
                        last_error = e.to_string();
                        continue;
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            if let Some(ws_url) = targets
                .into_iter()
                .find(|t| t.target_type == "page")
                .and_then(|t| t.web_socket_debugger_url)
            {
                debug!("Found page target {}", ws_url);
                return Ok(ws_url);
            }
        }

        Err(ApiError::Browser(format!(
            "Browser debugging endpoint not available: {}",
            last_error
        )))
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Browser process already gone: {}", e);
        }
        if let Some(profile) = self.profile.take() {
            if let Err(e) = profile.close() {
                warn!("Failed to remove browser profile: {}", e);
            }
        }
    }
}

/// 单页面会话
pub struct ChromePage {
    process: BrowserProcess,
    connection: CdpConnection,
    pointer: (f64, f64),
}

impl ChromePage {
    async fn call(&self, method: &str, params: Value) -> ApiResult<Value> {
        self.connection.call(method, params, COMMAND_TIMEOUT).await
    }

    async fn prepare(&mut self, options: &LaunchOptions) -> ApiResult<()> {
        self.call("Page.enable", json!({})).await?;
        self.call("Network.enable", json!({})).await?;
        self.call("Runtime.enable", json!({})).await?;
        self.call(
            "Network.setUserAgentOverride",
            json!({ "userAgent": options.user_agent }),
        )
        .await?;
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": options.viewport.0,
                "height": options.viewport.1,
                "deviceScaleFactor": 1,
                "mobile": false
            }),
        )
        .await?;

        if !options.cookies.is_empty() {
            let cookies: Vec<Value> = options
                .cookies
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value, "url": options.cookie_url }))
                .collect();
            // 注入失败不影响后续流程
            if let Err(e) = self.call("Network.setCookies", json!({ "cookies": cookies })).await {
                warn!("Failed to seed cookies: {}", e);
            }
        }

        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> ApiResult<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            return Err(ApiError::Browser(format!("Evaluation failed: {}", details)));
        }
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn dispatch_mouse(&self, event_type: &str, buttons: u8) -> ApiResult<()> {
        let button = if event_type == "mouseMoved" { "none" } else { "left" };
        self.call(
            "Input.dispatchMouseEvent",
            json!({
                "type": event_type,
                "x": self.pointer.0,
                "y": self.pointer.1,
                "button": button,
                "buttons": buttons,
                "clickCount": 1
            }),
        )
        .await?;
        Ok(())
    }
}

fn collect_frame_urls(node: &Value, urls: &mut Vec<String>) {
    if let Some(url) = node.pointer("/frame/url").and_then(Value::as_str) {
        urls.push(url.to_string());
    }
    if let Some(children) = node.get("childFrames").and_then(Value::as_array) {
        for child in children {
            collect_frame_urls(child, urls);
        }
    }
}

#[async_trait]
impl BrowserPage for ChromePage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> ApiResult<()> {
        let mut events = self.connection.subscribe();
        let result = self.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            return Err(ApiError::Browser(format!("Navigation to {} failed: {}", url, error)));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) if event.method == "Page.domContentEventFired" => return Ok(()),
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => {
                    return Err(ApiError::Browser("Browser connection closed".to_string()))
                }
                Err(_) => {
                    return Err(ApiError::Timeout(format!(
                        "Navigation to {} exceeded {:?}",
                        url, timeout
                    )))
                }
            }
        }
    }

    async fn title(&mut self) -> ApiResult<String> {
        let value = self.evaluate("document.title").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn frame_urls(&mut self) -> ApiResult<Vec<String>> {
        let tree = self.call("Page.getFrameTree", json!({})).await?;
        let mut urls = Vec::new();
        if let Some(root) = tree.get("frameTree") {
            collect_frame_urls(root, &mut urls);
        }
        Ok(urls)
    }

    async fn bounding_box(&mut self, selector: &str) -> ApiResult<Option<BoundingBox>> {
        let expression = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return null; \
             const r = el.getBoundingClientRect(); \
             return {{ x: r.x, y: r.y, width: r.width, height: r.height }}; }})()",
            serde_json::to_string(selector)?
        );
        let value = self.evaluate(&expression).await?;
        if value.is_null() {
            return Ok(None);
        }

        let field = |name: &str| value.get(name).and_then(Value::as_f64).unwrap_or_default();
        let bbox = BoundingBox {
            x: field("x"),
            y: field("y"),
            width: field("width"),
            height: field("height"),
        };
        Ok((bbox.width > 0.0 && bbox.height > 0.0).then_some(bbox))
    }

    async fn mouse_move(&mut self, x: f64, y: f64) -> ApiResult<()> {
        self.pointer = (x, y);
        self.dispatch_mouse("mouseMoved", 0).await
    }

    async fn mouse_down(&mut self) -> ApiResult<()> {
        self.dispatch_mouse("mousePressed", 1).await
    }

    async fn mouse_up(&mut self) -> ApiResult<()> {
        self.dispatch_mouse("mouseReleased", 0).await
    }

    async fn wait_for_network_idle(&mut self, timeout: Duration) -> ApiResult<()> {
        let mut events = self.connection.subscribe();
        let mut inflight: HashSet<String> = HashSet::new();
        let deadline = Instant::now() + timeout;

        loop {
            let quiet_until = Instant::now() + IDLE_WINDOW;
            match tokio::time::timeout_at(quiet_until.min(deadline), events.recv()).await {
                Ok(Ok(event)) => {
                    let request_id = event
                        .params
                        .get("requestId")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    match (event.method.as_str(), request_id) {
                        ("Network.requestWillBeSent", Some(id)) => {
                            inflight.insert(id);
                        }
                        ("Network.loadingFinished" | "Network.loadingFailed", Some(id)) => {
                            inflight.remove(&id);
                        }
                        _ => {}
                    }
                }
                Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) => {
                    return Err(ApiError::Browser("Browser connection closed".to_string()))
                }
                Err(_) => {
                    if inflight.is_empty() && Instant::now() >= quiet_until {
                        return Ok(());
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(ApiError::Timeout(format!(
                    "Network still busy after {:?} ({} requests)",
                    timeout,
                    inflight.len()
                )));
            }
        }
    }

    async fn cookies(&mut self) -> ApiResult<HashMap<String, String>> {
        let result = self.call("Network.getAllCookies", json!({})).await?;
        let cookies = result
            .get("cookies")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|cookie| {
                        let name = cookie.get("name")?.as_str()?;
                        let value = cookie.get("value")?.as_str()?;
                        Some((name.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(cookies)
    }

    async fn close(&mut self) {
        self.process.shutdown().await;
        debug!("Browser session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_frame_urls_walks_children() {
        let tree = json!({
            "frame": { "url": "https://www.perplexity.ai/" },
            "childFrames": [
                {
                    "frame": { "url": "https://challenges.cloudflare.com/cdn-cgi/turnstile" },
                    "childFrames": [ { "frame": { "url": "about:blank" } } ]
                }
            ]
        });

        let mut urls = Vec::new();
        collect_frame_urls(&tree, &mut urls);
        assert_eq!(
            urls,
            vec![
                "https://www.perplexity.ai/",
                "https://challenges.cloudflare.com/cdn-cgi/turnstile",
                "about:blank"
            ]
        );
    }

    #[test]
    fn test_target_info_parsing() {
        let targets: Vec<TargetInfo> = serde_json::from_value(json!([
            { "type": "service_worker", "webSocketDebuggerUrl": "ws://a" },
            { "type": "page", "webSocketDebuggerUrl": "ws://b", "title": "about:blank" }
        ]))
        .unwrap();
        let page = targets.into_iter().find(|t| t.target_type == "page").unwrap();
        assert_eq!(page.web_socket_debugger_url.as_deref(), Some("ws://b"));
    }
}
