use crate::config::{Config, DEFAULT_USER_AGENT};
use crate::error::ApiError;
use crate::services::browser::BrowserLauncher;
use crate::services::challenge_solver::{ChallengeOutcome, ChallengeSolver, SolverTiming};
use crate::services::credential_store::{serialize_cookies, Credential, CredentialStore};
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// 访客身份Cookie，存在即视为会话有效
pub const ANCHOR_COOKIE: &str = "pplx.visitor-id";

/// 会话管理器
pub struct SessionManager {
    credential: RwLock<Credential>,
    refresh_permit: Semaphore,
    /// 已完成的刷新次数（成功或失败）
    attempts: AtomicU64,
    last_attempt_ok: AtomicBool,
    refresh_interval: Duration,
    solver: ChallengeSolver,
    store: CredentialStore,
    target_url: String,
}

impl SessionManager {
    pub fn new(
        store: CredentialStore,
        solver: ChallengeSolver,
        refresh_interval: Duration,
        target_url: String,
    ) -> Self {
        let credential = store.load();
        Self {
            credential: RwLock::new(credential),
            refresh_permit: Semaphore::new(1),
            attempts: AtomicU64::new(0),
            last_attempt_ok: AtomicBool::new(false),
            refresh_interval,
            solver,
            store,
            target_url,
        }
    }

    pub fn from_config(config: &Config, launcher: Arc<dyn BrowserLauncher>) -> Self {
        let timing = SolverTiming {
            pass_timeout: Duration::from_secs(config.browser.challenge_timeout_secs),
            ..SolverTiming::default()
        };
        let solver = ChallengeSolver::new(launcher, config.perplexity.target_url.clone(), timing);
        Self::new(
            CredentialStore::new(config.perplexity.credential_file.clone()),
            solver,
            Duration::from_secs(config.perplexity.refresh_interval_secs),
            config.perplexity.target_url.clone(),
        )
    }

    /// 节流检查：未到刷新间隔且已有Cookie
    fn is_fresh(&self) -> bool {
        let credential = self.credential.read();
        if credential.cookies.is_empty() {
            return false;
        }
        match credential.last_refresh_at {
            Some(at) => Utc::now()
                .signed_duration_since(at)
                .to_std()
                .map(|elapsed| elapsed < self.refresh_interval)
                .unwrap_or(true),
            None => false,
        }
    }

    /// 确保会话可用，必要时通过浏览器刷新Cookie
    pub async fn ensure_fresh(&self, force: bool) -> bool {
        if !force && self.is_fresh() {
            return true;
        }

        let attempt = self.attempts.load(Ordering::SeqCst);

        // 同一时刻只允许一个刷新流程
        let Ok(_permit) = self.refresh_permit.acquire().await else {
            error!("Refresh permit closed");
            return false;
        };

        // 双重检查锁定模式：等待期间已有刷新结束则沿用其结果
        if self.attempts.load(Ordering::SeqCst) != attempt {
            let ok = self.last_attempt_ok.load(Ordering::SeqCst);
            info!("Session refresh finished by a concurrent caller (success: {})", ok);
            return ok;
        }
        if !force && self.is_fresh() {
            return true;
        }

        let ok = self.refresh(force).await;
        self.last_attempt_ok.store(ok, Ordering::SeqCst);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        ok
    }

    /// 运行一次浏览器挑战并提交结果，调用方须持有刷新许可
    async fn refresh(&self, force: bool) -> bool {
        let (seed, user_agent) = {
            let credential = self.credential.read();
            (credential.cookies.clone(), credential.user_agent.clone())
        };

        info!("Refreshing session (force: {}, seeded cookies: {})", force, seed.len());
        match self.solver.solve(&seed, &user_agent).await {
            ChallengeOutcome::Passed(cookies) => {
                if !cookies.contains_key(ANCHOR_COOKIE) {
                    warn!("Challenge passed but {} cookie is missing", ANCHOR_COOKIE);
                    return false;
                }

                let snapshot = {
                    let mut credential = self.credential.write();
                    credential.cookies = cookies;
                    credential.last_refresh_at = Some(Utc::now());
                    credential.clone()
                };
                info!("Session refreshed, {} cookies", snapshot.cookies.len());

                if let Err(e) = self.store.save(&snapshot) {
                    error!("Failed to persist credential to {}: {}", self.store.path().display(), e);
                }
                true
            }
            ChallengeOutcome::StillBlocked => {
                warn!("Session refresh failed: {}", ApiError::ChallengeUnsolved("still blocked".to_string()));
                false
            }
            ChallengeOutcome::TimedOut => {
                warn!("Session refresh failed: {}", ApiError::ChallengeUnsolved("timed out".to_string()));
                false
            }
            ChallengeOutcome::Error(detail) => {
                error!("Session refresh failed: {}", ApiError::ChallengeUnsolved(detail));
                false
            }
        }
    }

    /// 403之后后台强制刷新，不阻塞当前请求
    pub fn schedule_forced_refresh(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if !manager.ensure_fresh(true).await {
                warn!("Forced session refresh did not succeed");
            }
        });
    }

    /// 启动预热，失败不致命
    pub async fn warm_up(&self) {
        info!("Warming up session against {}", self.target_url);
        if self.ensure_fresh(true).await {
            info!("Session warm-up complete");
        } else {
            warn!("Session warm-up failed, will retry on the first request");
        }
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        self.credential.read().cookies.clone()
    }

    pub fn cookie_header(&self) -> String {
        serialize_cookies(&self.credential.read().cookies)
    }

    #[cfg(test)]
    pub fn credential(&self) -> Credential {
        self.credential.read().clone()
    }

    /// 创建请求头
    pub fn headers(&self) -> HeaderMap {
        let user_agent = self.credential.read().user_agent.clone();
        let origin = self.target_url.trim_end_matches('/');

        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("text/event-stream"));
        headers.insert("Accept-Language", HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        headers.insert(
            "Sec-Ch-Ua",
            HeaderValue::from_static(r#""Chromium";v="142", "Google Chrome";v="142", "Not_A Brand";v="99""#),
        );
        headers.insert("Sec-Ch-Ua-Mobile", HeaderValue::from_static("?0"));
        headers.insert("Sec-Ch-Ua-Platform", HeaderValue::from_static(r#""Windows""#));
        headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("empty"));
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("cors"));
        headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));
        headers.insert(
            "User-Agent",
            HeaderValue::from_str(&user_agent).unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_USER_AGENT)),
        );
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert("Origin", value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{}/search/new", origin)) {
            headers.insert("Referer", value);
        }
        headers.insert("Priority", HeaderValue::from_static("u=1, i"));
        headers.insert(
            "x-perplexity-request-reason",
            HeaderValue::from_static("perplexity-query-state-provider"),
        );

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::challenge_solver::tests::{fast_timing, FakeLauncher, FakeScript};
    use crate::services::credential_store::COOKIE_KEY;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn script_with(cookies: &[(&str, &str)]) -> Arc<FakeScript> {
        Arc::new(FakeScript {
            titles: Mutex::new(vec!["Perplexity".to_string()]),
            cookies: cookies.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            launch_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        })
    }

    fn manager(script: Arc<FakeScript>, dir: &TempDir, seed: &str) -> SessionManager {
        let path = dir.path().join(".env");
        std::fs::write(&path, format!("PORT=8000\n{}=\"{}\"\n", COOKIE_KEY, seed)).unwrap();
        let solver = ChallengeSolver::new(
            Arc::new(FakeLauncher(script)),
            "https://www.perplexity.ai".to_string(),
            fast_timing(),
        );
        SessionManager::new(
            CredentialStore::new(path),
            solver,
            Duration::from_secs(300),
            "https://www.perplexity.ai".to_string(),
        )
    }

    #[tokio::test]
    async fn test_throttle_allows_one_attempt_per_interval() {
        let dir = TempDir::new().unwrap();
        let script = script_with(&[(ANCHOR_COOKIE, "v1")]);
        let manager = manager(script.clone(), &dir, "old=1");

        assert!(manager.ensure_fresh(false).await);
        assert!(manager.ensure_fresh(false).await);
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
        assert_eq!(script.seeded.lock()[0].get("old").map(String::as_str), Some("1"));

        // 强制刷新绕过节流
        assert!(manager.ensure_fresh(true).await);
        assert_eq!(script.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_burst_runs_single_refresh() {
        let dir = TempDir::new().unwrap();
        let script = script_with(&[(ANCHOR_COOKIE, "v1")]);
        let manager = Arc::new(manager(script.clone(), &dir, ""));

        let calls = (0..5).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_fresh(false).await })
        });
        for call in calls.collect::<Vec<_>>() {
            assert!(call.await.unwrap());
        }
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_burst_runs_single_refresh() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(FakeScript {
            titles: Mutex::new(vec!["Just a moment...".to_string()]),
            launch_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let manager = Arc::new(manager(script.clone(), &dir, "old=1"));

        let calls = (0..5).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_fresh(false).await })
        });
        for call in calls.collect::<Vec<_>>() {
            assert!(!call.await.unwrap());
        }
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cookie_header(), "old=1");

        // 突发结束后的新请求可以再次尝试
        assert!(!manager.ensure_fresh(false).await);
        assert_eq!(script.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_anchor_keeps_previous_cookies() {
        let dir = TempDir::new().unwrap();
        let script = script_with(&[("cf_clearance", "c")]);
        let manager = manager(script, &dir, "old=1");

        assert!(!manager.ensure_fresh(true).await);
        assert_eq!(manager.cookie_header(), "old=1");
        assert!(manager.credential().last_refresh_at.is_none());
    }

    #[tokio::test]
    async fn test_still_blocked_leaves_credential_untouched() {
        let dir = TempDir::new().unwrap();
        let script = Arc::new(FakeScript {
            titles: Mutex::new(vec!["Just a moment...".to_string()]),
            ..Default::default()
        });
        let manager = manager(script, &dir, "old=1; keep=2");
        let before = manager.credential();

        assert!(!manager.ensure_fresh(false).await);
        assert_eq!(manager.credential(), before);
    }

    #[tokio::test]
    async fn test_successful_refresh_is_persisted() {
        let dir = TempDir::new().unwrap();
        let script = script_with(&[(ANCHOR_COOKIE, "v9"), ("session", "s")]);
        let manager = manager(script, &dir, "old=1");

        assert!(manager.ensure_fresh(true).await);
        assert_eq!(manager.cookies().get(ANCHOR_COOKIE).map(String::as_str), Some("v9"));

        let persisted = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(persisted.starts_with("PORT=8000\n"));
        assert!(persisted.contains("pplx.visitor-id=v9"));
        assert!(!persisted.contains("old=1"));
    }

    #[tokio::test]
    async fn test_scheduled_refresh_runs_in_background() {
        let dir = TempDir::new().unwrap();
        let script = script_with(&[(ANCHOR_COOKIE, "v1")]);
        let manager = Arc::new(manager(script.clone(), &dir, "old=1"));

        manager.schedule_forced_refresh();
        for _ in 0..100 {
            if manager.credential().last_refresh_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
        assert!(manager.cookies().contains_key(ANCHOR_COOKIE));
    }

    #[test]
    fn test_headers_carry_user_agent_and_origin() {
        let dir = TempDir::new().unwrap();
        let manager = manager(script_with(&[]), &dir, "a=1");
        let headers = manager.headers();

        assert_eq!(headers["Accept"], "text/event-stream");
        assert_eq!(headers["Origin"], "https://www.perplexity.ai");
        assert_eq!(headers["Referer"], "https://www.perplexity.ai/search/new");
        assert_eq!(headers["x-perplexity-request-reason"], "perplexity-query-state-provider");
        assert!(headers["User-Agent"].to_str().unwrap().contains("Mozilla/5.0"));
    }
}
