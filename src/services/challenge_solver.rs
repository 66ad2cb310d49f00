use crate::error::{ApiError, ApiResult};
use crate::services::browser::{BrowserLauncher, BrowserPage, LaunchOptions};
use crate::utils::{random_between, random_int};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CHALLENGE_TITLE_MARKERS: [&str; 2] = ["Just a moment", "Cloudflare"];
const CHALLENGE_FRAME_PATTERN: &str = "challenges";
const CHALLENGE_FRAME_SELECTOR: &str = "iframe[src*='challenges']";
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);
const VIEWPORT: (u32, u32) = (1280, 720);

/// 挑战求解结果
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeOutcome {
    Passed(HashMap<String, String>),
    StillBlocked,
    TimedOut,
    Error(String),
}

/// 求解状态机
#[derive(Debug, Clone, PartialEq)]
pub enum SolverState {
    Idle,
    Navigated,
    ChallengeDetected,
    NoChallenge,
    Solving,
    Solved,
    Failed(String),
}

/// 求解参数（帧查找与人类化交互时间）
#[derive(Debug, Clone)]
pub struct SolverTiming {
    pub frame_attempts: u32,
    pub frame_poll_interval: Duration,
    pub pass_timeout: Duration,
    pub jitter_x: f64,
    pub jitter_y: f64,
    pub move_steps: (u32, u32),
    pub step_delay_ms: (f64, f64),
    pub reaction_ms: (f64, f64),
    pub hold_ms: (f64, f64),
}

impl Default for SolverTiming {
    fn default() -> Self {
        Self {
            frame_attempts: 10,
            frame_poll_interval: Duration::from_secs(1),
            pass_timeout: Duration::from_secs(120),
            jitter_x: 10.0,
            jitter_y: 5.0,
            move_steps: (10, 20),
            step_delay_ms: (1.0, 10.0),
            reaction_ms: (200.0, 500.0),
            hold_ms: (50.0, 150.0),
        }
    }
}

/// 反自动化挑战求解器
pub struct ChallengeSolver {
    launcher: Arc<dyn BrowserLauncher>,
    target_url: String,
    timing: SolverTiming,
}

impl ChallengeSolver {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, target_url: String, timing: SolverTiming) -> Self {
        Self {
            launcher,
            target_url,
            timing,
        }
    }

    /// 用已有Cookie启动浏览器并尝试通过挑战
    pub async fn solve(&self, seed_cookies: &HashMap<String, String>, user_agent: &str) -> ChallengeOutcome {
        let options = LaunchOptions {
            user_agent: user_agent.to_string(),
            viewport: VIEWPORT,
            cookies: seed_cookies.clone(),
            cookie_url: self.target_url.clone(),
        };

        let mut page = match self.launcher.launch(&options).await {
            Ok(page) => page,
            Err(e) => {
                error!("Failed to start browser session: {}", e);
                return ChallengeOutcome::Error(e.to_string());
            }
        };

        let outcome = match tokio::time::timeout(self.timing.pass_timeout, self.run(page.as_mut())).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(ApiError::Timeout(detail))) => {
                warn!("Challenge pass timed out: {}", detail);
                ChallengeOutcome::TimedOut
            }
            Ok(Err(e)) => {
                error!("Browser operation failed: {}", e);
                ChallengeOutcome::Error(e.to_string())
            }
            Err(_) => {
                warn!("Challenge pass exceeded {:?}", self.timing.pass_timeout);
                ChallengeOutcome::TimedOut
            }
        };

        page.close().await;
        outcome
    }

    async fn run(&self, page: &mut dyn BrowserPage) -> ApiResult<ChallengeOutcome> {
        let mut state = SolverState::Idle;

        page.goto(&self.target_url, NAVIGATION_TIMEOUT).await?;
        transition(&mut state, SolverState::Navigated);

        let title = page.title().await?;
        if !is_challenge_title(&title) {
            transition(&mut state, SolverState::NoChallenge);
            return Ok(ChallengeOutcome::Passed(page.cookies().await?));
        }

        warn!("Challenge page detected (title: {}), attempting to pass", title);
        transition(&mut state, SolverState::ChallengeDetected);

        match self.locate_frame(page).await? {
            true => {
                transition(&mut state, SolverState::Solving);
                self.click_challenge(page).await?;
            }
            false => {
                warn!("Challenge frame not found, waiting for automatic redirect");
                transition(&mut state, SolverState::Failed("frame not found".to_string()));
            }
        }

        let title = page.title().await?;
        if is_challenge_title(&title) {
            if !matches!(state, SolverState::Failed(_)) {
                transition(&mut state, SolverState::Failed("challenge marker still present".to_string()));
            }
            error!("Still blocked by challenge page");
            return Ok(ChallengeOutcome::StillBlocked);
        }

        transition(&mut state, SolverState::Solved);
        Ok(ChallengeOutcome::Passed(page.cookies().await?))
    }

    /// 轮询查找挑战iframe
    async fn locate_frame(&self, page: &mut dyn BrowserPage) -> ApiResult<bool> {
        for attempt in 1..=self.timing.frame_attempts {
            let urls = page.frame_urls().await?;
            if urls.iter().any(|url| url.contains(CHALLENGE_FRAME_PATTERN)) {
                debug!("Challenge frame located on attempt {}", attempt);
                return Ok(true);
            }
            if attempt < self.timing.frame_attempts {
                tokio::time::sleep(self.timing.frame_poll_interval).await;
            }
        }
        Ok(false)
    }

    /// 模拟人工点击：移动到中心附近、停顿、按下/抬起
    async fn click_challenge(&self, page: &mut dyn BrowserPage) -> ApiResult<()> {
        let Some(bbox) = page.bounding_box(CHALLENGE_FRAME_SELECTOR).await? else {
            warn!("Challenge frame has no layout box yet");
            return Ok(());
        };

        let (center_x, center_y) = bbox.center();
        let target = (
            center_x + random_between(-self.timing.jitter_x, self.timing.jitter_x),
            center_y + random_between(-self.timing.jitter_y, self.timing.jitter_y),
        );
        info!("Clicking challenge frame at ({:.1}, {:.1})", target.0, target.1);

        let start = (
            random_between(0.0, VIEWPORT.0 as f64),
            random_between(0.0, VIEWPORT.1 as f64),
        );
        let steps = random_int(self.timing.move_steps.0, self.timing.move_steps.1);
        for (x, y) in pointer_path(start, target, steps) {
            page.mouse_move(x, y).await?;
            sleep_ms(self.timing.step_delay_ms).await;
        }

        sleep_ms(self.timing.reaction_ms).await;
        page.mouse_down().await?;
        sleep_ms(self.timing.hold_ms).await;
        page.mouse_up().await?;

        info!("Click done, waiting for the page to settle");
        if let Err(e) = page.wait_for_network_idle(SETTLE_TIMEOUT).await {
            debug!("Page did not settle: {}", e);
        }
        Ok(())
    }
}

fn transition(state: &mut SolverState, next: SolverState) {
    debug!("Challenge solver: {:?} -> {:?}", state, next);
    *state = next;
}

pub fn is_challenge_title(title: &str) -> bool {
    CHALLENGE_TITLE_MARKERS.iter().any(|marker| title.contains(marker))
}

/// 从起点到终点的轨迹，中段带正弦抖动，终点精确落在目标上
pub fn pointer_path(start: (f64, f64), end: (f64, f64), steps: u32) -> Vec<(f64, f64)> {
    let steps = steps.max(1);
    let mut path: Vec<(f64, f64)> = (1..steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            let wobble = (t * PI).sin();
            (
                start.0 + (end.0 - start.0) * t + random_between(-2.0, 2.0) * wobble,
                start.1 + (end.1 - start.1) * t + random_between(-2.0, 2.0) * wobble,
            )
        })
        .collect();
    path.push(end);
    path
}

async fn sleep_ms(range: (f64, f64)) {
    let millis = random_between(range.0, range.1);
    tokio::time::sleep(Duration::from_micros((millis * 1000.0) as u64)).await;
}
