//! 受控浏览器能力
//!
//! `BrowserLauncher` 启动一个隔离的浏览器会话并返回 `BrowserPage`，
//! 挑战求解器只通过这两个 trait 与浏览器交互。默认实现见 [`chrome`]，
//! 通过 Chrome DevTools Protocol 驱动本地 Chromium。

pub mod cdp;
pub mod chrome;
pub mod finder;

use crate::error::ApiResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use chrome::ChromeLauncher;

/// 页面元素在视口中的位置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// 启动参数
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub user_agent: String,
    pub viewport: (u32, u32),
    /// 预置Cookie，作用域为 `cookie_url`
    pub cookies: HashMap<String, String>,
    pub cookie_url: String,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> ApiResult<Box<dyn BrowserPage>>;
}

/// 单个页面会话，`close` 释放底层浏览器进程
#[async_trait]
pub trait BrowserPage: Send {
    /// 导航并等待 DOMContentLoaded；超时返回 `ApiError::Timeout`
    async fn goto(&mut self, url: &str, timeout: Duration) -> ApiResult<()>;

    async fn title(&mut self) -> ApiResult<String>;

    /// 所有frame的URL（含主frame）
    async fn frame_urls(&mut self) -> ApiResult<Vec<String>>;

    async fn bounding_box(&mut self, selector: &str) -> ApiResult<Option<BoundingBox>>;

    async fn mouse_move(&mut self, x: f64, y: f64) -> ApiResult<()>;

    async fn mouse_down(&mut self) -> ApiResult<()>;

    async fn mouse_up(&mut self) -> ApiResult<()>;

    /// 等待网络空闲；超时返回 `ApiError::Timeout`
    async fn wait_for_network_idle(&mut self, timeout: Duration) -> ApiResult<()>;

    async fn cookies(&mut self) -> ApiResult<HashMap<String, String>>;

    async fn close(&mut self);
}
