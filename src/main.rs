use anyhow::Result;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod handlers;
mod models;
mod services;
mod utils;

use config::Config;
use handlers::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    dotenv::dotenv().ok();

    // 初始化日志
    init_logging()?;

    let config = Config::load()?;

    println!("{}", "Perplexity Free API Server".bright_green().bold());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Environment: {}", config.environment);
    println!("Upstream: {}", config.perplexity.api_url);
    println!("Credential file: {}", config.perplexity.credential_file.display());
    if config.master_key_enabled() {
        println!("{}", "API master key check enabled".yellow());
    }
    println!("Server binding to: {}:{}", config.server.host, config.server.port);

    let state = AppState::new(config.clone())?;
    println!("Cached cookies: {}", state.session.cookies().len());

    // 启动预热，失败不阻塞服务
    if config.perplexity.warmup_on_start {
        let session = state.session.clone();
        tokio::spawn(async move {
            session.warm_up().await;
        });
    }

    // 创建路由
    let app = create_router(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("{}", format!("Server started on http://{}", addr).bright_green().bold());

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perplexity_free_api=debug,tower_http=debug".into())
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
