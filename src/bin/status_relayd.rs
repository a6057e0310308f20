//! status-relayd - 状态写入 + SSE 推送服务
//!
//! 负责：
//! - 接收状态写入
//! - 每个 channel 一条监听连接
//! - 向浏览器推送变更

use anyhow::Result;
use status_relay::{Relay, RelayConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("status_relay=debug".parse()?))
        .init();

    tracing::info!("🚀 status-relayd v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env()?;
    tracing::info!(
        "配置: listen={} db={:?} heartbeat={:?}",
        config.listen_addr,
        config.db.mode,
        config.heartbeat_interval
    );

    let relay = Relay::connect(config).await?;
    relay.run().await?;

    tracing::info!("👋 status-relayd exiting");
    Ok(())
}
