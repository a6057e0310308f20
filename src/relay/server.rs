//! Relay 服务
//!
//! 进程的组装点：存储、通知原语、订阅池、会话管理器都在这里显式构造并注入，
//! 没有全局单例。退出时先关会话，再关订阅池。

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::handler;
use super::pool::SubscriptionPool;
use super::session::{SessionConfig, SessionManager};
use crate::config::{ConnectionMode, RelayConfig};
use crate::db::StatusDB;
use crate::notify::{LocalNotifier, NotifyBackend};
use crate::publisher::ChangePublisher;
use crate::store::StatusStore;
use crate::writer::StatusWriter;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub writer: StatusWriter,
    pub sessions: SessionManager,
}

/// Relay 服务
pub struct Relay {
    config: RelayConfig,
    writer: StatusWriter,
    pool: SubscriptionPool,
    sessions: SessionManager,
}

impl Relay {
    /// 按存储配置连接后端
    ///
    /// - 本地 SQLite：进程内通知 hub
    /// - Postgres：`pg_notify` + `LISTEN`
    pub async fn connect(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        match config.db.mode {
            ConnectionMode::Local => {
                let db = StatusDB::connect(config.db.clone()).context("打开状态库失败")?;
                let notifier = LocalNotifier::new();
                Ok(Self::with_backends(config, Arc::new(db), notifier))
            }
            #[cfg(feature = "postgres")]
            ConnectionMode::Postgres => {
                let store =
                    crate::pg::PgStatusStore::connect(&config.db.url, config.db_max_connections)
                        .await
                        .context("连接 Postgres 失败")?;
                let notifier = Arc::new(crate::notify::PgNotifier::new(
                    store.pool().clone(),
                    config.db.url.clone(),
                ));
                Ok(Self::with_backends(config, Arc::new(store), notifier))
            }
            #[cfg(not(feature = "postgres"))]
            ConnectionMode::Postgres => {
                anyhow::bail!("Postgres 存储需要启用 `postgres` feature")
            }
        }
    }

    /// 用给定的存储与通知原语组装
    pub fn with_backends(
        config: RelayConfig,
        store: Arc<dyn StatusStore>,
        notifier: Arc<dyn NotifyBackend>,
    ) -> Self {
        let publisher = ChangePublisher::new(notifier.clone())
            .with_retries(config.publish_retries, config.publish_retry_backoff);
        let writer = StatusWriter::new(store, publisher);
        let pool = SubscriptionPool::new(notifier);
        let sessions = SessionManager::new(pool.clone(), SessionConfig::from(&config));

        Self {
            config,
            writer,
            pool,
            sessions,
        }
    }

    /// 构建路由
    pub fn router(&self) -> Router {
        let state = AppState {
            writer: self.writer.clone(),
            sessions: self.sessions.clone(),
        };

        Router::new()
            .merge(handler::routes())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub fn writer(&self) -> &StatusWriter {
        &self.writer
    }

    pub fn pool(&self) -> &SubscriptionPool {
        &self.pool
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// 运行 HTTP 服务直到收到中断信号
    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("绑定 {} 失败", self.config.listen_addr))?;

        tracing::info!("🚀 Relay 启动: http://{}", self.config.listen_addr);

        let sessions = self.sessions.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("监听中断信号失败: {}", e);
                }
                tracing::info!("收到中断信号，准备退出...");
                // 推流响应只有在会话结束后才会完成
                sessions.shutdown();
            })
            .await
            .context("HTTP 服务异常退出")?;

        self.shutdown().await;
        Ok(())
    }

    /// 关闭所有会话与监听连接
    pub async fn shutdown(&self) {
        self.sessions.shutdown();
        self.pool.shutdown().await;
        tracing::info!("🧹 Relay 清理完成");
    }
}
