//! Postgres LISTEN/NOTIFY

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};

use super::{NotificationStream, NotifyBackend};
use crate::error::{Error, Result};

/// 基于 `pg_notify` 的通知原语
///
/// 发布走连接池的短连接；每条监听连接按 URL 单独建立，不占用连接池，
/// 保持常驻的 channel 再多也不会挤占写入与发布。
#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
    url: String,
}

impl PgNotifier {
    pub fn new(pool: PgPool, url: impl Into<String>) -> Self {
        Self {
            pool,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotifyBackend for PgNotifier {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<Box<dyn NotificationStream>> {
        let mut listener = PgListener::connect(&self.url)
            .await
            .map_err(|e| Error::Subscription(format!("打开监听连接失败: {}", e)))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| Error::Subscription(format!("LISTEN {} 失败: {}", channel, e)))?;

        tracing::info!("👂 LISTEN {}", channel);
        Ok(Box::new(PgNotificationStream {
            channel: channel.to_string(),
            listener,
        }))
    }
}

struct PgNotificationStream {
    channel: String,
    listener: PgListener,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    async fn recv(&mut self) -> Result<String> {
        // try_recv 在连接中断时返回 Ok(None)，而 recv 会静默重连并丢失中间的通知
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Ok(notification.payload().to_string()),
            Ok(None) => Err(Error::Subscription(format!(
                "channel {} 的监听连接中断",
                self.channel
            ))),
            Err(e) => Err(Error::Subscription(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.listener.unlisten_all().await {
            tracing::warn!("UNLISTEN {} 失败: {}", self.channel, e);
        }
    }
}
