//! 变更发布器
//!
//! 写入成功后把规范记录发布到 channel。发布失败只记日志：
//! 记录已经落盘，丢一条实时通知只意味着客户端需要刷新。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::notify::NotifyBackend;
use crate::protocol::encode_event;
use crate::types::ChangeEvent;

/// 变更发布器
#[derive(Clone)]
pub struct ChangePublisher {
    backend: Arc<dyn NotifyBackend>,
    /// 失败后的额外重试次数
    retries: u32,
    backoff: Duration,
}

impl ChangePublisher {
    /// 创建发布器（失败不重试）
    pub fn new(backend: Arc<dyn NotifyBackend>) -> Self {
        Self {
            backend,
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// 设置有界重试
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// 发布一条变更，返回是否成功
    ///
    /// 返回前一定已完成（或放弃）发布，调用方可据此再响应 HTTP 写请求。
    pub async fn publish(&self, channel: &str, event: &ChangeEvent) -> bool {
        let payload = match encode_event(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize change event: {}", e);
                return false;
            }
        };

        let attempts = self.retries + 1;
        for attempt in 1..=attempts {
            match self.backend.publish(channel, &payload).await {
                Ok(()) => {
                    tracing::debug!(
                        "📣 Published change: channel={}, key={}, timestamp={}",
                        channel,
                        event.key,
                        event.timestamp
                    );
                    return true;
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "📣 Publish failed, retrying ({}/{}): channel={}, error={}",
                        attempt,
                        attempts,
                        channel,
                        e
                    );
                    sleep(self.backoff).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "📣 Publish failed, notification dropped: channel={}, key={}, error={}",
                        channel,
                        event.key,
                        e
                    );
                }
            }
        }

        false
    }
}
