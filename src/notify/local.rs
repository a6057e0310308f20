//! 进程内通知 hub
//!
//! 语义与 Postgres LISTEN/NOTIFY 对齐：只有发布时已在监听的连接能收到，
//! 没有积压和重放。支持模拟连接重置与不可用，便于验证订阅池的故障路径。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

use super::{NotificationStream, NotifyBackend};
use crate::error::{Error, Result};

/// 每个 channel 的缓冲长度
const DEFAULT_CAPACITY: usize = 1024;

/// 进程内通知 hub
pub struct LocalNotifier {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    /// 代号递增即视为所有现存监听连接中断
    reset_tx: watch::Sender<u64>,
    available: AtomicBool,
    listen_count: AtomicUsize,
    publish_count: AtomicUsize,
    capacity: usize,
}

impl LocalNotifier {
    /// 创建新的 hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 指定每个 channel 的缓冲长度
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            ..Self::default()
        })
    }

    /// 中断所有现存监听连接（模拟网络重置）
    pub fn reset_listeners(&self) {
        self.reset_tx.send_modify(|generation| *generation += 1);
        tracing::debug!("🔌 Local listeners reset");
    }

    /// 设置可用性；不可用时 publish/listen 均失败
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 累计打开的监听连接数
    pub fn listen_count(&self) -> usize {
        self.listen_count.load(Ordering::SeqCst)
    }

    /// 累计成功发布次数
    pub fn publish_count(&self) -> usize {
        self.publish_count.load(Ordering::SeqCst)
    }

    /// channel 上当前存活的监听连接数
    pub fn active_listeners(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            reset_tx: watch::channel(0).0,
            available: AtomicBool::new(true),
            listen_count: AtomicUsize::new(0),
            publish_count: AtomicUsize::new(0),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[async_trait]
impl NotifyBackend for LocalNotifier {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Store("本地通知 hub 不可用".into()));
        }

        // 没有接收者时 send 返回 Err，语义上等同于无人监听，忽略
        let _ = self.sender(channel).send(payload.to_string());
        self.publish_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<Box<dyn NotificationStream>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Subscription("本地通知 hub 不可用".into()));
        }

        let rx = self.sender(channel).subscribe();
        self.listen_count.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(LocalListener {
            channel: channel.to_string(),
            rx: Some(rx),
            reset_rx: self.reset_tx.subscribe(),
        }))
    }
}

/// 本地监听连接
struct LocalListener {
    channel: String,
    rx: Option<broadcast::Receiver<String>>,
    reset_rx: watch::Receiver<u64>,
}

#[async_trait]
impl NotificationStream for LocalListener {
    async fn recv(&mut self) -> Result<String> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::Subscription("监听连接已关闭".into()));
        };

        let received = tokio::select! {
            biased;
            _ = self.reset_rx.changed() => Err(Error::Subscription(format!(
                "channel {} 的监听连接被重置",
                self.channel
            ))),
            msg = rx.recv() => match msg {
                Ok(payload) => Ok(payload),
                // 落后即有通知丢失，按连接故障处理，不能静默跳过
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "🔌 Local listener lagged: channel={}, skipped={}",
                        self.channel,
                        skipped
                    );
                    Err(Error::Subscription(format!(
                        "channel {} 的监听连接落后，丢失 {} 条通知",
                        self.channel, skipped
                    )))
                }
                Err(RecvError::Closed) => Err(Error::Subscription("本地通知 hub 已关闭".into())),
            },
        };

        if received.is_err() {
            self.rx = None;
        }
        received
    }

    async fn close(&mut self) {
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_current_listeners_only() {
        let notifier = LocalNotifier::new();

        // 无人监听时发布成功但不留存
        notifier.publish("ops", "early").await.unwrap();

        let mut listener = notifier.listen("ops").await.unwrap();
        notifier.publish("ops", "late").await.unwrap();
        notifier.publish("other", "elsewhere").await.unwrap();

        assert_eq!(listener.recv().await.unwrap(), "late");
        assert_eq!(notifier.publish_count(), 3);
        assert_eq!(notifier.active_listeners("ops"), 1);
    }

    #[tokio::test]
    async fn test_reset_fails_existing_listener() {
        let notifier = LocalNotifier::new();
        let mut listener = notifier.listen("ops").await.unwrap();

        notifier.reset_listeners();
        let err = listener.recv().await.unwrap_err();
        assert!(matches!(err, Error::Subscription(_)));

        // 重置后新开的连接正常
        let mut fresh = notifier.listen("ops").await.unwrap();
        notifier.publish("ops", "after").await.unwrap();
        assert_eq!(fresh.recv().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_lagging_listener_fails_instead_of_skipping() {
        let notifier = LocalNotifier::with_capacity(2);
        let mut listener = notifier.listen("ops").await.unwrap();

        for n in 0..3 {
            notifier.publish("ops", &n.to_string()).await.unwrap();
        }

        let err = listener.recv().await.unwrap_err();
        assert!(matches!(err, Error::Subscription(_)));
        assert!(listener.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let notifier = LocalNotifier::new();
        notifier.set_available(false);

        assert!(matches!(
            notifier.publish("ops", "x").await,
            Err(Error::Store(_))
        ));
        assert!(matches!(
            notifier.listen("ops").await.err(),
            Some(Error::Subscription(_))
        ));
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let notifier = LocalNotifier::new();
        let mut listener = notifier.listen("ops").await.unwrap();
        assert_eq!(notifier.active_listeners("ops"), 1);

        listener.close().await;
        assert_eq!(notifier.active_listeners("ops"), 0);
        assert!(listener.recv().await.is_err());
    }
}
