//! 推流会话
//!
//! 每个客户端连接一个独立任务：
//!
//! ```text
//! Opening ──register ok──▶ Streaming ──▶ Closing
//!    │                                      ▲
//!    └──────────── register failed ─────────┘
//! ```
//!
//! Streaming 阶段在「下一条事件 / 下一次心跳 / 客户端断开 / 进程关闭」之间竞争等待。
//! Closing 依次：停心跳 → 注销监听器 → 关闭输出。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::pool::{PoolEvent, Registration, SessionId, SubscriptionPool};
use crate::config::RelayConfig;
use crate::protocol::Frame;

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub retry_interval: Duration,
    /// 输出帧队列长度
    pub session_buffer: usize,
    /// 订阅池事件队列长度
    pub listener_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for SessionConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            retry_interval: config.retry_interval,
            session_buffer: config.session_buffer,
            listener_buffer: config.listener_buffer,
        }
    }
}

/// 会话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 客户端断开
    ClientDisconnected,
    /// 进程关闭
    Shutdown,
    /// 无法加入订阅池
    PoolUnavailable,
    /// 共享监听连接中断
    SubscriptionLost,
    /// 消费过慢被订阅池驱逐
    Evicted,
    /// 会话任务异常退出
    Aborted,
}

/// 会话管理器
#[derive(Clone)]
pub struct SessionManager {
    pool: SubscriptionPool,
    config: SessionConfig,
    shutdown_tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl SessionManager {
    pub fn new(pool: SubscriptionPool, config: SessionConfig) -> Self {
        Self {
            pool,
            config,
            shutdown_tx: Arc::new(watch::channel(false).0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 为一个客户端打开会话，立即返回；帧从 [`SessionHandle`] 读取
    pub fn open(&self, channel: impl Into<String>) -> SessionHandle {
        let id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::channel(self.config.session_buffer);

        let session = StreamSession {
            id,
            channel: channel.into(),
            pool: self.pool.clone(),
            config: self.config.clone(),
            out: out_tx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            _active: ActiveGuard::new(self.active.clone()),
        };

        tracing::debug!("📥 Session opened: session={}, channel={}", id, session.channel);
        let task = tokio::spawn(session.run());

        SessionHandle {
            id,
            frames: out_rx,
            task,
        }
    }

    /// 当前存活的会话数
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// 通知所有会话关闭（不触碰订阅池的共享连接）
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn pool(&self) -> &SubscriptionPool {
        &self.pool
    }
}

/// 会话句柄（客户端一侧）
pub struct SessionHandle {
    id: SessionId,
    frames: mpsc::Receiver<Frame>,
    task: JoinHandle<CloseReason>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 读取下一帧；会话结束后返回 None
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// 转成帧流交给 HTTP 响应；流被丢弃即视为客户端断开
    pub fn into_stream(self) -> ReceiverStream<Frame> {
        ReceiverStream::new(self.frames)
    }

    /// 断开客户端并等待会话收尾
    pub async fn disconnect(self) -> CloseReason {
        drop(self.frames);
        self.task.await.unwrap_or(CloseReason::Aborted)
    }

    /// 等待会话自行结束（不断开），用于终止帧之后
    pub async fn closed(self) -> CloseReason {
        let Self { frames, task, .. } = self;
        let reason = task.await.unwrap_or(CloseReason::Aborted);
        drop(frames);
        reason
    }
}

/// 存活会话计数
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Streaming 阶段的一步
enum Step {
    Disconnected,
    Shutdown,
    Pool(Option<PoolEvent>),
    Heartbeat,
}

/// 一次推送的结果
enum Sent {
    Delivered,
    Disconnected,
    Shutdown,
}

impl Sent {
    /// 推送未完成时对应的关闭原因
    fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Sent::Delivered => None,
            Sent::Disconnected => Some(CloseReason::ClientDisconnected),
            Sent::Shutdown => Some(CloseReason::Shutdown),
        }
    }
}

/// 等待关闭信号；管理器已释放时永远挂起
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let signalled = rx.wait_for(|shutting_down| *shutting_down).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

struct StreamSession {
    id: SessionId,
    channel: String,
    pool: SubscriptionPool,
    config: SessionConfig,
    out: mpsc::Sender<Frame>,
    shutdown_rx: watch::Receiver<bool>,
    _active: ActiveGuard,
}

impl StreamSession {
    async fn run(mut self) -> CloseReason {
        // Opening: 先发握手，再加入订阅池
        let retry = Frame::Retry(self.config.retry_interval);
        if let Some(reason) = self.send(retry).await.close_reason() {
            return self.close(None, None, reason);
        }

        let shutting_down = *self.shutdown_rx.borrow();
        if shutting_down {
            self.send(Frame::error("server is shutting down")).await;
            return self.close(None, None, CloseReason::Shutdown);
        }

        let (listener_tx, mut listener_rx) = mpsc::channel(self.config.listener_buffer);
        let joined = tokio::select! {
            biased;
            _ = self.out.closed() => Err(CloseReason::ClientDisconnected),
            _ = shutdown_signalled(&mut self.shutdown_rx) => Err(CloseReason::Shutdown),
            result = self.pool.register(&self.channel, self.id, listener_tx) => Ok(result),
        };

        let registration = match joined {
            Ok(Ok(registration)) => registration,
            Ok(Err(e)) => {
                tracing::warn!(
                    "📥 Session could not join pool: session={}, channel={}, error={}",
                    self.id,
                    self.channel,
                    e
                );
                self.send(Frame::error(e.to_string())).await;
                return self.close(None, None, CloseReason::PoolUnavailable);
            }
            Err(reason) => return self.close(None, None, reason),
        };

        if let Some(reason) = self.send(Frame::Ready).await.close_reason() {
            return self.close(None, Some(registration), reason);
        }

        // Streaming
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let step = tokio::select! {
                biased;
                _ = self.out.closed() => Step::Disconnected,
                _ = shutdown_signalled(&mut self.shutdown_rx) => Step::Shutdown,
                event = listener_rx.recv() => Step::Pool(event),
                _ = heartbeat.tick() => Step::Heartbeat,
            };

            match step {
                Step::Disconnected => break CloseReason::ClientDisconnected,
                Step::Shutdown => break CloseReason::Shutdown,
                Step::Pool(Some(PoolEvent::Change(event))) => {
                    if let Some(reason) = self.send(Frame::Update(event)).await.close_reason() {
                        break reason;
                    }
                }
                Step::Pool(Some(PoolEvent::Error(message))) => {
                    self.send(Frame::error(message)).await;
                    break CloseReason::SubscriptionLost;
                }
                Step::Pool(None) => {
                    self.send(Frame::error("listener evicted: client too slow"))
                        .await;
                    break CloseReason::Evicted;
                }
                Step::Heartbeat => {
                    if let Some(reason) = self.send(Frame::Heartbeat).await.close_reason() {
                        break reason;
                    }
                }
            }
        };

        self.close(Some(heartbeat), Some(registration), reason)
    }

    /// 推一帧给客户端
    ///
    /// 客户端不读时输出队列会满，等待期间仍响应关闭信号。
    async fn send(&mut self, frame: Frame) -> Sent {
        tokio::select! {
            biased;
            sent = self.out.send(frame) => match sent {
                Ok(()) => Sent::Delivered,
                Err(_) => Sent::Disconnected,
            },
            _ = shutdown_signalled(&mut self.shutdown_rx) => Sent::Shutdown,
        }
    }

    /// Closing：每一步都执行，不因前一步的结果短路
    fn close(
        self,
        heartbeat: Option<Interval>,
        registration: Option<Registration>,
        reason: CloseReason,
    ) -> CloseReason {
        // 1. 停止心跳
        drop(heartbeat);

        // 2. 注销监听器（被驱逐或连接故障时已不在登记中）
        if let Some(registration) = registration {
            if !registration.unregister() {
                tracing::debug!("📤 Listener already removed by pool: session={}", self.id);
            }
        }

        // 3. 会话不持有私有存储连接，订阅走订阅池的共享连接

        // 4. 关闭输出
        let Self { id, channel, out, .. } = self;
        drop(out);

        tracing::debug!(
            "📤 Session closed: session={}, channel={}, reason={:?}",
            id,
            channel,
            reason
        );
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{LocalNotifier, NotifyBackend};
    use crate::protocol::encode_event;
    use crate::types::ChangeEvent;
    use tokio::time::timeout;

    fn event(key: &str, timestamp: i64) -> ChangeEvent {
        ChangeEvent {
            key: key.to_string(),
            contacted: true,
            replied: false,
            deleted: false,
            timestamp,
        }
    }

    fn manager(notifier: Arc<LocalNotifier>, heartbeat: Duration) -> SessionManager {
        let config = SessionConfig {
            heartbeat_interval: heartbeat,
            retry_interval: Duration::from_millis(3000),
            session_buffer: 16,
            listener_buffer: 16,
        };
        SessionManager::new(SubscriptionPool::new(notifier), config)
    }

    async fn next(handle: &mut SessionHandle) -> Option<Frame> {
        timeout(Duration::from_secs(60), handle.next_frame())
            .await
            .ok()
            .flatten()
    }

    /// 读到 Ready 为止（跳过握手）
    async fn open_ready(manager: &SessionManager, channel: &str) -> SessionHandle {
        let mut handle = manager.open(channel);
        assert_eq!(
            next(&mut handle).await,
            Some(Frame::Retry(Duration::from_millis(3000)))
        );
        assert_eq!(next(&mut handle).await, Some(Frame::Ready));
        handle
    }

    async fn publish(notifier: &LocalNotifier, channel: &str, event: &ChangeEvent) {
        notifier
            .publish(channel, &encode_event(event).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_then_ready() {
        let notifier = LocalNotifier::new();
        let manager = manager(notifier, Duration::from_secs(15));

        let handle = open_ready(&manager, "ops").await;
        assert_eq!(manager.active_sessions(), 1);
        assert_eq!(manager.pool().listener_count("ops").await, 1);

        assert_eq!(handle.disconnect().await, CloseReason::ClientDisconnected);
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_sessions_registered_before_publish() {
        let notifier = LocalNotifier::new();
        let manager = manager(notifier.clone(), Duration::from_secs(15));

        let mut first = open_ready(&manager, "ops").await;
        let mut second = open_ready(&manager, "ops").await;

        let sent = event("555-0100", 10);
        publish(&notifier, "ops", &sent).await;

        assert_eq!(next(&mut first).await, Some(Frame::Update(sent.clone())));
        assert_eq!(next(&mut second).await, Some(Frame::Update(sent.clone())));

        // 发布之后才打开的会话收不到
        let mut late = open_ready(&manager, "ops").await;
        let marker = event("marker", 11);
        publish(&notifier, "ops", &marker).await;
        assert_eq!(next(&mut late).await, Some(Frame::Update(marker.clone())));

        // 每个会话只收到一次
        assert_eq!(next(&mut first).await, Some(Frame::Update(marker)));
    }

    #[tokio::test]
    async fn test_updates_forwarded_in_order() {
        let notifier = LocalNotifier::new();
        let manager = manager(notifier.clone(), Duration::from_secs(15));
        let mut handle = open_ready(&manager, "ops").await;

        for ts in 1..=10 {
            publish(&notifier, "ops", &event("k", ts)).await;
        }
        for ts in 1..=10 {
            assert_eq!(next(&mut handle).await, Some(Frame::Update(event("k", ts))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_emits_heartbeats_only() {
        let notifier = LocalNotifier::new();
        let manager = manager(notifier, Duration::from_secs(15));
        let mut handle = open_ready(&manager, "ops").await;

        let started = Instant::now();
        assert_eq!(next(&mut handle).await, Some(Frame::Heartbeat));
        assert!(started.elapsed() <= Duration::from_secs(15));
        assert_eq!(next(&mut handle).await, Some(Frame::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_heartbeat_unregisters() {
        let notifier = LocalNotifier::new();
        let manager = manager(notifier.clone(), Duration::from_secs(15));

        let mut gone = open_ready(&manager, "ops").await;
        let mut stays = open_ready(&manager, "ops").await;

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(next(&mut gone).await, Some(Frame::Heartbeat));
        assert_eq!(gone.disconnect().await, CloseReason::ClientDisconnected);
        assert_eq!(manager.pool().listener_count("ops").await, 1);

        // 之后的发布只到达仍在线的会话
        let sent = event("k", 1);
        publish(&notifier, "ops", &sent).await;
        loop {
            match next(&mut stays).await {
                Some(Frame::Heartbeat) => continue,
                other => {
                    assert_eq!(other, Some(Frame::Update(sent)));
                    break;
                }
            }
        }
        // 共享连接不受单个会话关闭影响
        assert!(manager.pool().is_connected("ops").await);
    }

    #[tokio::test]
    async fn test_pool_failure_yields_single_error_frame() {
        let notifier = LocalNotifier::new();
        notifier.set_available(false);
        let manager = manager(notifier, Duration::from_secs(15));

        let mut handle = manager.open("ops");
        assert!(matches!(next(&mut handle).await, Some(Frame::Retry(_))));
        assert!(matches!(next(&mut handle).await, Some(Frame::Error { .. })));
        assert_eq!(next(&mut handle).await, None);
        assert_eq!(handle.closed().await, CloseReason::PoolUnavailable);
    }

    #[tokio::test]
    async fn test_connection_loss_terminates_sessions() {
        let notifier = LocalNotifier::new();
        let manager = manager(notifier.clone(), Duration::from_secs(15));
        let mut first = open_ready(&manager, "ops").await;
        let mut second = open_ready(&manager, "ops").await;

        notifier.reset_listeners();

        for handle in [&mut first, &mut second] {
            assert!(matches!(next(handle).await, Some(Frame::Error { .. })));
            assert_eq!(next(handle).await, None);
        }
        assert_eq!(first.closed().await, CloseReason::SubscriptionLost);

        // 新会话触发重连
        let mut fresh = open_ready(&manager, "ops").await;
        let sent = event("k", 2);
        publish(&notifier, "ops", &sent).await;
        assert_eq!(next(&mut fresh).await, Some(Frame::Update(sent)));
    }

    #[tokio::test]
    async fn test_shutdown_reaches_session_blocked_on_full_output() {
        let notifier = LocalNotifier::new();
        let config = SessionConfig {
            heartbeat_interval: Duration::from_secs(15),
            retry_interval: Duration::from_millis(3000),
            session_buffer: 2,
            listener_buffer: 16,
        };
        let manager = SessionManager::new(SubscriptionPool::new(notifier.clone()), config);
        let handle = open_ready(&manager, "ops").await;

        // 客户端不再读取：两条填满输出队列，第三条阻塞在推送上
        for ts in 1..=5 {
            publish(&notifier, "ops", &event("k", ts)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.active_sessions(), 1);

        manager.shutdown();
        let reason = timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("阻塞推送时会话未响应关闭");
        assert_eq!(reason, CloseReason::Shutdown);
        assert_eq!(manager.active_sessions(), 0);
        assert_eq!(manager.pool().listener_count("ops").await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let notifier = LocalNotifier::new();
        let manager = manager(notifier, Duration::from_secs(15));
        let mut handle = open_ready(&manager, "ops").await;

        manager.shutdown();
        assert_eq!(next(&mut handle).await, None);
        assert_eq!(handle.closed().await, CloseReason::Shutdown);
        assert_eq!(manager.pool().listener_count("ops").await, 0);

        // 关闭后打开的会话直接收到错误帧
        let mut late = manager.open("ops");
        assert!(matches!(next(&mut late).await, Some(Frame::Retry(_))));
        assert!(matches!(next(&mut late).await, Some(Frame::Error { .. })));
    }
}
