//! 订阅池
//!
//! 每个 channel 只维护一条专用监听连接，由后台接收循环独占；
//! 收到的通知解码一次后扇出给该 channel 上登记的所有会话监听器。
//!
//! 策略：
//! - 连接按需懒创建，并发首次登记只会建一条；建连期间不持有全局表锁，
//!   某个 channel 建连缓慢不会拖住其他 channel
//! - 最后一个监听器注销后连接保持（keep warm），直到 `shutdown()` 或连接故障
//! - 连接故障时向每个监听器发送一次 `PoolEvent::Error`，移除该 hub，
//!   下一个登记者会重新建立连接
//! - 监听器队列满即驱逐（慢消费者），不丢弃单条事件后继续推送

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::notify::{NotificationStream, NotifyBackend};
use crate::protocol::decode_event;
use crate::types::{validate_channel, ChangeEvent};

/// 会话 ID
pub type SessionId = Uuid;

/// 订阅池推给监听器的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// 一条变更
    Change(ChangeEvent),
    /// 共享连接故障（每个监听器只会收到一次，之后被移除）
    Error(String),
}

/// 监听器发送端
pub type ListenerSink = mpsc::Sender<PoolEvent>;

/// 单个 channel 的连接槽；首个登记者负责建连，其余等待同一结果
type HubSlot = Arc<OnceCell<Arc<ChannelHub>>>;

/// 订阅池
#[derive(Clone)]
pub struct SubscriptionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    backend: Arc<dyn NotifyBackend>,
    /// channel → 连接槽；锁只保护表本身，不跨越建连
    hubs: tokio::sync::Mutex<HashMap<String, HubSlot>>,
    closed: AtomicBool,
}

impl SubscriptionPool {
    /// 创建订阅池（不立即连接）
    pub fn new(backend: Arc<dyn NotifyBackend>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend,
                hubs: tokio::sync::Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 登记监听器，返回注销凭证
    ///
    /// channel 尚无连接（或已故障）时在此建立；建立失败返回 `Error::Subscription`。
    pub async fn register(
        &self,
        channel: &str,
        id: SessionId,
        sink: ListenerSink,
    ) -> Result<Registration> {
        validate_channel(channel)?;

        let mut sink = sink;
        // 故障 hub 尚未被接收循环移除时最多重连一次
        for _ in 0..2 {
            let slot = self.slot(channel).await?;
            let hub = slot
                .get_or_try_init(|| self.inner.connect(channel))
                .await
                .map(Arc::clone);

            let hub = match hub {
                Ok(hub) => hub,
                Err(e) => {
                    self.inner.remove_slot(channel, &slot).await;
                    return Err(e);
                }
            };

            // 建连期间 shutdown 已清空连接表，新连接无人回收
            if self.inner.closed.load(Ordering::SeqCst) {
                hub.stop().await;
                return Err(Error::Subscription("订阅池已关闭".into()));
            }

            match hub.add(id, sink) {
                Ok(()) => return Ok(Registration::new(hub, id)),
                Err(returned) => {
                    sink = returned;
                    self.inner.remove_hub(&hub).await;
                }
            }
        }

        Err(Error::Subscription(format!(
            "channel {} 的监听连接建立后立即中断",
            channel
        )))
    }

    /// 取出（或创建）channel 的连接槽，只在表锁内做同步操作
    async fn slot(&self, channel: &str) -> Result<HubSlot> {
        let mut hubs = self.inner.hubs.lock().await;
        // 持锁后再检查，避免在 shutdown 清空表之后插入新槽
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Subscription("订阅池已关闭".into()));
        }

        let broken = hubs
            .get(channel)
            .and_then(|slot| slot.get())
            .is_some_and(|hub| hub.is_broken());
        if broken {
            hubs.remove(channel);
        }

        Ok(hubs.entry(channel.to_string()).or_default().clone())
    }

    /// 已建立连接的 channel 数
    pub async fn channel_count(&self) -> usize {
        self.inner
            .hubs
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// channel 上的监听器数
    pub async fn listener_count(&self, channel: &str) -> usize {
        self.hub(channel)
            .await
            .map(|hub| hub.listener_count())
            .unwrap_or(0)
    }

    /// channel 是否持有存活的监听连接
    pub async fn is_connected(&self, channel: &str) -> bool {
        self.hub(channel).await.is_some_and(|hub| !hub.is_broken())
    }

    async fn hub(&self, channel: &str) -> Option<Arc<ChannelHub>> {
        self.inner
            .hubs
            .lock()
            .await
            .get(channel)
            .and_then(|slot| slot.get())
            .cloned()
    }

    /// 关闭所有监听连接；只在进程退出时调用
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // 尚在建连的槽由登记方在建连完成后自行回收
        let hubs: Vec<Arc<ChannelHub>> = {
            let mut hubs = self.inner.hubs.lock().await;
            hubs.drain()
                .filter_map(|(_, slot)| slot.get().cloned())
                .collect()
        };

        for hub in hubs {
            hub.stop().await;
        }
        tracing::info!("🧹 Subscription pool shut down");
    }
}

impl PoolInner {
    /// 打开专用监听连接并启动接收循环
    async fn connect(self: &Arc<Self>, channel: &str) -> Result<Arc<ChannelHub>> {
        let stream = self.backend.listen(channel).await.map_err(|e| match e {
            Error::Subscription(_) => e,
            other => Error::Subscription(other.to_string()),
        })?;

        let hub = ChannelHub::spawn(channel, stream, Arc::downgrade(self));
        tracing::info!("👂 Channel subscribed: channel={}", channel);
        Ok(hub)
    }

    /// 移除故障 hub（仅当表中仍是同一个实例）
    async fn remove_hub(&self, hub: &Arc<ChannelHub>) {
        let mut hubs = self.hubs.lock().await;
        let current = hubs
            .get(&hub.channel)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, hub));
        if current {
            hubs.remove(&hub.channel);
        }
    }

    /// 建连失败后移除空槽（仅当表中仍是同一个槽）
    async fn remove_slot(&self, channel: &str, slot: &HubSlot) {
        let mut hubs = self.hubs.lock().await;
        let current = hubs
            .get(channel)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if current {
            hubs.remove(channel);
        }
    }
}

/// 单个 channel 的监听连接与监听器表
struct ChannelHub {
    channel: String,
    state: Mutex<HubState>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct HubState {
    listeners: HashMap<SessionId, ListenerSink>,
    broken: bool,
}

/// 接收循环的一步
enum Step {
    Stop,
    Payload(String),
    Lost(Error),
}

impl ChannelHub {
    fn spawn(
        channel: &str,
        stream: Box<dyn NotificationStream>,
        pool: Weak<PoolInner>,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let hub = Arc::new(Self {
            channel: channel.to_string(),
            state: Mutex::new(HubState::default()),
            stop_tx,
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(hub.clone().receive_loop(stream, stop_rx, pool));
        *hub.task.lock() = Some(handle);
        hub
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut stream: Box<dyn NotificationStream>,
        mut stop_rx: watch::Receiver<bool>,
        pool: Weak<PoolInner>,
    ) {
        loop {
            let step = tokio::select! {
                biased;
                _ = stop_rx.changed() => Step::Stop,
                received = stream.recv() => match received {
                    Ok(payload) => Step::Payload(payload),
                    Err(e) => Step::Lost(e),
                },
            };

            match step {
                Step::Payload(payload) => self.dispatch(&payload),
                Step::Stop => {
                    stream.close().await;
                    tracing::debug!("👂 Channel listener stopped: channel={}", self.channel);
                    return;
                }
                Step::Lost(e) => {
                    tracing::error!(
                        "👂 Channel connection lost: channel={}, error={}",
                        self.channel,
                        e
                    );
                    self.fail(&e.to_string());
                    stream.close().await;
                    if let Some(pool) = pool.upgrade() {
                        pool.remove_hub(&self).await;
                    }
                    return;
                }
            }
        }
    }

    /// 解码一次，按接收顺序扇出
    fn dispatch(&self, payload: &str) {
        let event = match decode_event(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    "👂 Dropping malformed notification: channel={}, error={}",
                    self.channel,
                    e
                );
                return;
            }
        };

        let mut state = self.state.lock();
        let mut evicted = Vec::new();

        for (id, sink) in state.listeners.iter() {
            match sink.try_send(PoolEvent::Change(event.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "👂 Listener queue full, evicting: channel={}, session={}",
                        self.channel,
                        id
                    );
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            state.listeners.remove(&id);
        }

        tracing::trace!(
            "👂 Dispatched: channel={}, key={}, listeners={}",
            self.channel,
            event.key,
            state.listeners.len()
        );
    }

    /// 标记故障，通知并清空所有监听器
    fn fail(&self, message: &str) {
        let mut state = self.state.lock();
        state.broken = true;
        for (id, sink) in state.listeners.drain() {
            if sink.try_send(PoolEvent::Error(message.to_string())).is_err() {
                // 队列满或已断开：丢弃发送端，会话侧会看到队列关闭
                tracing::debug!("👂 Could not deliver error to session={}", id);
            }
        }
    }

    /// 故障 hub 拒绝登记，退回发送端
    fn add(&self, id: SessionId, sink: ListenerSink) -> std::result::Result<(), ListenerSink> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(sink);
        }
        state.listeners.insert(id, sink);
        tracing::debug!(
            "📡 Listener registered: channel={}, session={}, listeners={}",
            self.channel,
            id,
            state.listeners.len()
        );
        Ok(())
    }

    fn remove(&self, id: SessionId) -> bool {
        let mut state = self.state.lock();
        let removed = state.listeners.remove(&id).is_some();
        if removed {
            tracing::debug!(
                "📡 Listener unregistered: channel={}, session={}, listeners={}",
                self.channel,
                id,
                state.listeners.len()
            );
        }
        removed
    }

    fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.state.lock().listeners.clear();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("👂 Listener task ended abnormally: channel={}, error={}", self.channel, e);
            }
        }
    }
}

/// 注销凭证
///
/// 只移除本次登记的监听器；显式 [`Registration::unregister`] 或 drop 时生效，只生效一次。
pub struct Registration {
    hub: Option<Arc<ChannelHub>>,
    id: SessionId,
}

impl Registration {
    fn new(hub: Arc<ChannelHub>, id: SessionId) -> Self {
        Self { hub: Some(hub), id }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 注销，返回监听器此前是否仍在登记中
    ///
    /// 被驱逐或连接故障后监听器已被移除，此时返回 false。
    pub fn unregister(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        match self.hub.take() {
            Some(hub) => hub.remove(self.id),
            None => false,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}
