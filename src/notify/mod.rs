//! 通知原语 - 按 channel 发布/订阅字符串载荷
//!
//! - 发布：每次调用借用一条短连接，发完即还
//! - 监听：[`NotifyBackend::listen`] 返回一条专用长连接，
//!   由订阅池独占，每个 channel 只开一条
//!
//! 实现：
//! - [`LocalNotifier`]: 进程内 channel hub（单节点部署与测试）
//! - `PgNotifier`: Postgres `pg_notify` + `LISTEN`（`postgres` feature）

mod local;
#[cfg(feature = "postgres")]
mod postgres;

use async_trait::async_trait;

use crate::error::Result;

pub use local::LocalNotifier;
#[cfg(feature = "postgres")]
pub use postgres::PgNotifier;

/// 存储侧的通知原语
#[async_trait]
pub trait NotifyBackend: Send + Sync {
    /// 在 channel 上发布一条载荷；当前没有订阅者时静默成功
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// 打开一条专用监听连接并订阅 channel
    async fn listen(&self, channel: &str) -> Result<Box<dyn NotificationStream>>;
}

/// 单条监听连接上的通知流
#[async_trait]
pub trait NotificationStream: Send {
    /// 等待下一条原始载荷
    ///
    /// 连接致命中断时返回 `Error::Subscription`，之后该流不可再用。
    async fn recv(&mut self) -> Result<String>;

    /// 取消订阅并释放连接
    async fn close(&mut self) {}
}
