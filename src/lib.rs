//! status-relay - 状态写入 + 实时推送
//!
//! 记录每个 key（例如一个电话号码）的 contacted / replied / deleted 状态，
//! 并把每次变更实时推给订阅了同一 channel 的所有浏览器会话（SSE）。
//!
//! # 核心功能
//!
//! - **状态存储**: 原子 upsert，未指定的 flag 保留旧值
//! - **变更发布**: 写入成功后发布到 channel，失败只记日志不影响写入
//! - **订阅池**: 每个 channel 只保持一条监听连接，扇出给所有会话
//! - **推流会话**: 握手 / 实时事件 / 心跳 / 有序清理
//!
//! # Feature Flags
//!
//! - `writer`: 写入 + 发布
//! - `relay`: HTTP 服务（订阅池 + SSE 会话，依赖 `writer`）
//! - `postgres`: Postgres 存储与 `LISTEN/NOTIFY`
//!
//! # 架构
//!
//! 写入与推送共用同一个通知原语：本地模式是进程内 hub，Postgres 模式是
//! `pg_notify` + `LISTEN`。两端都只依赖 [`NotifyBackend`] trait。

pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod notify;
pub mod protocol;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "writer")]
pub mod publisher;

#[cfg(feature = "writer")]
pub mod writer;

#[cfg(feature = "postgres")]
pub mod pg;

#[cfg(feature = "relay")]
pub mod relay;

// Re-exports
pub use config::{ConnectionMode, DbConfig, RelayConfig};
pub use db::StatusDB;
pub use error::{Error, ErrorKind, Result};
pub use notify::{LocalNotifier, NotificationStream, NotifyBackend};
pub use protocol::Frame;
pub use store::StatusStore;
pub use types::*;

#[cfg(feature = "writer")]
pub use publisher::ChangePublisher;

#[cfg(feature = "writer")]
pub use writer::StatusWriter;

#[cfg(feature = "postgres")]
pub use notify::PgNotifier;

#[cfg(feature = "postgres")]
pub use pg::PgStatusStore;

#[cfg(feature = "relay")]
pub use relay::{Relay, SessionManager, SubscriptionPool};
