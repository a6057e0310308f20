//! Relay 模块 - 订阅池 + 推流会话 + HTTP 服务
//!
//! 数据流：写入 → 发布到 channel → 订阅池的单条监听连接收到一次 →
//! 扇出给该 channel 上的所有会话 → 每个会话编码为 SSE 帧推给自己的客户端。

mod handler;
mod pool;
mod server;
mod session;

pub use handler::{routes, ApiError, ErrorResponse, HealthResponse};
pub use pool::{ListenerSink, PoolEvent, Registration, SessionId, SubscriptionPool};
pub use server::{AppState, Relay};
pub use session::{CloseReason, SessionConfig, SessionHandle, SessionManager};
