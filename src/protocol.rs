//! 通知与推流协议
//!
//! - 通知载荷：`ChangeEvent` 的扁平 JSON 对象（一条通知一个对象，无嵌套）
//! - 推流帧：text/event-stream，帧类型见 [`Frame`]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ChangeEvent;

/// 序列化变更事件为通知载荷
pub fn encode_event(event: &ChangeEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// 解析通知载荷
///
/// 载荷来自共享 channel，任何人都能往上发；解析失败归为 `Error::Decode`。
pub fn decode_event(payload: &str) -> Result<ChangeEvent> {
    serde_json::from_str(payload).map_err(|e| Error::Decode(e.to_string()))
}

/// 推流帧事件名
pub mod frame_event {
    pub const READY: &str = "ready";
    pub const UPDATE: &str = "update";
    pub const ERROR: &str = "error";
}

/// 心跳注释文本
pub const HEARTBEAT_COMMENT: &str = "ping";

/// `error` 帧载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// 推给客户端的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 握手：客户端自动重连间隔
    Retry(Duration),
    /// 会话进入推流状态，空载荷
    Ready,
    /// 一条变更
    Update(ChangeEvent),
    /// 终止帧
    Error { message: String },
    /// 心跳注释行，客户端忽略
    Heartbeat,
}

impl Frame {
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    /// 具名事件的名字；握手和心跳不是具名事件
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            Frame::Ready => Some(frame_event::READY),
            Frame::Update(_) => Some(frame_event::UPDATE),
            Frame::Error { .. } => Some(frame_event::ERROR),
            Frame::Retry(_) | Frame::Heartbeat => None,
        }
    }

    /// 具名事件的 data 字段
    pub fn data(&self) -> Option<String> {
        match self {
            Frame::Ready => Some(String::new()),
            Frame::Update(event) => encode_event(event).ok(),
            Frame::Error { message } => serde_json::to_string(&ErrorPayload {
                message: message.clone(),
            })
            .ok(),
            Frame::Retry(_) | Frame::Heartbeat => None,
        }
    }

    /// 发出此帧后会话结束
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Error { .. })
    }
}
