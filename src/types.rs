//! 数据类型定义

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// channel 名最大字节数（与 Postgres 标识符上限一致）
pub const MAX_CHANNEL_LEN: usize = 63;

/// 联系状态记录
///
/// 以自然键（如电话号码）唯一标识，每个 key 至多一条记录。
/// `timestamp` 为最后一次写入时间（毫秒），同一 key 上严格递增。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub key: String,
    pub contacted: bool,
    pub replied: bool,
    /// 软删除标记
    pub deleted: bool,
    pub timestamp: i64,
}

/// 状态写入请求
///
/// 未指定的标记：首次插入时为 `false`，之后保留原值。
/// 指定的标记原样写入，不与旧值合并。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

impl StatusUpdate {
    /// 创建只带 key 的更新
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn contacted(mut self, value: bool) -> Self {
        self.contacted = Some(value);
        self
    }

    pub fn replied(mut self, value: bool) -> Self {
        self.replied = Some(value);
        self
    }

    pub fn deleted(mut self, value: bool) -> Self {
        self.deleted = Some(value);
        self
    }

    /// 校验自然键
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(Error::Validation("key 不能为空".into()));
        }
        Ok(())
    }
}

/// 变更事件
///
/// 写入成功后的记录快照，扁平 JSON 对象，不做持久化。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    pub contacted: bool,
    pub replied: bool,
    pub deleted: bool,
    pub timestamp: i64,
}

impl From<StatusRecord> for ChangeEvent {
    fn from(record: StatusRecord) -> Self {
        Self {
            key: record.key,
            contacted: record.contacted,
            replied: record.replied,
            deleted: record.deleted,
            timestamp: record.timestamp,
        }
    }
}

impl From<&StatusRecord> for ChangeEvent {
    fn from(record: &StatusRecord) -> Self {
        record.clone().into()
    }
}

/// 校验 channel 名: 1..=63 字节，只允许 `[A-Za-z0-9_.:-]`
pub fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN {
        return Err(Error::Validation(format!(
            "channel 长度必须在 1..={} 之间: {:?}",
            MAX_CHANNEL_LEN, channel
        )));
    }
    let valid = channel
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if !valid {
        return Err(Error::Validation(format!("channel 含非法字符: {:?}", channel)));
    }
    Ok(())
}
