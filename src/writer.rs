//! 状态写入器
//!
//! 写入 = upsert + 发布，两步在同一请求内顺序执行：
//! upsert 失败则不发布；发布失败不影响已成功的写入。

use std::sync::Arc;

use crate::error::Result;
use crate::publisher::ChangePublisher;
use crate::store::StatusStore;
use crate::types::{validate_channel, ChangeEvent, StatusRecord, StatusUpdate};

/// 状态写入器
#[derive(Clone)]
pub struct StatusWriter {
    store: Arc<dyn StatusStore>,
    publisher: ChangePublisher,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn StatusStore>, publisher: ChangePublisher) -> Self {
        Self { store, publisher }
    }

    /// 写入并发布，返回写入后的规范记录
    ///
    /// 返回时发布已完成或已放弃，响应里的时间戳与推送给订阅者的一致。
    pub async fn write(&self, channel: &str, update: &StatusUpdate) -> Result<StatusRecord> {
        validate_channel(channel)?;
        update.validate()?;

        let record = self.store.upsert_status(update).await?;
        tracing::debug!(
            "✍️ Status written: key={}, contacted={}, replied={}, deleted={}",
            record.key,
            record.contacted,
            record.replied,
            record.deleted
        );

        self.publisher
            .publish(channel, &ChangeEvent::from(&record))
            .await;

        Ok(record)
    }

    /// 底层存储
    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }
}
