//! 状态存储抽象
//!
//! 写路径只依赖 [`StatusStore`]：SQLite 由 [`StatusDB`] 实现，
//! Postgres 由 `PgStatusStore`（`postgres` feature）实现。

use async_trait::async_trait;

use crate::db::StatusDB;
use crate::error::{Error, Result};
use crate::types::{StatusRecord, StatusUpdate};

/// 支持原子 upsert 的状态存储
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// 原子 insert-or-update，返回写入后的规范记录
    async fn upsert_status(&self, update: &StatusUpdate) -> Result<StatusRecord>;

    /// 读取单条记录
    async fn get_status(&self, key: &str) -> Result<Option<StatusRecord>>;

    /// 列出记录
    async fn list_statuses(&self, include_deleted: bool) -> Result<Vec<StatusRecord>>;
}

/// 在阻塞线程池上执行 SQLite 操作，避免阻塞 tokio runtime
async fn run_blocking<T, F>(db: &StatusDB, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&StatusDB) -> Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || op(&db))
        .await
        .map_err(|e| Error::Store(format!("spawn_blocking failed: {}", e)))?
}

#[async_trait]
impl StatusStore for StatusDB {
    async fn upsert_status(&self, update: &StatusUpdate) -> Result<StatusRecord> {
        let update = update.clone();
        run_blocking(self, move |db| db.upsert_status(&update)).await
    }

    async fn get_status(&self, key: &str) -> Result<Option<StatusRecord>> {
        let key = key.to_string();
        run_blocking(self, move |db| db.get_status(&key)).await
    }

    async fn list_statuses(&self, include_deleted: bool) -> Result<Vec<StatusRecord>> {
        run_blocking(self, move |db| db.list_statuses(include_deleted)).await
    }
}
