//! Postgres 状态存储
//!
//! 每次写入从连接池借一条短连接，写完立即归还；
//! 永远不占用订阅池的专用监听连接。

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::db::current_time_ms;
use crate::error::Result;
use crate::schema::PG_SCHEMA_SQL;
use crate::store::StatusStore;
use crate::types::{StatusRecord, StatusUpdate};

const UPSERT_SQL: &str = r#"
INSERT INTO status_records (key, contacted, replied, deleted, created_at, updated_at)
VALUES ($1, COALESCE($2, FALSE), COALESCE($3, FALSE), COALESCE($4, FALSE), $5, $5)
ON CONFLICT (key) DO UPDATE SET
    contacted = COALESCE($2, status_records.contacted),
    replied = COALESCE($3, status_records.replied),
    deleted = COALESCE($4, status_records.deleted),
    updated_at = GREATEST(EXCLUDED.updated_at, status_records.updated_at + 1)
RETURNING key, contacted, replied, deleted, updated_at
"#;

/// Postgres 状态库
#[derive(Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    /// 连接并确保表存在
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Self::from_pool(pool).await
    }

    /// 复用已有连接池
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        sqlx::query(PG_SCHEMA_SQL).execute(&pool).await?;
        tracing::info!("Postgres 状态库已连接");
        Ok(Self { pool })
    }

    /// 底层连接池（供 PgNotifier 共用发布连接）
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<StatusRecord> {
    Ok(StatusRecord {
        key: row.try_get("key")?,
        contacted: row.try_get("contacted")?,
        replied: row.try_get("replied")?,
        deleted: row.try_get("deleted")?,
        timestamp: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn upsert_status(&self, update: &StatusUpdate) -> Result<StatusRecord> {
        update.validate()?;

        let row = sqlx::query(UPSERT_SQL)
            .bind(update.key.trim())
            .bind(update.contacted)
            .bind(update.replied)
            .bind(update.deleted)
            .bind(current_time_ms())
            .fetch_one(&self.pool)
            .await?;

        row_to_record(&row)
    }

    async fn get_status(&self, key: &str) -> Result<Option<StatusRecord>> {
        let row = sqlx::query(
            "SELECT key, contacted, replied, deleted, updated_at FROM status_records WHERE key = $1",
        )
        .bind(key.trim())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_statuses(&self, include_deleted: bool) -> Result<Vec<StatusRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT key, contacted, replied, deleted, updated_at FROM status_records
            WHERE $1 OR NOT deleted
            ORDER BY updated_at DESC
            "#,
        )
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}
