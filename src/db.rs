//! 数据库连接和操作

use crate::config::{ConnectionMode, DbConfig};
use crate::error::{Error, Result};
use crate::migrations;
use crate::schema;
use crate::types::{StatusRecord, StatusUpdate};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

/// SQLite 状态库
///
/// 克隆只复制连接句柄，共享同一条连接。
#[derive(Clone)]
pub struct StatusDB {
    pub(crate) conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    config: DbConfig,
}

impl StatusDB {
    /// 连接数据库
    pub fn connect(config: DbConfig) -> Result<Self> {
        match config.mode {
            ConnectionMode::Local => Self::connect_local(&config),
            ConnectionMode::Postgres => Err(Error::Config(
                "StatusDB 只支持本地 SQLite，Postgres 请使用 PgStatusStore".into(),
            )),
        }
    }

    /// 连接本地 SQLite
    fn connect_local(config: &DbConfig) -> Result<Self> {
        let path = Path::new(&config.url);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init(conn, config.clone())
    }

    /// 内存数据库（测试与临时场景）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, DbConfig::local(":memory:"))
    }

    fn init(conn: Connection, config: DbConfig) -> Result<Self> {
        // 迁移先于 schema，为老数据库补齐缺失的列
        migrations::run_migrations(&conn)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;

        tracing::info!("数据库已连接: {}", config.url);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== Status 操作 ====================

    /// 原子 upsert，返回写入后的规范记录
    ///
    /// 指定的标记原样写入；未指定的标记首次插入为 false，之后保留原值。
    /// 每次写入都刷新时间戳，且同一 key 上严格递增。
    pub fn upsert_status(&self, update: &StatusUpdate) -> Result<StatusRecord> {
        update.validate()?;

        let conn = self.conn.lock();
        let now = current_time_ms();

        let record = conn.query_row(
            r#"
            INSERT INTO status_records (key, contacted, replied, deleted, created_at, updated_at)
            VALUES (?1, COALESCE(?2, 0), COALESCE(?3, 0), COALESCE(?4, 0), ?5, ?5)
            ON CONFLICT(key) DO UPDATE SET
                contacted = COALESCE(?2, status_records.contacted),
                replied = COALESCE(?3, status_records.replied),
                deleted = COALESCE(?4, status_records.deleted),
                updated_at = MAX(excluded.updated_at, status_records.updated_at + 1)
            RETURNING key, contacted, replied, deleted, updated_at
            "#,
            params![
                update.key.trim(),
                update.contacted,
                update.replied,
                update.deleted,
                now,
            ],
            row_to_record,
        )?;

        Ok(record)
    }

    /// 读取单条记录（包含软删除的）
    pub fn get_status(&self, key: &str) -> Result<Option<StatusRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key, contacted, replied, deleted, updated_at FROM status_records WHERE key = ?1",
            params![key.trim()],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 列出记录，按最后写入时间倒序
    pub fn list_statuses(&self, include_deleted: bool) -> Result<Vec<StatusRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT key, contacted, replied, deleted, updated_at FROM status_records
            WHERE ?1 OR deleted = 0
            ORDER BY updated_at DESC
            "#,
        )?;

        let rows = stmt.query_map(params![include_deleted], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 记录总数
    pub fn count_statuses(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM status_records", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<StatusRecord> {
    Ok(StatusRecord {
        key: row.get(0)?,
        contacted: row.get(1)?,
        replied: row.get(2)?,
        deleted: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

/// 获取当前时间戳 (毫秒)
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
