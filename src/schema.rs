//! 数据库 Schema 定义

/// SQLite Schema
pub const SCHEMA_SQL: &str = r#"
-- 联系状态表（key 唯一，upsert 目标）
CREATE TABLE IF NOT EXISTS status_records (
    key TEXT PRIMARY KEY NOT NULL,
    contacted INTEGER NOT NULL DEFAULT 0,
    replied INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,   -- 软删除，本模块从不物理删除
    created_at INTEGER NOT NULL,          -- 毫秒时间戳
    updated_at INTEGER NOT NULL           -- 最后写入时间（毫秒），同 key 严格递增
);

CREATE INDEX IF NOT EXISTS idx_status_records_updated ON status_records(updated_at DESC);
"#;

/// Postgres Schema
#[cfg(feature = "postgres")]
pub const PG_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS status_records (
    key TEXT PRIMARY KEY NOT NULL,
    contacted BOOLEAN NOT NULL DEFAULT FALSE,
    replied BOOLEAN NOT NULL DEFAULT FALSE,
    deleted BOOLEAN NOT NULL DEFAULT FALSE,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;
