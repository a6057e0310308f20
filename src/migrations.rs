//! 数据库迁移模块

use rusqlite::{Connection, Result as SqliteResult};
use tracing::{info, warn};

/// 迁移版本
const MIGRATION_VERSION: i64 = 1;

/// 初始化迁移系统
fn initialize_migrations(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;
    Ok(())
}

/// 获取当前数据库版本
fn get_current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;
    Ok(version.unwrap_or(0))
}

/// 记录迁移版本
fn record_migration(conn: &Connection, version: i64) -> SqliteResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        [version, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;

    for col_name in columns.flatten() {
        if col_name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// 迁移 1: 为早期的 status_records 表添加软删除字段
fn migration_001_add_deleted_flag(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 001: Add soft-delete flag");

    // 新库由 schema 直接建出完整表
    if !table_exists(conn, "status_records")? {
        return Ok(());
    }

    if !column_exists(conn, "status_records", "deleted")? {
        info!("Adding deleted column");
        conn.execute(
            "ALTER TABLE status_records ADD COLUMN deleted INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    Ok(())
}

/// 执行所有待应用的迁移
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    initialize_migrations(conn)?;

    let current_version = get_current_version(conn)?;
    if current_version >= MIGRATION_VERSION {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;

    if current_version < 1 {
        if let Err(e) = migration_001_add_deleted_flag(&tx) {
            warn!("Migration 1 failed: {}", e);
            return Err(e);
        }
        record_migration(&tx, 1)?;
    }

    tx.commit()?;

    info!("Migrations applied, current version: {}", MIGRATION_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_adds_deleted_column() {
        let conn = Connection::open_in_memory().unwrap();

        // 模拟老版本表
        conn.execute_batch(
            r#"
            CREATE TABLE status_records (
                key TEXT PRIMARY KEY NOT NULL,
                contacted INTEGER NOT NULL DEFAULT 0,
                replied INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            INSERT INTO status_records VALUES ('555-0100', 1, 0, 1, 1);
            "#,
        )
        .unwrap();

        run_migrations(&conn).unwrap();
        assert!(column_exists(&conn, "status_records", "deleted").unwrap());
        assert_eq!(get_current_version(&conn).unwrap(), 1);

        let deleted: i64 = conn
            .query_row("SELECT deleted FROM status_records WHERE key = '555-0100'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(deleted, 0);

        // 幂等
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_fresh_database_skips_alter() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert!(!table_exists(&conn, "status_records").unwrap());
        assert_eq!(get_current_version(&conn).unwrap(), 1);
    }
}
