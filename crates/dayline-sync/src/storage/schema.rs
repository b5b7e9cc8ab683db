//! 数据库 Schema - 建表与仅向前迁移
//!
//! 版本记录在 `PRAGMA user_version`，迁移只向前执行：
//! - v1: 实体表（信封 + 不透明 fields）、sync_queue、conflict_history
//! - v2: 实体表补 `version` / `device_id` 列（存量行回填 version=1、device_id=NULL）

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, SyncError};
use crate::storage::entity::{EntityKind, ALL_KINDS};

/// 当前 schema 版本
pub const SCHEMA_VERSION: i32 = 2;

/// 打开连接后的统一初始化：pragma + 迁移
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| SyncError::Database(format!("设置 WAL 模式失败: {}", e)))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| SyncError::Database(format!("设置同步模式失败: {}", e)))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| SyncError::Database(format!("开启外键失败: {}", e)))?;

    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| SyncError::Migration(format!("读取 user_version 失败: {}", e)))?;

    if version > SCHEMA_VERSION {
        return Err(SyncError::Migration(format!(
            "数据库版本 {} 高于引擎支持的 {}，拒绝降级",
            version, SCHEMA_VERSION
        )));
    }

    if version < 1 {
        migrate_to_v1(conn)?;
        info!("schema 迁移完成: v0 -> v1");
    }
    if version < 2 {
        migrate_to_v2(conn)?;
        info!("schema 迁移完成: v1 -> v2");
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| SyncError::Migration(format!("写入 user_version 失败: {}", e)))?;

    Ok(())
}

/// v1: 实体表 + 发件箱 + 冲突历史
fn migrate_to_v1(conn: &Connection) -> Result<()> {
    for kind in ALL_KINDS {
        let table = kind.table_name();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id         TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted    INTEGER NOT NULL DEFAULT 0,
                fields     TEXT NOT NULL DEFAULT '{{}}'
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_user ON {table}(user_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at);"
        ))
        .map_err(|e| SyncError::Migration(format!("建表 {} 失败: {}", table, e)))?;
    }

    // routine_entries 额外的业务索引（按日查询、按 (routine_id, date) 查询）
    let table = EntityKind::RoutineEntry.table_name();
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_date
             ON {table}(json_extract(fields, '$.date'));
         CREATE INDEX IF NOT EXISTS idx_{table}_routine_date
             ON {table}(json_extract(fields, '$.routine_id'), json_extract(fields, '$.date'));"
    ))
    .map_err(|e| SyncError::Migration(format!("建 routine_entries 索引失败: {}", e)))?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_queue (
            seq       INTEGER PRIMARY KEY AUTOINCREMENT,
            tbl       TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            kind      TEXT NOT NULL,
            payload   TEXT NOT NULL,
            ts        TEXT NOT NULL,
            retries   INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_ts ON sync_queue(ts);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(tbl, entity_id);

        CREATE TABLE IF NOT EXISTS conflict_history (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id      TEXT NOT NULL,
            entity_type    TEXT NOT NULL,
            field          TEXT NOT NULL,
            local_value    TEXT,
            remote_value   TEXT,
            resolved_value TEXT,
            winner         TEXT NOT NULL,
            strategy       TEXT NOT NULL,
            ts             TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conflict_history_ts ON conflict_history(ts);",
    )
    .map_err(|e| SyncError::Migration(format!("建 sync_queue/conflict_history 失败: {}", e)))?;

    Ok(())
}

/// v2: 实体表补 version / device_id 列
///
/// DEFAULT 1 即对存量行回填 _version=1；device_id 新列天然为 NULL。
fn migrate_to_v2(conn: &Connection) -> Result<()> {
    for kind in ALL_KINDS {
        let table = kind.table_name();
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN version INTEGER NOT NULL DEFAULT 1;
             ALTER TABLE {table} ADD COLUMN device_id TEXT;"
        ))
        .map_err(|e| SyncError::Migration(format!("迁移 {} 到 v2 失败: {}", table, e)))?;
    }
    Ok(())
}
