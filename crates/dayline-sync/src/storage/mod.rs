//! 存储模块 - 同步引擎的本地持久化层
//!
//! 分层设计：
//! - LocalStore: 每用户一个 rusqlite 库，统一的事务入口
//! - entity: 信封行与受控实体枚举
//! - outbox: 操作日志（与实体写同事务）
//! - conflict_history: 合并审计
//! - kv: sled 平台级键值（游标、设备标识）
//!
//! 引擎对外承诺的原子性不变量在这里兑现：任何本地实体变更与其
//! 发件箱记录要么同时提交、要么同时回滚。

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

pub mod conflict_history;
pub mod entity;
pub mod kv;
pub mod outbox;
pub mod schema;

pub use conflict_history::{ConflictHistory, ConflictRecord, ConflictWinner};
pub use entity::{fmt_ts, parse_ts, EntityKind, EntityRow, FieldMap, ALL_KINDS};
pub use outbox::{OpKind, Operation, OutboxQueue, MAX_RETRIES};

/// 存储统计信息
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub entity_rows: u64,
    pub tombstones: u64,
    pub pending_ops: u64,
    pub conflict_rows: u64,
}

/// 本地存储 - 每用户一个数据库文件
///
/// 连接由一个 tokio Mutex 串行化：事务是对本地库唯一的并发控制手段，
/// 推送排空、实时摄入与 UI 写都经过同一入口。
#[derive(Debug)]
pub struct LocalStore {
    #[allow(dead_code)]
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    user_id: String,
    device_id: String,
}

impl LocalStore {
    /// 打开（必要时创建）用户数据库并执行迁移
    pub async fn open(base_path: &Path, user_id: &str, device_id: &str) -> Result<Self> {
        let user_dir = base_path.join("users").join(user_id);
        tokio::fs::create_dir_all(&user_dir)
            .await
            .map_err(|e| SyncError::IO(format!("创建用户数据目录失败: {}", e)))?;

        let db_path = user_dir.join("dayline.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| SyncError::Database(format!("打开数据库失败: {}", e)))?;
        schema::initialize(&conn)?;

        info!("本地存储已就绪: user={} path={}", user_id, db_path.display());

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    // ---------- 读路径 ----------

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRow>> {
        let conn = self.conn.lock().await;
        get_row(&conn, kind, id)
    }

    /// 当前用户的可见行（UI 读取，过滤软删除）
    pub async fn query_visible(&self, kind: EntityKind) -> Result<Vec<EntityRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
             FROM {} WHERE user_id = ?1 AND deleted = 0 ORDER BY updated_at DESC",
            kind.table_name()
        ))?;
        let rows = collect_rows(stmt.query_map(params![self.user_id], row_to_entity)?);
        rows
    }

    /// `updated_at ≥ since` 的行（含软删除，供同步内部使用）
    pub async fn query_updated_since(
        &self,
        kind: EntityKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntityRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
             FROM {} WHERE updated_at >= ?1 ORDER BY updated_at ASC, id ASC",
            kind.table_name()
        ))?;
        let rows = collect_rows(stmt.query_map(params![fmt_ts(&since)], row_to_entity)?);
        rows
    }

    /// 业务字段等值查询（走表达式索引，如 routine_entries 的 date）
    pub async fn query_field_eq(
        &self,
        kind: EntityKind,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<EntityRow>> {
        validate_field_name(field)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
             FROM {} WHERE user_id = ?1 AND deleted = 0
               AND json_extract(fields, '$.{}') = ?2
             ORDER BY updated_at DESC",
            kind.table_name(),
            field
        ))?;
        let rows = collect_rows(stmt.query_map(params![self.user_id, json_scalar(value)], row_to_entity)?);
        rows
    }

    /// 多字段等值查询（如 routine_entries 的 (routine_id, date) 复合索引）
    pub async fn query_fields_eq(
        &self,
        kind: EntityKind,
        pairs: &[(String, serde_json::Value)],
    ) -> Result<Vec<EntityRow>> {
        if pairs.is_empty() {
            return self.query_visible(kind).await;
        }
        let mut clauses = String::new();
        // ?1 被 user_id 占用
        for (i, (field, _)) in pairs.iter().enumerate() {
            validate_field_name(field)?;
            clauses.push_str(&format!(
                " AND json_extract(fields, '$.{}') = ?{}",
                field,
                i + 2
            ));
        }
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
             FROM {} WHERE user_id = ?1 AND deleted = 0{}
             ORDER BY updated_at DESC",
            kind.table_name(),
            clauses
        ))?;
        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(self.user_id.clone())];
        params.extend(pairs.iter().map(|(_, v)| json_scalar(v)));
        let rows = collect_rows(stmt.query_map(rusqlite::params_from_iter(params), row_to_entity)?);
        rows
    }

    /// 业务字段范围查询（闭区间）
    pub async fn query_field_range(
        &self,
        kind: EntityKind,
        field: &str,
        low: &serde_json::Value,
        high: &serde_json::Value,
    ) -> Result<Vec<EntityRow>> {
        validate_field_name(field)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
             FROM {} WHERE user_id = ?1 AND deleted = 0
               AND json_extract(fields, '$.{}') BETWEEN ?2 AND ?3
             ORDER BY updated_at DESC",
            kind.table_name(),
            field
        ))?;
        let rows = collect_rows(stmt.query_map(
            params![self.user_id, json_scalar(low), json_scalar(high)],
            row_to_entity,
        )?);
        rows
    }

    // ---------- 裸写路径（解析器 / 实时摄入；不入发件箱） ----------

    pub async fn put(&self, kind: EntityKind, row: &EntityRow) -> Result<()> {
        let conn = self.conn.lock().await;
        put_row(&conn, kind, row)
    }

    pub async fn bulk_put(&self, kind: EntityKind, rows: &[EntityRow]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for row in rows {
            put_row(&tx, kind, row)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn hard_delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table_name()),
            params![id],
        )?;
        Ok(())
    }

    pub async fn bulk_hard_delete(&self, kind: EntityKind, ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", kind.table_name()),
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---------- C4: 本地变更 + 发件箱，同一事务 ----------

    /// 新建实体并入队 `create`
    pub async fn create_entity(
        &self,
        kind: EntityKind,
        id: &str,
        fields: FieldMap,
    ) -> Result<EntityRow> {
        reject_envelope_fields(&fields)?;
        let mut conn = self.conn.lock().await;
        if get_row(&conn, kind, id)?.is_some() {
            return Err(SyncError::AlreadyExists(format!(
                "{} {} 已存在",
                kind, id
            )));
        }
        let row = EntityRow::new(id, &self.user_id, &self.device_id, fields.clone());
        let tx = conn.transaction()?;
        put_row(&tx, kind, &row)?;
        OutboxQueue::append(&tx, kind, id, &OpKind::Create { value: fields }, row.updated_at)?;
        tx.commit()?;
        debug!("本地新建 {} {}", kind, id);
        Ok(row)
    }

    /// 软删除并入队 `delete`
    pub async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<EntityRow> {
        let mut conn = self.conn.lock().await;
        let mut row = get_row(&conn, kind, id)?
            .ok_or_else(|| SyncError::NotFound(format!("{} {} 不存在", kind, id)))?;
        let now = Utc::now();
        row.deleted = true;
        row.updated_at = row.updated_at.max(now);
        row.device_id = Some(self.device_id.clone());
        let tx = conn.transaction()?;
        put_row(&tx, kind, &row)?;
        OutboxQueue::append(&tx, kind, id, &OpKind::Delete, now)?;
        tx.commit()?;
        debug!("本地删除 {} {}", kind, id);
        Ok(row)
    }

    /// 写入若干业务字段并入队 `set`
    pub async fn set_fields(
        &self,
        kind: EntityKind,
        id: &str,
        fields: FieldMap,
    ) -> Result<EntityRow> {
        reject_envelope_fields(&fields)?;
        if fields.is_empty() {
            return Err(SyncError::InvalidArgument("set 的字段映射不能为空".into()));
        }
        let mut conn = self.conn.lock().await;
        let mut row = get_row(&conn, kind, id)?
            .ok_or_else(|| SyncError::NotFound(format!("{} {} 不存在", kind, id)))?;
        let now = Utc::now();
        for (k, v) in fields.iter() {
            row.fields.insert(k.clone(), v.clone());
        }
        row.updated_at = row.updated_at.max(now);
        row.device_id = Some(self.device_id.clone());
        let tx = conn.transaction()?;
        put_row(&tx, kind, &row)?;
        OutboxQueue::append(&tx, kind, id, &OpKind::Set { fields }, now)?;
        tx.commit()?;
        Ok(row)
    }

    /// 数值增量并入队 `increment`（意图保留：不会退化为快照）
    pub async fn increment_field(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        delta: f64,
    ) -> Result<EntityRow> {
        if entity::is_envelope_field(field) {
            return Err(SyncError::InvalidArgument(format!(
                "不能对信封字段 {} 做增量",
                field
            )));
        }
        let mut conn = self.conn.lock().await;
        let mut row = get_row(&conn, kind, id)?
            .ok_or_else(|| SyncError::NotFound(format!("{} {} 不存在", kind, id)))?;
        let now = Utc::now();
        let current = row.numeric_field(field).unwrap_or(0.0);
        row.fields
            .insert(field.to_string(), number_value(current + delta));
        row.updated_at = row.updated_at.max(now);
        row.device_id = Some(self.device_id.clone());
        let tx = conn.transaction()?;
        put_row(&tx, kind, &row)?;
        OutboxQueue::append(
            &tx,
            kind,
            id,
            &OpKind::Increment {
                field: field.to_string(),
                delta,
            },
            now,
        )?;
        tx.commit()?;
        Ok(row)
    }

    // ---------- 发件箱 ----------

    pub async fn outbox_all(&self) -> Result<Vec<Operation>> {
        let conn = self.conn.lock().await;
        OutboxQueue::load_all(&conn)
    }

    pub async fn outbox_for_entity(&self, kind: EntityKind, id: &str) -> Result<Vec<Operation>> {
        let conn = self.conn.lock().await;
        OutboxQueue::load_for_entity(&conn, kind, id)
    }

    pub async fn outbox_remove(&self, seq: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        OutboxQueue::remove(&conn, seq)
    }

    pub async fn outbox_bump_retry(&self, seq: i64) -> Result<u32> {
        let conn = self.conn.lock().await;
        OutboxQueue::bump_retry(&conn, seq, Utc::now())
    }

    pub async fn outbox_replace(
        &self,
        removed_seqs: &[i64],
        survivors: &[Operation],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        OutboxQueue::replace(&mut conn, removed_seqs, survivors)
    }

    pub async fn pending_ops(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        OutboxQueue::count(&conn)
    }

    // ---------- 合并落盘与审计 ----------

    /// 解析器产出的合并行 + 冲突记录，单事务落盘
    pub async fn apply_resolution(
        &self,
        kind: EntityKind,
        merged: &EntityRow,
        conflicts: &[ConflictRecord],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        put_row(&tx, kind, merged)?;
        for record in conflicts {
            ConflictHistory::append(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn conflict_recent(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        let conn = self.conn.lock().await;
        ConflictHistory::recent(&conn, limit)
    }

    // ---------- 维护 ----------

    /// 清理老化墓碑：`deleted=1` 且 `updated_at` 早于保留期
    pub async fn sweep_tombstones(&self, retention: Duration) -> Result<usize> {
        let cutoff = fmt_ts(&(Utc::now() - retention));
        let conn = self.conn.lock().await;
        let mut removed = 0usize;
        for kind in ALL_KINDS {
            removed += conn.execute(
                &format!(
                    "DELETE FROM {} WHERE deleted = 1 AND updated_at < ?1",
                    kind.table_name()
                ),
                params![cutoff],
            )?;
        }
        if removed > 0 {
            info!("墓碑清理完成，删除 {} 行", removed);
        }
        Ok(removed)
    }

    pub async fn prune_conflicts(&self, retention: Duration) -> Result<usize> {
        let conn = self.conn.lock().await;
        ConflictHistory::prune(&conn, retention, Utc::now())
    }

    /// 登出清空：实体表、发件箱、冲突历史
    pub async fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for kind in ALL_KINDS {
            tx.execute(&format!("DELETE FROM {}", kind.table_name()), [])?;
        }
        OutboxQueue::clear(&tx)?;
        ConflictHistory::clear(&tx)?;
        tx.commit()?;
        warn!("本地数据已清空: user={}", self.user_id);
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;
        let mut stats = StoreStats::default();
        for kind in ALL_KINDS {
            let (rows, tombs): (i64, i64) = conn.query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(deleted), 0) FROM {}",
                    kind.table_name()
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            stats.entity_rows += rows as u64;
            stats.tombstones += tombs as u64;
        }
        stats.pending_ops = OutboxQueue::count(&conn)? as u64;
        let conflicts: i64 =
            conn.query_row("SELECT COUNT(*) FROM conflict_history", [], |row| row.get(0))?;
        stats.conflict_rows = conflicts as u64;
        Ok(stats)
    }
}

// ---------- 行映射与内部工具 ----------

fn get_row(conn: &Connection, kind: EntityKind, id: &str) -> Result<Option<EntityRow>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
                 FROM {} WHERE id = ?1",
                kind.table_name()
            ),
            params![id],
            row_to_entity,
        )
        .optional()?;
    row.transpose()
}

fn put_row(conn: &Connection, kind: EntityKind, row: &EntityRow) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {}
             (id, user_id, created_at, updated_at, deleted, version, device_id, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            kind.table_name()
        ),
        params![
            row.id,
            row.user_id,
            fmt_ts(&row.created_at),
            fmt_ts(&row.updated_at),
            row.deleted as i64,
            row.version,
            row.device_id,
            serde_json::Value::Object(row.fields.clone()).to_string(),
        ],
    )?;
    Ok(())
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<EntityRow>> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    let deleted: i64 = row.get(4)?;
    let version: i64 = row.get(5)?;
    let device_id: Option<String> = row.get(6)?;
    let fields: String = row.get(7)?;

    Ok((|| {
        let fields: serde_json::Value = serde_json::from_str(&fields)?;
        let fields = fields
            .as_object()
            .cloned()
            .ok_or_else(|| SyncError::Database("fields 列不是 JSON 对象".into()))?;
        Ok(EntityRow {
            id,
            user_id,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            deleted: deleted != 0,
            version,
            device_id,
            fields,
        })
    })())
}

fn collect_rows(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<Result<EntityRow>>>,
) -> Result<Vec<EntityRow>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn reject_envelope_fields(fields: &FieldMap) -> Result<()> {
    if let Some(name) = fields.keys().find(|k| entity::is_envelope_field(k)) {
        return Err(SyncError::InvalidArgument(format!(
            "信封字段 {} 不能通过业务写入修改",
            name
        )));
    }
    Ok(())
}

fn validate_field_name(field: &str) -> Result<()> {
    if field.is_empty()
        || !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(SyncError::InvalidArgument(format!(
            "非法字段名: {}",
            field
        )));
    }
    Ok(())
}

/// JSON 标量 → SQL 可比较值（json_extract 的返回约定）
fn json_scalar(value: &serde_json::Value) -> rusqlite::types::Value {
    match value {
        serde_json::Value::Null => rusqlite::types::Value::Null,
        serde_json::Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

/// f64 → JSON 数值（整数值落为整数，便于与远端一致比较）
pub(crate) fn number_value(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}
