//! 操作日志（发件箱）- 本地写入的意图记录
//!
//! 每次本地写都会在实体变更的同一事务里追加一条操作记录，压缩后由
//! push 管线排空。操作按 `kind` 建模为和类型：`increment` 永远带
//! field/delta，`delete` 永远不带，不存在"可空字段"状态。
//!
//! ## NOTE: 队列不做重试调度
//!
//! OutboxQueue 只负责持久化与退避资格判断，重试 / 退避 / 丢弃策略由
//! push 管线执行（参见 sync::pusher）。

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde_json::json;
use std::str::FromStr;

use crate::error::{Result, SyncError};
use crate::storage::entity::{fmt_ts, parse_ts, EntityKind, FieldMap};

/// 重试上限：达到后操作被移除并上报
pub const MAX_RETRIES: u32 = 5;

/// 操作种类（和类型：每个变体只携带自己需要的数据）
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// 新建：value 为不含信封默认值的初始业务字段
    Create { value: FieldMap },
    /// 软删除
    Delete,
    /// 字段写入：单字段 set 即单键映射
    Set { fields: FieldMap },
    /// 数值增量：不可被快照替换（除非后继显式 set 同字段）
    Increment { field: String, delta: f64 },
}

impl OpKind {
    pub fn kind_str(&self) -> &'static str {
        match self {
            OpKind::Create { .. } => "create",
            OpKind::Delete => "delete",
            OpKind::Set { .. } => "set",
            OpKind::Increment { .. } => "increment",
        }
    }

    fn payload_json(&self) -> serde_json::Value {
        match self {
            OpKind::Create { value } => json!({ "value": value }),
            OpKind::Delete => json!({}),
            OpKind::Set { fields } => json!({ "fields": fields }),
            OpKind::Increment { field, delta } => json!({ "field": field, "delta": delta }),
        }
    }

    fn from_parts(kind: &str, payload: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        match kind {
            "create" => {
                let map = value
                    .get("value")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .ok_or_else(|| SyncError::Database("create 操作缺少 value".into()))?;
                Ok(OpKind::Create { value: map })
            }
            "delete" => Ok(OpKind::Delete),
            "set" => {
                let map = value
                    .get("fields")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .ok_or_else(|| SyncError::Database("set 操作缺少 fields".into()))?;
                Ok(OpKind::Set { fields: map })
            }
            "increment" => {
                let field = value
                    .get("field")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SyncError::Database("increment 操作缺少 field".into()))?
                    .to_string();
                let delta = value
                    .get("delta")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| SyncError::Database("increment 操作缺少 delta".into()))?;
                Ok(OpKind::Increment { field, delta })
            }
            other => Err(SyncError::Database(format!("未知操作种类: {}", other))),
        }
    }

    /// 该操作挂起时被"屏蔽"的字段（解析器的 pending-op shield 用）
    pub fn touched_fields(&self) -> Vec<&str> {
        match self {
            OpKind::Create { value } => value.keys().map(|k| k.as_str()).collect(),
            OpKind::Delete => vec!["deleted"],
            OpKind::Set { fields } => fields.keys().map(|k| k.as_str()).collect(),
            OpKind::Increment { field, .. } => vec![field.as_str()],
        }
    }
}

/// 发件箱操作记录
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// 队列序号（单调，主键）
    pub seq: i64,
    pub table: EntityKind,
    pub entity_id: String,
    pub kind: OpKind,
    /// 入队时间，也是退避基准（失败重试时刷新）
    pub timestamp: DateTime<Utc>,
    pub retries: u32,
}

impl Operation {
    /// 退避资格：首次立即，之后 wall − timestamp ≥ 2^(retries−1) 秒
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.retries == 0 {
            return true;
        }
        let exp = (self.retries - 1).min(30);
        let wait = Duration::seconds(1i64 << exp);
        now - self.timestamp >= wait
    }
}

/// `sync_queue` 表的同步访问层（在存储层连接锁内调用）
pub struct OutboxQueue;

impl OutboxQueue {
    /// 在调用方事务内追加一条操作（与实体变更同事务，保证原子性）
    pub fn append(
        conn: &Connection,
        table: EntityKind,
        entity_id: &str,
        kind: &OpKind,
        ts: DateTime<Utc>,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO sync_queue (tbl, entity_id, kind, payload, ts, retries)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                table.as_str(),
                entity_id,
                kind.kind_str(),
                kind.payload_json().to_string(),
                fmt_ts(&ts),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 全量加载，按 seq 升序
    pub fn load_all(conn: &Connection) -> Result<Vec<Operation>> {
        let mut stmt = conn.prepare(
            "SELECT seq, tbl, entity_id, kind, payload, ts, retries
             FROM sync_queue ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], row_to_op)?;
        let mut ops = Vec::new();
        for row in rows {
            ops.push(row??);
        }
        Ok(ops)
    }

    /// 某实体的挂起操作，按 seq 升序
    pub fn load_for_entity(
        conn: &Connection,
        table: EntityKind,
        entity_id: &str,
    ) -> Result<Vec<Operation>> {
        let mut stmt = conn.prepare(
            "SELECT seq, tbl, entity_id, kind, payload, ts, retries
             FROM sync_queue WHERE tbl = ?1 AND entity_id = ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![table.as_str(), entity_id], row_to_op)?;
        let mut ops = Vec::new();
        for row in rows {
            ops.push(row??);
        }
        Ok(ops)
    }

    pub fn remove(conn: &Connection, seq: i64) -> Result<()> {
        conn.execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    /// 失败重试：retries+1，timestamp 刷新为 now（退避基准）
    pub fn bump_retry(conn: &Connection, seq: i64, now: DateTime<Utc>) -> Result<u32> {
        conn.execute(
            "UPDATE sync_queue SET retries = retries + 1, ts = ?2 WHERE seq = ?1",
            params![seq, fmt_ts(&now)],
        )?;
        let retries: u32 = conn.query_row(
            "SELECT retries FROM sync_queue WHERE seq = ?1",
            params![seq],
            |row| row.get(0),
        )?;
        Ok(retries)
    }

    /// 压缩落盘：删旧序号、以原 seq 插回幸存操作，单事务完成
    pub fn replace(
        conn: &mut Connection,
        removed_seqs: &[i64],
        survivors: &[Operation],
    ) -> Result<()> {
        let tx = conn.transaction()?;
        for seq in removed_seqs {
            tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
        }
        for op in survivors {
            tx.execute(
                "INSERT OR REPLACE INTO sync_queue
                 (seq, tbl, entity_id, kind, payload, ts, retries)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    op.seq,
                    op.table.as_str(),
                    op.entity_id,
                    op.kind.kind_str(),
                    op.kind.payload_json().to_string(),
                    fmt_ts(&op.timestamp),
                    op.retries,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count(conn: &Connection) -> Result<usize> {
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn clear(conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM sync_queue", [])?;
        Ok(())
    }
}

fn row_to_op(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Operation>> {
    let seq: i64 = row.get(0)?;
    let tbl: String = row.get(1)?;
    let entity_id: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let ts: String = row.get(5)?;
    let retries: u32 = row.get(6)?;

    Ok((|| {
        let table = EntityKind::from_str(&tbl)
            .map_err(|_| SyncError::Database(format!("sync_queue 含未知表名: {}", tbl)))?;
        Ok(Operation {
            seq,
            table,
            entity_id,
            kind: OpKind::from_parts(&kind, &payload)?,
            timestamp: parse_ts(&ts)?,
            retries,
        })
    })())
}
