//! 冲突历史 - 字段级合并的审计日志
//!
//! 只追加，按 30 天滚动清理。

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::entity::{fmt_ts, parse_ts, EntityKind};

/// 胜者归属
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Local,
    Remote,
    Merged,
}

impl ConflictWinner {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Merged => "merged",
        }
    }
}

/// 单个字段的一次冲突裁决
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub entity_id: String,
    pub entity_type: EntityKind,
    pub field: String,
    pub local_value: Option<serde_json::Value>,
    pub remote_value: Option<serde_json::Value>,
    pub resolved_value: Option<serde_json::Value>,
    pub winner: ConflictWinner,
    /// 裁决策略：local_pending / delete_wins / last_write
    pub strategy: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// `conflict_history` 表的同步访问层
pub struct ConflictHistory;

impl ConflictHistory {
    pub fn append(conn: &Connection, record: &ConflictRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO conflict_history
             (entity_id, entity_type, field, local_value, remote_value,
              resolved_value, winner, strategy, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.entity_id,
                record.entity_type.as_str(),
                record.field,
                record.local_value.as_ref().map(|v| v.to_string()),
                record.remote_value.as_ref().map(|v| v.to_string()),
                record.resolved_value.as_ref().map(|v| v.to_string()),
                record.winner.as_str(),
                record.strategy,
                fmt_ts(&record.timestamp),
            ],
        )?;
        Ok(())
    }

    /// 最近的裁决记录（调试与设置页用）
    pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<ConflictRecord>> {
        let mut stmt = conn.prepare(
            "SELECT entity_id, entity_type, field, local_value, remote_value,
                    resolved_value, winner, strategy, ts
             FROM conflict_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let entity_id: String = row.get(0)?;
            let entity_type: String = row.get(1)?;
            let field: String = row.get(2)?;
            let local_value: Option<String> = row.get(3)?;
            let remote_value: Option<String> = row.get(4)?;
            let resolved_value: Option<String> = row.get(5)?;
            let winner: String = row.get(6)?;
            let strategy: String = row.get(7)?;
            let ts: String = row.get(8)?;
            Ok((
                entity_id,
                entity_type,
                field,
                local_value,
                remote_value,
                resolved_value,
                winner,
                strategy,
                ts,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (entity_id, entity_type, field, lv, rv, sv, winner, strategy, ts) = row?;
            let Ok(entity_type) = entity_type.parse::<EntityKind>() else {
                // 旧版本遗留的未知实体类型，跳过
                continue;
            };
            let winner = match winner.as_str() {
                "local" => ConflictWinner::Local,
                "remote" => ConflictWinner::Remote,
                _ => ConflictWinner::Merged,
            };
            let strategy = match strategy.as_str() {
                "local_pending" => "local_pending",
                "delete_wins" => "delete_wins",
                _ => "last_write",
            };
            records.push(ConflictRecord {
                entity_id,
                entity_type,
                field,
                local_value: lv.and_then(|s| serde_json::from_str(&s).ok()),
                remote_value: rv.and_then(|s| serde_json::from_str(&s).ok()),
                resolved_value: sv.and_then(|s| serde_json::from_str(&s).ok()),
                winner,
                strategy,
                timestamp: parse_ts(&ts)?,
            });
        }
        Ok(records)
    }

    /// 清理超过保留期的记录，返回删除数量
    pub fn prune(conn: &Connection, retention: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = fmt_ts(&(now - retention));
        let n = conn.execute(
            "DELETE FROM conflict_history WHERE ts < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    pub fn clear(conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM conflict_history", [])?;
        Ok(())
    }
}
