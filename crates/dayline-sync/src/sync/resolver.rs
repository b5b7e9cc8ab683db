//! 冲突解析器 - 三层字段级合并
//!
//! 在拉取与实时摄入时调用，输入 (local, remote, pendingOps)，输出合并行
//! 与审计记录。解析器从不失败：每个字段都有裁决规则兜底。
//!
//! 裁决次序（自上而下）：
//! 1. 字段有挂起的发件箱操作 → 本地胜（保留用户意图）
//! 2. `deleted` 字段任一侧为 true → 删除侧胜
//! 3. updated_at 较新的一侧胜
//! 4. 时间戳相同 → device_id 字典序较小者胜（确定性收敛）
//!
//! 不变量：字段存在挂起 `increment` 时，绝不用远端快照覆盖本地数值，
//! 否则下一次推送会把增量重复施加。挂起操作本身不受解析器影响。

use chrono::Utc;
use std::collections::BTreeSet;
use tracing::debug;

use crate::storage::conflict_history::{ConflictRecord, ConflictWinner};
use crate::storage::entity::{EntityKind, EntityRow};
use crate::storage::outbox::Operation;

/// 一次解析的产出
#[derive(Debug, Clone)]
pub struct Resolution {
    pub merged: EntityRow,
    pub conflicts: Vec<ConflictRecord>,
    /// merged 与本地现状不同，需要落盘
    pub changed: bool,
}

/// 对单个实体执行三层合并
pub fn resolve(
    kind: EntityKind,
    local: Option<&EntityRow>,
    remote: &EntityRow,
    pending: &[Operation],
) -> Resolution {
    // 第一层：平凡情形
    let local = match local {
        None => {
            return Resolution {
                merged: remote.clone(),
                conflicts: Vec::new(),
                changed: true,
            };
        }
        Some(row) => row,
    };
    if remote.updated_at == local.updated_at && remote.version == local.version {
        return Resolution {
            merged: local.clone(),
            conflicts: Vec::new(),
            changed: false,
        };
    }

    // 挂起操作屏蔽的字段集合
    let shielded: BTreeSet<&str> = pending
        .iter()
        .flat_map(|op| op.kind.touched_fields())
        .collect();

    // 第二层：求差异字段（业务字段 + deleted 标志）
    let mut diff_fields: BTreeSet<String> = BTreeSet::new();
    for key in local.fields.keys().chain(remote.fields.keys()) {
        if local.fields.get(key) != remote.fields.get(key) {
            diff_fields.insert(key.clone());
        }
    }
    let deleted_differs = local.deleted != remote.deleted;

    // 信封永不参与合并：id / user_id / created_at 取本地
    let mut merged = local.clone();
    merged.updated_at = local.updated_at.max(remote.updated_at);

    if diff_fields.is_empty() && !deleted_differs {
        // 仅信封漂移（例如对端 bump 过 _version），不算一次合并写
        merged.version = local.version.max(remote.version);
        let changed = merged != *local;
        return Resolution {
            merged,
            conflicts: Vec::new(),
            changed,
        };
    }

    let mut conflicts = Vec::new();
    let now = Utc::now();

    // 第三层：逐字段裁决
    if deleted_differs {
        let (winner, strategy) = if shielded.contains("deleted") {
            (ConflictWinner::Local, "local_pending")
        } else if local.deleted || remote.deleted {
            // 删除侧胜
            let winner = if local.deleted {
                ConflictWinner::Local
            } else {
                ConflictWinner::Remote
            };
            (winner, "delete_wins")
        } else {
            (last_write_winner(local, remote), "last_write")
        };
        let resolved = match winner {
            ConflictWinner::Local => local.deleted,
            _ => remote.deleted,
        };
        merged.deleted = resolved;
        conflicts.push(ConflictRecord {
            entity_id: local.id.clone(),
            entity_type: kind,
            field: "deleted".into(),
            local_value: Some(serde_json::Value::Bool(local.deleted)),
            remote_value: Some(serde_json::Value::Bool(remote.deleted)),
            resolved_value: Some(serde_json::Value::Bool(resolved)),
            winner,
            strategy,
            timestamp: now,
        });
    }

    for field in diff_fields {
        let (winner, strategy) = if shielded.contains(field.as_str()) {
            (ConflictWinner::Local, "local_pending")
        } else {
            (last_write_winner(local, remote), "last_write")
        };
        let side = match winner {
            ConflictWinner::Local => local,
            _ => remote,
        };
        match side.fields.get(&field) {
            Some(value) => {
                merged.fields.insert(field.clone(), value.clone());
            }
            None => {
                merged.fields.remove(&field);
            }
        }
        conflicts.push(ConflictRecord {
            entity_id: local.id.clone(),
            entity_type: kind,
            field: field.clone(),
            local_value: local.fields.get(&field).cloned(),
            remote_value: remote.fields.get(&field).cloned(),
            resolved_value: side.fields.get(&field).cloned(),
            winner,
            strategy,
            timestamp: now,
        });
    }

    // 任一次合并写都 bump 版本；device_id 随信封较新一侧
    merged.version = local.version.max(remote.version) + 1;
    merged.device_id = if remote.updated_at >= local.updated_at {
        remote.device_id.clone()
    } else {
        local.device_id.clone()
    };

    debug!(
        "解析 {} {}: {} 个字段裁决，版本 {} -> {}",
        kind,
        local.id,
        conflicts.len(),
        local.version.max(remote.version),
        merged.version
    );

    Resolution {
        merged,
        conflicts,
        changed: true,
    }
}

/// 最后写入胜；时间戳打平时 device_id 字典序小者胜
fn last_write_winner(local: &EntityRow, remote: &EntityRow) -> ConflictWinner {
    if local.updated_at > remote.updated_at {
        ConflictWinner::Local
    } else if remote.updated_at > local.updated_at {
        ConflictWinner::Remote
    } else {
        let l = local.device_id.as_deref().unwrap_or("");
        let r = remote.device_id.as_deref().unwrap_or("");
        if l <= r {
            ConflictWinner::Local
        } else {
            ConflictWinner::Remote
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entity::FieldMap;
    use crate::storage::outbox::OpKind;
    use chrono::Duration;
    use serde_json::json;

    fn row(id: &str, device: &str, fields: &[(&str, serde_json::Value)]) -> EntityRow {
        let mut map = FieldMap::new();
        for (k, v) in fields {
            map.insert((*k).into(), v.clone());
        }
        EntityRow::new(id, "u1", device, map)
    }

    fn pending_inc(field: &str, delta: f64) -> Operation {
        Operation {
            seq: 1,
            table: EntityKind::Goal,
            entity_id: "g1".into(),
            kind: OpKind::Increment {
                field: field.into(),
                delta,
            },
            timestamp: Utc::now(),
            retries: 0,
        }
    }

    fn pending_set(field: &str, value: serde_json::Value) -> Operation {
        let mut fields = FieldMap::new();
        fields.insert(field.into(), value);
        Operation {
            seq: 1,
            table: EntityKind::Goal,
            entity_id: "g1".into(),
            kind: OpKind::Set { fields },
            timestamp: Utc::now(),
            retries: 0,
        }
    }

    #[test]
    fn absent_local_takes_remote_wholesale() {
        let remote = row("g1", "dev-b", &[("name", json!("Run"))]);
        let res = resolve(EntityKind::Goal, None, &remote, &[]);
        assert!(res.changed);
        assert_eq!(res.merged, remote);
        assert!(res.conflicts.is_empty());
    }

    #[test]
    fn identical_envelope_is_a_noop() {
        let local = row("g1", "dev-a", &[("name", json!("Run"))]);
        let remote = local.clone();
        let res = resolve(EntityKind::Goal, Some(&local), &remote, &[]);
        assert!(!res.changed);
        assert!(res.conflicts.is_empty());
    }

    #[test]
    fn newer_remote_field_wins_and_bumps_version() {
        let local = row("g1", "dev-a", &[("name", json!("Run"))]);
        let mut remote = row("g1", "dev-b", &[("name", json!("Walk"))]);
        remote.updated_at = local.updated_at + Duration::seconds(5);
        remote.version = 3;

        let res = resolve(EntityKind::Goal, Some(&local), &remote, &[]);
        assert!(res.changed);
        assert_eq!(res.merged.field("name"), Some(&json!("Walk")));
        assert_eq!(res.merged.version, 4); // max(1, 3) + 1
        assert_eq!(res.merged.updated_at, remote.updated_at);
        assert_eq!(res.conflicts.len(), 1);
        assert_eq!(res.conflicts[0].winner, ConflictWinner::Remote);
        assert_eq!(res.conflicts[0].strategy, "last_write");
    }

    #[test]
    fn pending_op_shields_field_from_remote_snapshot() {
        // 挂起 increment(+5) 时，远端快照不得覆盖本地数值
        let mut local = row("g1", "dev-a", &[("current_value", json!(15))]);
        local.version = 2;
        let mut remote = row("g1", "dev-b", &[("current_value", json!(10))]);
        remote.updated_at = local.updated_at + Duration::seconds(30);
        remote.version = 5;

        let res = resolve(
            EntityKind::Goal,
            Some(&local),
            &remote,
            &[pending_inc("current_value", 5.0)],
        );
        assert!(res.changed);
        assert_eq!(res.merged.field("current_value"), Some(&json!(15)));
        assert_eq!(res.conflicts[0].strategy, "local_pending");
        assert_eq!(res.conflicts[0].winner, ConflictWinner::Local);
    }

    #[test]
    fn pending_set_shields_while_delete_still_wins() {
        // 本地挂起 set(name)，远端已删除：deleted 按删除侧胜，name 保留本地意图
        let mut local = row("g1", "dev-a", &[("name", json!("Run"))]);
        local.updated_at = local.updated_at + Duration::seconds(10);
        let mut remote = row("g1", "dev-b", &[("name", json!("Old"))]);
        remote.deleted = true;
        remote.version = 2;

        let res = resolve(
            EntityKind::Goal,
            Some(&local),
            &remote,
            &[pending_set("name", json!("Run"))],
        );
        assert!(res.changed);
        assert!(res.merged.deleted, "删除侧必须胜出");
        assert_eq!(res.merged.field("name"), Some(&json!("Run")));
        let deleted_conflict = res
            .conflicts
            .iter()
            .find(|c| c.field == "deleted")
            .unwrap();
        assert_eq!(deleted_conflict.strategy, "delete_wins");
        assert_eq!(deleted_conflict.winner, ConflictWinner::Remote);
    }

    #[test]
    fn resurrection_is_impossible() {
        // 已接受 deleted=true 后，迟到的旧 update 不能把行复活
        let mut local = row("g1", "dev-a", &[("name", json!("Run"))]);
        local.deleted = true;
        local.version = 4;
        let mut remote = row("g1", "dev-b", &[("name", json!("Run"))]);
        remote.updated_at = local.updated_at - Duration::seconds(60);
        remote.deleted = false;

        let res = resolve(EntityKind::Goal, Some(&local), &remote, &[]);
        assert!(res.merged.deleted, "解析器必须保持 deleted=true");
    }

    #[test]
    fn equal_timestamps_break_ties_by_device_id_on_both_sides() {
        let mut a = row("g1", "dev-a", &[("name", json!("FromA"))]);
        let mut b = row("g1", "dev-b", &[("name", json!("FromB"))]);
        b.updated_at = a.updated_at;
        a.version = 1;
        b.version = 1;

        // A 视角：local=a remote=b；B 视角：local=b remote=a
        let at_a = resolve(EntityKind::Goal, Some(&a), &b, &[]);
        let at_b = resolve(EntityKind::Goal, Some(&b), &a, &[]);
        assert_eq!(
            at_a.merged.field("name"),
            at_b.merged.field("name"),
            "两端必须收敛到同一胜者"
        );
        assert_eq!(at_a.merged.field("name"), Some(&json!("FromA")));
    }

    #[test]
    fn envelope_only_drift_does_not_bump_version() {
        let local = row("g1", "dev-a", &[("name", json!("Run"))]);
        let mut remote = local.clone();
        remote.version = 3;
        remote.updated_at = local.updated_at + Duration::seconds(1);

        let res = resolve(EntityKind::Goal, Some(&local), &remote, &[]);
        assert!(res.changed);
        assert_eq!(res.merged.version, 3);
        assert!(res.conflicts.is_empty());

        // 再解析一次同一远端行：无额外写（拉取幂等的基础）
        let res2 = resolve(EntityKind::Goal, Some(&res.merged), &remote, &[]);
        assert!(!res2.changed);
    }

    #[test]
    fn field_missing_on_winner_side_is_removed() {
        let local = row("g1", "dev-a", &[("color", json!("red"))]);
        let mut remote = row("g1", "dev-b", &[]);
        remote.updated_at = local.updated_at + Duration::seconds(5);
        remote.version = 2;

        let res = resolve(EntityKind::Goal, Some(&local), &remote, &[]);
        assert!(res.changed);
        assert_eq!(res.merged.field("color"), None);
        assert_eq!(res.conflicts[0].remote_value, None);
    }
}
