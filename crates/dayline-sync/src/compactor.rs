//! 合并压缩器 - 发件箱的单趟归约
//!
//! 在每次排空开始时恰好调用一次。契约：输出队列施加到任意一致远端后，
//! 终态与原队列观察等价，且记录数尽可能少。
//!
//! 规则（按组内 seq 序贪心求值）：
//! - `create … delete` 互相抵消（含其间全部操作）
//! - 无前置 `create` 的 `update(s) … delete` 只留末位 `delete`
//! - `create` 吸收后继 `set` / `increment` 为单条 `create`
//! - 同字段：`increment` 串求和；`increment` 后接 `set` 被覆盖；
//!   数值 `set` 后接 `increment` 折为一条 `set`；`set` 串后者胜
//! - 零增量、空 `set`、仅 `updated_at` 的 `set` 一律剔除
//! - 折叠幸存者保留被折叠记录里最早的 timestamp（退避年龄不重置）
//!
//! 压缩是幂等的：对输出再压缩不产生任何变化。

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::storage::entity::FieldMap;
use crate::storage::number_value;
use crate::storage::outbox::{OpKind, Operation};

/// 压缩整个发件箱，返回观察等价的幸存序列（按 seq 升序）
pub fn compact(ops: Vec<Operation>) -> Vec<Operation> {
    // 按 (table, entity_id) 分组，组间保持首见顺序
    let mut order: Vec<(crate::storage::EntityKind, String)> = Vec::new();
    let mut groups: HashMap<(crate::storage::EntityKind, String), Vec<Operation>> = HashMap::new();
    for op in ops {
        let key = (op.table, op.entity_id.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(op);
    }

    let mut out = Vec::new();
    for key in order {
        let group = groups.remove(&key).unwrap_or_default();
        out.extend(compact_group(group));
    }
    out.sort_by_key(|op| op.seq);
    out
}

/// 折叠幸存者的归属信息：seq / timestamp 取被折叠者最小，retries 取最大
#[derive(Debug, Clone, Copy, PartialEq)]
struct Provenance {
    seq: i64,
    ts: DateTime<Utc>,
    retries: u32,
}

impl Provenance {
    fn of(op: &Operation) -> Self {
        Self {
            seq: op.seq,
            ts: op.timestamp,
            retries: op.retries,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            seq: self.seq.min(other.seq),
            ts: self.ts.min(other.ts),
            retries: self.retries.max(other.retries),
        }
    }
}

/// 单字段的折叠状态机
#[derive(Debug, Clone)]
enum FieldState {
    /// 终值为 set
    Set(serde_json::Value, Provenance),
    /// 终值为纯增量
    Inc(f64, Provenance),
    /// 非数值 set 后接增量：两者都要保留（增量在远端按 0 基准读改写）
    SetThenInc(serde_json::Value, Provenance, f64, Provenance),
}

fn compact_group(ops: Vec<Operation>) -> Vec<Operation> {
    if ops.len() <= 1 {
        // 单条也要做无效操作剔除
        return ops.into_iter().filter(|op| !is_noop(op)).collect();
    }

    // 末位 delete 裁决
    let last_delete = ops
        .iter()
        .rposition(|o| matches!(o.kind, OpKind::Delete));
    let (mut head, tail): (Vec<Operation>, Vec<Operation>) = match last_delete {
        Some(j) => {
            let created_before = ops[..j]
                .iter()
                .any(|o| matches!(o.kind, OpKind::Create { .. }));
            let tail = ops[j + 1..].to_vec();
            if created_before {
                // create … delete：远端从未见过该实体，全部抵消
                (Vec::new(), tail)
            } else {
                let prov = ops[..=j]
                    .iter()
                    .map(Provenance::of)
                    .reduce(Provenance::merge)
                    .unwrap_or_else(|| Provenance::of(&ops[j]));
                let survivor = Operation {
                    seq: prov.seq,
                    timestamp: prov.ts,
                    retries: prov.retries,
                    ..ops[j].clone()
                };
                (vec![survivor], tail)
            }
        }
        None => (Vec::new(), ops),
    };

    head.extend(compact_run(tail));
    head
}

/// 无 delete 裁决的剩余序列：create 吸收 + 同字段折叠
fn compact_run(ops: Vec<Operation>) -> Vec<Operation> {
    if ops.is_empty() {
        return ops;
    }

    let table = ops[0].table;
    let entity_id = ops[0].entity_id.clone();

    let mut iter = ops.into_iter().peekable();

    // create 吸收：组内首条若为 create，其后的 set / increment 全部折入初始负载
    if let Some(create) = iter.next_if(|o| matches!(o.kind, OpKind::Create { .. })) {
        let prov = Provenance::of(&create);
        let mut value = match create.kind {
            OpKind::Create { value } => value,
            _ => unreachable!("next_if 已保证首条是 create"),
        };
        for op in iter {
            match op.kind {
                OpKind::Set { fields } => {
                    for (k, v) in fields {
                        value.insert(k, v);
                    }
                }
                OpKind::Increment { field, delta } => {
                    let base = value.get(&field).and_then(|v| v.as_f64()).unwrap_or(0.0);
                    value.insert(field, number_value(base + delta));
                }
                // delete 已在组裁决阶段处理；重复 create 不会出现（id 全局唯一）
                other => {
                    tracing::warn!("压缩跳过 create 后的异常操作: {}", other.kind_str());
                }
            }
        }
        return vec![Operation {
            seq: prov.seq,
            table,
            entity_id,
            kind: OpKind::Create { value },
            timestamp: prov.ts,
            retries: prov.retries,
        }];
    }

    // 同字段折叠
    let mut states: BTreeMap<String, FieldState> = BTreeMap::new();
    for op in iter {
        let prov = Provenance::of(&op);
        match op.kind {
            OpKind::Set { fields } => {
                for (field, value) in fields {
                    let merged = match states.remove(&field) {
                        // set 胜出，但吸收被丢弃记录的最早时间戳
                        Some(FieldState::Set(_, p))
                        | Some(FieldState::Inc(_, p))
                        | Some(FieldState::SetThenInc(_, p, _, _)) => p.merge(prov),
                        None => prov,
                    };
                    states.insert(field, FieldState::Set(value, merged));
                }
            }
            OpKind::Increment { field, delta } => {
                let next = match states.remove(&field) {
                    None => FieldState::Inc(delta, prov),
                    Some(FieldState::Inc(acc, p)) => FieldState::Inc(acc + delta, p.merge(prov)),
                    Some(FieldState::Set(v, p)) => match v.as_f64() {
                        Some(base) => {
                            FieldState::Set(number_value(base + delta), p.merge(prov))
                        }
                        None => FieldState::SetThenInc(v, p, delta, prov),
                    },
                    Some(FieldState::SetThenInc(v, p, acc, q)) => {
                        FieldState::SetThenInc(v, p, acc + delta, q.merge(prov))
                    }
                };
                states.insert(field, next);
            }
            other => {
                tracing::warn!("压缩遇到未归类操作: {}", other.kind_str());
            }
        }
    }

    // 发射：所有 set 终值合并为一条 set，各增量字段各发一条 increment
    let mut set_fields = FieldMap::new();
    let mut set_prov: Option<Provenance> = None;
    let mut incs: Vec<(String, f64, Provenance)> = Vec::new();
    for (field, state) in states {
        match state {
            FieldState::Set(value, p) => {
                set_fields.insert(field, value);
                set_prov = Some(set_prov.map_or(p, |q| q.merge(p)));
            }
            FieldState::Inc(delta, p) => incs.push((field, delta, p)),
            FieldState::SetThenInc(value, p, delta, q) => {
                set_fields.insert(field.clone(), value);
                set_prov = Some(set_prov.map_or(p, |r| r.merge(p)));
                incs.push((field, delta, q));
            }
        }
    }

    let mut out = Vec::new();
    // 仅 updated_at 的 set 是无效操作（push 时信封自动带 updated_at）
    let set_is_noop = set_fields.is_empty()
        || (set_fields.len() == 1 && set_fields.contains_key("updated_at"));
    if !set_is_noop {
        if let Some(prov) = set_prov {
            out.push(Operation {
                seq: prov.seq,
                table,
                entity_id: entity_id.clone(),
                kind: OpKind::Set { fields: set_fields },
                timestamp: prov.ts,
                retries: prov.retries,
            });
        }
    }
    for (field, delta, prov) in incs {
        if delta == 0.0 {
            continue;
        }
        out.push(Operation {
            seq: prov.seq,
            table,
            entity_id: entity_id.clone(),
            kind: OpKind::Increment { field, delta },
            timestamp: prov.ts,
            retries: prov.retries,
        });
    }
    out.sort_by_key(|op| op.seq);
    out
}

fn is_noop(op: &Operation) -> bool {
    match &op.kind {
        OpKind::Increment { delta, .. } => *delta == 0.0,
        OpKind::Set { fields } => {
            fields.is_empty() || (fields.len() == 1 && fields.contains_key("updated_at"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EntityKind;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::HashMap;

    fn op(seq: i64, id: &str, kind: OpKind) -> Operation {
        Operation {
            seq,
            table: EntityKind::Goal,
            entity_id: id.into(),
            kind,
            timestamp: base_ts() + Duration::seconds(seq),
            retries: 0,
        }
    }

    fn base_ts() -> chrono::DateTime<Utc> {
        chrono::DateTime::parse_from_rfc3339("2025-06-01T00:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn set1(field: &str, value: serde_json::Value) -> OpKind {
        let mut fields = FieldMap::new();
        fields.insert(field.into(), value);
        OpKind::Set { fields }
    }

    fn inc(field: &str, delta: f64) -> OpKind {
        OpKind::Increment {
            field: field.into(),
            delta,
        }
    }

    fn create(pairs: &[(&str, serde_json::Value)]) -> OpKind {
        let mut value = FieldMap::new();
        for (k, v) in pairs {
            value.insert((*k).into(), v.clone());
        }
        OpKind::Create { value }
    }

    /// 模拟远端：按序施加操作，得到可观察终态
    #[derive(Debug, Default, PartialEq)]
    struct RemoteSim {
        rows: HashMap<String, (bool, FieldMap)>, // id -> (deleted, fields)
    }

    impl RemoteSim {
        fn apply(&mut self, ops: &[Operation]) {
            for op in ops {
                match &op.kind {
                    OpKind::Create { value } => {
                        self.rows
                            .entry(op.entity_id.clone())
                            .or_insert((false, value.clone()));
                    }
                    OpKind::Delete => {
                        if let Some((deleted, _)) = self.rows.get_mut(&op.entity_id) {
                            *deleted = true;
                        }
                    }
                    OpKind::Set { fields } => {
                        if let Some((_, row)) = self.rows.get_mut(&op.entity_id) {
                            for (k, v) in fields {
                                row.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    OpKind::Increment { field, delta } => {
                        if let Some((_, row)) = self.rows.get_mut(&op.entity_id) {
                            let base = row.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
                            row.insert(field.clone(), number_value(base + delta));
                        }
                    }
                }
            }
        }
    }

    fn assert_equivalent(ops: Vec<Operation>) {
        let compacted = compact(ops.clone());
        let mut a = RemoteSim::default();
        let mut b = RemoteSim::default();
        a.apply(&ops);
        b.apply(&compacted);
        assert_eq!(a, b, "压缩前后远端终态必须观察等价");
    }

    #[test]
    fn create_then_delete_cancels_everything_between() {
        let ops = vec![
            op(1, "g1", create(&[("name", json!("Run"))])),
            op(2, "g1", set1("name", json!("Walk"))),
            op(3, "g1", inc("current_value", 2.0)),
            op(4, "g1", OpKind::Delete),
        ];
        assert_equivalent(ops.clone());
        assert!(compact(ops).is_empty());
    }

    #[test]
    fn updates_then_delete_keeps_only_terminal_delete() {
        let ops = vec![
            op(1, "g1", set1("name", json!("Walk"))),
            op(2, "g1", inc("current_value", 2.0)),
            op(3, "g1", OpKind::Delete),
        ];
        let out = compact(ops.clone());
        assert_equivalent(ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, OpKind::Delete);
        // 幸存者保留最早的时间戳与最小 seq
        assert_eq!(out[0].seq, 1);
        assert_eq!(out[0].timestamp, base_ts() + Duration::seconds(1));
    }

    #[test]
    fn create_absorbs_sets_and_increments() {
        let ops = vec![
            op(1, "g1", create(&[("name", json!("Run")), ("current_value", json!(0))])),
            op(2, "g1", inc("current_value", 3.0)),
            op(3, "g1", set1("name", json!("Walk"))),
            op(4, "g1", inc("streak", 1.0)), // create 负载没有的数值字段按 0 起算
        ];
        assert_equivalent(ops.clone());
        let out = compact(ops);
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            OpKind::Create { value } => {
                assert_eq!(value.get("name"), Some(&json!("Walk")));
                assert_eq!(value.get("current_value"), Some(&json!(3)));
                assert_eq!(value.get("streak"), Some(&json!(1)));
            }
            other => panic!("期望 create，得到 {:?}", other),
        }
        assert_eq!(out[0].seq, 1);
    }

    #[test]
    fn fifty_rapid_increments_fold_to_one() {
        let mut ops = Vec::new();
        for i in 0..50 {
            ops.push(op(i + 1, "g1", inc("current_value", 1.0)));
        }
        assert_equivalent(ops.clone());
        let out = compact(ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, inc("current_value", 50.0));
        assert_eq!(out[0].timestamp, base_ts() + Duration::seconds(1));
    }

    #[test]
    fn increment_then_set_drops_increment() {
        let ops = vec![
            op(1, "g1", inc("current_value", 7.0)),
            op(2, "g1", set1("current_value", json!(100))),
        ];
        assert_equivalent(ops.clone());
        let out = compact(ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, set1("current_value", json!(100)));
        // 被吸收的 increment 的时间戳更早，幸存 set 继承之
        assert_eq!(out[0].timestamp, base_ts() + Duration::seconds(1));
    }

    #[test]
    fn numeric_set_then_increment_folds_into_set() {
        let ops = vec![
            op(1, "g1", set1("current_value", json!(10))),
            op(2, "g1", inc("current_value", 5.0)),
        ];
        assert_equivalent(ops.clone());
        let out = compact(ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, set1("current_value", json!(15)));
    }

    #[test]
    fn non_numeric_set_then_increment_keeps_both() {
        let ops = vec![
            op(1, "g1", set1("label", json!("high"))),
            op(2, "g1", inc("label", 2.0)),
        ];
        assert_equivalent(ops.clone());
        let out = compact(ops);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, set1("label", json!("high")));
        assert_eq!(out[1].kind, inc("label", 2.0));
    }

    #[test]
    fn consecutive_sets_last_wins_and_maps_merge() {
        let mut m1 = FieldMap::new();
        m1.insert("name".into(), json!("Run"));
        m1.insert("color".into(), json!("red"));
        let mut m2 = FieldMap::new();
        m2.insert("name".into(), json!("Walk"));
        let ops = vec![
            op(1, "g1", OpKind::Set { fields: m1 }),
            op(2, "g1", OpKind::Set { fields: m2 }),
        ];
        assert_equivalent(ops.clone());
        let out = compact(ops);
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            OpKind::Set { fields } => {
                assert_eq!(fields.get("name"), Some(&json!("Walk")));
                assert_eq!(fields.get("color"), Some(&json!("red")));
            }
            other => panic!("期望 set，得到 {:?}", other),
        }
    }

    #[test]
    fn noop_operations_are_eliminated() {
        let ops = vec![
            op(1, "g1", inc("current_value", 0.0)),
            op(2, "g2", OpKind::Set { fields: FieldMap::new() }),
            op(3, "g3", set1("updated_at", json!("2025-06-01T00:00:00Z"))),
        ];
        assert!(compact(ops).is_empty());
    }

    #[test]
    fn opposite_increments_cancel_out() {
        let ops = vec![
            op(1, "g1", inc("current_value", 4.0)),
            op(2, "g1", inc("current_value", -4.0)),
        ];
        assert_equivalent(ops.clone());
        assert!(compact(ops).is_empty());
    }

    #[test]
    fn groups_do_not_interfere() {
        let ops = vec![
            op(1, "g1", inc("current_value", 1.0)),
            op(2, "g2", inc("current_value", 2.0)),
            op(3, "g1", inc("current_value", 1.0)),
        ];
        assert_equivalent(ops.clone());
        let out = compact(ops);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].entity_id, "g1");
        assert_eq!(out[0].kind, inc("current_value", 2.0));
        assert_eq!(out[1].entity_id, "g2");
    }

    #[test]
    fn compaction_is_idempotent() {
        let cases: Vec<Vec<Operation>> = vec![
            vec![
                op(1, "g1", create(&[("current_value", json!(0))])),
                op(2, "g1", inc("current_value", 3.0)),
            ],
            vec![
                op(1, "g1", set1("label", json!("high"))),
                op(2, "g1", inc("label", 2.0)),
                op(3, "g2", set1("name", json!("x"))),
                op(4, "g2", OpKind::Delete),
            ],
            vec![
                op(1, "g1", inc("a", 1.0)),
                op(2, "g1", set1("b", json!(5))),
                op(3, "g1", inc("b", 1.0)),
            ],
        ];
        for ops in cases {
            let once = compact(ops);
            let twice = compact(once.clone());
            assert_eq!(once, twice, "compact(compact(O)) 必须等于 compact(O)");
        }
    }

    #[test]
    fn retry_state_survives_collapse() {
        let mut a = op(1, "g1", inc("current_value", 1.0));
        a.retries = 2;
        let b = op(2, "g1", inc("current_value", 1.0));
        let out = compact(vec![a, b]);
        assert_eq!(out.len(), 1);
        // 退避计数不会因折叠而清零
        assert_eq!(out[0].retries, 2);
    }
}
