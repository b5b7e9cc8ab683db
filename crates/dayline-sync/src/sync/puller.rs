//! 拉取对账 - 基于游标的增量拉取
//!
//! 游标为 `lastSyncTimestamp`（平台 KV 持久化，登出清除）。各同步表
//! 并行拉取 `updated_at ≥ cursor` 的行，按 (updated_at, id) 稳定排序
//! 键集分页，逐行过冲突解析器落盘，最后把游标推进到观察到的最大
//! `updated_at`。游标单调不减；任一表失败则本轮不推进（避免漏行）。

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::remote::RemoteStore;
use crate::storage::entity::{fmt_ts, parse_ts, EntityKind, ALL_KINDS};
use crate::storage::kv::{keys, KvStore};
use crate::storage::LocalStore;
use crate::sync::resolver;

/// 一次对账的结果
#[derive(Debug, Default, Clone)]
pub struct PullReport {
    /// 经解析器实际落盘的行数
    pub applied: usize,
    /// 观察到的行数（含无变化行）
    pub observed: usize,
    /// 本轮后的游标
    pub cursor: Option<String>,
    /// 拉取失败的表
    pub failed_tables: Vec<EntityKind>,
}

/// 拉取器
#[derive(Debug)]
pub struct Puller {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    kv: Arc<KvStore>,
    bus: EventBus,
    page_size: usize,
}

impl Puller {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        kv: Arc<KvStore>,
        bus: EventBus,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            remote,
            kv,
            bus,
            page_size,
        }
    }

    pub fn cursor(&self) -> Result<Option<String>> {
        self.kv.get(keys::LAST_SYNC_TIMESTAMP)
    }

    /// 执行一次对账
    pub async fn reconcile(&self) -> Result<PullReport> {
        let cursor: Option<String> = self.kv.get(keys::LAST_SYNC_TIMESTAMP)?;
        let since = match cursor.as_deref() {
            Some(s) => Some(parse_ts(s)?),
            None => None,
        };

        let results = join_all(
            ALL_KINDS
                .iter()
                .map(|kind| self.pull_table(*kind, since)),
        )
        .await;

        let mut report = PullReport {
            cursor: cursor.clone(),
            ..PullReport::default()
        };
        let mut max_seen: Option<DateTime<Utc>> = since;
        for (kind, result) in ALL_KINDS.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    report.applied += outcome.applied;
                    report.observed += outcome.observed;
                    if let Some(ts) = outcome.max_updated_at {
                        max_seen = Some(max_seen.map_or(ts, |m| m.max(ts)));
                    }
                }
                Err(e) => {
                    warn!("拉取 {} 失败: {}", kind, e);
                    report.failed_tables.push(*kind);
                }
            }
        }

        // 游标只在全表成功时推进，且单调不减
        if report.failed_tables.is_empty() {
            if let Some(ts) = max_seen {
                let advanced = since.map_or(true, |s| ts > s);
                if advanced {
                    let value = fmt_ts(&ts);
                    self.kv.set(keys::LAST_SYNC_TIMESTAMP, &value)?;
                    report.cursor = Some(value);
                }
            }
        }

        self.bus.emit(EngineEvent::PostPull {
            pulled: report.applied,
        });
        info!(
            "对账完成: applied={} observed={} cursor={:?}",
            report.applied, report.observed, report.cursor
        );
        Ok(report)
    }

    async fn pull_table(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> Result<TableOutcome> {
        let mut outcome = TableOutcome::default();
        let mut after: Option<(DateTime<Utc>, String)> = None;

        loop {
            let page = self
                .remote
                .select_since(kind, self.store.user_id(), since, after.clone(), self.page_size)
                .await
                .map_err(|e| SyncError::Remote(e.to_string()))?;
            let page_len = page.len();

            for row in &page {
                outcome.observed += 1;
                outcome.max_updated_at = Some(
                    outcome
                        .max_updated_at
                        .map_or(row.updated_at, |m| m.max(row.updated_at)),
                );

                let pending = self.store.outbox_for_entity(kind, &row.id).await?;
                let local = self.store.get(kind, &row.id).await?;
                let res = resolver::resolve(kind, local.as_ref(), row, &pending);
                if res.changed {
                    self.store
                        .apply_resolution(kind, &res.merged, &res.conflicts)
                        .await?;
                    outcome.applied += 1;
                    self.bus.emit(EngineEvent::EntityChanged {
                        table: kind,
                        entity_id: row.id.clone(),
                    });
                }
            }

            if page_len < self.page_size {
                break;
            }
            after = page.last().map(|r| (r.updated_at, r.id.clone()));
            debug!("{} 翻页继续, after={:?}", kind, after);
        }

        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct TableOutcome {
    applied: usize,
    observed: usize,
    max_updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::test_helpers::MemoryRemote;
    use crate::remote::RemoteError;
    use crate::storage::entity::{EntityRow, FieldMap};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup(page_size: usize) -> (TempDir, Arc<LocalStore>, Arc<MemoryRemote>, Puller) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path(), "u1", "device-a").await.unwrap());
        let kv = Arc::new(KvStore::open(dir.path(), "u1").await.unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let puller = Puller::new(
            store.clone(),
            remote.clone(),
            kv,
            EventBus::default(),
            page_size,
        );
        (dir, store, remote, puller)
    }

    fn goal(id: &str, name: &str, at: DateTime<Utc>) -> EntityRow {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!(name));
        let mut row = EntityRow::new(id, "u1", "device-b", fields);
        row.updated_at = at;
        row
    }

    #[tokio::test]
    async fn first_pull_hydrates_and_sets_cursor() {
        let (_dir, store, remote, puller) = setup(100).await;
        let t = Utc::now();
        remote.seed(EntityKind::Goal, goal("g1", "Run", t));
        remote.seed(EntityKind::Goal, goal("g2", "Walk", t + chrono::Duration::seconds(5)));

        let report = puller.reconcile().await.unwrap();
        assert_eq!(report.applied, 2);
        assert!(store.get(EntityKind::Goal, "g1").await.unwrap().is_some());
        assert_eq!(
            report.cursor.as_deref(),
            Some(fmt_ts(&(t + chrono::Duration::seconds(5))).as_str())
        );
    }

    #[tokio::test]
    async fn pull_is_idempotent_when_cursor_static() {
        let (_dir, _store, remote, puller) = setup(100).await;
        remote.seed(EntityKind::Goal, goal("g1", "Run", Utc::now()));

        let first = puller.reconcile().await.unwrap();
        assert_eq!(first.applied, 1);

        // 游标未动、远端未变：第二轮不应产生任何写
        let second = puller.reconcile().await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.cursor, first.cursor);
    }

    #[tokio::test]
    async fn cursor_never_decreases() {
        let (_dir, _store, remote, puller) = setup(100).await;
        let t = Utc::now();
        remote.seed(EntityKind::Goal, goal("g1", "Run", t));
        let first = puller.reconcile().await.unwrap();

        // 远端出现一行 updated_at 更早的行（另一表），游标不得回退
        remote.seed(
            EntityKind::Task,
            goal("t1", "Old", t - chrono::Duration::hours(2)),
        );
        let second = puller.reconcile().await.unwrap();
        assert_eq!(second.cursor, first.cursor);
    }

    #[tokio::test]
    async fn pagination_survives_equal_timestamps() {
        // 同一 updated_at 的多行靠 (updated_at, id) 键集分页，不漏行
        let (_dir, store, remote, puller) = setup(2).await;
        let t = Utc::now();
        for i in 0..5 {
            remote.seed(EntityKind::Goal, goal(&format!("g{}", i), "x", t));
        }

        let report = puller.reconcile().await.unwrap();
        assert_eq!(report.applied, 5);
        for i in 0..5 {
            assert!(store
                .get(EntityKind::Goal, &format!("g{}", i))
                .await
                .unwrap()
                .is_some());
        }
    }

    #[tokio::test]
    async fn pending_increment_shields_local_value_through_pull() {
        // 属性 9：挂起 increment(+5) 时，拉取远端快照不改本地值
        let (_dir, store, remote, puller) = setup(100).await;
        let local = goal("g1", "Run", Utc::now());
        store.put(EntityKind::Goal, &local).await.unwrap();
        store
            .increment_field(EntityKind::Goal, "g1", "current_value", 5.0)
            .await
            .unwrap();
        let local_after = store.get(EntityKind::Goal, "g1").await.unwrap().unwrap();

        let mut snapshot = goal("g1", "Run", Utc::now() + chrono::Duration::seconds(30));
        snapshot.fields.insert("current_value".into(), json!(100));
        snapshot.version = 9;
        remote.seed(EntityKind::Goal, snapshot);

        puller.reconcile().await.unwrap();
        let row = store.get(EntityKind::Goal, "g1").await.unwrap().unwrap();
        assert_eq!(
            row.field("current_value"),
            local_after.field("current_value"),
            "挂起增量字段不得被远端快照覆盖"
        );
        // 挂起操作本身原样保留
        assert_eq!(store.pending_ops().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_table_blocks_cursor_advance() {
        let (_dir, _store, remote, puller) = setup(100).await;
        remote.seed(EntityKind::Goal, goal("g1", "Run", Utc::now()));
        // 12 张表并行拉取，注入一次失败
        remote.fail_next(RemoteError::Transient("timeout".into()), 1);

        let report = puller.reconcile().await.unwrap();
        assert_eq!(report.failed_tables.len(), 1);
        assert!(report.cursor.is_none(), "有表失败时游标不推进");

        // 重试成功后游标推进
        let report = puller.reconcile().await.unwrap();
        assert!(report.failed_tables.is_empty());
        assert!(report.cursor.is_some());
    }
}
