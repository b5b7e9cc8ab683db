//! 反应式查询层 - UI 的只读窗口
//!
//! 所有读取只打本地存储；每个查询订阅引擎事件，在可能影响自身谓词的
//! 事件（推送完成、拉取完成、实时应用、单实体变更）后重查并经 watch
//! 通道发布。写入方走引擎的发件箱助手，从不直接改本地库。

use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::error::Result;
use crate::events::EventBus;
use crate::storage::entity::{EntityKind, EntityRow};
use crate::storage::LocalStore;

/// 查询谓词（均隐含 user_id 过滤与 deleted=0）
#[derive(Debug, Clone)]
pub enum QueryFilter {
    /// 某类实体的全部可见行
    All,
    /// 业务字段等值（如 routine_entries 的 date）
    FieldEq(String, serde_json::Value),
    /// 多字段等值（如 (routine_id, date) 复合索引）
    FieldsEq(Vec<(String, serde_json::Value)>),
    /// 业务字段闭区间（如日期范围）
    FieldRange {
        field: String,
        low: serde_json::Value,
        high: serde_json::Value,
    },
}

/// 查询定义
#[derive(Debug, Clone)]
pub struct QueryDef {
    pub kind: EntityKind,
    pub filter: QueryFilter,
}

impl QueryDef {
    pub fn all(kind: EntityKind) -> Self {
        Self {
            kind,
            filter: QueryFilter::All,
        }
    }

    pub fn field_eq(kind: EntityKind, field: &str, value: serde_json::Value) -> Self {
        Self {
            kind,
            filter: QueryFilter::FieldEq(field.to_string(), value),
        }
    }

    pub fn field_range(
        kind: EntityKind,
        field: &str,
        low: serde_json::Value,
        high: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            filter: QueryFilter::FieldRange {
                field: field.to_string(),
                low,
                high,
            },
        }
    }
}

/// 活动查询句柄：持有 watch 接收端，drop 时后台任务随之结束
#[derive(Debug)]
pub struct LiveQuery {
    rx: watch::Receiver<Vec<EntityRow>>,
    task: tokio::task::JoinHandle<()>,
}

impl LiveQuery {
    /// 当前结果集
    pub fn rows(&self) -> Vec<EntityRow> {
        self.rx.borrow().clone()
    }

    /// 等待下一次结果变化
    pub async fn changed(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| crate::error::SyncError::ShuttingDown("查询源已关闭".into()))
    }

    pub fn receiver(&self) -> watch::Receiver<Vec<EntityRow>> {
        self.rx.clone()
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_query(store: &LocalStore, def: &QueryDef) -> Result<Vec<EntityRow>> {
    match &def.filter {
        QueryFilter::All => store.query_visible(def.kind).await,
        QueryFilter::FieldEq(field, value) => store.query_field_eq(def.kind, field, value).await,
        QueryFilter::FieldsEq(pairs) => store.query_fields_eq(def.kind, pairs).await,
        QueryFilter::FieldRange { field, low, high } => {
            store.query_field_range(def.kind, field, low, high).await
        }
    }
}

/// 建立一个活动查询：先查一次作为初值，随后跟随引擎事件刷新
pub async fn watch_query(
    store: Arc<LocalStore>,
    bus: &EventBus,
    def: QueryDef,
) -> Result<LiveQuery> {
    let initial = run_query(&store, &def).await?;
    let (tx, rx) = watch::channel(initial);
    let mut events = bus.subscribe();

    let task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !event.affects(def.kind) {
                        continue;
                    }
                    match run_query(&store, &def).await {
                        Ok(rows) => {
                            // 结果未变时不惊动订阅方
                            let unchanged = *tx.borrow() == rows;
                            if !unchanged && tx.send(rows).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("活动查询重查失败: {}", e),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("活动查询落后 {} 个事件，强制重查", n);
                    if let Ok(rows) = run_query(&store, &def).await {
                        let _ = tx.send(rows);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    Ok(LiveQuery { rx, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use crate::storage::entity::FieldMap;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<LocalStore>, EventBus) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path(), "u1", "device-a").await.unwrap());
        (dir, store, EventBus::default())
    }

    fn entry(routine: &str, date: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("routine_id".into(), json!(routine));
        fields.insert("date".into(), json!(date));
        fields
    }

    #[tokio::test]
    async fn initial_result_reflects_store() {
        let (_dir, store, bus) = setup().await;
        store
            .create_entity(EntityKind::RoutineEntry, "e1", entry("r1", "2025-06-01"))
            .await
            .unwrap();

        let query = watch_query(
            store.clone(),
            &bus,
            QueryDef::field_eq(EntityKind::RoutineEntry, "date", json!("2025-06-01")),
        )
        .await
        .unwrap();
        assert_eq!(query.rows().len(), 1);
    }

    #[tokio::test]
    async fn query_refreshes_on_matching_event() {
        let (_dir, store, bus) = setup().await;
        let mut query = watch_query(store.clone(), &bus, QueryDef::all(EntityKind::Goal))
            .await
            .unwrap();
        assert!(query.rows().is_empty());

        store
            .create_entity(EntityKind::Goal, "g1", FieldMap::new())
            .await
            .unwrap();
        bus.emit(EngineEvent::EntityChanged {
            table: EntityKind::Goal,
            entity_id: "g1".into(),
        });

        query.changed().await.unwrap();
        assert_eq!(query.rows().len(), 1);
    }

    #[tokio::test]
    async fn unrelated_events_do_not_disturb_subscribers() {
        let (_dir, store, bus) = setup().await;
        let query = watch_query(store.clone(), &bus, QueryDef::all(EntityKind::Goal))
            .await
            .unwrap();
        let mut rx = query.receiver();

        bus.emit(EngineEvent::EntityChanged {
            table: EntityKind::Task,
            entity_id: "t1".into(),
        });
        tokio::task::yield_now().await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn deleted_rows_leave_result_set() {
        let (_dir, store, bus) = setup().await;
        store
            .create_entity(EntityKind::Goal, "g1", FieldMap::new())
            .await
            .unwrap();
        let mut query = watch_query(store.clone(), &bus, QueryDef::all(EntityKind::Goal))
            .await
            .unwrap();
        assert_eq!(query.rows().len(), 1);

        store.delete_entity(EntityKind::Goal, "g1").await.unwrap();
        bus.emit(EngineEvent::EntityChanged {
            table: EntityKind::Goal,
            entity_id: "g1".into(),
        });
        query.changed().await.unwrap();
        assert!(query.rows().is_empty());
    }
}
