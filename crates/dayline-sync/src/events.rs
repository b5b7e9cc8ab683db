//! 事件系统 - 引擎对反应式层的通知出口
//!
//! 引擎本身不做 UI 反应式：推送完成、拉取完成、实时应用与单实体变更
//! 都通过广播事件发布，任何订阅方（查询层、状态条）自行决定刷新。

use tokio::sync::broadcast;
use tracing::debug;

use crate::storage::entity::EntityKind;

/// 引擎事件
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// 一次推送排空完成
    PostPush { pushed: usize },
    /// 一次拉取对账完成
    PostPull { pulled: usize },
    /// 实时事件已应用到本地
    RealtimeApplied { table: EntityKind, entity_id: String },
    /// 本地写导致的单实体变更
    EntityChanged { table: EntityKind, entity_id: String },
    /// 操作达到重试上限被丢弃
    OpsDropped { tables: Vec<EntityKind> },
}

impl EngineEvent {
    /// 该事件是否可能影响某类实体的查询结果
    pub fn affects(&self, kind: EntityKind) -> bool {
        match self {
            EngineEvent::PostPush { .. } | EngineEvent::PostPull { .. } => true,
            EngineEvent::RealtimeApplied { table, .. }
            | EngineEvent::EntityChanged { table, .. } => *table == kind,
            EngineEvent::OpsDropped { tables } => tables.contains(&kind),
        }
    }
}

/// 事件总线（broadcast 扇出，无订阅者时事件直接丢弃）
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!("引擎事件: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
