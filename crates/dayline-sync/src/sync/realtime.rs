//! 实时摄入 - 远端变更流的编辑感知应用
//!
//! 每用户一条按 user_id 过滤的服务端推送通道。事件逐条处理：
//! 1. 本地 2 秒内写过的行直接丢弃（回声保护）
//! 2. 正在编辑的实体进入暂存区，退出编辑或 TTL 到期后应用
//!    （删除事件按固定 500ms 延迟应用，留给删除动画）
//! 3. 其余事件经冲突解析器落盘
//!
//! 通道状态机：disconnected → connecting → connected →
//! {error → reconnecting(指数退避)} → connected；连续 5 次失败标记
//! unhealthy，此后由周期轮询兜底。连上时不请求快照（游标拉取已建立
//! 基线）。

use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::remote::{ChangeEvent, ChannelProvider};
use crate::storage::entity::EntityKind;
use crate::storage::LocalStore;
use crate::sync::resolver;
use crate::sync::status::StatusObserver;

/// 连续失败上限，达到后通道标记为不健康
const MAX_CHANNEL_FAILURES: u32 = 5;
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Unhealthy,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
            ChannelState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// 最近本地写窗口（回声保护）
#[derive(Debug, Clone)]
pub struct RecentWrites {
    window: Duration,
    inner: Arc<RwLock<HashMap<(EntityKind, String), tokio::time::Instant>>>,
}

impl RecentWrites {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 记录一次本地写
    pub async fn note(&self, kind: EntityKind, id: &str) {
        let mut map = self.inner.write().await;
        let now = tokio::time::Instant::now();
        // 顺带清理过期条目，映射不随写入无限增长
        map.retain(|_, at| now.duration_since(*at) < self.window);
        map.insert((kind, id.to_string()), now);
    }

    pub async fn is_recent(&self, kind: EntityKind, id: &str) -> bool {
        let map = self.inner.read().await;
        map.get(&(kind, id.to_string()))
            .map(|at| at.elapsed() < self.window)
            .unwrap_or(false)
    }
}

/// 实时摄入器
#[derive(Debug)]
pub struct RealtimeIngress {
    provider: Arc<dyn ChannelProvider>,
    store: Arc<LocalStore>,
    bus: EventBus,
    status: StatusObserver,
    recent: RecentWrites,
    state: Arc<RwLock<ChannelState>>,
    /// 正在编辑的实体（UI 标记）
    editing: Arc<RwLock<HashSet<(EntityKind, String)>>>,
    /// 编辑期间暂存的远端变更
    buffered: Arc<Mutex<HashMap<(EntityKind, String), ChangeEvent>>>,
    edit_ttl: Duration,
    delete_hold: Duration,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RealtimeIngress {
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        store: Arc<LocalStore>,
        bus: EventBus,
        status: StatusObserver,
        recent: RecentWrites,
        edit_ttl: Duration,
        delete_hold: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            bus,
            status,
            recent,
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            editing: Arc::new(RwLock::new(HashSet::new())),
            buffered: Arc::new(Mutex::new(HashMap::new())),
            edit_ttl,
            delete_hold,
            task: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    pub async fn is_healthy(&self) -> bool {
        matches!(
            self.state().await,
            ChannelState::Connected | ChannelState::Connecting | ChannelState::Reconnecting
        )
    }

    /// 启动（或在断开 / 不健康后重启）订阅循环
    pub async fn start(self: Arc<Self>) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run().await }));
    }

    /// 停止订阅。已提交远端的变更不会被撤回。
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.set_state(ChannelState::Disconnected).await;
    }

    /// UI 标记实体进入编辑态
    pub async fn mark_editing(&self, kind: EntityKind, id: &str) {
        self.editing
            .write()
            .await
            .insert((kind, id.to_string()));
    }

    /// UI 标记实体退出编辑态，暂存的远端变更立即应用
    pub async fn end_editing(&self, kind: EntityKind, id: &str) {
        self.editing
            .write()
            .await
            .remove(&(kind, id.to_string()));
        self.flush_buffered(kind, id).await;
    }

    /// 编辑期间是否有待应用的远端删除（UI 的 pending 指示）
    pub async fn pending_delete(&self, kind: EntityKind, id: &str) -> bool {
        self.buffered
            .lock()
            .await
            .get(&(kind, id.to_string()))
            .map(|ev| matches!(ev, ChangeEvent::Delete { .. }) || ev.row().deleted)
            .unwrap_or(false)
    }

    async fn run(self: Arc<Self>) {
        let mut failures: u32 = 0;
        loop {
            self.set_state(ChannelState::Connecting).await;
            match self.provider.subscribe(self.store.user_id()).await {
                Ok(mut rx) => {
                    failures = 0;
                    self.set_state(ChannelState::Connected).await;
                    info!("实时通道已连接: user={}", self.store.user_id());
                    while let Some(event) = rx.recv().await {
                        self.clone().apply_event(event).await;
                    }
                    warn!("实时通道断开");
                }
                Err(e) => {
                    warn!("实时订阅失败: {}", e);
                }
            }

            failures += 1;
            if failures >= MAX_CHANNEL_FAILURES {
                self.set_state(ChannelState::Unhealthy).await;
                warn!("实时通道连续 {} 次失败，转入轮询兜底", failures);
                return;
            }
            self.set_state(ChannelState::Reconnecting).await;
            tokio::time::sleep(channel_backoff(failures)).await;
        }
    }

    async fn set_state(&self, state: ChannelState) {
        {
            let mut guard = self.state.write().await;
            if *guard == state {
                return;
            }
            *guard = state;
        }
        debug!("通道状态: {}", state);
        self.status.set_realtime_state(state).await;
    }

    /// 处理一个通道事件（回声保护 → 编辑暂存 → 解析落盘）
    async fn apply_event(self: Arc<Self>, event: ChangeEvent) {
        let kind = event.table();
        let row = event.row();

        // 行级过滤防御：解析器只信任当前用户的行
        if row.user_id != self.store.user_id() {
            warn!("丢弃非本用户的实时事件: {} {}", kind, row.id);
            return;
        }

        // 回声保护：本地刚写过的行，远端回放直接丢弃
        if self.recent.is_recent(kind, &row.id).await {
            debug!("回声丢弃: {} {}", kind, row.id);
            return;
        }

        let key = (kind, row.id.clone());
        if self.editing.read().await.contains(&key) {
            let is_delete =
                matches!(event, ChangeEvent::Delete { .. }) || event.row().deleted;
            self.buffered.lock().await.insert(key.clone(), event);
            let hold = if is_delete {
                // 删除给 UI 留出动画窗口后强制应用
                self.delete_hold
            } else {
                self.edit_ttl
            };
            debug!("编辑中，暂存远端变更 {} {} (hold {:?})", kind, key.1, hold);
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                this.flush_buffered(key.0, &key.1).await;
            });
            return;
        }

        self.apply_now(event).await;
    }

    async fn flush_buffered(&self, kind: EntityKind, id: &str) {
        let event = self
            .buffered
            .lock()
            .await
            .remove(&(kind, id.to_string()));
        if let Some(event) = event {
            self.apply_now(event).await;
        }
    }

    async fn apply_now(&self, event: ChangeEvent) {
        let kind = event.table();
        let mut remote_row = event.row().clone();
        if matches!(event, ChangeEvent::Delete { .. }) {
            // 远端硬删除按软删除落地；墓碑由保留期清扫兜底
            remote_row.deleted = true;
        }

        // 失败在引擎边界吸收：实时路径不向上冒错
        let applied = async {
            let pending = self
                .store
                .outbox_for_entity(kind, &remote_row.id)
                .await?;
            let local = self.store.get(kind, &remote_row.id).await?;
            let res = resolver::resolve(kind, local.as_ref(), &remote_row, &pending);
            if res.changed {
                self.store
                    .apply_resolution(kind, &res.merged, &res.conflicts)
                    .await?;
            }
            crate::error::Result::Ok(res.changed)
        }
        .await;

        match applied {
            Ok(changed) => {
                if changed {
                    self.bus.emit(EngineEvent::RealtimeApplied {
                        table: kind,
                        entity_id: remote_row.id.clone(),
                    });
                }
            }
            Err(e) => {
                warn!("实时应用失败 {} {}: {}", kind, remote_row.id, e);
            }
        }
    }
}

/// 通道重连退避：1s 起步翻倍，封顶 30s，10% 抖动
fn channel_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(8);
    let base = (BACKOFF_BASE_MS << exp).min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=(base / 10).max(1));
    Duration::from_millis(base + jitter)
}
