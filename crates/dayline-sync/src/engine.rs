//! 同步引擎 - 组件装配与生命周期
//!
//! 登录时构造一个 `SyncEngine` 实例；进程内没有其它可变全局状态。
//! 引擎拥有全部定时器（推送去抖、周期对账、保留期清扫），stop 时
//! 全部取消；已提交远端的变更不会被撤回。
//!
//! 本地写路径：UI → 引擎写助手 → 单事务 { 实体变更 + 发件箱 } →
//! schedule_push 去抖 → 压缩 → 排空。读路径全部走本地库（query 层）。

use chrono::Duration as ChronoDuration;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device;
use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::network::{NetworkEvent, NetworkMonitor, NetworkStatusListener};
use crate::query::{self, LiveQuery, QueryDef};
use crate::remote::{ChannelProvider, RemoteStore};
use crate::storage::entity::{EntityKind, EntityRow, FieldMap};
use crate::storage::kv::{keys, KvStore};
use crate::storage::{ConflictRecord, LocalStore, StoreStats};
use crate::sync::puller::Puller;
use crate::sync::pusher::Pusher;
use crate::sync::realtime::{RealtimeIngress, RecentWrites};
use crate::sync::status::{StatusObserver, SyncPhase, SyncStatusSnapshot};

/// 引擎配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub user_id: String,
    /// 推送去抖窗口
    pub debounce: Duration,
    /// 回声保护窗口（必须 ≥ debounce）
    pub echo_window: Duration,
    pub pull_page_size: usize,
    /// 实时通道不健康时的轮询间隔
    pub periodic_interval: Duration,
    /// 墓碑与冲突历史保留天数
    pub retention_days: i64,
    /// 编辑中暂存远端变更的 TTL
    pub edit_hold: Duration,
    /// 编辑中删除事件的固定延迟
    pub delete_hold: Duration,
    /// 重连稳定窗
    pub reconnect_stabilise: Duration,
    /// 状态最短展示窗
    pub status_min_display: Duration,
    pub max_retries: u32,
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    data_dir: Option<PathBuf>,
    user_id: Option<String>,
    debounce: Option<Duration>,
    echo_window: Option<Duration>,
    pull_page_size: Option<usize>,
    periodic_interval: Option<Duration>,
    retention_days: Option<i64>,
    edit_hold: Option<Duration>,
    delete_hold: Option<Duration>,
    reconnect_stabilise: Option<Duration>,
    status_min_display: Option<Duration>,
    max_retries: Option<u32>,
}

impl SyncConfigBuilder {
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn user_id(mut self, uid: impl Into<String>) -> Self {
        self.user_id = Some(uid.into());
        self
    }

    pub fn debounce(mut self, d: Duration) -> Self {
        self.debounce = Some(d);
        self
    }

    pub fn echo_window(mut self, d: Duration) -> Self {
        self.echo_window = Some(d);
        self
    }

    pub fn pull_page_size(mut self, n: usize) -> Self {
        self.pull_page_size = Some(n);
        self
    }

    pub fn periodic_interval(mut self, d: Duration) -> Self {
        self.periodic_interval = Some(d);
        self
    }

    pub fn retention_days(mut self, days: i64) -> Self {
        self.retention_days = Some(days);
        self
    }

    pub fn edit_hold(mut self, d: Duration) -> Self {
        self.edit_hold = Some(d);
        self
    }

    pub fn delete_hold(mut self, d: Duration) -> Self {
        self.delete_hold = Some(d);
        self
    }

    pub fn reconnect_stabilise(mut self, d: Duration) -> Self {
        self.reconnect_stabilise = Some(d);
        self
    }

    pub fn status_min_display(mut self, d: Duration) -> Self {
        self.status_min_display = Some(d);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        let data_dir = self
            .data_dir
            .ok_or_else(|| SyncError::Config("缺少 data_dir".into()))?;
        let user_id = self
            .user_id
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SyncError::Config("缺少 user_id".into()))?;
        let debounce = self.debounce.unwrap_or(Duration::from_millis(1_500));
        let echo_window = self.echo_window.unwrap_or(Duration::from_secs(2));
        if echo_window < debounce {
            // 回声窗短于去抖窗时，自己的推送回放会被误认成远端变更
            return Err(SyncError::Config(
                "echo_window 必须不小于 debounce".into(),
            ));
        }
        Ok(SyncConfig {
            data_dir,
            user_id,
            debounce,
            echo_window,
            pull_page_size: self.pull_page_size.unwrap_or(200),
            periodic_interval: self.periodic_interval.unwrap_or(Duration::from_secs(15 * 60)),
            retention_days: self.retention_days.unwrap_or(30),
            edit_hold: self.edit_hold.unwrap_or(Duration::from_secs(10)),
            delete_hold: self.delete_hold.unwrap_or(Duration::from_millis(500)),
            reconnect_stabilise: self.reconnect_stabilise.unwrap_or(Duration::from_millis(500)),
            status_min_display: self.status_min_display.unwrap_or(Duration::from_millis(500)),
            max_retries: self.max_retries.unwrap_or(crate::storage::MAX_RETRIES),
        })
    }
}

/// 排空并发门：同一时刻最多一个 drain，在途时的请求合并为一次尾随排空
#[derive(Debug, Default)]
struct DrainGate {
    in_flight: AtomicBool,
    trailing: AtomicBool,
}

/// 同步引擎
#[derive(Debug)]
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<LocalStore>,
    kv: Arc<KvStore>,
    network: Arc<NetworkMonitor>,
    bus: EventBus,
    status: StatusObserver,
    pusher: Arc<Pusher>,
    puller: Arc<Puller>,
    realtime: Arc<RealtimeIngress>,
    recent: RecentWrites,
    push_deadline: Mutex<Option<tokio::time::Instant>>,
    push_notify: Notify,
    gate: DrainGate,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    running: AtomicBool,
}

impl SyncEngine {
    /// 装配引擎（登录时调用一次）。远端存储、实时通道与网络监听器由
    /// 宿主平台注入。
    pub async fn initialize(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        channel: Arc<dyn ChannelProvider>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        let kv = Arc::new(KvStore::open(&config.data_dir, &config.user_id).await?);
        let device_id = device::load_or_create(&kv)?;
        let store = Arc::new(
            LocalStore::open(&config.data_dir, &config.user_id, &device_id).await?,
        );

        let bus = EventBus::default();
        let status = StatusObserver::new(config.status_min_display);
        let network = Arc::new(NetworkMonitor::new(listener, config.reconnect_stabilise));
        let recent = RecentWrites::new(config.echo_window);

        let pusher = Arc::new(Pusher::new(
            store.clone(),
            remote.clone(),
            status.clone(),
            bus.clone(),
            config.max_retries,
        ));
        let puller = Arc::new(Puller::new(
            store.clone(),
            remote,
            kv.clone(),
            bus.clone(),
            config.pull_page_size,
        ));
        let realtime = Arc::new(RealtimeIngress::new(
            channel,
            store.clone(),
            bus.clone(),
            status.clone(),
            recent.clone(),
            config.edit_hold,
            config.delete_hold,
        ));

        info!(
            "同步引擎装配完成: user={} device={}",
            config.user_id, device_id
        );

        Ok(Arc::new(Self {
            config,
            store,
            kv,
            network,
            bus,
            status,
            pusher,
            puller,
            realtime,
            recent,
            push_deadline: Mutex::new(None),
            push_notify: Notify::new(),
            gate: DrainGate::default(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    /// 启动引擎：网络监控、实时订阅、去抖调度、周期任务。
    /// 在线时做一次启动对账。幂等保护：重复 start 返回错误。
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::InvalidArgument("引擎已启动".into()));
        }

        self.network.start().await?;
        self.realtime.clone().start().await;

        let mut tasks = self.tasks.lock().await;

        // 去抖调度任务
        {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                engine.debounce_loop().await;
            }));
        }

        // 网络事件任务：重连 → 对账 + 排空；断开 → offline
        {
            let engine = self.clone();
            let mut events = self.network.subscribe();
            tasks.push(tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        NetworkEvent::Reconnected => {
                            info!("重连：恢复实时订阅并对账");
                            engine.realtime.clone().start().await;
                            engine.reconcile_once().await;
                            engine.drain_once().await;
                        }
                        NetworkEvent::Disconnected => {
                            engine.status.set_phase(SyncPhase::Offline).await;
                        }
                    }
                }
            }));
        }

        // 周期任务：通道不健康时轮询对账；顺带保留期清扫
        {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(engine.config.periodic_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tick.tick().await; // 首个 tick 立即完成，跳过
                loop {
                    tick.tick().await;
                    if engine.network.is_online().await && !engine.realtime.is_healthy().await {
                        debug!("实时通道不健康，周期轮询对账");
                        engine.reconcile_once().await;
                        engine.drain_once().await;
                    }
                    let retention = ChronoDuration::days(engine.config.retention_days);
                    if let Err(e) = engine.store.sweep_tombstones(retention).await {
                        warn!("墓碑清理失败: {}", e);
                    }
                    if let Err(e) = engine.store.prune_conflicts(retention).await {
                        warn!("冲突历史清理失败: {}", e);
                    }
                }
            }));
        }
        drop(tasks);

        // 启动对账（在线才有意义）
        if self.network.is_online().await {
            self.reconcile_once().await;
            self.drain_once().await;
        } else {
            self.status.set_phase(SyncPhase::Offline).await;
        }

        info!("同步引擎已启动");
        Ok(())
    }

    /// 停止引擎：取消去抖与周期定时器、退订通道。
    /// 已提交远端的变更不会被中止。
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.push_deadline.lock().await = None;
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.realtime.stop().await;
        self.network.stop().await;
        info!("同步引擎已停止");
    }

    /// 登出：停止引擎并清空本地实体、发件箱、冲突历史与拉取游标。
    /// 设备标识保留。
    pub async fn logout(&self) -> Result<()> {
        self.stop().await;
        self.store.clear_all().await?;
        self.kv.delete(keys::LAST_SYNC_TIMESTAMP)?;
        self.kv.drop_user_tree()?;
        info!("登出完成: user={}", self.config.user_id);
        Ok(())
    }

    // ---------- 本地写助手（C10 的写入方唯一入口） ----------

    /// 新建实体（id 由引擎生成，全局唯一）
    pub async fn create(&self, kind: EntityKind, fields: FieldMap) -> Result<EntityRow> {
        let id = Uuid::new_v4().to_string();
        let row = self.store.create_entity(kind, &id, fields).await?;
        self.after_local_write(kind, &id).await;
        Ok(row)
    }

    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        self.store.delete_entity(kind, id).await?;
        self.after_local_write(kind, id).await;
        Ok(())
    }

    pub async fn set_field(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<EntityRow> {
        let mut fields = FieldMap::new();
        fields.insert(field.to_string(), value);
        self.set_many(kind, id, fields).await
    }

    pub async fn set_many(
        &self,
        kind: EntityKind,
        id: &str,
        fields: FieldMap,
    ) -> Result<EntityRow> {
        let row = self.store.set_fields(kind, id, fields).await?;
        self.after_local_write(kind, id).await;
        Ok(row)
    }

    pub async fn increment(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        delta: f64,
    ) -> Result<EntityRow> {
        let row = self.store.increment_field(kind, id, field, delta).await?;
        self.after_local_write(kind, id).await;
        Ok(row)
    }

    async fn after_local_write(&self, kind: EntityKind, id: &str) {
        self.recent.note(kind, id).await;
        if let Ok(pending) = self.store.pending_ops().await {
            self.status.set_pending_count(pending as u64).await;
        }
        self.bus.emit(EngineEvent::EntityChanged {
            table: kind,
            entity_id: id.to_string(),
        });
        self.schedule_push().await;
    }

    // ---------- 推送调度 ----------

    /// 设置 / 重置去抖窗口。窗口期满后执行一次排空；在途时合并为
    /// 恰好一次尾随排空。
    pub async fn schedule_push(&self) {
        *self.push_deadline.lock().await =
            Some(tokio::time::Instant::now() + self.config.debounce);
        self.push_notify.notify_one();
    }

    async fn debounce_loop(&self) {
        loop {
            let deadline = *self.push_deadline.lock().await;
            match deadline {
                None => self.push_notify.notified().await,
                Some(at) => {
                    tokio::select! {
                        // 新的写把窗口往后推，重读 deadline
                        _ = self.push_notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {
                            *self.push_deadline.lock().await = None;
                            self.drain_once().await;
                        }
                    }
                }
            }
        }
    }

    /// 单飞排空：并发请求合并为一次尾随 drain
    async fn drain_once(&self) {
        if !self.network.is_online().await {
            self.status.set_phase(SyncPhase::Offline).await;
            return;
        }
        if self.gate.in_flight.swap(true, Ordering::SeqCst) {
            self.gate.trailing.store(true, Ordering::SeqCst);
            return;
        }

        loop {
            self.status.set_phase(SyncPhase::Syncing).await;
            match self.pusher.drain().await {
                Ok(report) => {
                    if report.auth_revoked {
                        self.handle_auth_revoked().await;
                        break;
                    }
                    if let Some(err) = report.last_error {
                        self.status.record_error(&err, None).await;
                    } else {
                        self.status.set_phase(SyncPhase::Idle).await;
                    }
                }
                Err(e) => {
                    warn!("排空失败: {}", e);
                    self.status.record_error(&e.to_string(), None).await;
                }
            }

            if self.gate.trailing.swap(false, Ordering::SeqCst) {
                continue;
            }
            self.gate.in_flight.store(false, Ordering::SeqCst);
            // 释放与置位之间到达的尾随请求
            if self.gate.trailing.swap(false, Ordering::SeqCst) {
                if self.gate.in_flight.swap(true, Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            break;
        }
    }

    /// 一次拉取对账（启动 / 重连 / 可见性 / 周期兜底共用）
    async fn reconcile_once(&self) {
        if !self.network.is_online().await {
            return;
        }
        self.status.set_phase(SyncPhase::Syncing).await;
        match self.puller.reconcile().await {
            Ok(report) => {
                if report.failed_tables.is_empty() {
                    self.status.record_sync_time(chrono::Utc::now()).await;
                    self.status.set_phase(SyncPhase::Idle).await;
                } else {
                    self.status
                        .record_error("部分表拉取失败", None)
                        .await;
                }
            }
            Err(e) => {
                warn!("对账失败: {}", e);
                self.status.record_error(&e.to_string(), None).await;
            }
        }
    }

    /// 凭证失效：拆通道、清本地、上报错误
    async fn handle_auth_revoked(&self) {
        warn!("凭证失效：拆除通道并清空本地状态");
        self.realtime.stop().await;
        if let Err(e) = self.store.clear_all().await {
            warn!("清空本地数据失败: {}", e);
        }
        let _ = self.kv.delete(keys::LAST_SYNC_TIMESTAMP);
        self.status
            .record_error("auth revoked", Some("本地状态已清空，需要重新登录".into()))
            .await;
    }

    // ---------- UI 配套 ----------

    /// 标签页可见性变化（平台层转发）
    pub async fn notify_visibility(&self, visible: bool) {
        self.network.notify_visibility(visible).await;
        if visible && self.network.is_online().await {
            self.reconcile_once().await;
        }
    }

    /// UI 标记实体进入 / 退出编辑态
    pub async fn mark_editing(&self, kind: EntityKind, id: &str) {
        self.realtime.mark_editing(kind, id).await;
    }

    pub async fn end_editing(&self, kind: EntityKind, id: &str) {
        self.realtime.end_editing(kind, id).await;
    }

    /// 建立活动查询（读路径只打本地库）
    pub async fn watch(&self, def: QueryDef) -> Result<LiveQuery> {
        query::watch_query(self.store.clone(), &self.bus, def).await
    }

    pub async fn status(&self) -> SyncStatusSnapshot {
        self.status.snapshot().await
    }

    pub fn subscribe_status(&self) -> tokio::sync::broadcast::Receiver<SyncStatusSnapshot> {
        self.status.subscribe()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub async fn pending_ops(&self) -> Result<usize> {
        self.store.pending_ops().await
    }

    pub async fn conflict_history(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        self.store.conflict_recent(limit).await
    }

    pub async fn store_stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn device_id(&self) -> &str {
        self.store.device_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_helpers::ScriptedListener;
    use crate::network::NetworkStatus;
    use crate::remote::test_helpers::{MemoryChannel, MemoryRemote};
    use crate::remote::ChangeEvent;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        engine: Arc<SyncEngine>,
        remote: Arc<MemoryRemote>,
        channel: Arc<MemoryChannel>,
        listener: Arc<ScriptedListener>,
    }

    async fn harness(initial: NetworkStatus) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::builder()
            .data_dir(dir.path())
            .user_id("u1")
            .debounce(Duration::from_millis(1_500))
            .echo_window(Duration::from_secs(2))
            .build()
            .unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let channel = Arc::new(MemoryChannel::new());
        let listener = Arc::new(ScriptedListener::new(initial));
        let engine = SyncEngine::initialize(
            config,
            remote.clone(),
            channel.clone(),
            listener.clone(),
        )
        .await
        .unwrap();
        engine.clone().start().await.unwrap();
        Harness {
            _dir: dir,
            engine,
            remote,
            channel,
            listener,
        }
    }

    async fn settle() {
        for _ in 0..30 {
            tokio::task::yield_now().await;
        }
    }

    fn goal_fields(value: i64) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("current_value".into(), json!(value));
        fields
    }

    #[tokio::test(start_paused = true)]
    async fn config_rejects_echo_window_shorter_than_debounce() {
        let err = SyncConfig::builder()
            .data_dir("/tmp/x")
            .user_id("u1")
            .debounce(Duration::from_secs(3))
            .echo_window(Duration::from_secs(2))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_is_rejected() {
        let h = harness(NetworkStatus::Online).await;
        settle().await;
        assert!(h.engine.clone().start().await.is_err());
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_writes_drain_after_quiet_window() {
        let h = harness(NetworkStatus::Online).await;
        settle().await;

        let row = h.engine.create(EntityKind::Goal, goal_fields(0)).await.unwrap();
        h.engine
            .increment(EntityKind::Goal, &row.id, "current_value", 3.0)
            .await
            .unwrap();

        // 去抖窗内不应有任何请求
        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(h.remote.row_count(), 0);

        // 窗口期满：压缩为单条 create，远端出现 current_value=3 的行
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        let pushed = h.remote.row(EntityKind::Goal, &row.id).unwrap();
        assert_eq!(pushed.numeric_field("current_value"), Some(3.0));
        assert_eq!(h.engine.pending_ops().await.unwrap(), 0);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_edits_push_after_reconnect() {
        // S1: 离线编辑，重连后推送
        let h = harness(NetworkStatus::Offline).await;
        settle().await;
        assert_eq!(h.engine.status().await.status, SyncPhase::Offline);

        let row = h.engine.create(EntityKind::Goal, goal_fields(0)).await.unwrap();
        h.engine
            .increment(EntityKind::Goal, &row.id, "current_value", 3.0)
            .await
            .unwrap();

        // 去抖期满但离线：排空为空操作
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(h.remote.row_count(), 0);
        assert_eq!(h.engine.pending_ops().await.unwrap(), 2);

        // 重连（含 500ms 稳定窗）
        h.listener.push_status(NetworkStatus::Online).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        let pushed = h.remote.row(EntityKind::Goal, &row.id).unwrap();
        assert_eq!(pushed.numeric_field("current_value"), Some(3.0));
        assert_eq!(pushed.version, 1);
        assert_eq!(h.engine.pending_ops().await.unwrap(), 0);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_debounce() {
        let h = harness(NetworkStatus::Online).await;
        settle().await;

        h.engine.create(EntityKind::Goal, goal_fields(1)).await.unwrap();
        h.engine.stop().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(h.remote.row_count(), 0, "stop 后去抖不得再触发排空");
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_event_reaches_local_store() {
        let h = harness(NetworkStatus::Online).await;
        settle().await;

        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("FromOtherDevice"));
        let row = EntityRow::new("g-remote", "u1", "device-b", fields);
        h.channel
            .emit(ChangeEvent::Insert {
                table: EntityKind::Goal,
                row,
            })
            .await;
        settle().await;

        let local = h
            .engine
            .store()
            .get(EntityKind::Goal, "g-remote")
            .await
            .unwrap();
        assert!(local.is_some());
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn own_echo_does_not_mutate_store_twice() {
        let h = harness(NetworkStatus::Online).await;
        settle().await;

        let row = h.engine.create(EntityKind::Goal, goal_fields(7)).await.unwrap();
        let local_before = h
            .engine
            .store()
            .get(EntityKind::Goal, &row.id)
            .await
            .unwrap()
            .unwrap();

        // 自己的写在 2 秒内以实时事件形式回放
        let mut echo = row.clone();
        echo.device_id = Some(h.engine.device_id().to_string());
        h.channel
            .emit(ChangeEvent::Update {
                table: EntityKind::Goal,
                row: echo,
            })
            .await;
        settle().await;

        let local_after = h
            .engine
            .store()
            .get(EntityKind::Goal, &row.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local_before, local_after);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_local_state_but_keeps_device_id() {
        let h = harness(NetworkStatus::Offline).await;
        settle().await;
        h.engine.create(EntityKind::Goal, goal_fields(1)).await.unwrap();
        let device_before = h.engine.device_id().to_string();

        h.engine.logout().await.unwrap();

        let stats = h.engine.store_stats().await.unwrap();
        assert_eq!(stats.entity_rows, 0);
        assert_eq!(stats.pending_ops, 0);

        // 设备标识在登出后存活（默认 Tree 不随用户 Tree 清除）
        let device_after = device::load_or_create(&h.engine.kv).unwrap();
        assert_eq!(device_before, device_after);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_triggers_reconcile() {
        let h = harness(NetworkStatus::Online).await;
        settle().await;

        // 另一设备在远端写入
        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("Elsewhere"));
        let row = EntityRow::new("g9", "u1", "device-b", fields);
        h.remote.seed(EntityKind::Goal, row);

        h.engine.notify_visibility(true).await;
        settle().await;
        assert!(h
            .engine
            .store()
            .get(EntityKind::Goal, "g9")
            .await
            .unwrap()
            .is_some());
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_drain_runs_exactly_once() {
        let h = harness(NetworkStatus::Online).await;
        settle().await;
        let mut events = h.engine.subscribe_events();

        // 两次 schedule 间隔小于去抖窗：只产生一次排空
        h.engine.create(EntityKind::Goal, goal_fields(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        h.engine.create(EntityKind::Goal, goal_fields(1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        let mut post_push = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::PostPush { .. }) {
                post_push += 1;
            }
        }
        assert_eq!(post_push, 1, "去抖窗内的写合并为一次排空");
        assert_eq!(h.remote.row_count(), 2);
        h.engine.stop().await;
    }
}
