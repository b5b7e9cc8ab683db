//! 同步状态观察者 - 面向状态条的去抖快照
//!
//! 状态迁移带 500ms 最短展示窗：`syncing` 停留不足最短窗时，迁出被
//! 推迟到窗口结束，避免状态条闪烁。重复的相同迁移直接丢弃。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::storage::entity::EntityKind;
use crate::sync::realtime::ChannelState;

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Offline,
    Error,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Syncing => write!(f, "syncing"),
            SyncPhase::Offline => write!(f, "offline"),
            SyncPhase::Error => write!(f, "error"),
        }
    }
}

/// 对外发布的状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusSnapshot {
    pub status: SyncPhase,
    pub pending_count: u64,
    pub last_error: Option<String>,
    pub last_error_details: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_message: Option<String>,
    pub realtime_state: ChannelState,
}

impl Default for SyncStatusSnapshot {
    fn default() -> Self {
        Self {
            status: SyncPhase::Idle,
            pending_count: 0,
            last_error: None,
            last_error_details: None,
            last_sync_time: None,
            sync_message: None,
            realtime_state: ChannelState::Disconnected,
        }
    }
}

#[derive(Debug)]
struct Inner {
    snapshot: SyncStatusSnapshot,
    phase_entered: tokio::time::Instant,
    /// 迁移请求代号：推迟中的迁移若被更新请求超越则作废
    generation: u64,
    pending_phase: Option<(u64, SyncPhase)>,
}

/// 状态观察者
#[derive(Debug, Clone)]
pub struct StatusObserver {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<SyncStatusSnapshot>,
    min_display: Duration,
}

impl StatusObserver {
    pub fn new(min_display: Duration) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                snapshot: SyncStatusSnapshot::default(),
                phase_entered: tokio::time::Instant::now(),
                generation: 0,
                pending_phase: None,
            })),
            tx,
            min_display,
        }
    }

    pub async fn snapshot(&self) -> SyncStatusSnapshot {
        self.inner.read().await.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatusSnapshot> {
        self.tx.subscribe()
    }

    /// 请求状态迁移（受最短展示窗与重复丢弃约束）
    pub async fn set_phase(&self, phase: SyncPhase) {
        let mut inner = self.inner.write().await;
        let effective = inner
            .pending_phase
            .map(|(_, p)| p)
            .unwrap_or(inner.snapshot.status);
        if effective == phase {
            // 重复的相同迁移丢弃
            return;
        }

        inner.generation += 1;
        let gen = inner.generation;

        let elapsed = inner.phase_entered.elapsed();
        if inner.snapshot.status == SyncPhase::Syncing && elapsed < self.min_display {
            // syncing 未满最短展示窗：推迟迁出
            let remaining = self.min_display - elapsed;
            inner.pending_phase = Some((gen, phase));
            debug!("syncing 停留 {:?} 不足最短窗，推迟迁出 {:?}", elapsed, remaining);
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                let mut inner = this.inner.write().await;
                if inner.pending_phase == Some((gen, phase)) {
                    inner.pending_phase = None;
                    Self::apply(&mut inner, phase, &this.tx);
                }
            });
            return;
        }

        inner.pending_phase = None;
        Self::apply(&mut inner, phase, &self.tx);
    }

    fn apply(inner: &mut Inner, phase: SyncPhase, tx: &broadcast::Sender<SyncStatusSnapshot>) {
        inner.snapshot.status = phase;
        inner.phase_entered = tokio::time::Instant::now();
        if phase != SyncPhase::Error {
            inner.snapshot.sync_message = None;
        }
        let _ = tx.send(inner.snapshot.clone());
    }

    pub async fn set_pending_count(&self, count: u64) {
        let mut inner = self.inner.write().await;
        if inner.snapshot.pending_count != count {
            inner.snapshot.pending_count = count;
            let _ = self.tx.send(inner.snapshot.clone());
        }
    }

    pub async fn set_realtime_state(&self, state: ChannelState) {
        let mut inner = self.inner.write().await;
        if inner.snapshot.realtime_state != state {
            inner.snapshot.realtime_state = state;
            let _ = self.tx.send(inner.snapshot.clone());
        }
    }

    pub async fn record_sync_time(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        inner.snapshot.last_sync_time = Some(at);
        let _ = self.tx.send(inner.snapshot.clone());
    }

    pub async fn record_error(&self, error: &str, details: Option<String>) {
        {
            let mut inner = self.inner.write().await;
            inner.snapshot.last_error = Some(error.to_string());
            inner.snapshot.last_error_details = details;
        }
        self.set_phase(SyncPhase::Error).await;
    }

    /// 操作达到重试上限被丢弃：附带受影响的表名上报
    pub async fn report_dropped(&self, tables: &[EntityKind]) {
        let names: Vec<&str> = tables.iter().map(|t| t.as_str()).collect();
        let mut inner = self.inner.write().await;
        inner.snapshot.sync_message = Some(format!(
            "部分变更重试超限已放弃，涉及: {}",
            names.join(", ")
        ));
        inner.snapshot.last_error = Some("sync operations dropped".to_string());
        let _ = self.tx.send(inner.snapshot.clone());
    }
}
