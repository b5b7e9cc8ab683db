//! 网络状态监控 - 平台信号之上的在线布尔与重连事件
//!
//! 移动端 PWA 的两个怪癖在这里补偿：
//! - 重连后平台信号抖动，宣布上线前等 500ms 稳定窗
//! - 后台标签页可能吞掉 online 事件，"恢复可见 + 平台在线 + 此前离线"
//!   等价于一次重连

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Result;

/// 平台网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// 平台状态变化事件（由平台层监听器发出）
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

/// 网络状态监听器 trait（由宿主平台实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 当前平台网络状态
    async fn current_status(&self) -> NetworkStatus;

    /// 开始监听状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 引擎侧的网络事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Reconnected,
    Disconnected,
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    event_tx: broadcast::Sender<NetworkEvent>,
    online: Arc<RwLock<bool>>,
    /// 自上次重连以来是否经历过离线（供可见性补偿判断）
    was_offline: Arc<RwLock<bool>>,
    stabilise: Duration,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>, stabilise: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            listener,
            event_tx,
            online: Arc::new(RwLock::new(false)),
            was_offline: Arc::new(RwLock::new(false)),
            stabilise,
            task: Mutex::new(None),
        }
    }

    /// 启动监控：初始值取平台信号，随后跟踪变化
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.current_status().await;
        *self.online.write().await = initial == NetworkStatus::Online;

        let mut receiver = self.listener.start_monitoring().await?;
        let listener = self.listener.clone();
        let online = self.online.clone();
        let was_offline = self.was_offline.clone();
        let event_tx = self.event_tx.clone();
        let stabilise = self.stabilise;

        let handle = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                apply_status(
                    &listener,
                    &online,
                    &was_offline,
                    &event_tx,
                    stabilise,
                    event.new_status,
                )
                .await;
            }
        });
        *self.task.lock().await = Some(handle);
        info!("网络监控已启动，初始状态: {:?}", initial);
        Ok(())
    }

    pub async fn is_online(&self) -> bool {
        *self.online.read().await
    }

    /// 手动驱动一次状态变化（测试与平台回调用）
    pub async fn set_status(&self, status: NetworkStatus) {
        apply_status(
            &self.listener,
            &self.online,
            &self.was_offline,
            &self.event_tx,
            self.stabilise,
            status,
        )
        .await;
    }

    /// 标签页可见性变化：可见 + 平台在线 + 此前离线 → 视同一次重连
    pub async fn notify_visibility(&self, visible: bool) {
        if !visible {
            return;
        }
        let platform_online = self.listener.current_status().await == NetworkStatus::Online;
        let missed = *self.was_offline.read().await;
        if platform_online && missed {
            debug!("可见性补偿：平台在线但 online 事件缺失，按重连处理");
            apply_status(
                &self.listener,
                &self.online,
                &self.was_offline,
                &self.event_tx,
                self.stabilise,
                NetworkStatus::Online,
            )
            .await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.listener.stop_monitoring().await;
    }
}

async fn apply_status(
    listener: &Arc<dyn NetworkStatusListener>,
    online: &Arc<RwLock<bool>>,
    was_offline: &Arc<RwLock<bool>>,
    event_tx: &broadcast::Sender<NetworkEvent>,
    stabilise: Duration,
    new_status: NetworkStatus,
) {
    match new_status {
        NetworkStatus::Offline => {
            let mut flag = online.write().await;
            if *flag {
                *flag = false;
                *was_offline.write().await = true;
                let _ = event_tx.send(NetworkEvent::Disconnected);
                debug!("网络离线");
            }
        }
        NetworkStatus::Online => {
            // 稳定窗：信号站稳后才宣布重连
            tokio::time::sleep(stabilise).await;
            if listener.current_status().await != NetworkStatus::Online {
                debug!("稳定窗内网络再次离线，放弃本次重连");
                return;
            }
            let mut flag = online.write().await;
            if !*flag {
                *flag = true;
                *was_offline.write().await = false;
                let _ = event_tx.send(NetworkEvent::Reconnected);
                info!("网络重连");
            }
        }
    }
}
