//! Dayline Sync - 本地优先同步引擎
//!
//! 本引擎为 Dayline 个人效率应用提供多设备数据收敛，包括：
//! - 📝 操作日志（事务性发件箱）：本地写与意图记录同事务提交
//! - 🗜️ 合并压缩：跨操作抵消与同字段归并，幂等且观察等价
//! - 🔁 推拉管线：去抖推送、游标分页拉取、指数退避与幂等吸收
//! - ⚖️ 字段级冲突解析：挂起操作屏蔽、删除侧胜、最后写入胜
//! - 📡 实时摄入：编辑感知应用、回声保护、通道状态机
//! - 🚦 状态观察：500ms 最短展示窗的去抖状态条数据源
//!
//! 所有读写先落本地库立即返回；远端收敛在后台完成，跨长离线期与
//! 并发编辑均保持单用户多设备收敛。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dayline_sync::{SyncConfig, SyncEngine, EntityKind, FieldMap};
//! # use dayline_sync::{RemoteStore, ChannelProvider, NetworkStatusListener};
//!
//! # async fn run(
//! #     remote: Arc<dyn RemoteStore>,
//! #     channel: Arc<dyn ChannelProvider>,
//! #     listener: Arc<dyn NetworkStatusListener>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! // 配置引擎（登录时构造一次）
//! let config = SyncConfig::builder()
//!     .data_dir("/path/to/data")
//!     .user_id("user123")
//!     .build()?;
//!
//! let engine = SyncEngine::initialize(config, remote, channel, listener).await?;
//! engine.clone().start().await?;
//!
//! // 本地写：立即返回，后台去抖推送
//! let mut fields = FieldMap::new();
//! fields.insert("name".into(), serde_json::json!("晨跑"));
//! fields.insert("current_value".into(), serde_json::json!(0));
//! let goal = engine.create(EntityKind::Goal, fields).await?;
//! engine.increment(EntityKind::Goal, &goal.id, "current_value", 1.0).await?;
//!
//! // 登出：清空本地数据与游标，保留设备标识
//! engine.logout().await?;
//! # Ok(())
//! # }
//! ```

pub mod compactor;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod network;
pub mod query;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use engine::{SyncConfig, SyncConfigBuilder, SyncEngine};
pub use error::{Result, SyncError};
pub use events::{EngineEvent, EventBus};
pub use network::{NetworkEvent, NetworkMonitor, NetworkStatus, NetworkStatusListener};
pub use query::{LiveQuery, QueryDef, QueryFilter};
pub use remote::{
    ChangeEvent, ChannelProvider, RemoteError, RemotePatch, RemoteResult, RemoteStore,
};
pub use storage::{
    ConflictRecord, ConflictWinner, EntityKind, EntityRow, FieldMap, LocalStore, OpKind,
    Operation, StoreStats, ALL_KINDS,
};
pub use sync::{
    ChannelState, DrainReport, PullReport, StatusObserver, SyncPhase, SyncStatusSnapshot,
};
pub use version::ENGINE_VERSION;
