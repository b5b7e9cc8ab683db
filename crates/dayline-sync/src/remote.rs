//! 远端契约 - 关系型存储与实时通道的抽象接口
//!
//! 引擎不绑定任何具体云端客户端：推拉走 `RemoteStore`，实时流走
//! `ChannelProvider`（由宿主平台注入实现）。远端需满足：
//! - 每张实体表带信封列，按 user_id 行级过滤
//! - `select … where updated_at ≥ cursor order by updated_at, id` 可分页
//! - UPDATE/DELETE 事件携带完整行（REPLICA IDENTITY FULL 或等价物）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::storage::entity::{EntityKind, EntityRow, FieldMap};

/// 远端失败分类（按处理方式归类，而非按传输层命名）
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// create 撞主键：行已存在，视为已同步
    DuplicateKey,
    /// 目标行不存在：delete/update 视为已完成
    NotFound,
    /// CAS 版本不匹配（读改写期间远端已变）
    VersionConflict,
    /// 瞬时失败：超时、5xx、限流，按退避重试
    Transient(String),
    /// 结构性失败：schema 不匹配等，重试至上限后丢弃并上报
    Fatal(String),
    /// 凭证失效：不重试，触发通道拆除与本地清理
    AuthRevoked,
}

impl RemoteError {
    /// 是否进入退避重试（重试上限由推送管线执行）
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Fatal(_))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::DuplicateKey => write!(f, "duplicate key"),
            RemoteError::NotFound => write!(f, "row not found"),
            RemoteError::VersionConflict => write!(f, "version conflict"),
            RemoteError::Transient(e) => write!(f, "transient: {}", e),
            RemoteError::Fatal(e) => write!(f, "fatal: {}", e),
            RemoteError::AuthRevoked => write!(f, "auth revoked"),
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// 远端 UPDATE 的补丁：业务列 + 需要动到的信封列
#[derive(Debug, Clone, Default)]
pub struct RemotePatch {
    pub fields: FieldMap,
    pub deleted: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
    pub version: Option<i64>,
}

/// 远端关系型存储
#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    /// 整行插入（create 推送）
    async fn insert(&self, table: EntityKind, row: &EntityRow) -> RemoteResult<()>;

    /// 按 id 更新
    async fn update(&self, table: EntityKind, id: &str, patch: &RemotePatch) -> RemoteResult<()>;

    /// 带乐观并发检查的更新：`WHERE _version = expected_version`
    async fn update_cas(
        &self,
        table: EntityKind,
        id: &str,
        patch: &RemotePatch,
        expected_version: i64,
    ) -> RemoteResult<()>;

    async fn fetch(&self, table: EntityKind, id: &str) -> RemoteResult<Option<EntityRow>>;

    /// 增量拉取一页：`updated_at ≥ since`，稳定排序 (updated_at, id)，
    /// `after` 为上一页末行的键集游标
    async fn select_since(
        &self,
        table: EntityKind,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        after: Option<(DateTime<Utc>, String)>,
        limit: usize,
    ) -> RemoteResult<Vec<EntityRow>>;
}

/// 实时变更事件（携带完整行）
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Insert { table: EntityKind, row: EntityRow },
    Update { table: EntityKind, row: EntityRow },
    Delete { table: EntityKind, row: EntityRow },
}

impl ChangeEvent {
    pub fn table(&self) -> EntityKind {
        match self {
            ChangeEvent::Insert { table, .. }
            | ChangeEvent::Update { table, .. }
            | ChangeEvent::Delete { table, .. } => *table,
        }
    }

    pub fn row(&self) -> &EntityRow {
        match self {
            ChangeEvent::Insert { row, .. }
            | ChangeEvent::Update { row, .. }
            | ChangeEvent::Delete { row, .. } => row,
        }
    }
}

/// 实时通道提供方（宿主平台注入）
#[async_trait]
pub trait ChannelProvider: Send + Sync + std::fmt::Debug {
    /// 订阅按 user_id 过滤的变更流；通道断开时接收端关闭
    async fn subscribe(&self, user_id: &str) -> RemoteResult<mpsc::Receiver<ChangeEvent>>;
}
