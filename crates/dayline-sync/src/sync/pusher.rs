//! 推送排空 - 发件箱到远端的单次 drain
//!
//! 流程：压缩 → 取退避到期的操作（seq 序）→ 逐条翻译为远端变更 →
//! 吸收幂等结果（撞主键 / 行不存在）→ 失败进退避，超限丢弃并上报。
//!
//! 同一实体组内保持 seq 序：组内某条失败或未到退避期时，该组后续
//! 操作本轮跳过，避免乱序到达远端。

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::compactor::compact;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::remote::{RemoteError, RemotePatch, RemoteStore};
use crate::storage::entity::{EntityKind, EntityRow};
use crate::storage::outbox::{OpKind, Operation};
use crate::storage::LocalStore;
use crate::sync::resolver;
use crate::sync::status::StatusObserver;

/// increment 读改写的 CAS 重试上限（超过按瞬时失败进退避）
const CAS_MAX_ATTEMPTS: u32 = 3;

/// 一次排空的结果
#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    /// 成功镜像到远端的操作数
    pub pushed: usize,
    /// 因远端更新（stale basis）被丢弃、改为拉取远端的操作数
    pub remote_wins: usize,
    /// 进入退避的操作数
    pub failed: usize,
    /// 本轮因退避未到期而跳过的操作数
    pub deferred: usize,
    /// 达到重试上限被丢弃的操作所涉及的表
    pub dropped_tables: Vec<EntityKind>,
    /// 凭证失效（调用方需拆通道、清本地）
    pub auth_revoked: bool,
    pub last_error: Option<String>,
}

/// 单条操作的推送结局
enum PushOutcome {
    /// 已镜像（含幂等吸收）
    Done,
    /// 远端基准更新，op 作废，携带远端行回灌本地
    RemoteWins(EntityRow),
    /// 可重试失败
    Retry(RemoteError),
    /// 凭证失效
    AuthRevoked,
}

/// 推送器
#[derive(Debug)]
pub struct Pusher {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    status: StatusObserver,
    bus: EventBus,
    max_retries: u32,
}

impl Pusher {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        status: StatusObserver,
        bus: EventBus,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            remote,
            status,
            bus,
            max_retries,
        }
    }

    /// 执行一次排空（前置条件：在线；并发门由引擎把守）
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        // 压缩恰好一次
        let ops = self.store.outbox_all().await?;
        if ops.is_empty() {
            return Ok(report);
        }
        let compacted = compact(ops.clone());
        if compacted != ops {
            let removed: Vec<i64> = ops.iter().map(|o| o.seq).collect();
            self.store.outbox_replace(&removed, &compacted).await?;
            debug!("压缩: {} 条 -> {} 条", ops.len(), compacted.len());
        }

        let now = Utc::now();
        // 组内失败 / 退避未到期时，该组后续操作本轮不再发送
        let mut blocked: HashSet<(EntityKind, String)> = HashSet::new();

        for op in &compacted {
            let group = (op.table, op.entity_id.clone());
            if blocked.contains(&group) {
                report.deferred += 1;
                continue;
            }
            if !op.is_eligible(now) {
                report.deferred += 1;
                blocked.insert(group);
                continue;
            }

            match self.push_op(op).await {
                PushOutcome::Done => {
                    self.store.outbox_remove(op.seq).await?;
                    report.pushed += 1;
                }
                PushOutcome::RemoteWins(remote_row) => {
                    // 远端静默胜出：丢弃本条，远端行经解析器回灌本地
                    self.store.outbox_remove(op.seq).await?;
                    report.remote_wins += 1;
                    let pending = self
                        .store
                        .outbox_for_entity(op.table, &op.entity_id)
                        .await?;
                    let local = self.store.get(op.table, &op.entity_id).await?;
                    let res = resolver::resolve(op.table, local.as_ref(), &remote_row, &pending);
                    if res.changed {
                        self.store
                            .apply_resolution(op.table, &res.merged, &res.conflicts)
                            .await?;
                    }
                    self.bus.emit(EngineEvent::EntityChanged {
                        table: op.table,
                        entity_id: op.entity_id.clone(),
                    });
                    blocked.insert(group);
                }
                PushOutcome::Retry(err) => {
                    warn!(
                        "推送失败 seq={} {} {}: {}",
                        op.seq, op.table, op.entity_id, err
                    );
                    report.failed += 1;
                    report.last_error = Some(err.to_string());
                    let retries = self.store.outbox_bump_retry(op.seq).await?;
                    if retries >= self.max_retries {
                        self.store.outbox_remove(op.seq).await?;
                        if !report.dropped_tables.contains(&op.table) {
                            report.dropped_tables.push(op.table);
                        }
                        warn!(
                            "操作重试超限被丢弃 seq={} table={}",
                            op.seq, op.table
                        );
                    }
                    blocked.insert(group);
                }
                PushOutcome::AuthRevoked => {
                    report.auth_revoked = true;
                    report.last_error = Some(RemoteError::AuthRevoked.to_string());
                    break;
                }
            }
        }

        // 上报：挂起数、丢弃表、推送完成事件
        let pending = self.store.pending_ops().await? as u64;
        self.status.set_pending_count(pending).await;
        if !report.dropped_tables.is_empty() {
            self.status.report_dropped(&report.dropped_tables).await;
            self.bus.emit(EngineEvent::OpsDropped {
                tables: report.dropped_tables.clone(),
            });
        }
        if report.pushed > 0 {
            self.status.record_sync_time(Utc::now()).await;
        }
        self.bus.emit(EngineEvent::PostPush {
            pushed: report.pushed,
        });

        info!(
            "排空完成: pushed={} remote_wins={} failed={} deferred={}",
            report.pushed, report.remote_wins, report.failed, report.deferred
        );
        Ok(report)
    }

    /// 把单条操作翻译为远端变更
    async fn push_op(&self, op: &Operation) -> PushOutcome {
        match &op.kind {
            OpKind::Create { value } => self.push_create(op, value.clone()).await,
            OpKind::Delete => self.push_delete(op).await,
            OpKind::Set { fields } => self.push_set(op, fields.clone()).await,
            OpKind::Increment { field, delta } => self.push_increment(op, field, *delta).await,
        }
    }

    async fn push_create(
        &self,
        op: &Operation,
        value: crate::storage::entity::FieldMap,
    ) -> PushOutcome {
        // 以本地行为准（信封已就位）；本地行缺失时按操作负载重建
        let row = match self.store.get(op.table, &op.entity_id).await {
            Ok(Some(local)) => EntityRow {
                version: 1,
                device_id: Some(self.store.device_id().to_string()),
                ..local
            },
            _ => {
                let mut row = EntityRow::new(
                    &op.entity_id,
                    self.store.user_id(),
                    self.store.device_id(),
                    value,
                );
                row.created_at = op.timestamp;
                row.updated_at = op.timestamp;
                row
            }
        };
        match self.remote.insert(op.table, &row).await {
            Ok(()) => PushOutcome::Done,
            // 撞主键 = 已同步过
            Err(RemoteError::DuplicateKey) => PushOutcome::Done,
            Err(RemoteError::AuthRevoked) => PushOutcome::AuthRevoked,
            Err(err) => PushOutcome::Retry(err),
        }
    }

    async fn push_delete(&self, op: &Operation) -> PushOutcome {
        let patch = RemotePatch {
            deleted: Some(true),
            updated_at: Some(Utc::now()),
            device_id: Some(self.store.device_id().to_string()),
            ..RemotePatch::default()
        };
        match self.remote.update(op.table, &op.entity_id, &patch).await {
            Ok(()) => PushOutcome::Done,
            // 行不存在 = 删除已生效
            Err(RemoteError::NotFound) => PushOutcome::Done,
            Err(RemoteError::AuthRevoked) => PushOutcome::AuthRevoked,
            Err(err) => PushOutcome::Retry(err),
        }
    }

    async fn push_set(
        &self,
        op: &Operation,
        fields: crate::storage::entity::FieldMap,
    ) -> PushOutcome {
        // 先取远端 updated_at：远端严格更新于本条基准时，远端静默胜出
        let remote_row = match self.remote.fetch(op.table, &op.entity_id).await {
            Ok(row) => row,
            Err(RemoteError::AuthRevoked) => return PushOutcome::AuthRevoked,
            Err(err) => return PushOutcome::Retry(err),
        };
        if let Some(ref row) = remote_row {
            if row.updated_at > op.timestamp {
                return PushOutcome::RemoteWins(row.clone());
            }
        }

        // 负载只含真正变更的字段 + 信封
        let patch = RemotePatch {
            fields,
            updated_at: Some(Utc::now()),
            device_id: Some(self.store.device_id().to_string()),
            ..RemotePatch::default()
        };
        match self.remote.update(op.table, &op.entity_id, &patch).await {
            Ok(()) => PushOutcome::Done,
            Err(RemoteError::NotFound) => PushOutcome::Done,
            Err(RemoteError::AuthRevoked) => PushOutcome::AuthRevoked,
            Err(err) => PushOutcome::Retry(err),
        }
    }

    /// increment 的读改写：取当前值、写回 current+Δ，
    /// `WHERE _version = expected` 的 CAS 失败时重取重写
    async fn push_increment(&self, op: &Operation, field: &str, delta: f64) -> PushOutcome {
        for attempt in 0..CAS_MAX_ATTEMPTS {
            let row = match self.remote.fetch(op.table, &op.entity_id).await {
                Ok(Some(row)) => row,
                // 目标行不存在：与 delete 同理吸收
                Ok(None) => return PushOutcome::Done,
                Err(RemoteError::AuthRevoked) => return PushOutcome::AuthRevoked,
                Err(err) => return PushOutcome::Retry(err),
            };
            let current = row.numeric_field(field).unwrap_or(0.0);
            let mut fields = crate::storage::entity::FieldMap::new();
            fields.insert(
                field.to_string(),
                crate::storage::number_value(current + delta),
            );
            let patch = RemotePatch {
                fields,
                updated_at: Some(Utc::now()),
                device_id: Some(self.store.device_id().to_string()),
                version: Some(row.version + 1),
                ..RemotePatch::default()
            };
            match self
                .remote
                .update_cas(op.table, &op.entity_id, &patch, row.version)
                .await
            {
                Ok(()) => return PushOutcome::Done,
                Err(RemoteError::VersionConflict) => {
                    debug!(
                        "increment CAS 失败，重取 (attempt {}/{})",
                        attempt + 1,
                        CAS_MAX_ATTEMPTS
                    );
                    continue;
                }
                Err(RemoteError::NotFound) => return PushOutcome::Done,
                Err(RemoteError::AuthRevoked) => return PushOutcome::AuthRevoked,
                Err(err) => return PushOutcome::Retry(err),
            }
        }
        PushOutcome::Retry(RemoteError::Transient("increment CAS 连续失败".into()))
    }
}
