//! 实体类型与信封 - 同步引擎的受控实体枚举
//!
//! entity kind 为受控枚举，新增需客户端与远端 schema 同步升级。
//! 引擎不解释业务字段，只认信封列（id / user_id / created_at /
//! updated_at / deleted / _version / device_id），业务字段整体作为
//! 不透明 JSON 对象存取。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// 业务字段映射（不透明，引擎不解释）
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// 实体类型（与远端表一一对应）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Goal,
    Routine,
    RoutineEntry,
    Task,
    Project,
    Note,
    JournalEntry,
    TimeBlock,
    Reminder,
    Tag,
    Mood,
    Preference,
}

/// 全部实体类型（拉取时按此遍历）
pub const ALL_KINDS: [EntityKind; 12] = [
    EntityKind::Goal,
    EntityKind::Routine,
    EntityKind::RoutineEntry,
    EntityKind::Task,
    EntityKind::Project,
    EntityKind::Note,
    EntityKind::JournalEntry,
    EntityKind::TimeBlock,
    EntityKind::Reminder,
    EntityKind::Tag,
    EntityKind::Mood,
    EntityKind::Preference,
];

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Goal => "goal",
            Self::Routine => "routine",
            Self::RoutineEntry => "routine_entry",
            Self::Task => "task",
            Self::Project => "project",
            Self::Note => "note",
            Self::JournalEntry => "journal_entry",
            Self::TimeBlock => "time_block",
            Self::Reminder => "reminder",
            Self::Tag => "tag",
            Self::Mood => "mood",
            Self::Preference => "preference",
        }
    }

    /// 本地与远端共用的表名
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Goal => "goals",
            Self::Routine => "routines",
            Self::RoutineEntry => "routine_entries",
            Self::Task => "tasks",
            Self::Project => "projects",
            Self::Note => "notes",
            Self::JournalEntry => "journal_entries",
            Self::TimeBlock => "time_blocks",
            Self::Reminder => "reminders",
            Self::Tag => "tags",
            Self::Mood => "moods",
            Self::Preference => "preferences",
        }
    }
}

impl FromStr for EntityKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "goal" => Ok(Self::Goal),
            "routine" => Ok(Self::Routine),
            "routine_entry" => Ok(Self::RoutineEntry),
            "task" => Ok(Self::Task),
            "project" => Ok(Self::Project),
            "note" => Ok(Self::Note),
            "journal_entry" => Ok(Self::JournalEntry),
            "time_block" => Ok(Self::TimeBlock),
            "reminder" => Ok(Self::Reminder),
            "tag" => Ok(Self::Tag),
            "mood" => Ok(Self::Mood),
            "preference" => Ok(Self::Preference),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 信封列名（永不参与字段级合并）
pub const ENVELOPE_FIELDS: [&str; 7] = [
    "id",
    "user_id",
    "created_at",
    "updated_at",
    "deleted",
    "_version",
    "device_id",
];

pub fn is_envelope_field(name: &str) -> bool {
    ENVELOPE_FIELDS.contains(&name)
}

/// 带信封的实体行
///
/// `fields` 内只有业务字段；信封列单独建模，避免和业务字段混淆。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    #[serde(rename = "_version")]
    pub version: i64,
    pub device_id: Option<String>,
    pub fields: FieldMap,
}

impl EntityRow {
    /// 新建一行（本地 create 路径）
    pub fn new(id: &str, user_id: &str, device_id: &str, fields: FieldMap) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
            deleted: false,
            version: 1,
            device_id: Some(device_id.to_string()),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// 读取数值字段（缺失或非数值按 None）
    pub fn numeric_field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|v| v.as_f64())
    }
}

/// 统一的时间戳文本格式（毫秒精度 RFC-3339，保证文本序与时间序一致）
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Database(format!("无效时间戳 {}: {}", s, e)))
}
