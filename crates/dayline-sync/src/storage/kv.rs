//! KV 存储模块 - 基于 sled 的平台级键值存储
//!
//! 与实体库相互独立：游标等用户态键存放在 `user_{uid}` Tree，
//! 设备标识存放在默认 Tree（清除用户数据不会波及）。

use sled::{Db, Tree};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SyncError};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    db: Arc<Db>,
    /// 当前用户的 Tree
    tree: Tree,
    user_id: String,
}

impl KvStore {
    /// 打开指定用户的 KV 存储
    ///
    /// 切换账号后旧实例可能刚释放文件锁，打开失败时带退避重试。
    pub async fn open(base_path: &Path, user_id: &str) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            SyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = db
            .open_tree(format!("user_{}", user_id))
            .map_err(|e| SyncError::KvStore(format!("打开用户 Tree 失败: {}", e)))?;

        Ok(Self {
            base_path: base_path.to_path_buf(),
            db: Arc::new(db),
            tree,
            user_id: user_id.to_string(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// 设置键值（用户 Tree）
    pub fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| SyncError::JsonError(format!("序列化值失败: {}", e)))?;
        self.tree
            .insert(key, bytes)
            .map_err(|e| SyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    /// 读取键值（用户 Tree）
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let result = self
            .tree
            .get(key)
            .map_err(|e| SyncError::KvStore(format!("获取键值对失败: {}", e)))?;
        match result {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::JsonError(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|e| SyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(())
    }

    /// 设置全局键值（默认 Tree，跨用户、跨登出存活）
    pub fn set_global<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| SyncError::JsonError(format!("序列化值失败: {}", e)))?;
        self.db
            .insert(key, bytes)
            .map_err(|e| SyncError::KvStore(format!("设置全局键失败: {}", e)))?;
        Ok(())
    }

    pub fn get_global<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let result = self
            .db
            .get(key)
            .map_err(|e| SyncError::KvStore(format!("获取全局键失败: {}", e)))?;
        match result {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::JsonError(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 登出清理：丢弃当前用户的 Tree（默认 Tree 不受影响）
    pub fn drop_user_tree(&self) -> Result<()> {
        self.db
            .drop_tree(format!("user_{}", self.user_id))
            .map_err(|e| SyncError::KvStore(format!("删除用户 Tree 失败: {}", e)))?;
        Ok(())
    }
}

/// 常用键
pub mod keys {
    /// 拉取游标（用户 Tree）
    pub const LAST_SYNC_TIMESTAMP: &str = "last_sync_timestamp";
    /// 设备标识（默认 Tree）
    pub const DEVICE_ID: &str = "device_id";
}
