//! 设备标识 - 每次安装一个稳定 ID
//!
//! 存放在 KV 的默认 Tree（实体库与用户 Tree 之外），清除用户数据 /
//! 登出都不会再生成。首写之后只读。时间戳打平时，解析器按设备 ID
//! 字典序取小者，保证两端裁决一致。

use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::kv::{keys, KvStore};

/// 读取设备 ID，首次访问时生成并持久化
pub fn load_or_create(kv: &KvStore) -> Result<String> {
    if let Some(existing) = kv.get_global::<String>(keys::DEVICE_ID)? {
        return Ok(existing);
    }
    let device_id = Uuid::new_v4().to_string();
    kv.set_global(keys::DEVICE_ID, &device_id)?;
    info!("生成新设备标识: {}", device_id);
    Ok(device_id)
}
