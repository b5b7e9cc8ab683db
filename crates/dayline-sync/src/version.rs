//! 引擎版本号 - 来自 Cargo.toml

/// 引擎版本（编译期注入）
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
