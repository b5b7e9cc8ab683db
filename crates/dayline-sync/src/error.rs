use std::fmt;

#[derive(Debug)]
pub enum SyncError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    KvStore(String),
    IO(String),
    Database(String),
    Migration(String),
    InvalidArgument(String),
    NotFound(String),
    AlreadyExists(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
    Offline,
    Remote(String),
    AuthRevoked(String),
    Other(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            SyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            SyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            SyncError::IO(e) => write!(f, "IO error: {}", e),
            SyncError::Database(e) => write!(f, "Database error: {}", e),
            SyncError::Migration(e) => write!(f, "Migration error: {}", e),
            SyncError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            SyncError::NotFound(e) => write!(f, "Not found: {}", e),
            SyncError::AlreadyExists(e) => write!(f, "Already exists: {}", e),
            SyncError::Config(e) => write!(f, "Config error: {}", e),
            SyncError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            SyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            SyncError::Offline => write!(f, "Network offline"),
            SyncError::Remote(e) => write!(f, "Remote store error: {}", e),
            SyncError::AuthRevoked(e) => write!(f, "Auth revoked: {}", e),
            SyncError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<rusqlite::Error> for SyncError {
    fn from(error: rusqlite::Error) -> Self {
        SyncError::SqliteError(error)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::IO(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
