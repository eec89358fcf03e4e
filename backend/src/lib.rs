// Snapshot Backup Library
// 离线优先的快照备份核心库

// 认证模块
pub mod auth;

// 快照备份引擎
pub mod backup;

// 配置管理模块
pub mod config;

// 远程快照存储
pub mod remote;

// Web服务器模块
pub mod server;

// 本地数据存储
pub mod store;

#[cfg(test)]
mod test_support;

// 导出常用类型
pub use auth::{AuthProvider, AuthState, Credentials, SessionAuthProvider};
pub use backup::{
    BackupConfig, BackupError, BackupEvent, BackupOrchestrator, BackupReceipt, EngineSettings,
    RestoreError, RestoreOptions, RestoreResult, SystemState,
};
pub use config::AppConfig;
pub use remote::{LocalDirRemoteStore, RemoteStore};
pub use server::AppState;
pub use store::{LocalSnapshotSource, SqliteLocalStore};
