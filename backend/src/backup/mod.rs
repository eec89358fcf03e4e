//! 快照备份模块
//!
//! 将本地数据打包为压缩快照并同步到远程存储，支持：
//! - 脏标记 + 防抖（关键操作后自动备份）
//! - 定时调度（兜底机制）
//! - 持久化重试队列（离线、限流、可重试失败）
//! - 指数退避与最小上传间隔
//! - 保留策略（清理旧快照）
//! - 从远程快照恢复（替换或合并）

pub mod codec;
pub mod config;
pub mod dirty;
pub mod error;
pub mod events;
pub mod folder;
pub mod manager;
pub mod network;
pub mod persistence;
pub mod queue;
pub mod retention;
pub mod scheduler;
pub mod throttle;
pub mod types;

pub use codec::{DecodedSnapshot, SnapshotCodec, SNAPSHOT_EXTENSION};
pub use config::*;
pub use error::{BackupError, ErrorCategory, RestoreError, RestoreStage, RetryPolicy};
pub use events::*;
pub use manager::{BackupOrchestrator, EngineSettings};
pub use network::Connectivity;
pub use persistence::PersistedState;
pub use scheduler::{BackupRunner, TriggerSource};
pub use types::*;
