//! 备份数据类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::BackupConfig;
use crate::auth::AuthState;
use crate::store::{ImportMode, ImportedCounts};

/// 当前支持的快照 schema 版本
pub const BACKUP_SCHEMA_VERSION: &str = "1.0.0";

/// 运行环境
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Production,
    Development,
    Test,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
        }
    }
}

/// 快照元数据
///
/// `content_hash` 与 `size_bytes` 始终基于实际上传的（压缩后）字节计算
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub schema_version: String,
    pub app_version: String,
    pub device_id: String,
    pub environment: Environment,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    /// SHA-256 十六进制摘要
    pub content_hash: String,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 备份状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    #[default]
    Idle,
    Pending,
    Uploading,
    Success,
    Error,
    OfflineQueued,
}

/// 最近一次备份的状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LastBackup {
    pub status: BackupStatus,
    pub timestamp: Option<DateTime<Utc>>,
    pub file_name: Option<String>,
    pub error: Option<String>,
}

/// 队列条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Queued,
    Uploading,
    Error,
}

/// 待上传快照（压缩后的字节 + 元数据）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedSnapshot {
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    pub metadata: SnapshotMetadata,
}

/// 重试队列条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub snapshot: EncodedSnapshot,
    pub target_file_name: String,
    /// 已尝试次数（只增不减）
    pub attempts: u32,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// 入队时的脏标记代数，上传成功后用于判断能否清除脏标记
    #[serde(default)]
    pub dirty_generation: u64,
}

/// 入队原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    /// 距上次上传不足最小间隔
    RateLimited,
    /// 离线
    Offline,
    /// 可重试的上传失败
    RetryableFailure,
    /// 应用关闭
    AppClose,
}

impl std::fmt::Display for QueueReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueReason::RateLimited => write!(f, "rate_limited"),
            QueueReason::Offline => write!(f, "offline"),
            QueueReason::RetryableFailure => write!(f, "retryable_failure"),
            QueueReason::AppClose => write!(f, "app_close"),
        }
    }
}

/// 创建备份的结果
///
/// `Queued` 表示已被接受并持久化，但尚未得到远程确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackupReceipt {
    Uploaded {
        file_name: String,
        remote_id: String,
        size: u64,
        timestamp: DateTime<Utc>,
    },
    Queued {
        entry_id: String,
        file_name: String,
        reason: QueueReason,
        timestamp: DateTime<Utc>,
    },
}

impl BackupReceipt {
    pub fn file_name(&self) -> &str {
        match self {
            BackupReceipt::Uploaded { file_name, .. } | BackupReceipt::Queued { file_name, .. } => {
                file_name
            }
        }
    }

    pub fn is_uploaded(&self) -> bool {
        matches!(self, BackupReceipt::Uploaded { .. })
    }
}

/// 恢复选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    pub mode: ImportMode,
    pub validate_schema: bool,
    pub create_backup_before_restore: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            mode: ImportMode::Replace,
            validate_schema: true,
            create_backup_before_restore: true,
        }
    }
}

/// 恢复前安全快照的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SafetySnapshotOutcome {
    Skipped,
    Completed { receipt: BackupReceipt },
    Failed { error: String },
}

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub file_id: String,
    pub mode: ImportMode,
    pub imported: ImportedCounts,
    pub schema_version: String,
    pub source_device_id: String,
    pub snapshot_timestamp: DateTime<Utc>,
    pub safety_snapshot: SafetySnapshotOutcome,
}

/// 队列处理被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainSkip {
    /// 已有处理在进行
    AlreadyProcessing,
    Offline,
    Unauthenticated,
}

/// 一次队列处理的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub uploaded: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// 处理后清理的远程快照数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pruned: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<DrainSkip>,
}

impl DrainReport {
    pub fn skipped(reason: DrainSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

/// 系统状态（聚合视图，非持久化）
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub config: BackupConfig,
    pub auth: AuthState,
    pub last_backup: LastBackup,
    pub dirty: bool,
    pub queue: Vec<QueueSummary>,
    pub online: bool,
    pub remote_folder_id: Option<String>,
    pub scheduler_running: bool,
}

/// 队列条目摘要（不含快照字节）
#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub id: String,
    pub target_file_name: String,
    pub attempts: u32,
    pub status: QueueStatus,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&QueueEntry> for QueueSummary {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            id: entry.id.clone(),
            target_file_name: entry.target_file_name.clone(),
            attempts: entry.attempts,
            status: entry.status,
            size_bytes: entry.snapshot.metadata.size_bytes,
            created_at: entry.created_at,
            last_attempt_at: entry.last_attempt_at,
            last_error: entry.last_error.clone(),
        }
    }
}

/// 格式化文件大小
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        let text = format!("{:.2}", size);
        let text = text.trim_end_matches('0').trim_end_matches('.');
        format!("{} {}", text, UNITS[unit])
    }
}

/// 队列中以 Base64 保存快照字节
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
