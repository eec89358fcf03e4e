//! 备份错误处理模块
//!
//! 提供统一的错误分类、重试策略和用户友好的错误消息

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// 备份错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackupError {
    /// 认证失败（未登录或凭证无效）
    #[error("认证失败: {0}")]
    AuthFailed(String),

    /// 访问令牌已过期
    #[error("令牌已过期: {0}")]
    TokenExpired(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    NetworkError(String),

    /// 远程存储配额已满
    #[error("存储配额已满: {0}")]
    QuotaExceeded(String),

    /// 文件过大
    #[error("文件过大: {0}")]
    FileTooLarge(String),

    /// 权限错误
    #[error("权限错误: {0}")]
    PermissionDenied(String),

    /// 备份目录或文件不存在
    #[error("目录或文件不存在: {0}")]
    FolderNotFound(String),

    /// 备份内容无效（解压、解析或校验失败）
    #[error("无效的备份: {0}")]
    InvalidBackup(String),

    /// 备份 schema 版本不兼容
    #[error("备份 schema 不兼容: 远程 v{remote}, 本地 v{local}")]
    SchemaIncompatible { remote: String, local: String },

    /// 压缩失败
    #[error("压缩失败: {0}")]
    CompressionFailed(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

impl BackupError {
    /// 获取错误分类
    pub fn category(&self) -> ErrorCategory {
        classify_error(self)
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        to_user_message(self)
    }

    /// 是否可重试（可重试的错误进入重试队列，其余直接返回给调用方）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::RateLimited
        )
    }

    /// 根据远程存储返回的 HTTP 状态码构造错误
    ///
    /// 403 需要结合消息区分配额与权限问题
    pub fn from_http_status(status: u16, message: &str) -> Self {
        match status {
            401 => BackupError::TokenExpired(message.to_string()),
            403 if message.to_lowercase().contains("quota") => {
                BackupError::QuotaExceeded(message.to_string())
            }
            403 => BackupError::PermissionDenied(message.to_string()),
            404 => BackupError::FolderNotFound(message.to_string()),
            413 => BackupError::FileTooLarge(message.to_string()),
            500..=599 => BackupError::NetworkError(format!("服务器错误 {}: {}", status, message)),
            _ => BackupError::Unknown(format!("HTTP {}: {}", status, message)),
        }
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 临时错误（可重试）
    Transient,
    /// 配额/速率限制（可重试，退避上限更大）
    RateLimited,
    /// 权限错误（需要重新授权）
    Permission,
    /// 资源错误（需要用户干预）
    Resource,
    /// 数据错误（备份内容本身有问题）
    Data,
    /// 配置错误（需要修改配置）
    Configuration,
    /// 永久错误（不可重试）
    Permanent,
}

/// 重试策略
///
/// 退避时间为 `min(base * 2^attempts, cap)`，配额错误使用更大的上限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数（达到后放弃该条目）
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 配额错误的最大延迟（毫秒）
    pub quota_max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2000,
            max_delay_ms: 32000,
            quota_max_delay_ms: 120000,
        }
    }
}

impl RetryPolicy {
    /// 计算退避延迟
    ///
    /// `attempts` 为本次尝试之前已经累计的次数
    pub fn backoff_delay(&self, attempts: u32, category: ErrorCategory) -> Duration {
        let cap = match category {
            ErrorCategory::RateLimited => self.quota_max_delay_ms,
            _ => self.max_delay_ms,
        };

        let factor = 2u64.saturating_pow(attempts);
        let delay = self.base_delay_ms.saturating_mul(factor).min(cap);

        Duration::from_millis(delay)
    }

    /// 条目是否已耗尽尝试次数
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// 错误分类函数
pub fn classify_error(error: &BackupError) -> ErrorCategory {
    match error {
        BackupError::NetworkError(_) | BackupError::TokenExpired(_) => ErrorCategory::Transient,
        BackupError::QuotaExceeded(_) => ErrorCategory::RateLimited,
        BackupError::AuthFailed(_) | BackupError::PermissionDenied(_) => ErrorCategory::Permission,
        BackupError::FileTooLarge(_) | BackupError::FolderNotFound(_) => ErrorCategory::Resource,
        BackupError::InvalidBackup(_)
        | BackupError::SchemaIncompatible { .. }
        | BackupError::CompressionFailed(_) => ErrorCategory::Data,
        BackupError::ConfigError(_) => ErrorCategory::Configuration,
        BackupError::Unknown(_) => ErrorCategory::Permanent,
    }
}

/// 生成用户友好的错误消息
pub fn to_user_message(error: &BackupError) -> String {
    match error {
        BackupError::AuthFailed(_) => "尚未登录远程存储，请先登录".to_string(),
        BackupError::TokenExpired(_) => "登录已过期，备份已加入队列，重新登录后自动上传".to_string(),
        BackupError::NetworkError(_) => "网络连接失败，备份已加入队列，恢复网络后自动上传".to_string(),
        BackupError::QuotaExceeded(_) => "远程存储空间已满，请清理后重试".to_string(),
        BackupError::FileTooLarge(_) => "备份文件过大，无法上传".to_string(),
        BackupError::PermissionDenied(_) => "没有访问权限，请检查账号授权".to_string(),
        BackupError::FolderNotFound(_) => "备份目录或文件不存在".to_string(),
        BackupError::InvalidBackup(_) => "备份文件已损坏或格式不正确".to_string(),
        BackupError::SchemaIncompatible { remote, local } => format!(
            "备份版本 v{} 与当前版本 v{} 不兼容，请先升级应用",
            remote, local
        ),
        BackupError::CompressionFailed(_) => "备份数据压缩失败".to_string(),
        BackupError::ConfigError(msg) => format!("配置有误：{}，请检查备份配置", msg),
        BackupError::Unknown(msg) => format!("未知错误：{}", msg),
    }
}

/// 从 anyhow::Error 转换
impl From<anyhow::Error> for BackupError {
    fn from(err: anyhow::Error) -> Self {
        // 底层可能已经包装了具体的备份错误
        if let Some(backup_err) = err.downcast_ref::<BackupError>() {
            return backup_err.clone();
        }

        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return io_error_to_backup(io_err);
        }

        BackupError::Unknown(format!("{:#}", err))
    }
}

/// 从 std::io::Error 转换
impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        io_error_to_backup(&err)
    }
}

fn io_error_to_backup(err: &std::io::Error) -> BackupError {
    match err.kind() {
        std::io::ErrorKind::NotFound => BackupError::FolderNotFound(err.to_string()),
        std::io::ErrorKind::PermissionDenied => BackupError::PermissionDenied(err.to_string()),
        std::io::ErrorKind::TimedOut
        | std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => BackupError::NetworkError(err.to_string()),
        _ => BackupError::Unknown(err.to_string()),
    }
}

/// 恢复流程的失败阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    /// 认证检查
    Auth,
    /// 下载远程快照
    Download,
    /// 解压、校验与 schema 检查
    Decode,
    /// 导入本地存储
    Import,
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreStage::Auth => write!(f, "auth"),
            RestoreStage::Download => write!(f, "download"),
            RestoreStage::Decode => write!(f, "decode"),
            RestoreStage::Import => write!(f, "import"),
        }
    }
}

/// 恢复错误（携带失败阶段）
#[derive(Debug, Clone, Error)]
#[error("恢复失败（阶段: {stage}）: {source}")]
pub struct RestoreError {
    pub stage: RestoreStage,
    #[source]
    pub source: BackupError,
}

impl RestoreError {
    pub fn new(stage: RestoreStage, source: BackupError) -> Self {
        Self { stage, source }
    }
}
