// 统一错误处理

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

use crate::backup::{BackupError, RestoreError};

/// API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 内部服务器错误
    Internal(anyhow::Error),
    /// 备份领域错误
    Backup(BackupError),
    /// 恢复失败（带阶段）
    Restore(RestoreError),
    /// 请求参数错误
    BadRequest(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Internal(e) => write!(f, "Internal error: {}", e),
            ApiError::Backup(e) => write!(f, "Backup error: {}", e),
            ApiError::Restore(e) => write!(f, "Restore error: {}", e),
            ApiError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

/// 错误响应体
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
}

/// 备份错误对应的 HTTP 状态码
fn backup_status(err: &BackupError) -> StatusCode {
    match err {
        BackupError::AuthFailed(_) | BackupError::TokenExpired(_) => StatusCode::UNAUTHORIZED,
        BackupError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        BackupError::FolderNotFound(_) => StatusCode::NOT_FOUND,
        BackupError::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        BackupError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        BackupError::NetworkError(_) => StatusCode::SERVICE_UNAVAILABLE,
        BackupError::ConfigError(_)
        | BackupError::InvalidBackup(_)
        | BackupError::SchemaIncompatible { .. } => StatusCode::BAD_REQUEST,
        BackupError::CompressionFailed(_) | BackupError::Unknown(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, details, stage) = match self {
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(e.to_string()),
                    None,
                )
            }
            ApiError::Backup(e) => {
                let status = backup_status(&e);
                tracing::warn!("备份请求失败: status={}, error={}", status, e);
                (status, e.user_message(), Some(e.to_string()), None)
            }
            ApiError::Restore(e) => {
                let status = backup_status(&e.source);
                tracing::warn!("恢复请求失败: status={}, {}", status, e);
                (
                    status,
                    e.source.user_message(),
                    Some(e.source.to_string()),
                    Some(e.stage.to_string()),
                )
            }
            ApiError::BadRequest(msg) => {
                tracing::debug!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, msg, None, None)
            }
        };

        let body = Json(ErrorResponse {
            code: i32::from(status.as_u16()),
            message,
            details,
            stage,
        });

        (status, body).into_response()
    }
}

/// 从 anyhow::Error 转换
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        ApiError::Backup(err)
    }
}

impl From<RestoreError> for ApiError {
    fn from(err: RestoreError) -> Self {
        ApiError::Restore(err)
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;
