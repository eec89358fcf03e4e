// 认证模块

pub mod session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backup::BackupError;

pub use session::SessionAuthProvider;

/// 认证状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub user_email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// 登录凭证
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    /// 令牌有效期（秒），为空表示不过期
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
    #[serde(default)]
    pub user_email: Option<String>,
}

/// 认证提供方
///
/// `is_authenticated` 只表示已登录；令牌过期在 `get_token` 时以 TokenExpired 报告，
/// 由调用方按可重试错误处理
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// 是否已登录
    fn is_authenticated(&self) -> bool;

    /// 当前认证状态
    fn auth_state(&self) -> AuthState;

    /// 订阅认证状态变化
    fn subscribe(&self) -> watch::Receiver<AuthState>;

    /// 获取访问令牌
    async fn get_token(&self) -> Result<String, BackupError>;

    /// 登录
    async fn sign_in(&self, credentials: Credentials) -> Result<AuthState, BackupError>;

    /// 登出
    async fn sign_out(&self) -> Result<(), BackupError>;
}
