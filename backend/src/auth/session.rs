// 会话管理和持久化

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{AuthProvider, AuthState, Credentials};
use crate::backup::BackupError;

/// 令牌有效期上限（10 年）
const MAX_TOKEN_LIFETIME_SECS: u64 = 10 * 365 * 24 * 3600;

/// 持久化的会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_email: Option<String>,
    pub signed_in_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }

    fn state(&self) -> AuthState {
        AuthState {
            is_authenticated: true,
            user_email: self.user_email.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// 基于会话文件的认证提供方
pub struct SessionAuthProvider {
    /// 会话文件路径
    session_file: PathBuf,
    /// 当前会话（内存缓存）
    current_session: RwLock<Option<Session>>,
    /// 状态广播
    state_tx: watch::Sender<AuthState>,
}

impl SessionAuthProvider {
    /// 创建认证提供方并尝试从文件恢复会话
    ///
    /// 会话文件损坏时视为未登录
    pub async fn load(session_file: impl Into<PathBuf>) -> Result<Self> {
        let session_file = session_file.into();
        let session = match read_session(&session_file).await {
            Ok(session) => session,
            Err(e) => {
                warn!("加载会话失败，视为未登录: {:#}", e);
                None
            }
        };

        if let Some(ref s) = session {
            info!("会话加载成功: user={:?}", s.user_email);
        }

        let state = session.as_ref().map(Session::state).unwrap_or_default();
        let (state_tx, _) = watch::channel(state);

        Ok(Self {
            session_file,
            current_session: RwLock::new(session),
            state_tx,
        })
    }

    /// 会话文件路径
    pub fn session_file(&self) -> &Path {
        &self.session_file
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        info!("保存会话到文件: {:?}", self.session_file);

        // 确保目录存在
        if let Some(parent) = self.session_file.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create session directory")?;
        }

        let json = serde_json::to_string_pretty(session).context("Failed to serialize session")?;
        fs::write(&self.session_file, &json)
            .await
            .context("Failed to write session file")?;
        Ok(())
    }

    async fn clear_session_file(&self) -> Result<()> {
        if fs::try_exists(&self.session_file).await.unwrap_or(false) {
            fs::remove_file(&self.session_file)
                .await
                .context("Failed to remove session file")?;
        }
        Ok(())
    }

    fn publish(&self, state: AuthState) {
        self.state_tx.send_replace(state);
    }
}

async fn read_session(path: &Path) -> Result<Option<Session>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .await
        .context("Failed to read session file")?;
    let session: Session =
        serde_json::from_str(&content).context("Failed to deserialize session")?;
    Ok(Some(session))
}

#[async_trait]
impl AuthProvider for SessionAuthProvider {
    fn is_authenticated(&self) -> bool {
        self.current_session.read().is_some()
    }

    fn auth_state(&self) -> AuthState {
        self.state_tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    async fn get_token(&self) -> Result<String, BackupError> {
        let guard = self.current_session.read();
        let session = guard
            .as_ref()
            .ok_or_else(|| BackupError::AuthFailed("未登录".to_string()))?;

        if session.is_expired() {
            return Err(BackupError::TokenExpired(format!(
                "令牌已于 {:?} 过期",
                session.expires_at
            )));
        }
        Ok(session.access_token.clone())
    }

    async fn sign_in(&self, credentials: Credentials) -> Result<AuthState, BackupError> {
        if credentials.access_token.trim().is_empty() {
            return Err(BackupError::AuthFailed("访问令牌为空".to_string()));
        }

        let now = Utc::now();
        let session = Session {
            access_token: credentials.access_token,
            expires_at: credentials
                .expires_in_secs
                .map(|secs| now + Duration::seconds(secs.min(MAX_TOKEN_LIFETIME_SECS) as i64)),
            user_email: credentials.user_email,
            signed_in_at: now,
        };

        self.save_session(&session).await?;

        let state = session.state();
        *self.current_session.write() = Some(session);
        self.publish(state.clone());

        info!("登录成功: user={:?}", state.user_email);
        Ok(state)
    }

    async fn sign_out(&self) -> Result<(), BackupError> {
        self.clear_session_file().await?;
        *self.current_session.write() = None;
        self.publish(AuthState::default());

        info!("已登出");
        Ok(())
    }
}
