// 应用状态

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::{AuthProvider, SessionAuthProvider};
use crate::backup::{BackupOrchestrator, Connectivity, EventBus, PersistedState};
use crate::config::AppConfig;
use crate::remote::LocalDirRemoteStore;
use crate::store::SqliteLocalStore;

/// 应用状态（各 handler 共享）
#[derive(Clone)]
pub struct AppState {
    /// 备份编排器
    pub orchestrator: Arc<BackupOrchestrator>,
    /// 认证提供方
    pub auth: Arc<dyn AuthProvider>,
    /// 本地数据存储
    pub store: Arc<SqliteLocalStore>,
    /// 进程配置
    pub config: Arc<RwLock<AppConfig>>,
}

impl AppState {
    /// 按配置创建全部协作方
    pub async fn new(config: AppConfig) -> Result<Self> {
        let storage = &config.storage;
        tokio::fs::create_dir_all(&storage.data_dir)
            .await
            .with_context(|| format!("创建数据目录失败: {:?}", storage.data_dir))?;

        let state = Arc::new(PersistedState::open(
            &storage.state_db_path(),
            EventBus::new(),
        )?);
        let store = Arc::new(SqliteLocalStore::open(&storage.local_db_path())?);
        let remote = Arc::new(LocalDirRemoteStore::new(
            storage.remote_dir_path(),
            config.engine.app_name.clone(),
        ));
        let auth: Arc<dyn AuthProvider> =
            Arc::new(SessionAuthProvider::load(storage.session_file_path()).await?);

        let orchestrator = BackupOrchestrator::new(
            config.engine.to_settings(),
            state,
            remote,
            auth.clone(),
            store.clone(),
            Arc::new(Connectivity::default()),
        )?;

        Ok(Self {
            orchestrator,
            auth,
            store,
            config: Arc::new(RwLock::new(config)),
        })
    }
}
