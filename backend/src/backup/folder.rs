//! 远程备份目录缓存

use std::sync::Arc;

use super::error::BackupError;
use super::persistence::PersistedState;
use crate::remote::RemoteStore;

/// 远程目录解析器
///
/// 目录 ID 缓存在持久化状态中；远程返回 FolderNotFound 时由调用方失效缓存
pub struct FolderCache {
    remote: Arc<dyn RemoteStore>,
    state: Arc<PersistedState>,
}

impl FolderCache {
    pub fn new(remote: Arc<dyn RemoteStore>, state: Arc<PersistedState>) -> Self {
        Self { remote, state }
    }

    /// 获取目录 ID，缓存缺失时向远程确认并写入缓存
    pub async fn resolve(&self) -> Result<String, BackupError> {
        if let Some(folder_id) = self.state.folder_id()? {
            return Ok(folder_id);
        }

        let folder_id = self.remote.ensure_folder().await?;
        self.state.set_folder_id(&folder_id)?;
        tracing::info!("远程备份目录: {}", folder_id);
        Ok(folder_id)
    }

    /// 失效缓存
    pub fn invalidate(&self) {
        if let Err(e) = self.state.clear_folder_id() {
            tracing::warn!("清除目录缓存失败: {:#}", e);
        }
    }

    /// 对远程错误做后处理：目录不存在时失效缓存
    pub fn observe(&self, err: &BackupError) {
        if matches!(err, BackupError::FolderNotFound(_)) {
            tracing::warn!("远程目录不存在，清除缓存: {}", err);
            self.invalidate();
        }
    }
}
