// 远程快照存储模块

pub mod local_dir;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup::{BackupError, SnapshotMetadata};

pub use local_dir::LocalDirRemoteStore;

/// 上传回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub remote_id: String,
    pub size: u64,
}

/// 远程快照条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub remote_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SnapshotMetadata>,
}

/// 远程快照存储
///
/// 所有操作都可能失败并返回分类后的 BackupError；上传需要可安全重试（同名覆盖）
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 确保备份目录存在，返回目录 ID（幂等）
    async fn ensure_folder(&self) -> Result<String, BackupError>;

    /// 上传快照
    async fn upload(
        &self,
        folder_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &SnapshotMetadata,
    ) -> Result<UploadReceipt, BackupError>;

    /// 列出目录中的快照（尽量按创建时间倒序）
    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteSnapshot>, BackupError>;

    /// 下载快照内容
    async fn download(&self, remote_id: &str) -> Result<Vec<u8>, BackupError>;

    /// 删除快照，已不存在视为成功
    async fn delete(&self, remote_id: &str) -> Result<(), BackupError>;

    /// 查询单个快照的信息（用于恢复前校验）
    async fn stat(&self, _remote_id: &str) -> Result<Option<RemoteSnapshot>, BackupError> {
        Ok(None)
    }
}
