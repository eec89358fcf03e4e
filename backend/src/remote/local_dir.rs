//! 基于本地目录的远程存储
//!
//! 目录结构：`{root}/{folder}/{file_name}` 为快照内容，
//! `{file_name}.meta.json` 为元数据附属文件。远程 ID 即文件名。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{RemoteSnapshot, RemoteStore, UploadReceipt};
use crate::backup::{BackupError, SnapshotMetadata};

/// 元数据附属文件后缀
const META_SUFFIX: &str = ".meta.json";

/// 附属文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SidecarFile {
    created_at: DateTime<Utc>,
    metadata: SnapshotMetadata,
}

/// 本地目录远程存储
#[derive(Debug, Clone)]
pub struct LocalDirRemoteStore {
    root: PathBuf,
    folder_name: String,
    /// 单个快照最大字节数
    max_file_size: Option<u64>,
}

impl LocalDirRemoteStore {
    pub fn new(root: impl Into<PathBuf>, folder_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            folder_name: folder_name.into(),
            max_file_size: None,
        }
    }

    /// 设置单个快照大小上限
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = Some(max_file_size);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_path(&self, folder_id: &str) -> Result<PathBuf, BackupError> {
        validate_name(folder_id)?;
        Ok(self.root.join(folder_id))
    }

    fn file_path(&self, remote_id: &str) -> Result<PathBuf, BackupError> {
        validate_name(remote_id)?;
        Ok(self.root.join(&self.folder_name).join(remote_id))
    }

    async fn read_sidecar(path: &Path) -> Option<SidecarFile> {
        let content = fs::read_to_string(sidecar_path(path)).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                tracing::warn!("元数据文件损坏: {:?}, error={}", path, e);
                None
            }
        }
    }

    async fn snapshot_entry(path: &Path, name: &str) -> Result<RemoteSnapshot, BackupError> {
        let file_meta = fs::metadata(path).await?;
        let sidecar = Self::read_sidecar(path).await;

        let created_at = match &sidecar {
            Some(s) => s.created_at,
            None => file_meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        };

        Ok(RemoteSnapshot {
            remote_id: name.to_string(),
            name: name.to_string(),
            created_at,
            size: file_meta.len(),
            metadata: sidecar.map(|s| s.metadata),
        })
    }
}

/// 名称不能包含路径分隔符或 `..`
fn validate_name(name: &str) -> Result<(), BackupError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(BackupError::PermissionDenied(format!("非法名称: {}", name)));
    }
    Ok(())
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

#[async_trait]
impl RemoteStore for LocalDirRemoteStore {
    async fn ensure_folder(&self) -> Result<String, BackupError> {
        let path = self.folder_path(&self.folder_name)?;
        fs::create_dir_all(&path).await?;
        tracing::debug!("备份目录已就绪: {:?}", path);
        Ok(self.folder_name.clone())
    }

    async fn upload(
        &self,
        folder_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &SnapshotMetadata,
    ) -> Result<UploadReceipt, BackupError> {
        if let Some(max) = self.max_file_size {
            if bytes.len() as u64 > max {
                return Err(BackupError::FileTooLarge(format!(
                    "{} 字节超过上限 {} 字节",
                    bytes.len(),
                    max
                )));
            }
        }

        validate_name(file_name)?;
        let folder = self.folder_path(folder_id)?;
        if !fs::try_exists(&folder).await.unwrap_or(false) {
            return Err(BackupError::FolderNotFound(folder_id.to_string()));
        }

        let path = folder.join(file_name);

        // 先写临时文件再重命名，同名重试时整体覆盖
        let tmp = folder.join(format!(".{}.tmp", file_name));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;

        let sidecar = SidecarFile {
            created_at: Utc::now(),
            metadata: metadata.clone(),
        };
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| BackupError::Unknown(format!("序列化元数据失败: {}", e)))?;
        fs::write(sidecar_path(&path), json).await?;

        Ok(UploadReceipt {
            remote_id: file_name.to_string(),
            size: bytes.len() as u64,
        })
    }

    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteSnapshot>, BackupError> {
        let folder = self.folder_path(folder_id)?;
        let mut dir = match fs::read_dir(&folder).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::FolderNotFound(folder_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.ends_with(META_SUFFIX) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            snapshots.push(Self::snapshot_entry(&entry.path(), &name).await?);
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    async fn download(&self, remote_id: &str) -> Result<Vec<u8>, BackupError> {
        let path = self.file_path(remote_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::FolderNotFound(format!("快照不存在: {}", remote_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, remote_id: &str) -> Result<(), BackupError> {
        let path = self.file_path(remote_id)?;
        for target in [sidecar_path(&path), path] {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn stat(&self, remote_id: &str) -> Result<Option<RemoteSnapshot>, BackupError> {
        let path = self.file_path(remote_id)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(Self::snapshot_entry(&path, remote_id).await?))
    }
}
