//! 远程快照保留策略

use std::sync::Arc;

use super::error::BackupError;
use super::folder::FolderCache;
use crate::remote::RemoteStore;

/// 快照清理器
pub struct RetentionPruner {
    remote: Arc<dyn RemoteStore>,
    folder: Arc<FolderCache>,
}

impl RetentionPruner {
    pub fn new(remote: Arc<dyn RemoteStore>, folder: Arc<FolderCache>) -> Self {
        Self { remote, folder }
    }

    /// 保留最新的 `keep` 个快照，删除其余的，返回删除数量
    ///
    /// 单个删除失败只记录日志并跳过
    pub async fn prune(&self, keep: usize) -> Result<usize, BackupError> {
        let folder_id = self.folder.resolve().await?;
        let mut snapshots = match self.remote.list(&folder_id).await {
            Ok(list) => list,
            Err(e) => {
                self.folder.observe(&e);
                return Err(e);
            }
        };

        if snapshots.len() <= keep {
            return Ok(0);
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut deleted = 0;
        for snapshot in snapshots.iter().skip(keep) {
            match self.remote.delete(&snapshot.remote_id).await {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!("已删除旧快照: {}", snapshot.name);
                }
                Err(e) => {
                    tracing::warn!("删除旧快照失败: name={}, error={}", snapshot.name, e);
                }
            }
        }

        tracing::info!(
            "快照清理完成: 保留 {}, 删除 {}/{}",
            keep,
            deleted,
            snapshots.len() - keep
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::events::EventBus;
    use crate::backup::persistence::PersistedState;
    use crate::test_support::MemoryRemoteStore;
    use chrono::{Duration, TimeZone, Utc};

    fn setup(remote: Arc<MemoryRemoteStore>) -> RetentionPruner {
        let state = Arc::new(PersistedState::in_memory(EventBus::new()).unwrap());
        let folder = Arc::new(FolderCache::new(remote.clone(), state));
        RetentionPruner::new(remote, folder)
    }

    #[tokio::test]
    async fn test_keeps_newest() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // 乱序插入 T1..T5
        for i in [3, 1, 5, 2, 4] {
            remote.insert_snapshot(&format!("T{}", i), base + Duration::hours(i), b"x");
        }

        let pruner = setup(remote.clone());
        assert_eq!(pruner.prune(3).await.unwrap(), 2);

        let mut names = remote.names();
        names.sort();
        assert_eq!(names, vec!["T3", "T4", "T5"]);

        // 不足 keep 时不删除
        assert_eq!(pruner.prune(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_failures_are_skipped() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 1..=4 {
            remote.insert_snapshot(&format!("T{}", i), base + Duration::hours(i), b"x");
        }
        remote.fail_delete("T1");

        let pruner = setup(remote.clone());
        assert_eq!(pruner.prune(2).await.unwrap(), 1);

        let mut names = remote.names();
        names.sort();
        assert_eq!(names, vec!["T1", "T3", "T4"]);
    }
}
