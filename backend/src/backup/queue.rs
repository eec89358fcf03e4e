//! 重试队列
//!
//! 持久化的 FIFO 待上传队列：
//! - 入队在返回前已落盘
//! - 同一时刻最多只有一次处理（running 标志）
//! - 每个条目最多尝试 `max_attempts` 次，失败后指数退避
//! - 两次成功上传之间至少间隔最小上传间隔

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::error::{BackupError, RetryPolicy};
use super::events::BackupEvent;
use super::folder::FolderCache;
use super::network::Connectivity;
use super::persistence::PersistedState;
use super::retention::RetentionPruner;
use super::throttle::UploadThrottle;
use super::types::{
    BackupStatus, DrainReport, DrainSkip, EncodedSnapshot, QueueEntry, QueueStatus,
};
use crate::auth::AuthProvider;
use crate::remote::{RemoteStore, UploadReceipt};

/// 处理中标志守卫，离开作用域时自动清除
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 重试队列
pub struct RetryQueue {
    state: Arc<PersistedState>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    connectivity: Arc<Connectivity>,
    folder: Arc<FolderCache>,
    pruner: Arc<RetentionPruner>,
    throttle: Arc<UploadThrottle>,
    policy: RetryPolicy,
    /// 是否正在处理
    running: AtomicBool,
}

impl RetryQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<PersistedState>,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthProvider>,
        connectivity: Arc<Connectivity>,
        folder: Arc<FolderCache>,
        pruner: Arc<RetentionPruner>,
        throttle: Arc<UploadThrottle>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            state,
            remote,
            auth,
            connectivity,
            folder,
            pruner,
            throttle,
            policy,
            running: AtomicBool::new(false),
        }
    }

    /// 入队
    ///
    /// `dirty_generation` 为生成快照时的脏标记代数
    pub fn enqueue(
        &self,
        snapshot: EncodedSnapshot,
        file_name: &str,
        dirty_generation: u64,
    ) -> Result<QueueEntry, BackupError> {
        let entry = QueueEntry {
            id: Uuid::new_v4().to_string(),
            snapshot,
            target_file_name: file_name.to_string(),
            attempts: 0,
            status: QueueStatus::Queued,
            created_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
            dirty_generation,
        };

        let len = self.state.push_queue(entry.clone())?;
        tracing::info!(
            "备份已加入队列: id={}, file={}, 队列长度={}",
            entry.id,
            entry.target_file_name,
            len
        );
        Ok(entry)
    }

    /// 队列中的全部条目
    pub fn entries(&self) -> Result<Vec<QueueEntry>, BackupError> {
        Ok(self.state.queue()?)
    }

    pub fn is_processing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 清空队列
    pub fn clear(&self) -> Result<usize, BackupError> {
        let cleared = self.state.clear_queue()?;
        tracing::info!("已清空备份队列: {} 个条目", cleared);
        Ok(cleared)
    }

    /// 处理队列
    ///
    /// 已在处理、离线或未登录时直接返回。单个条目在一次处理中只尝试一次
    pub async fn process(&self) -> DrainReport {
        let Some(_guard) = RunningGuard::try_acquire(&self.running) else {
            tracing::debug!("队列正在处理中，跳过");
            return DrainReport::skipped(DrainSkip::AlreadyProcessing);
        };

        if !self.connectivity.is_online() {
            return DrainReport::skipped(DrainSkip::Offline);
        }
        if !self.auth.is_authenticated() {
            return DrainReport::skipped(DrainSkip::Unauthenticated);
        }

        let entries = match self.state.queue() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("读取备份队列失败: {:#}", e);
                return DrainReport::default();
            }
        };

        if entries.is_empty() {
            return DrainReport::default();
        }

        tracing::info!("开始处理备份队列: {} 个条目", entries.len());

        let mut report = DrainReport::default();
        for entry in entries {
            if let Err(e) = self.process_entry(entry, &mut report).await {
                tracing::error!("更新队列状态失败，停止本次处理: {}", e);
                break;
            }
        }

        // 无论结果如何都执行一次清理
        match self.state.config() {
            Ok(config) => match self.pruner.prune(config.max_snapshots_to_keep as usize).await {
                Ok(deleted) => report.pruned = Some(deleted),
                Err(e) => tracing::warn!("队列处理后清理旧快照失败: {}", e),
            },
            Err(e) => tracing::warn!("读取备份配置失败，跳过清理: {:#}", e),
        }

        tracing::info!(
            "备份队列处理完成: 上传 {}, 失败 {}, 放弃 {}",
            report.uploaded,
            report.failed,
            report.abandoned
        );
        report
    }

    async fn process_entry(
        &self,
        entry: QueueEntry,
        report: &mut DrainReport,
    ) -> Result<(), BackupError> {
        if self.policy.is_exhausted(entry.attempts) {
            self.state.remove_queue_entry(&entry.id)?;
            tracing::warn!(
                "备份 {} 在 {} 次尝试后放弃",
                entry.target_file_name,
                entry.attempts
            );
            self.state.events().emit(BackupEvent::EntryAbandoned {
                entry_id: entry.id.clone(),
                file_name: entry.target_file_name.clone(),
                attempts: entry.attempts,
                last_error: entry.last_error.clone(),
            });
            report.abandoned += 1;
            return Ok(());
        }

        let previous_attempts = entry.attempts;
        let updated = self.state.update_queue_entry(&entry.id, |e| {
            e.status = QueueStatus::Uploading;
            e.attempts += 1;
            e.last_attempt_at = Some(Utc::now());
        })?;

        // 处理期间条目可能已被清空
        let Some(entry) = updated else {
            return Ok(());
        };

        // 许可覆盖整个上传过程
        let permit = self.throttle.acquire().await;
        let result = self.upload(&entry).await;
        if result.is_ok() {
            permit.record_success();
        }
        drop(permit);

        match result {
            Ok(receipt) => {
                self.state.remove_queue_entry(&entry.id)?;

                let now = Utc::now();
                self.state.update_last_backup(|last| {
                    last.status = BackupStatus::Success;
                    last.timestamp = Some(now);
                    last.file_name = Some(entry.target_file_name.clone());
                    last.error = None;
                })?;

                if !self.state.clear_dirty_if_generation(entry.dirty_generation)? {
                    tracing::debug!("脏标记未清除（入队后有新的修改或本来就是干净的）");
                }

                tracing::info!(
                    "队列备份上传成功: file={}, 尝试次数={}",
                    entry.target_file_name,
                    entry.attempts
                );
                self.state.events().emit(BackupEvent::BackupSucceeded {
                    file_name: entry.target_file_name.clone(),
                    remote_id: receipt.remote_id,
                    size: receipt.size,
                    from_queue: true,
                    timestamp: now,
                });
                report.uploaded += 1;
            }
            Err(err) => {
                tracing::warn!(
                    "队列备份上传失败: file={}, attempts={}, error={}",
                    entry.target_file_name,
                    entry.attempts,
                    err
                );
                self.folder.observe(&err);

                let delay = self.policy.backoff_delay(previous_attempts, err.category());
                tracing::debug!("退避 {:?} 后继续", delay);
                tokio::time::sleep(delay).await;

                self.state.update_queue_entry(&entry.id, |e| {
                    e.status = QueueStatus::Error;
                    e.last_error = Some(err.to_string());
                })?;
                report.failed += 1;
            }
        }

        Ok(())
    }

    async fn upload(&self, entry: &QueueEntry) -> Result<UploadReceipt, BackupError> {
        self.auth.get_token().await?;
        let folder_id = self.folder.resolve().await?;
        self.remote
            .upload(
                &folder_id,
                &entry.target_file_name,
                &entry.snapshot.bytes,
                &entry.snapshot.metadata,
            )
            .await
    }
}
