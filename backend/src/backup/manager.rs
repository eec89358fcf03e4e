//! 备份编排器
//!
//! 对外提供创建备份、恢复备份、清理旧快照等操作，
//! 并把脏标记跟踪、调度器、重试队列组装在一起

use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

use super::codec::SnapshotCodec;
use super::config::{BackupConfig, UpdateBackupConfigRequest};
use super::dirty::DirtyTracker;
use super::error::{BackupError, RestoreError, RestoreStage, RetryPolicy};
use super::events::{BackupEvent, NotifyLevel};
use super::folder::FolderCache;
use super::network::Connectivity;
use super::persistence::PersistedState;
use super::queue::RetryQueue;
use super::retention::RetentionPruner;
use super::scheduler::{BackupRunner, Scheduler, TriggerSource};
use super::throttle::UploadThrottle;
use super::types::{
    format_file_size, BackupReceipt, BackupStatus, DrainReport, EncodedSnapshot, Environment,
    QueueReason, QueueSummary, RestoreOptions, RestoreResult, SafetySnapshotOutcome, SystemState,
};
use crate::auth::AuthProvider;
use crate::remote::{RemoteSnapshot, RemoteStore, UploadReceipt};
use crate::store::{ExportFilter, LocalSnapshotSource};

/// 引擎参数（来自进程配置）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub app_name: String,
    pub app_version: String,
    pub environment: Environment,
    /// 防抖窗口
    pub debounce: Duration,
    /// 两次成功上传的最小间隔
    pub min_upload_interval: Duration,
    pub retry: RetryPolicy,
    pub export_filter: ExportFilter,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            app_name: "SnapshotBackup".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: Environment::Production,
            debounce: Duration::from_secs(30),
            min_upload_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            export_filter: ExportFilter::default(),
        }
    }
}

/// 已编码、待上传的快照
struct PreparedSnapshot {
    snapshot: EncodedSnapshot,
    file_name: String,
    /// 导出前的脏标记代数
    dirty_generation: u64,
}

/// 备份编排器
pub struct BackupOrchestrator {
    settings: EngineSettings,
    state: Arc<PersistedState>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    source: Arc<dyn LocalSnapshotSource>,
    connectivity: Arc<Connectivity>,
    codec: SnapshotCodec,
    folder: Arc<FolderCache>,
    pruner: Arc<RetentionPruner>,
    throttle: Arc<UploadThrottle>,
    queue: Arc<RetryQueue>,
    dirty: DirtyTracker,
    scheduler: Scheduler,
    /// 同一时刻只允许一个恢复
    restore_lock: tokio::sync::Mutex<()>,
}

impl BackupOrchestrator {
    /// 创建编排器
    pub fn new(
        settings: EngineSettings,
        state: Arc<PersistedState>,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthProvider>,
        source: Arc<dyn LocalSnapshotSource>,
        connectivity: Arc<Connectivity>,
    ) -> Result<Arc<Self>, BackupError> {
        let device_id = state.device_id()?;
        let codec = SnapshotCodec::new(
            settings.app_name.clone(),
            settings.app_version.clone(),
            device_id,
            settings.environment,
        );

        let folder = Arc::new(FolderCache::new(remote.clone(), state.clone()));
        let pruner = Arc::new(RetentionPruner::new(remote.clone(), folder.clone()));
        let throttle = Arc::new(UploadThrottle::new(settings.min_upload_interval));
        let queue = Arc::new(RetryQueue::new(
            state.clone(),
            remote.clone(),
            auth.clone(),
            connectivity.clone(),
            folder.clone(),
            pruner.clone(),
            throttle.clone(),
            settings.retry.clone(),
        ));

        let orchestrator = Arc::new_cyclic(|weak: &Weak<Self>| {
            let runner: Weak<dyn BackupRunner> = weak.clone();

            let dirty = DirtyTracker::new(
                state.clone(),
                auth.clone(),
                runner.clone(),
                settings.debounce,
            );
            let scheduler = Scheduler::new(runner, state.clone(), auth.clone(), connectivity.clone());

            Self {
                settings,
                state,
                remote,
                auth,
                source,
                connectivity,
                codec,
                folder,
                pruner,
                throttle,
                queue,
                dirty,
                scheduler,
                restore_lock: tokio::sync::Mutex::new(()),
            }
        });

        tracing::info!(
            "备份编排器已创建: device_id={}, env={}",
            orchestrator.codec.device_id(),
            orchestrator.settings.environment
        );
        Ok(orchestrator)
    }

    // ==================== 生命周期 ====================

    /// 启动自动备份
    ///
    /// 始终监听网络状态；仅在已启用且已登录时启动定时器，
    /// 在线时立即处理一次队列。返回定时器是否已启动
    pub fn start(self: &Arc<Self>) -> Result<bool, BackupError> {
        self.scheduler.watch_connectivity();

        let config = self.state.config()?;
        if !config.enabled {
            tracing::info!("自动备份未启用");
            return Ok(false);
        }
        if !self.auth.is_authenticated() {
            tracing::info!("未登录，自动备份等待登录");
            return Ok(false);
        }

        self.scheduler.start()?;

        if self.connectivity.is_online() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let report = this.queue.process().await;
                tracing::debug!("启动时队列处理结果: {:?}", report);
            });
        }
        Ok(true)
    }

    /// 停止定时器与防抖
    pub fn stop(&self) {
        self.scheduler.stop();
        self.dirty.cancel();
    }

    /// 停止全部后台任务（包括网络监听）
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.dirty.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// 登录后：启用自动备份并启动
    pub fn on_signed_in(self: &Arc<Self>) -> Result<BackupConfig, BackupError> {
        let config = self.update_config(UpdateBackupConfigRequest {
            enabled: Some(true),
            ..Default::default()
        })?;
        self.start()?;
        Ok(config)
    }

    /// 登出后：停止并清除全部备份状态
    pub fn reset(&self) -> Result<(), BackupError> {
        self.stop();
        self.state.reset()?;
        self.throttle.reset();
        tracing::info!("备份系统已重置");
        Ok(())
    }

    /// 应用关闭：满足条件时把当前数据加入队列（不做网络请求）
    pub async fn on_app_close(&self) -> Result<Option<BackupReceipt>, BackupError> {
        let config = self.state.config()?;
        let dirty = self.state.is_dirty()?;

        if !(config.enabled && config.backup_on_close && dirty && self.auth.is_authenticated()) {
            return Ok(None);
        }

        tracing::info!("应用关闭，备份加入队列");
        let prepared = self.prepare(Some("应用关闭时备份".to_string())).await?;
        Ok(Some(self.enqueue_prepared(prepared, QueueReason::AppClose)?))
    }

    // ==================== 脏标记 ====================

    /// 本地数据发生变更
    pub fn mark_dirty(&self) -> Result<bool, BackupError> {
        let armed = self.dirty.mark_dirty()?;
        if armed {
            self.state.update_last_backup(|last| {
                if last.status != BackupStatus::Uploading {
                    last.status = BackupStatus::Pending;
                }
            })?;
        }
        Ok(armed)
    }

    // ==================== 创建备份 ====================

    /// 手动创建备份
    pub async fn create_backup(
        &self,
        description: Option<String>,
    ) -> Result<BackupReceipt, BackupError> {
        self.create_backup_from(TriggerSource::Manual, description).await
    }

    async fn create_backup_from(
        &self,
        trigger: TriggerSource,
        description: Option<String>,
    ) -> Result<BackupReceipt, BackupError> {
        tracing::info!("开始创建备份: trigger={}", trigger);

        // 许可一直持有到上传结束，并发触发只会有一个真正上传
        let Some(permit) = self.throttle.try_acquire() else {
            tracing::info!(
                "距上次上传不足 {:?} 或有上传正在进行，备份加入队列",
                self.throttle.min_interval()
            );
            let prepared = self.prepare_or_fail(description).await?;
            return self.enqueue_prepared(prepared, QueueReason::RateLimited);
        };

        if !self.auth.is_authenticated() {
            return Err(self.record_failure(
                BackupError::AuthFailed("尚未登录远程存储".to_string()),
                None,
            ));
        }

        if !self.connectivity.is_online() {
            tracing::info!("离线，备份加入队列");
            let prepared = self.prepare_or_fail(description).await?;
            return self.enqueue_prepared(prepared, QueueReason::Offline);
        }

        self.state.update_last_backup(|last| {
            last.status = BackupStatus::Uploading;
            last.error = None;
        })?;

        let prepared = self.prepare_or_fail(description).await?;

        match self.upload(&prepared).await {
            Ok(receipt) => {
                permit.record_success();
                drop(permit);
                self.complete_upload(prepared, receipt).await
            }
            Err(err) => {
                self.folder.observe(&err);
                if err.is_retryable() {
                    tracing::warn!("上传失败，备份加入队列: {}", err);
                    self.enqueue_prepared(prepared, QueueReason::RetryableFailure)
                } else {
                    Err(self.record_failure(err, Some(prepared.file_name)))
                }
            }
        }
    }

    /// 导出并编码本地数据
    async fn prepare(&self, description: Option<String>) -> Result<PreparedSnapshot, BackupError> {
        // 先记录代数，导出后发生的修改会使代数增加
        let dirty_generation = self.state.dirty_generation()?;
        let data = self.source.export_all(&self.settings.export_filter).await?;
        let snapshot = self.codec.encode(&data, description)?;
        let file_name = self.codec.file_name();

        tracing::debug!(
            "快照已生成: file={}, size={}",
            file_name,
            format_file_size(snapshot.metadata.size_bytes)
        );

        Ok(PreparedSnapshot {
            snapshot,
            file_name,
            dirty_generation,
        })
    }

    async fn prepare_or_fail(
        &self,
        description: Option<String>,
    ) -> Result<PreparedSnapshot, BackupError> {
        match self.prepare(description).await {
            Ok(prepared) => Ok(prepared),
            Err(err) => Err(self.record_failure(err, None)),
        }
    }

    async fn upload(&self, prepared: &PreparedSnapshot) -> Result<UploadReceipt, BackupError> {
        self.auth.get_token().await?;
        let folder_id = self.folder.resolve().await?;
        self.remote
            .upload(
                &folder_id,
                &prepared.file_name,
                &prepared.snapshot.bytes,
                &prepared.snapshot.metadata,
            )
            .await
    }

    async fn complete_upload(
        &self,
        prepared: PreparedSnapshot,
        receipt: UploadReceipt,
    ) -> Result<BackupReceipt, BackupError> {
        let now = Utc::now();
        self.state.update_last_backup(|last| {
            last.status = BackupStatus::Success;
            last.timestamp = Some(now);
            last.file_name = Some(prepared.file_name.clone());
            last.error = None;
        })?;

        if !self.dirty.clear_dirty_if_unchanged(prepared.dirty_generation)? {
            tracing::debug!("脏标记未清除（上传期间有新的修改或本来就是干净的）");
        }

        tracing::info!(
            "备份创建成功: file={}, size={}",
            prepared.file_name,
            format_file_size(receipt.size)
        );
        self.state.events().emit(BackupEvent::BackupSucceeded {
            file_name: prepared.file_name.clone(),
            remote_id: receipt.remote_id.clone(),
            size: receipt.size,
            from_queue: false,
            timestamp: now,
        });

        let config = self.state.config()?;
        if let Err(e) = self
            .pruner
            .prune(config.max_snapshots_to_keep as usize)
            .await
        {
            tracing::warn!("清理旧快照失败: {}", e);
        }

        if config.notify_on_success {
            self.notify(NotifyLevel::Success, "备份成功".to_string());
        }

        Ok(BackupReceipt::Uploaded {
            file_name: prepared.file_name,
            remote_id: receipt.remote_id,
            size: receipt.size,
            timestamp: now,
        })
    }

    /// 加入重试队列，状态置为 offline_queued
    fn enqueue_prepared(
        &self,
        prepared: PreparedSnapshot,
        reason: QueueReason,
    ) -> Result<BackupReceipt, BackupError> {
        let entry = self.queue.enqueue(
            prepared.snapshot,
            &prepared.file_name,
            prepared.dirty_generation,
        )?;

        self.state.update_last_backup(|last| {
            last.status = BackupStatus::OfflineQueued;
            last.file_name = Some(entry.target_file_name.clone());
        })?;

        self.state.events().emit(BackupEvent::BackupQueued {
            entry_id: entry.id.clone(),
            file_name: entry.target_file_name.clone(),
            reason,
        });

        Ok(BackupReceipt::Queued {
            entry_id: entry.id,
            file_name: entry.target_file_name,
            reason,
            timestamp: entry.created_at,
        })
    }

    /// 记录失败状态并按配置通知，返回原错误
    fn record_failure(&self, err: BackupError, file_name: Option<String>) -> BackupError {
        tracing::error!("备份失败: {}", err);

        let message = err.to_string();
        if let Err(e) = self.state.update_last_backup(|last| {
            last.status = BackupStatus::Error;
            last.error = Some(message.clone());
            if file_name.is_some() {
                last.file_name = file_name.clone();
            }
        }) {
            tracing::warn!("更新备份状态失败: {:#}", e);
        }

        self.state.events().emit(BackupEvent::BackupFailed {
            file_name,
            error: message,
            status: BackupStatus::Error,
        });

        let notify = self
            .state
            .config()
            .map(|c| c.notify_on_error)
            .unwrap_or(true);
        if notify {
            self.notify(NotifyLevel::Error, err.user_message());
        }
        err
    }

    fn notify(&self, level: NotifyLevel, message: String) {
        self.state
            .events()
            .emit(BackupEvent::Notify { level, message });
    }

    // ==================== 恢复 ====================

    /// 从远程快照恢复本地数据
    ///
    /// 安全快照失败不会中断恢复；导入在本地存储的单个事务中完成
    pub async fn restore_backup(
        &self,
        file_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreResult, RestoreError> {
        let _guard = self.restore_lock.lock().await;
        tracing::info!("开始恢复: file_id={}, mode={}", file_id, options.mode);

        let result = self.restore_inner(file_id, options).await;
        if let Err(ref e) = result {
            tracing::error!("{}", e);
            let notify = self
                .state
                .config()
                .map(|c| c.notify_on_error)
                .unwrap_or(true);
            if notify {
                self.notify(
                    NotifyLevel::Error,
                    format!("恢复失败：{}", e.source.user_message()),
                );
            }
        }
        result
    }

    async fn restore_inner(
        &self,
        file_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreResult, RestoreError> {
        if !self.auth.is_authenticated() {
            return Err(RestoreError::new(
                RestoreStage::Auth,
                BackupError::AuthFailed("尚未登录远程存储".to_string()),
            ));
        }

        let safety_snapshot = if options.create_backup_before_restore {
            match self
                .create_backup_from(
                    TriggerSource::SafetySnapshot,
                    Some("恢复前自动备份".to_string()),
                )
                .await
            {
                Ok(receipt) => SafetySnapshotOutcome::Completed { receipt },
                Err(e) => {
                    tracing::warn!("恢复前安全快照失败，继续恢复: {}", e);
                    SafetySnapshotOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            }
        } else {
            SafetySnapshotOutcome::Skipped
        };

        self.auth
            .get_token()
            .await
            .map_err(|e| RestoreError::new(RestoreStage::Auth, e))?;

        let bytes = match self.remote.download(file_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.folder.observe(&e);
                return Err(RestoreError::new(RestoreStage::Download, e));
            }
        };

        // 远程有元数据时校验哈希
        match self.remote.stat(file_id).await {
            Ok(Some(RemoteSnapshot {
                metadata: Some(metadata),
                ..
            })) => {
                self.codec
                    .verify(&bytes, &metadata)
                    .map_err(|e| RestoreError::new(RestoreStage::Decode, e))?;
            }
            Ok(_) => tracing::debug!("远程快照没有元数据，跳过哈希校验"),
            Err(e) => tracing::warn!("获取远程快照信息失败，跳过哈希校验: {}", e),
        }

        let decoded = self
            .codec
            .decode(&bytes)
            .map_err(|e| RestoreError::new(RestoreStage::Decode, e))?;

        if options.validate_schema {
            self.codec
                .check_schema(&decoded.schema_version)
                .map_err(|e| RestoreError::new(RestoreStage::Decode, e))?;
        }

        let imported = self
            .source
            .import_all(&decoded.data, options.mode)
            .await
            .map_err(|e| RestoreError::new(RestoreStage::Import, e))?;

        if let Err(e) = self.dirty.clear_dirty() {
            tracing::warn!("恢复后清除脏标记失败: {}", e);
        }

        let total = imported.total();
        tracing::info!("恢复成功: file_id={}, 导入 {} 条记录", file_id, total);
        self.state.events().emit(BackupEvent::RestoreCompleted {
            file_id: file_id.to_string(),
            total_imported: total,
        });

        if self.state.config().map(|c| c.notify_on_success).unwrap_or(false) {
            self.notify(NotifyLevel::Success, "恢复成功".to_string());
        }

        Ok(RestoreResult {
            file_id: file_id.to_string(),
            mode: options.mode,
            imported,
            schema_version: decoded.schema_version,
            source_device_id: decoded.device_id,
            snapshot_timestamp: decoded.timestamp,
            safety_snapshot,
        })
    }

    // ==================== 快照管理 ====================

    /// 删除超出保留数量的旧快照，`keep` 为空时使用配置值
    pub async fn prune_old_snapshots(&self, keep: Option<usize>) -> Result<usize, BackupError> {
        let keep = match keep {
            Some(keep) => keep,
            None => self.state.config()?.max_snapshots_to_keep as usize,
        };
        self.pruner.prune(keep).await
    }

    /// 列出远程快照（新的在前）
    pub async fn list_snapshots(&self) -> Result<Vec<RemoteSnapshot>, BackupError> {
        self.require_auth()?;
        let folder_id = self.folder.resolve().await?;
        match self.remote.list(&folder_id).await {
            Ok(mut list) => {
                list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(list)
            }
            Err(e) => {
                self.folder.observe(&e);
                Err(e)
            }
        }
    }

    /// 删除单个远程快照
    pub async fn delete_snapshot(&self, remote_id: &str) -> Result<(), BackupError> {
        self.require_auth()?;
        self.remote.delete(remote_id).await?;
        tracing::info!("已删除快照: {}", remote_id);
        Ok(())
    }

    fn require_auth(&self) -> Result<(), BackupError> {
        if self.auth.is_authenticated() {
            Ok(())
        } else {
            Err(BackupError::AuthFailed("尚未登录远程存储".to_string()))
        }
    }

    // ==================== 队列 ====================

    pub async fn process_queue(&self) -> DrainReport {
        self.queue.process().await
    }

    pub fn clear_queue(&self) -> Result<usize, BackupError> {
        self.queue.clear()
    }

    // ==================== 配置与状态 ====================

    pub fn config(&self) -> Result<BackupConfig, BackupError> {
        Ok(self.state.config()?)
    }

    /// 更新配置，调度相关字段变化时重启或停止定时器
    pub fn update_config(
        &self,
        request: UpdateBackupConfigRequest,
    ) -> Result<BackupConfig, BackupError> {
        let current = self.state.config()?;
        let updated = current.apply(&request);
        updated.validate()?;
        self.state.set_config(&updated)?;

        if current.timing_changed(&updated) {
            if updated.enabled && self.auth.is_authenticated() {
                self.scheduler.start()?;
            } else {
                self.stop();
            }
        }

        tracing::info!("备份配置已更新: {:?}", updated);
        Ok(updated)
    }

    /// 系统状态快照
    pub fn state(&self) -> Result<SystemState, BackupError> {
        let queue = self.queue.entries()?;
        Ok(SystemState {
            config: self.state.config()?,
            auth: self.auth.auth_state(),
            last_backup: self.state.last_backup()?,
            dirty: self.state.is_dirty()?,
            queue: queue.iter().map(QueueSummary::from).collect(),
            online: self.connectivity.is_online(),
            remote_folder_id: self.state.folder_id()?,
            scheduler_running: self.scheduler.is_running(),
        })
    }

    /// 上报网络状态，返回是否发生变化
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    /// 订阅备份事件
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.state.events().subscribe()
    }
}

#[async_trait::async_trait]
impl BackupRunner for BackupOrchestrator {
    async fn run_backup(&self, trigger: TriggerSource) -> Result<BackupReceipt, BackupError> {
        self.create_backup_from(trigger, None).await
    }

    async fn drain_queue(&self) -> DrainReport {
        self.queue.process().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::events::EventBus;
    use crate::store::ImportMode;
    use crate::test_support::{
        sample_data, test_codec, MemoryRemoteStore, MemorySnapshotSource, SwitchableAuth,
    };
    use chrono::Duration as ChronoDuration;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    struct Fixture {
        orchestrator: Arc<BackupOrchestrator>,
        remote: Arc<MemoryRemoteStore>,
        auth: Arc<SwitchableAuth>,
        source: Arc<MemorySnapshotSource>,
        state: Arc<PersistedState>,
        connectivity: Arc<Connectivity>,
    }

    fn fixture(authenticated: bool) -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = Arc::new(SwitchableAuth::new(authenticated));
        let source = Arc::new(MemorySnapshotSource::new(sample_data(&["p1", "p2"])));
        let state = Arc::new(PersistedState::in_memory(EventBus::new()).unwrap());
        let connectivity = Arc::new(Connectivity::new(true));

        let settings = EngineSettings {
            app_name: "Test".to_string(),
            environment: Environment::Test,
            ..Default::default()
        };
        let orchestrator = BackupOrchestrator::new(
            settings,
            state.clone(),
            remote.clone(),
            auth.clone(),
            source.clone(),
            connectivity.clone(),
        )
        .unwrap();

        Fixture {
            orchestrator,
            remote,
            auth,
            source,
            state,
            connectivity,
        }
    }

    fn enable(state: &PersistedState) {
        let config = BackupConfig {
            enabled: true,
            ..Default::default()
        };
        state.set_config(&config).unwrap();
    }

    fn drain_events(rx: &mut broadcast::Receiver<BackupEvent>) -> Vec<BackupEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// 手工构造指定 schema 版本的快照字节
    fn snapshot_with_schema(schema_version: &str) -> Vec<u8> {
        let envelope = json!({
            "schema_version": schema_version,
            "app_version": "9.0.0",
            "device_id": "device_other",
            "environment": "production",
            "timestamp": Utc::now(),
            "data": {"players": [{"id": "z"}]},
        });
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&serde_json::to_vec(&envelope).unwrap())
            .unwrap();
        encoder.finish().unwrap()
    }

    fn player_ids(source: &MemorySnapshotSource) -> Vec<String> {
        source
            .data()
            .records("players")
            .iter()
            .filter_map(crate::store::record_id)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_uploads_and_clears_dirty() {
        let f = fixture(true);
        let mut rx = f.orchestrator.subscribe();
        f.state.set_dirty(true).unwrap();

        let receipt = f.orchestrator.create_backup(None).await.unwrap();
        assert!(receipt.is_uploaded());
        assert!(receipt.file_name().starts_with("Test_device_"));
        assert_eq!(f.remote.uploaded_names(), vec![receipt.file_name().to_string()]);

        assert!(!f.state.is_dirty().unwrap());
        let last = f.state.last_backup().unwrap();
        assert_eq!(last.status, BackupStatus::Success);
        assert_eq!(last.file_name.as_deref(), Some(receipt.file_name()));
        assert!(last.timestamp.is_some());

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            BackupEvent::BackupSucceeded { from_queue: false, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_backup_is_queued() {
        let f = fixture(true);
        f.connectivity.set_online(false);

        let receipt = f.orchestrator.create_backup(None).await.unwrap();
        match receipt {
            BackupReceipt::Queued { reason, .. } => assert_eq!(reason, QueueReason::Offline),
            other => panic!("应当入队: {:?}", other),
        }

        assert_eq!(f.state.queue().unwrap().len(), 1);
        assert_eq!(f.remote.upload_attempts(), 0);
        assert_eq!(
            f.state.last_backup().unwrap().status,
            BackupStatus::OfflineQueued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_backup_within_interval_is_queued() {
        let f = fixture(true);

        let first = f.orchestrator.create_backup(None).await.unwrap();
        assert!(first.is_uploaded());

        let second = f.orchestrator.create_backup(None).await.unwrap();
        match second {
            BackupReceipt::Queued { reason, .. } => assert_eq!(reason, QueueReason::RateLimited),
            other => panic!("应当因限流入队: {:?}", other),
        }
        assert_eq!(f.remote.upload_attempts(), 1);

        // 队列处理会等待最小间隔后上传
        let report = f.orchestrator.process_queue().await;
        assert_eq!(report.uploaded, 1);
        assert!(f.state.queue().unwrap().is_empty());

        let log = f.remote.upload_log();
        assert_eq!(log.len(), 2);
        assert!(log[1].1 - log[0].1 >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_backups_upload_once() {
        let f = fixture(true);
        f.remote.set_upload_delay(Some(Duration::from_secs(1)));

        let (a, b) = tokio::join!(
            f.orchestrator.create_backup(None),
            f.orchestrator.create_backup(None)
        );
        let receipts = [a.unwrap(), b.unwrap()];
        assert_eq!(receipts.iter().filter(|r| r.is_uploaded()).count(), 1);
        assert!(receipts.iter().any(|r| matches!(
            r,
            BackupReceipt::Queued {
                reason: QueueReason::RateLimited,
                ..
            }
        )));

        let report = f.orchestrator.process_queue().await;
        assert_eq!(report.uploaded, 1);

        let log = f.remote.upload_log();
        assert_eq!(log.len(), 2);
        assert!(log[1].1 - log[0].1 >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backups_in_same_second_keep_both_snapshots() {
        let f = fixture(true);

        let first = f.orchestrator.create_backup(None).await.unwrap();
        let second = f.orchestrator.create_backup(None).await.unwrap();
        assert!(first.is_uploaded());
        assert!(!second.is_uploaded());
        assert_ne!(first.file_name(), second.file_name());

        f.orchestrator.process_queue().await;
        let names = f.remote.names();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&first.file_name().to_string()));
        assert!(names.contains(&second.file_name().to_string()));
    }

    #[tokio::test]
    async fn test_unauthenticated_backup_fails_without_queueing() {
        let f = fixture(false);
        let mut rx = f.orchestrator.subscribe();

        let err = f.orchestrator.create_backup(None).await.unwrap_err();
        assert!(matches!(err, BackupError::AuthFailed(_)));
        assert!(f.state.queue().unwrap().is_empty());
        assert_eq!(f.state.last_backup().unwrap().status, BackupStatus::Error);

        let events = drain_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BackupEvent::BackupFailed { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            BackupEvent::Notify {
                level: NotifyLevel::Error,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_error_notification_respects_config() {
        let f = fixture(false);
        f.orchestrator
            .update_config(UpdateBackupConfigRequest {
                notify_on_error: Some(false),
                ..Default::default()
            })
            .unwrap();
        let mut rx = f.orchestrator.subscribe();

        f.orchestrator.create_backup(None).await.unwrap_err();
        let events = drain_events(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, BackupEvent::Notify { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_upload_failure_is_queued() {
        let f = fixture(true);
        f.remote
            .fail_all_uploads(Some(BackupError::NetworkError("timeout".to_string())));

        let receipt = f.orchestrator.create_backup(None).await.unwrap();
        match receipt {
            BackupReceipt::Queued { reason, .. } => {
                assert_eq!(reason, QueueReason::RetryableFailure)
            }
            other => panic!("应当入队: {:?}", other),
        }
        assert_eq!(f.state.queue().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_upload_failure_reports_error() {
        let f = fixture(true);
        f.remote
            .fail_all_uploads(Some(BackupError::PermissionDenied("denied".to_string())));

        let err = f.orchestrator.create_backup(None).await.unwrap_err();
        assert!(matches!(err, BackupError::PermissionDenied(_)));
        assert!(f.state.queue().unwrap().is_empty());

        let last = f.state.last_backup().unwrap();
        assert_eq!(last.status, BackupStatus::Error);
        assert!(last.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_snapshots_pruned_after_upload() {
        let f = fixture(true);
        let now = Utc::now();
        for i in 0..6 {
            f.remote.insert_snapshot(
                &format!("old-{}.json.gz", i),
                now - ChronoDuration::hours(10 - i),
                b"old",
            );
        }

        let receipt = f.orchestrator.create_backup(None).await.unwrap();
        let names = f.remote.names();
        assert_eq!(names.len(), 5);
        assert!(names.contains(&receipt.file_name().to_string()));
        assert!(!names.contains(&"old-0.json.gz".to_string()));
        assert!(!names.contains(&"old-1.json.gz".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_replace_with_safety_snapshot() {
        let f = fixture(true);
        let snapshot = test_codec()
            .encode(&sample_data(&["a", "b", "c"]), None)
            .unwrap();
        f.remote
            .insert_encoded("restore-me.json.gz", Utc::now(), &snapshot);
        f.state.set_dirty(true).unwrap();

        let result = f
            .orchestrator
            .restore_backup("restore-me.json.gz", RestoreOptions::default())
            .await
            .unwrap();

        assert_eq!(result.imported.get("players"), 3);
        assert_eq!(result.source_device_id, "device_test");
        assert!(matches!(
            result.safety_snapshot,
            SafetySnapshotOutcome::Completed { .. }
        ));
        assert_eq!(player_ids(&f.source), vec!["a", "b", "c"]);
        assert!(!f.state.is_dirty().unwrap());
        // 安全快照已上传
        assert_eq!(f.remote.uploaded_names().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_merge_skips_existing_ids() {
        let f = fixture(true);
        let snapshot = test_codec()
            .encode(&sample_data(&["p1", "p3"]), None)
            .unwrap();
        f.remote.insert_encoded("merge.json.gz", Utc::now(), &snapshot);

        let options = RestoreOptions {
            mode: ImportMode::Merge,
            create_backup_before_restore: false,
            ..Default::default()
        };
        let result = f
            .orchestrator
            .restore_backup("merge.json.gz", options)
            .await
            .unwrap();

        assert_eq!(result.imported.get("players"), 1);
        assert_eq!(result.safety_snapshot, SafetySnapshotOutcome::Skipped);
        assert_eq!(player_ids(&f.source), vec!["p1", "p2", "p3"]);
        assert_eq!(f.remote.upload_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_failure_leaves_local_data() {
        let f = fixture(true);
        let snapshot = test_codec().encode(&sample_data(&["x"]), None).unwrap();
        f.remote.insert_encoded("snap.json.gz", Utc::now(), &snapshot);
        f.source.set_fail_import(true);

        let err = f
            .orchestrator
            .restore_backup("snap.json.gz", RestoreOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.stage, RestoreStage::Import);
        assert_eq!(player_ids(&f.source), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_safety_snapshot_failure_does_not_abort_restore() {
        let f = fixture(true);
        let snapshot = test_codec().encode(&sample_data(&["x"]), None).unwrap();
        f.remote.insert_encoded("snap.json.gz", Utc::now(), &snapshot);
        f.source.set_fail_export(true);

        let result = f
            .orchestrator
            .restore_backup("snap.json.gz", RestoreOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            result.safety_snapshot,
            SafetySnapshotOutcome::Failed { .. }
        ));
        assert_eq!(player_ids(&f.source), vec!["x"]);
    }

    #[tokio::test]
    async fn test_incompatible_schema_rejected_at_decode() {
        let f = fixture(true);
        f.remote
            .insert_snapshot("future.json.gz", Utc::now(), &snapshot_with_schema("2.0.0"));

        let options = RestoreOptions {
            create_backup_before_restore: false,
            ..Default::default()
        };
        let err = f
            .orchestrator
            .restore_backup("future.json.gz", options)
            .await
            .unwrap_err();

        assert_eq!(err.stage, RestoreStage::Decode);
        assert!(matches!(
            err.source,
            BackupError::SchemaIncompatible { .. }
        ));
        assert_eq!(player_ids(&f.source), vec!["p1", "p2"]);

        // 关闭校验后可以导入
        let options = RestoreOptions {
            validate_schema: false,
            create_backup_before_restore: false,
            ..Default::default()
        };
        let result = f
            .orchestrator
            .restore_backup("future.json.gz", options)
            .await
            .unwrap();
        assert_eq!(result.schema_version, "2.0.0");
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let f = fixture(true);
        let mut snapshot = test_codec().encode(&sample_data(&["x"]), None).unwrap();
        snapshot.metadata.content_hash = "0".repeat(64);
        f.remote.insert_encoded("tampered.json.gz", Utc::now(), &snapshot);

        let options = RestoreOptions {
            create_backup_before_restore: false,
            ..Default::default()
        };
        let err = f
            .orchestrator
            .restore_backup("tampered.json.gz", options)
            .await
            .unwrap_err();
        assert_eq!(err.stage, RestoreStage::Decode);
        assert!(matches!(err.source, BackupError::InvalidBackup(_)));
    }

    #[tokio::test]
    async fn test_restore_requires_auth() {
        let f = fixture(false);
        let err = f
            .orchestrator
            .restore_backup("any.json.gz", RestoreOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.stage, RestoreStage::Auth);
    }

    #[tokio::test]
    async fn test_restore_missing_file_fails_at_download() {
        let f = fixture(true);
        let options = RestoreOptions {
            create_backup_before_restore: false,
            ..Default::default()
        };
        let err = f
            .orchestrator
            .restore_backup("missing.json.gz", options)
            .await
            .unwrap_err();
        assert_eq!(err.stage, RestoreStage::Download);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_update_restarts_scheduler() {
        let f = fixture(true);
        assert!(!f.orchestrator.start().unwrap());
        assert!(!f.orchestrator.is_running());

        f.orchestrator
            .update_config(UpdateBackupConfigRequest {
                enabled: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!(f.orchestrator.is_running());

        f.orchestrator
            .update_config(UpdateBackupConfigRequest {
                auto_interval_minutes: Some(10),
                ..Default::default()
            })
            .unwrap();
        assert!(f.orchestrator.is_running());

        f.orchestrator
            .update_config(UpdateBackupConfigRequest {
                enabled: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert!(!f.orchestrator.is_running());

        let err = f
            .orchestrator
            .update_config(UpdateBackupConfigRequest {
                max_snapshots_to_keep: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, BackupError::ConfigError(_)));
        assert_eq!(f.orchestrator.config().unwrap().max_snapshots_to_keep, 5);

        f.orchestrator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_in_enables_and_starts() {
        let f = fixture(true);
        let config = f.orchestrator.on_signed_in().unwrap();
        assert!(config.enabled);
        assert!(f.orchestrator.is_running());
        f.orchestrator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_dirty_sets_pending_and_debounces() {
        let f = fixture(true);
        enable(&f.state);

        assert!(f.orchestrator.mark_dirty().unwrap());
        assert_eq!(f.state.last_backup().unwrap().status, BackupStatus::Pending);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(f.remote.uploaded_names().len(), 1);
        assert!(!f.state.is_dirty().unwrap());
    }

    #[tokio::test]
    async fn test_app_close_queues_when_dirty() {
        let f = fixture(true);
        assert!(f.orchestrator.on_app_close().await.unwrap().is_none());

        enable(&f.state);
        assert!(f.orchestrator.on_app_close().await.unwrap().is_none());

        f.state.set_dirty(true).unwrap();
        let receipt = f.orchestrator.on_app_close().await.unwrap().unwrap();
        match receipt {
            BackupReceipt::Queued { reason, .. } => assert_eq!(reason, QueueReason::AppClose),
            other => panic!("应当入队: {:?}", other),
        }
        assert_eq!(f.state.queue().unwrap().len(), 1);
        assert_eq!(f.remote.upload_attempts(), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let f = fixture(true);
        enable(&f.state);
        f.connectivity.set_online(false);
        f.orchestrator.create_backup(None).await.unwrap();
        f.state.set_dirty(true).unwrap();
        let device_id = f.state.device_id().unwrap();

        f.orchestrator.reset().unwrap();

        let state = f.orchestrator.state().unwrap();
        assert!(state.queue.is_empty());
        assert!(!state.dirty);
        assert!(!state.config.enabled);
        assert_eq!(state.last_backup.status, BackupStatus::Idle);
        assert_eq!(f.state.device_id().unwrap(), device_id);
    }

    #[tokio::test]
    async fn test_list_and_delete_require_auth() {
        let f = fixture(true);
        f.remote.insert_snapshot("a.json.gz", Utc::now(), b"a");
        assert_eq!(f.orchestrator.list_snapshots().await.unwrap().len(), 1);

        f.orchestrator.delete_snapshot("a.json.gz").await.unwrap();
        assert!(f.orchestrator.list_snapshots().await.unwrap().is_empty());

        f.auth.set_authenticated(false);
        assert!(matches!(
            f.orchestrator.list_snapshots().await,
            Err(BackupError::AuthFailed(_))
        ));
    }
}
