//! 测试用的内存协作方

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::auth::{AuthProvider, AuthState, Credentials};
use crate::backup::{
    BackupError, BackupReceipt, BackupRunner, DrainReport, EncodedSnapshot, Environment,
    SnapshotCodec, SnapshotMetadata, TriggerSource,
};
use crate::remote::{RemoteSnapshot, RemoteStore, UploadReceipt};
use crate::store::{
    record_id, ExportFilter, ImportMode, ImportedCounts, LocalSnapshotSource, SnapshotData,
};

pub const TEST_FOLDER: &str = "test-folder";

/// 测试用编解码器
pub fn test_codec() -> SnapshotCodec {
    SnapshotCodec::new("Test", "0.1.0", "device_test", Environment::Test)
}

/// 以 tag 区分内容的快照
pub fn encoded_snapshot(tag: &str) -> EncodedSnapshot {
    let mut data = SnapshotData::default();
    data.collections
        .insert("players".to_string(), vec![json!({"id": tag, "name": tag})]);
    test_codec().encode(&data, Some(tag.to_string())).unwrap()
}

/// 示例数据
pub fn sample_data(players: &[&str]) -> SnapshotData {
    let mut data = SnapshotData::default();
    data.collections.insert(
        "players".to_string(),
        players
            .iter()
            .map(|id| json!({"id": id, "name": format!("player {}", id)}))
            .collect(),
    );
    data
}

// ==================== 远程存储 ====================

#[derive(Debug, Clone)]
struct StoredSnapshot {
    bytes: Vec<u8>,
    created_at: DateTime<Utc>,
    metadata: Option<SnapshotMetadata>,
}

#[derive(Default)]
struct RemoteInner {
    files: BTreeMap<String, StoredSnapshot>,
    /// 成功上传记录（文件名, 时间）
    upload_log: Vec<(String, Instant)>,
    upload_attempts: usize,
    /// 按文件名的剩余失败次数
    scripted_failures: HashMap<String, (usize, BackupError)>,
    always_fail: Option<BackupError>,
    download_failure: Option<BackupError>,
    delete_failures: HashSet<String>,
    ensure_folder_calls: usize,
    last_created_at: Option<DateTime<Utc>>,
    /// 每次上传前的延迟
    upload_delay: Option<std::time::Duration>,
}

/// 可编排失败的内存远程存储
#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<RemoteInner>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接放入一个快照
    pub fn insert_snapshot(&self, name: &str, created_at: DateTime<Utc>, bytes: &[u8]) {
        self.inner.lock().files.insert(
            name.to_string(),
            StoredSnapshot {
                bytes: bytes.to_vec(),
                created_at,
                metadata: None,
            },
        );
    }

    /// 放入带元数据的快照
    pub fn insert_encoded(&self, name: &str, created_at: DateTime<Utc>, snapshot: &EncodedSnapshot) {
        self.inner.lock().files.insert(
            name.to_string(),
            StoredSnapshot {
                bytes: snapshot.bytes.clone(),
                created_at,
                metadata: Some(snapshot.metadata.clone()),
            },
        );
    }

    /// 指定文件名的接下来 `times` 次上传失败
    pub fn fail_next_uploads(&self, name: &str, times: usize, err: BackupError) {
        self.inner
            .lock()
            .scripted_failures
            .insert(name.to_string(), (times, err));
    }

    /// 所有上传失败（None 恢复正常）
    pub fn fail_all_uploads(&self, err: Option<BackupError>) {
        self.inner.lock().always_fail = err;
    }

    /// 让每次上传耗时 `delay`
    pub fn set_upload_delay(&self, delay: Option<std::time::Duration>) {
        self.inner.lock().upload_delay = delay;
    }

    pub fn fail_downloads(&self, err: Option<BackupError>) {
        self.inner.lock().download_failure = err;
    }

    pub fn fail_delete(&self, name: &str) {
        self.inner.lock().delete_failures.insert(name.to_string());
    }

    /// 远程现有的文件名（有序）
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().files.keys().cloned().collect()
    }

    pub fn upload_log(&self) -> Vec<(String, Instant)> {
        self.inner.lock().upload_log.clone()
    }

    /// 成功上传的文件名（按上传顺序）
    pub fn uploaded_names(&self) -> Vec<String> {
        self.upload_log().into_iter().map(|(name, _)| name).collect()
    }

    pub fn upload_attempts(&self) -> usize {
        self.inner.lock().upload_attempts
    }

    pub fn ensure_folder_calls(&self) -> usize {
        self.inner.lock().ensure_folder_calls
    }

    pub fn bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(name).map(|s| s.bytes.clone())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn ensure_folder(&self) -> Result<String, BackupError> {
        self.inner.lock().ensure_folder_calls += 1;
        Ok(TEST_FOLDER.to_string())
    }

    async fn upload(
        &self,
        _folder_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &SnapshotMetadata,
    ) -> Result<UploadReceipt, BackupError> {
        let delay = self.inner.lock().upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        inner.upload_attempts += 1;

        if let Some(err) = inner.always_fail.clone() {
            return Err(err);
        }
        if let Some((remaining, err)) = inner.scripted_failures.get_mut(file_name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err.clone());
            }
        }

        // 保证创建时间严格递增
        let mut created_at = Utc::now();
        if let Some(last) = inner.last_created_at {
            if created_at <= last {
                created_at = last + ChronoDuration::milliseconds(1);
            }
        }
        inner.last_created_at = Some(created_at);

        inner.files.insert(
            file_name.to_string(),
            StoredSnapshot {
                bytes: bytes.to_vec(),
                created_at,
                metadata: Some(metadata.clone()),
            },
        );
        inner
            .upload_log
            .push((file_name.to_string(), Instant::now()));

        Ok(UploadReceipt {
            remote_id: file_name.to_string(),
            size: bytes.len() as u64,
        })
    }

    async fn list(&self, _folder_id: &str) -> Result<Vec<RemoteSnapshot>, BackupError> {
        let inner = self.inner.lock();
        let mut list: Vec<_> = inner
            .files
            .iter()
            .map(|(name, s)| RemoteSnapshot {
                remote_id: name.clone(),
                name: name.clone(),
                created_at: s.created_at,
                size: s.bytes.len() as u64,
                metadata: s.metadata.clone(),
            })
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn download(&self, remote_id: &str) -> Result<Vec<u8>, BackupError> {
        let inner = self.inner.lock();
        if let Some(err) = inner.download_failure.clone() {
            return Err(err);
        }
        inner
            .files
            .get(remote_id)
            .map(|s| s.bytes.clone())
            .ok_or_else(|| BackupError::FolderNotFound(remote_id.to_string()))
    }

    async fn delete(&self, remote_id: &str) -> Result<(), BackupError> {
        let mut inner = self.inner.lock();
        if inner.delete_failures.contains(remote_id) {
            return Err(BackupError::NetworkError(format!("删除失败: {}", remote_id)));
        }
        inner.files.remove(remote_id);
        Ok(())
    }

    async fn stat(&self, remote_id: &str) -> Result<Option<RemoteSnapshot>, BackupError> {
        let inner = self.inner.lock();
        Ok(inner.files.get(remote_id).map(|s| RemoteSnapshot {
            remote_id: remote_id.to_string(),
            name: remote_id.to_string(),
            created_at: s.created_at,
            size: s.bytes.len() as u64,
            metadata: s.metadata.clone(),
        }))
    }
}

// ==================== 认证 ====================

/// 可切换登录状态的认证提供方
pub struct SwitchableAuth {
    authenticated: AtomicBool,
    token_error: Mutex<Option<BackupError>>,
    state_tx: watch::Sender<AuthState>,
}

impl SwitchableAuth {
    pub fn new(authenticated: bool) -> Self {
        let (state_tx, _) = watch::channel(AuthState {
            is_authenticated: authenticated,
            ..Default::default()
        });
        Self {
            authenticated: AtomicBool::new(authenticated),
            token_error: Mutex::new(None),
            state_tx,
        }
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
        self.state_tx.send_replace(AuthState {
            is_authenticated: authenticated,
            ..Default::default()
        });
    }

    /// 让 get_token 返回指定错误
    pub fn fail_token(&self, err: Option<BackupError>) {
        *self.token_error.lock() = err;
    }
}

#[async_trait]
impl AuthProvider for SwitchableAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn auth_state(&self) -> AuthState {
        self.state_tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    async fn get_token(&self) -> Result<String, BackupError> {
        if !self.is_authenticated() {
            return Err(BackupError::AuthFailed("未登录".to_string()));
        }
        if let Some(err) = self.token_error.lock().clone() {
            return Err(err);
        }
        Ok("test-token".to_string())
    }

    async fn sign_in(&self, credentials: Credentials) -> Result<AuthState, BackupError> {
        self.set_authenticated(true);
        Ok(AuthState {
            is_authenticated: true,
            user_email: credentials.user_email,
            expires_at: None,
        })
    }

    async fn sign_out(&self) -> Result<(), BackupError> {
        self.set_authenticated(false);
        Ok(())
    }
}

// ==================== 本地数据源 ====================

/// 内存本地数据源，导入失败时不修改数据
#[derive(Default)]
pub struct MemorySnapshotSource {
    data: Mutex<SnapshotData>,
    fail_export: AtomicBool,
    fail_import: AtomicBool,
    export_calls: AtomicUsize,
}

impl MemorySnapshotSource {
    pub fn new(data: SnapshotData) -> Self {
        Self {
            data: Mutex::new(data),
            ..Default::default()
        }
    }

    pub fn data(&self) -> SnapshotData {
        self.data.lock().clone()
    }

    pub fn set_fail_export(&self, fail: bool) {
        self.fail_export.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_import(&self, fail: bool) {
        self.fail_import.store(fail, Ordering::SeqCst);
    }

    pub fn export_calls(&self) -> usize {
        self.export_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalSnapshotSource for MemorySnapshotSource {
    async fn export_all(&self, _filter: &ExportFilter) -> Result<SnapshotData, BackupError> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_export.load(Ordering::SeqCst) {
            return Err(BackupError::Unknown("导出失败".to_string()));
        }
        Ok(self.data.lock().clone())
    }

    async fn import_all(
        &self,
        data: &SnapshotData,
        mode: ImportMode,
    ) -> Result<ImportedCounts, BackupError> {
        if self.fail_import.load(Ordering::SeqCst) {
            return Err(BackupError::Unknown("导入失败".to_string()));
        }

        let mut current = self.data.lock();
        let mut next = match mode {
            ImportMode::Replace => SnapshotData::default(),
            ImportMode::Merge => current.clone(),
        };

        let mut counts = ImportedCounts::default();
        for (collection, records) in &data.collections {
            let target = next.collections.entry(collection.clone()).or_default();
            let mut existing: HashSet<String> = target.iter().filter_map(record_id).collect();
            let mut imported = 0;
            for record in records {
                let id = record_id(record)
                    .ok_or_else(|| BackupError::InvalidBackup("记录缺少 id".to_string()))?;
                if existing.insert(id) {
                    target.push(record.clone());
                    imported += 1;
                }
            }
            counts.0.insert(collection.clone(), imported);
        }

        *current = next;
        Ok(counts)
    }
}

// ==================== 备份执行方 ====================

/// 记录调用的备份执行方
#[derive(Default)]
pub struct CountingRunner {
    triggers: Mutex<Vec<TriggerSource>>,
    drains: AtomicUsize,
    /// 为 true 时 run_backup 返回错误
    failing: AtomicBool,
}

impl CountingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_count(&self) -> usize {
        self.triggers.lock().len()
    }

    pub fn triggers(&self) -> Vec<TriggerSource> {
        self.triggers.lock().clone()
    }

    pub fn drain_count(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackupRunner for CountingRunner {
    async fn run_backup(&self, trigger: TriggerSource) -> Result<BackupReceipt, BackupError> {
        self.triggers.lock().push(trigger);
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackupError::NetworkError("模拟备份失败".to_string()));
        }
        Ok(BackupReceipt::Uploaded {
            file_name: format!("{}.json.gz", trigger),
            remote_id: trigger.to_string(),
            size: 0,
            timestamp: Utc::now(),
        })
    }

    async fn drain_queue(&self) -> DrainReport {
        self.drains.fetch_add(1, Ordering::SeqCst);
        DrainReport::default()
    }
}
