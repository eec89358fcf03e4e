//! 备份调度器
//!
//! 负责：
//! - 按 `auto_interval_minutes` 周期检查脏标记并触发备份
//! - 每个周期处理一次重试队列
//! - 网络从离线恢复为在线时立即处理重试队列

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::error::BackupError;
use super::network::Connectivity;
use super::persistence::PersistedState;
use super::types::{BackupReceipt, DrainReport};
use crate::auth::AuthProvider;

/// 备份触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// 定时轮询
    Poll,
    /// 关键操作防抖
    Debounce,
    /// 手动触发
    Manual,
    /// 恢复前的安全快照
    SafetySnapshot,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Poll => write!(f, "poll"),
            TriggerSource::Debounce => write!(f, "debounce"),
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::SafetySnapshot => write!(f, "safety_snapshot"),
        }
    }
}

/// 备份执行方（由编排器实现，调度器与脏标记跟踪器通过弱引用回调）
#[async_trait]
pub trait BackupRunner: Send + Sync {
    /// 执行一次备份
    async fn run_backup(&self, trigger: TriggerSource) -> Result<BackupReceipt, BackupError>;

    /// 处理重试队列
    async fn drain_queue(&self) -> DrainReport;
}

/// 备份调度器
pub struct Scheduler {
    runner: Weak<dyn BackupRunner>,
    state: Arc<PersistedState>,
    auth: Arc<dyn AuthProvider>,
    connectivity: Arc<Connectivity>,
    /// 周期定时器
    timer: Mutex<Option<CancellationToken>>,
    /// 网络状态监听
    watcher: Mutex<Option<CancellationToken>>,
}

impl Scheduler {
    pub fn new(
        runner: Weak<dyn BackupRunner>,
        state: Arc<PersistedState>,
        auth: Arc<dyn AuthProvider>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        Self {
            runner,
            state,
            auth,
            connectivity,
            timer: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    /// 启动周期定时器
    ///
    /// 已在运行时先停止，再按当前配置重新启动
    pub fn start(&self) -> Result<(), BackupError> {
        let config = self.state.config()?;
        config.validate()?;

        let period = Duration::from_secs(u64::from(config.auto_interval_minutes) * 60);
        let token = CancellationToken::new();

        if let Some(previous) = self.timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let runner = self.runner.clone();
        let state = self.state.clone();
        let auth = self.auth.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(runner) = runner.upgrade() else { break };
                        on_tick(runner.as_ref(), &state, auth.as_ref()).await;
                    }
                }
            }
            tracing::debug!("周期定时器已退出");
        });

        tracing::info!(
            "调度器已启动: 每 {} 分钟检查一次",
            config.auto_interval_minutes
        );
        Ok(())
    }

    /// 停止周期定时器（未运行时无操作）
    ///
    /// 已发出的上传会继续完成
    pub fn stop(&self) {
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
            tracing::info!("调度器已停止");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// 监听网络状态，离线→在线时处理重试队列（幂等）
    pub fn watch_connectivity(&self) {
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *guard = Some(token.clone());

        let runner = self.runner.clone();
        let mut rx = self.connectivity.subscribe();

        tokio::spawn(async move {
            let mut was_online = *rx.borrow_and_update();
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *rx.borrow_and_update();
                        if online && !was_online {
                            let Some(runner) = runner.upgrade() else { break };
                            tracing::info!("网络已恢复，处理重试队列");
                            let report = runner.drain_queue().await;
                            tracing::debug!("网络恢复后队列处理结果: {:?}", report);
                        }
                        was_online = online;
                    }
                }
            }
        });
    }

    /// 停止所有后台任务
    pub fn shutdown(&self) {
        self.stop();
        if let Some(token) = self.watcher.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 周期回调：有未备份修改且已登录时备份，然后处理队列
///
/// 错误只记录日志
async fn on_tick(runner: &dyn BackupRunner, state: &PersistedState, auth: &dyn AuthProvider) {
    let dirty = match state.is_dirty() {
        Ok(dirty) => dirty,
        Err(e) => {
            tracing::warn!("读取脏标记失败: {:#}", e);
            false
        }
    };

    if dirty && auth.is_authenticated() {
        match runner.run_backup(TriggerSource::Poll).await {
            Ok(receipt) => tracing::debug!("定时备份完成: {}", receipt.file_name()),
            Err(e) => tracing::warn!("定时备份失败: {}", e),
        }
    }

    let report = runner.drain_queue().await;
    tracing::debug!("定时队列处理结果: {:?}", report);
}
