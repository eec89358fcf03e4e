//! 脏标记跟踪
//!
//! 本地数据变更时置脏，并在满足条件时启动防抖定时器；
//! 窗口内的重复调用会重置定时器，不会叠加

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::BackupError;
use super::persistence::PersistedState;
use super::scheduler::{BackupRunner, TriggerSource};
use crate::auth::AuthProvider;

/// 脏标记跟踪器
pub struct DirtyTracker {
    state: Arc<PersistedState>,
    auth: Arc<dyn AuthProvider>,
    runner: Weak<dyn BackupRunner>,
    /// 防抖窗口
    debounce: Duration,
    /// 当前等待中的防抖定时器
    pending: Mutex<Option<CancellationToken>>,
}

impl DirtyTracker {
    pub fn new(
        state: Arc<PersistedState>,
        auth: Arc<dyn AuthProvider>,
        runner: Weak<dyn BackupRunner>,
        debounce: Duration,
    ) -> Self {
        Self {
            state,
            auth,
            runner,
            debounce,
            pending: Mutex::new(None),
        }
    }

    /// 标记本地数据已修改
    ///
    /// 返回是否启动了防抖定时器
    pub fn mark_dirty(&self) -> Result<bool, BackupError> {
        self.state.set_dirty(true)?;

        let config = self.state.config()?;
        if !(config.enabled && config.backup_on_critical_actions && self.auth.is_authenticated()) {
            return Ok(false);
        }

        self.arm();
        Ok(true)
    }

    /// 启动（或重置）防抖定时器
    fn arm(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.pending.lock().replace(token.clone()) {
            previous.cancel();
        }

        let runner = self.runner.clone();
        let delay = self.debounce;
        let fired = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    fired.cancel();
                    let Some(runner) = runner.upgrade() else { return };
                    tracing::debug!("防抖窗口结束，触发备份");
                    if let Err(e) = runner.run_backup(TriggerSource::Debounce).await {
                        tracing::warn!("防抖备份失败: {}", e);
                    }
                }
            }
        });

        tracing::debug!("防抖定时器已启动: {:?}", self.debounce);
    }

    /// 是否有等待中的防抖定时器
    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|token| !token.is_cancelled())
            .unwrap_or(false)
    }

    /// 取消等待中的防抖定时器
    pub fn cancel(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
    }

    /// 无条件清除脏标记（恢复成功后）
    pub fn clear_dirty(&self) -> Result<(), BackupError> {
        self.state.set_dirty(false)?;
        Ok(())
    }

    /// 仅当期间没有新的修改时清除脏标记（上传成功后）
    pub fn clear_dirty_if_unchanged(&self, generation: u64) -> Result<bool, BackupError> {
        Ok(self.state.clear_dirty_if_generation(generation)?)
    }

    pub fn is_dirty(&self) -> Result<bool, BackupError> {
        Ok(self.state.is_dirty()?)
    }

    pub fn generation(&self) -> Result<u64, BackupError> {
        Ok(self.state.dirty_generation()?)
    }
}

impl Drop for DirtyTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}
