//! 上传节流器
//!
//! 保证同一进程内两次成功上传之间至少间隔 `min_interval`。
//! 上传前必须先取得 [`UploadPermit`]，许可在上传结束前一直占用上传槽位，
//! 并发触发的备份不会同时通过检查

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::Instant;

/// 上传节流器
#[derive(Debug)]
pub struct UploadThrottle {
    /// 最小上传间隔
    min_interval: Duration,
    /// 上次成功上传的时间
    last_upload: Mutex<Option<Instant>>,
    /// 上传槽位，同一时刻只有一个上传
    slot: AsyncMutex<()>,
}

/// 上传许可
///
/// 持有期间其它上传无法开始
#[derive(Debug)]
pub struct UploadPermit<'a> {
    throttle: &'a UploadThrottle,
    _slot: MutexGuard<'a, ()>,
}

impl UploadPermit<'_> {
    /// 记录本次上传成功
    pub fn record_success(&self) {
        self.throttle.record_success();
    }
}

impl UploadThrottle {
    /// 创建新的上传节流器
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_upload: Mutex::new(None),
            slot: AsyncMutex::new(()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// 距离允许下一次上传还需等待的时间
    pub fn remaining(&self) -> Duration {
        match *self.last_upload.lock() {
            Some(last) => self.min_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// 立即尝试取得上传许可
    ///
    /// 有上传正在进行或间隔未到时返回 None
    pub fn try_acquire(&self) -> Option<UploadPermit<'_>> {
        let slot = self.slot.try_lock().ok()?;
        if !self.remaining().is_zero() {
            return None;
        }
        Some(UploadPermit {
            throttle: self,
            _slot: slot,
        })
    }

    /// 等待直到取得上传许可
    pub async fn acquire(&self) -> UploadPermit<'_> {
        let slot = self.slot.lock().await;
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                break;
            }
            tracing::debug!("等待上传间隔: {:?}", remaining);
            tokio::time::sleep(remaining).await;
        }
        UploadPermit {
            throttle: self,
            _slot: slot,
        }
    }

    /// 记录一次成功上传
    pub fn record_success(&self) {
        *self.last_upload.lock() = Some(Instant::now());
    }

    /// 清除记录
    pub fn reset(&self) {
        *self.last_upload.lock() = None;
    }
}
