//! 备份事件模块
//!
//! 定义备份相关的广播事件（状态变更、上传结果、通知）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::types::{BackupStatus, QueueReason};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 持久化状态变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChange {
    Config,
    Dirty,
    LastBackup,
    Queue,
    Folder,
    Reset,
}

/// 通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyLevel {
    Success,
    Error,
}

/// 备份事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackupEvent {
    /// 持久化状态变更
    StateChanged {
        change: StateChange,
        /// 脏标记变更时携带新值
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dirty: Option<bool>,
    },
    /// 备份上传成功
    BackupSucceeded {
        file_name: String,
        remote_id: String,
        size: u64,
        from_queue: bool,
        timestamp: DateTime<Utc>,
    },
    /// 备份已加入重试队列
    BackupQueued {
        entry_id: String,
        file_name: String,
        reason: QueueReason,
    },
    /// 备份失败
    BackupFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        error: String,
        status: BackupStatus,
    },
    /// 队列条目达到最大尝试次数被放弃
    EntryAbandoned {
        entry_id: String,
        file_name: String,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    /// 恢复完成
    RestoreCompleted { file_id: String, total_imported: usize },
    /// 用户通知（受 notify_on_success / notify_on_error 控制）
    Notify { level: NotifyLevel, message: String },
}

impl BackupEvent {
    /// 事件名称
    pub fn event_type(&self) -> &'static str {
        match self {
            BackupEvent::StateChanged { .. } => "state_changed",
            BackupEvent::BackupSucceeded { .. } => "backup_succeeded",
            BackupEvent::BackupQueued { .. } => "backup_queued",
            BackupEvent::BackupFailed { .. } => "backup_failed",
            BackupEvent::EntryAbandoned { .. } => "entry_abandoned",
            BackupEvent::RestoreCompleted { .. } => "restore_completed",
            BackupEvent::Notify { .. } => "notify",
        }
    }
}

/// 事件总线
///
/// 没有订阅者时发送会失败，这里直接忽略
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// 发送事件
    pub fn emit(&self, event: BackupEvent) {
        tracing::trace!("备份事件: {}", event.event_type());
        let _ = self.tx.send(event);
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
