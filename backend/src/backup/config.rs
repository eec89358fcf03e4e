//! 备份配置数据结构

use serde::{Deserialize, Serialize};

use super::error::BackupError;

/// 备份配置（用户可修改，持久化在 PersistedState 中）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// 是否启用自动备份
    pub enabled: bool,
    /// 自动备份间隔（分钟）
    pub auto_interval_minutes: u32,
    /// 远程保留的快照数量
    pub max_snapshots_to_keep: u32,
    /// 应用关闭时备份
    pub backup_on_close: bool,
    /// 关键操作后备份（防抖触发）
    pub backup_on_critical_actions: bool,
    /// 成功时通知
    pub notify_on_success: bool,
    /// 失败时通知
    pub notify_on_error: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            // 登录前默认关闭
            enabled: false,
            auto_interval_minutes: 30,
            max_snapshots_to_keep: 5,
            backup_on_close: true,
            backup_on_critical_actions: true,
            notify_on_success: false,
            notify_on_error: true,
        }
    }
}

impl BackupConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.auto_interval_minutes == 0 {
            return Err(BackupError::ConfigError(
                "auto_interval_minutes 必须大于 0".to_string(),
            ));
        }
        if self.max_snapshots_to_keep == 0 {
            return Err(BackupError::ConfigError(
                "max_snapshots_to_keep 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 应用更新请求，返回新配置
    pub fn apply(&self, request: &UpdateBackupConfigRequest) -> BackupConfig {
        let mut updated = self.clone();
        if let Some(v) = request.enabled {
            updated.enabled = v;
        }
        if let Some(v) = request.auto_interval_minutes {
            updated.auto_interval_minutes = v;
        }
        if let Some(v) = request.max_snapshots_to_keep {
            updated.max_snapshots_to_keep = v;
        }
        if let Some(v) = request.backup_on_close {
            updated.backup_on_close = v;
        }
        if let Some(v) = request.backup_on_critical_actions {
            updated.backup_on_critical_actions = v;
        }
        if let Some(v) = request.notify_on_success {
            updated.notify_on_success = v;
        }
        if let Some(v) = request.notify_on_error {
            updated.notify_on_error = v;
        }
        updated
    }

    /// 与调度相关的字段是否发生变化（需要重启调度器）
    pub fn timing_changed(&self, other: &BackupConfig) -> bool {
        self.enabled != other.enabled || self.auto_interval_minutes != other.auto_interval_minutes
    }
}

/// 更新备份配置请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateBackupConfigRequest {
    pub enabled: Option<bool>,
    pub auto_interval_minutes: Option<u32>,
    pub max_snapshots_to_keep: Option<u32>,
    pub backup_on_close: Option<bool>,
    pub backup_on_critical_actions: Option<bool>,
    pub notify_on_success: Option<bool>,
    pub notify_on_error: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BackupConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.auto_interval_minutes, 30);
        assert_eq!(config.max_snapshots_to_keep, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_merges_defaults() {
        let config: BackupConfig = serde_json::from_str(r#"{"enabled":true,"max_snapshots_to_keep":3}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_snapshots_to_keep, 3);
        assert_eq!(config.auto_interval_minutes, 30);
        assert!(config.notify_on_error);
    }

    #[test]
    fn test_apply_and_timing_changed() {
        let config = BackupConfig::default();

        let request = UpdateBackupConfigRequest {
            notify_on_success: Some(true),
            ..Default::default()
        };
        let updated = config.apply(&request);
        assert!(updated.notify_on_success);
        assert!(!config.timing_changed(&updated));

        let request = UpdateBackupConfigRequest {
            auto_interval_minutes: Some(10),
            ..Default::default()
        };
        let updated = config.apply(&request);
        assert!(config.timing_changed(&updated));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = BackupConfig {
            auto_interval_minutes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BackupConfig {
            max_snapshots_to_keep: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
