// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::backup::{EngineSettings, Environment, RetryPolicy};
use crate::store::ExportFilter;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 存储路径配置
    pub storage: StorageConfig,
    /// 备份引擎配置
    pub engine: EngineConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// 存储路径配置
///
/// 相对路径都基于 `data_dir`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 数据目录
    pub data_dir: PathBuf,
    /// 备份状态数据库
    pub state_db: PathBuf,
    /// 本地数据数据库
    pub local_db: PathBuf,
    /// 远程快照目录（本地目录模拟的远程存储）
    pub remote_dir: PathBuf,
    /// 登录会话文件
    pub session_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            state_db: PathBuf::from("backup_state.db"),
            local_db: PathBuf::from("local.db"),
            remote_dir: PathBuf::from("remote"),
            session_file: PathBuf::from("session.json"),
        }
    }
}

impl StorageConfig {
    /// 解析为基于数据目录的路径
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.resolve(&self.state_db)
    }

    pub fn local_db_path(&self) -> PathBuf {
        self.resolve(&self.local_db)
    }

    pub fn remote_dir_path(&self) -> PathBuf {
        self.resolve(&self.remote_dir)
    }

    pub fn session_file_path(&self) -> PathBuf {
        self.resolve(&self.session_file)
    }
}

/// 备份引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 应用名（出现在快照文件名与远程目录名中）
    pub app_name: String,
    pub app_version: String,
    pub environment: Environment,
    /// 防抖窗口（秒）
    pub debounce_secs: u64,
    /// 两次上传的最小间隔（秒）
    pub min_upload_interval_secs: u64,
    /// 退避基数（毫秒）
    pub backoff_base_ms: u64,
    /// 退避上限（毫秒）
    pub backoff_cap_ms: u64,
    /// 配额错误的退避上限（毫秒）
    pub quota_backoff_cap_ms: u64,
    /// 单个队列条目的最大尝试次数
    pub max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "SnapshotBackup".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: Environment::Production,
            debounce_secs: 30,
            min_upload_interval_secs: 60,
            backoff_base_ms: 2000,
            backoff_cap_ms: 32000,
            quota_backoff_cap_ms: 120000,
            max_attempts: 5,
        }
    }
}

impl EngineConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            anyhow::bail!("engine.app_name 不能为空");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("engine.max_attempts 必须大于 0");
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            anyhow::bail!("engine.backoff_base_ms 不能大于 backoff_cap_ms");
        }
        Ok(())
    }

    /// 转换为引擎参数
    pub fn to_settings(&self) -> EngineSettings {
        EngineSettings {
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            environment: self.environment,
            debounce: Duration::from_secs(self.debounce_secs),
            min_upload_interval: Duration::from_secs(self.min_upload_interval_secs),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay_ms: self.backoff_base_ms,
                max_delay_ms: self.backoff_cap_ms,
                quota_max_delay_ms: self.quota_backoff_cap_ms,
            },
            export_filter: ExportFilter::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("读取配置文件失败")?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.engine.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        // 确保父目录存在
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("创建配置目录失败")?;
        }

        fs::write(path, content)
            .await
            .context("写入配置文件失败")?;

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
