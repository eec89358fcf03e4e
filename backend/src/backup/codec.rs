//! 快照编解码
//!
//! 将本地导出数据序列化为 gzip 压缩的 JSON，计算 SHA-256 校验和，
//! 并在恢复时解压、校验、检查 schema 兼容性

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::Arc;

use super::error::BackupError;
use super::types::{EncodedSnapshot, Environment, SnapshotMetadata, BACKUP_SCHEMA_VERSION};
use crate::store::SnapshotData;

/// 快照文件扩展名
pub const SNAPSHOT_EXTENSION: &str = ".json.gz";

/// 解压后快照的最大字节数
pub const MAX_DECODED_BYTES: u64 = 256 * 1024 * 1024;

/// 压缩包内的快照内容
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    schema_version: String,
    app_version: String,
    device_id: String,
    environment: Environment,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    data: SnapshotData,
}

/// 解码后的快照
#[derive(Debug, Clone)]
pub struct DecodedSnapshot {
    pub schema_version: String,
    pub app_version: String,
    pub device_id: String,
    pub environment: Environment,
    pub timestamp: DateTime<Utc>,
    pub description: Option<String>,
    pub data: SnapshotData,
}

/// 快照编解码器
#[derive(Debug, Clone)]
pub struct SnapshotCodec {
    app_name: String,
    app_version: String,
    device_id: String,
    environment: Environment,
    schema_version: String,
    /// 最近一次生成的文件名前缀及同秒序号
    last_name: Arc<Mutex<(String, u32)>>,
}

impl SnapshotCodec {
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        device_id: impl Into<String>,
        environment: Environment,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            device_id: device_id.into(),
            environment,
            schema_version: BACKUP_SCHEMA_VERSION.to_string(),
            last_name: Arc::new(Mutex::new((String::new(), 0))),
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// 编码快照：序列化 → gzip → SHA-256
    pub fn encode(
        &self,
        data: &SnapshotData,
        description: Option<String>,
    ) -> Result<EncodedSnapshot, BackupError> {
        let timestamp = Utc::now();
        let envelope = SnapshotEnvelope {
            schema_version: self.schema_version.clone(),
            app_version: self.app_version.clone(),
            device_id: self.device_id.clone(),
            environment: self.environment,
            timestamp,
            description: description.clone(),
            data: data.clone(),
        };

        let json = serde_json::to_vec(&envelope)
            .map_err(|e| BackupError::CompressionFailed(format!("序列化快照失败: {}", e)))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| BackupError::CompressionFailed(e.to_string()))?;
        let bytes = encoder
            .finish()
            .map_err(|e| BackupError::CompressionFailed(e.to_string()))?;

        let metadata = SnapshotMetadata {
            schema_version: self.schema_version.clone(),
            app_version: self.app_version.clone(),
            device_id: self.device_id.clone(),
            environment: self.environment,
            timestamp,
            size_bytes: bytes.len() as u64,
            content_hash: content_hash(&bytes),
            compressed: true,
            description,
        };

        tracing::debug!(
            "快照已编码: 原始 {} 字节, 压缩后 {} 字节",
            json.len(),
            bytes.len()
        );

        Ok(EncodedSnapshot { bytes, metadata })
    }

    /// 解码快照：gunzip → JSON
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedSnapshot, BackupError> {
        self.decode_with_limit(bytes, MAX_DECODED_BYTES)
    }

    fn decode_with_limit(&self, bytes: &[u8], limit: u64) -> Result<DecodedSnapshot, BackupError> {
        // 多读一个字节用于判断是否超限
        let mut decoder = GzDecoder::new(bytes).take(limit + 1);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| BackupError::InvalidBackup(format!("解压失败: {}", e)))?;
        if json.len() as u64 > limit {
            return Err(BackupError::InvalidBackup(format!(
                "快照解压后超过 {} 字节上限",
                limit
            )));
        }

        let envelope: SnapshotEnvelope = serde_json::from_slice(&json)
            .map_err(|e| BackupError::InvalidBackup(format!("解析快照失败: {}", e)))?;

        Ok(DecodedSnapshot {
            schema_version: envelope.schema_version,
            app_version: envelope.app_version,
            device_id: envelope.device_id,
            environment: envelope.environment,
            timestamp: envelope.timestamp,
            description: envelope.description,
            data: envelope.data,
        })
    }

    /// 校验下载字节与元数据中的哈希是否一致
    pub fn verify(&self, bytes: &[u8], metadata: &SnapshotMetadata) -> Result<(), BackupError> {
        let actual = content_hash(bytes);
        if !actual.eq_ignore_ascii_case(&metadata.content_hash) {
            return Err(BackupError::InvalidBackup(format!(
                "校验和不匹配: 期望 {}, 实际 {}",
                metadata.content_hash, actual
            )));
        }
        Ok(())
    }

    /// 检查远程快照的 schema 版本能否导入
    pub fn check_schema(&self, remote: &str) -> Result<(), BackupError> {
        if is_schema_compatible(remote, &self.schema_version) {
            Ok(())
        } else {
            Err(BackupError::SchemaIncompatible {
                remote: remote.to_string(),
                local: self.schema_version.clone(),
            })
        }
    }

    /// 生成远程文件名（本地时间）
    ///
    /// 同一秒内多次生成时追加 `-1`、`-2` 序号，远程按文件名覆盖
    pub fn file_name(&self) -> String {
        self.unique_file_name_at(Local::now().naive_local())
    }

    fn unique_file_name_at(&self, at: NaiveDateTime) -> String {
        let name = self.file_name_at(at);
        let mut last = self.last_name.lock();
        if last.0 == name {
            last.1 += 1;
            let stem = name.strip_suffix(SNAPSHOT_EXTENSION).unwrap_or(&name);
            format!("{}-{}{}", stem, last.1, SNAPSHOT_EXTENSION)
        } else {
            *last = (name.clone(), 0);
            name
        }
    }

    /// 生成指定时间的远程文件名
    ///
    /// 格式: `{app}_{device}_{env}_backup_v{schema}_{DDMMYYYY-HHMMSS}.json.gz`
    pub fn file_name_at(&self, at: NaiveDateTime) -> String {
        format!(
            "{}_{}_{}_backup_v{}_{}{}",
            self.app_name,
            self.device_id,
            self.environment,
            self.schema_version.replace('.', "_"),
            at.format("%d%m%Y-%H%M%S"),
            SNAPSHOT_EXTENSION
        )
    }
}

/// 计算 SHA-256 十六进制摘要
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// schema 兼容性：主版本相同且远程次版本不高于本地
pub fn is_schema_compatible(remote: &str, local: &str) -> bool {
    match (parse_major_minor(remote), parse_major_minor(local)) {
        (Some((remote_major, remote_minor)), Some((local_major, local_minor))) => {
            remote_major == local_major && remote_minor <= local_minor
        }
        _ => false,
    }
}

fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map(|p| p.parse().ok()).unwrap_or(Some(0))?;
    Some((major, minor))
}
