// 本地数据存储模块
//
// 定义快照导出/导入的协作方接口，以及基于 SQLite 的实现

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::backup::BackupError;

pub use sqlite::SqliteLocalStore;

/// 玩家
pub const COLLECTION_PLAYERS: &str = "players";
/// 游戏模板
pub const COLLECTION_GAME_MODELS: &str = "gameModels";
/// 游戏
pub const COLLECTION_GAMES: &str = "games";
/// 游戏参与者
pub const COLLECTION_GAME_PLAYERS: &str = "gamePlayers";
/// 回合
pub const COLLECTION_TURNS: &str = "turns";
/// 回合得分
pub const COLLECTION_TURN_SCORES: &str = "turnScores";
/// 应用设置
pub const COLLECTION_SETTINGS: &str = "settings";

/// 快照中包含的全部集合（按导入顺序）
pub const SNAPSHOT_COLLECTIONS: [&str; 7] = [
    COLLECTION_PLAYERS,
    COLLECTION_GAME_MODELS,
    COLLECTION_GAMES,
    COLLECTION_GAME_PLAYERS,
    COLLECTION_TURNS,
    COLLECTION_TURN_SCORES,
    COLLECTION_SETTINGS,
];

/// 快照数据：集合名 → 记录列表
///
/// 每条记录是一个带 `id` 字段的 JSON 对象
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotData {
    pub collections: BTreeMap<String, Vec<Value>>,
}

impl SnapshotData {
    /// 获取集合记录（不存在时为空）
    pub fn records(&self, collection: &str) -> &[Value] {
        self.collections
            .get(collection)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// 总记录数
    pub fn total_records(&self) -> usize {
        self.collections.values().map(|v| v.len()).sum()
    }
}

/// 导出过滤选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportFilter {
    /// 包含进行中的游戏
    pub include_in_progress: bool,
    /// 包含已结束的游戏
    pub include_finished: bool,
    /// 包含玩家
    pub include_players: bool,
    /// 包含游戏模板
    pub include_models: bool,
}

impl Default for ExportFilter {
    fn default() -> Self {
        Self {
            include_in_progress: true,
            include_finished: true,
            include_players: true,
            include_models: true,
        }
    }
}

/// 导入模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// 合并：已存在的记录（按 id）保持不变
    Merge,
    /// 替换：先清空所有本地集合再导入
    #[default]
    Replace,
}

impl std::fmt::Display for ImportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportMode::Merge => write!(f, "merge"),
            ImportMode::Replace => write!(f, "replace"),
        }
    }
}

/// 每个集合实际导入的记录数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportedCounts(pub BTreeMap<String, usize>);

impl ImportedCounts {
    pub fn get(&self, collection: &str) -> usize {
        self.0.get(collection).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

/// 本地快照源
///
/// 导出与导入都在本地存储自己的事务语义内完成，导入失败时不得留下部分写入
#[async_trait]
pub trait LocalSnapshotSource: Send + Sync {
    /// 导出本地数据
    async fn export_all(&self, filter: &ExportFilter) -> Result<SnapshotData, BackupError>;

    /// 导入快照数据，返回每个集合导入的记录数
    async fn import_all(
        &self,
        data: &SnapshotData,
        mode: ImportMode,
    ) -> Result<ImportedCounts, BackupError>;
}

/// 提取记录 id（支持字符串与数字）
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
