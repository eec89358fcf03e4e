//! 基于 SQLite 的本地数据存储
//!
//! 所有集合保存在同一张 `records` 表中，记录体为 JSON

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

use super::{
    record_id, ExportFilter, ImportMode, ImportedCounts, LocalSnapshotSource, SnapshotData,
    COLLECTION_GAMES, COLLECTION_GAME_MODELS, COLLECTION_GAME_PLAYERS, COLLECTION_PLAYERS,
    COLLECTION_SETTINGS, COLLECTION_TURNS, COLLECTION_TURN_SCORES, SNAPSHOT_COLLECTIONS,
};
use crate::backup::BackupError;

/// 游戏进行中
const GAME_IN_PROGRESS: &str = "IN_PROGRESS";
/// 游戏已结束
const GAME_FINISHED: &str = "FINISHED";

/// SQLite 本地存储
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLocalStore")
            .field("conn", &"<Connection>")
            .finish()
    }
}

impl SqliteLocalStore {
    /// 打开（或创建）本地数据库
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("打开本地数据库失败: {:?}", db_path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_database()?;

        tracing::info!("本地数据库已打开: {:?}", db_path);
        Ok(store)
    }

    /// 内存数据库
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_database()?;
        Ok(store)
    }

    fn init_database(&self) -> Result<()> {
        self.conn.lock().execute(
            "-- ============================================
            -- 表: records (本地数据记录表)
            -- 描述: 各集合的记录，记录体为 JSON
            -- ============================================
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,               -- 集合名
                id TEXT NOT NULL,                       -- 记录ID
                body TEXT NOT NULL,                     -- JSON 记录体
                PRIMARY KEY (collection, id)
            )",
            [],
        )?;
        Ok(())
    }

    /// 写入（或覆盖）一条记录
    pub fn put(&self, collection: &str, record: &Value) -> Result<()> {
        let id = record_id(record).ok_or_else(|| anyhow!("记录缺少 id 字段"))?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO records (collection, id, body) VALUES (?1, ?2, ?3)",
            params![collection, id, serde_json::to_string(record)?],
        )?;
        Ok(())
    }

    /// 读取一条记录
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let body: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// 集合中的全部记录（包括软删除的）
    pub fn list(&self, collection: &str) -> Result<Vec<Value>> {
        let conn = self.conn.lock();
        load_collection(&conn, collection)
    }

    /// 集合中的记录数
    pub fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn export_filtered(&self, filter: &ExportFilter) -> Result<SnapshotData> {
        let conn = self.conn.lock();
        let live = |collection: &str| -> Result<Vec<Value>> {
            Ok(load_collection(&conn, collection)?
                .into_iter()
                .filter(|r| !is_deleted(r))
                .collect())
        };

        let mut data = SnapshotData::default();

        let players = if filter.include_players {
            live(COLLECTION_PLAYERS)?
        } else {
            Vec::new()
        };
        let models = if filter.include_models {
            live(COLLECTION_GAME_MODELS)?
        } else {
            Vec::new()
        };

        let games: Vec<Value> = live(COLLECTION_GAMES)?
            .into_iter()
            .filter(|g| match g.get("status").and_then(Value::as_str) {
                Some(GAME_IN_PROGRESS) => filter.include_in_progress,
                Some(GAME_FINISHED) => filter.include_finished,
                _ => true,
            })
            .collect();
        let game_ids: HashSet<String> = games.iter().filter_map(record_id).collect();

        // 只导出所选游戏的关联数据
        let belongs_to = |records: Vec<Value>, field: &str, ids: &HashSet<String>| -> Vec<Value> {
            records
                .into_iter()
                .filter(|r| {
                    r.get(field)
                        .and_then(value_as_id)
                        .map(|id| ids.contains(&id))
                        .unwrap_or(false)
                })
                .collect()
        };

        let game_players = belongs_to(live(COLLECTION_GAME_PLAYERS)?, "gameId", &game_ids);
        let turns = belongs_to(live(COLLECTION_TURNS)?, "gameId", &game_ids);
        let turn_ids: HashSet<String> = turns.iter().filter_map(record_id).collect();
        let turn_scores = belongs_to(live(COLLECTION_TURN_SCORES)?, "turnId", &turn_ids);
        let settings = live(COLLECTION_SETTINGS)?;

        for (collection, records) in [
            (COLLECTION_PLAYERS, players),
            (COLLECTION_GAME_MODELS, models),
            (COLLECTION_GAMES, games),
            (COLLECTION_GAME_PLAYERS, game_players),
            (COLLECTION_TURNS, turns),
            (COLLECTION_TURN_SCORES, turn_scores),
            (COLLECTION_SETTINGS, settings),
        ] {
            data.collections.insert(collection.to_string(), records);
        }

        Ok(data)
    }

    fn import_transaction(&self, data: &SnapshotData, mode: ImportMode) -> Result<ImportedCounts> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if mode == ImportMode::Replace {
            for collection in SNAPSHOT_COLLECTIONS {
                // 快照中没有设置时保留本地设置
                if collection == COLLECTION_SETTINGS && !data.collections.contains_key(collection) {
                    continue;
                }
                tx.execute(
                    "DELETE FROM records WHERE collection = ?1",
                    params![collection],
                )?;
            }
        }

        let mut counts = ImportedCounts::default();
        for collection in SNAPSHOT_COLLECTIONS {
            let Some(records) = data.collections.get(collection) else {
                continue;
            };
            let imported = insert_records(&tx, collection, records, mode)?;
            counts.0.insert(collection.to_string(), imported);
        }

        for name in data.collections.keys() {
            if !SNAPSHOT_COLLECTIONS.contains(&name.as_str()) {
                tracing::warn!("忽略未知集合: {}", name);
            }
        }

        tx.commit()?;
        Ok(counts)
    }
}

fn load_collection(conn: &Connection, collection: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare("SELECT body FROM records WHERE collection = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;

    let mut records = Vec::new();
    for body in rows {
        records.push(serde_json::from_str(&body?)?);
    }
    Ok(records)
}

fn insert_records(
    tx: &Transaction<'_>,
    collection: &str,
    records: &[Value],
    mode: ImportMode,
) -> Result<usize> {
    let sql = match mode {
        ImportMode::Replace => {
            "INSERT OR REPLACE INTO records (collection, id, body) VALUES (?1, ?2, ?3)"
        }
        ImportMode::Merge => {
            "INSERT OR IGNORE INTO records (collection, id, body) VALUES (?1, ?2, ?3)"
        }
    };
    let mut stmt = tx.prepare(sql)?;

    let mut imported = 0;
    for record in records {
        let id = record_id(record).ok_or_else(|| {
            BackupError::InvalidBackup(format!("集合 {} 中的记录缺少 id", collection))
        })?;

        let mut record = record.clone();
        // 导入的数据不带本地同步标记
        if let Some(obj) = record.as_object_mut() {
            obj.remove("dirty");
        }

        imported += stmt.execute(params![collection, id, serde_json::to_string(&record)?])?;
    }
    Ok(imported)
}

fn is_deleted(record: &Value) -> bool {
    record
        .get("deletedAt")
        .map(|v| !v.is_null())
        .unwrap_or(false)
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl LocalSnapshotSource for SqliteLocalStore {
    async fn export_all(&self, filter: &ExportFilter) -> Result<SnapshotData, BackupError> {
        let data = self.export_filtered(filter)?;
        tracing::debug!("本地数据已导出: {} 条记录", data.total_records());
        Ok(data)
    }

    async fn import_all(
        &self,
        data: &SnapshotData,
        mode: ImportMode,
    ) -> Result<ImportedCounts, BackupError> {
        let counts = self.import_transaction(data, mode)?;
        tracing::info!("本地数据已导入: mode={}, {} 条记录", mode, counts.total());
        Ok(counts)
    }
}
