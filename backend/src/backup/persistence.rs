//! 备份状态持久化模块
//!
//! 以键值形式将备份配置、脏标记、最近备份状态、重试队列和远程目录 ID
//! 持久化到 SQLite。每个键的读写都是单条语句或单个事务，重启后可恢复。

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rand::{distributions::Alphanumeric, Rng};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;

use super::config::BackupConfig;
use super::events::{BackupEvent, EventBus, StateChange};
use super::types::{LastBackup, QueueEntry};

/// 数据库连接池类型
type DbPool = Pool<SqliteConnectionManager>;
type DbConnection = PooledConnection<SqliteConnectionManager>;

/// 备份配置
pub const KEY_CONFIG: &str = "backup_config";
/// 脏标记
pub const KEY_IS_DIRTY: &str = "backup_is_dirty";
/// 脏标记代数（每次置脏加一）
pub const KEY_DIRTY_GENERATION: &str = "backup_dirty_generation";
/// 最近一次备份状态
pub const KEY_LAST_BACKUP: &str = "backup_last_backup";
/// 重试队列
pub const KEY_QUEUE: &str = "backup_queue";
/// 无法解析的队列原值（保留以便人工恢复）
pub const KEY_QUEUE_CORRUPT: &str = "backup_queue_corrupt";
/// 远程备份目录 ID
pub const KEY_FOLDER_ID: &str = "backup_drive_folder_id";
/// 设备 ID（reset 时保留）
pub const KEY_DEVICE_ID: &str = "backup_device_id";

/// reset 时清除的键
const RESETTABLE_KEYS: [&str; 7] = [
    KEY_CONFIG,
    KEY_IS_DIRTY,
    KEY_DIRTY_GENERATION,
    KEY_LAST_BACKUP,
    KEY_QUEUE,
    KEY_QUEUE_CORRUPT,
    KEY_FOLDER_ID,
];

/// 备份持久化状态
///
/// 所有持久化字段的唯一写入者，其他组件都通过它读写
pub struct PersistedState {
    pool: Arc<DbPool>,
    events: EventBus,
}

impl std::fmt::Debug for PersistedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedState")
            .field("pool", &"<DbPool>")
            .finish()
    }
}

impl PersistedState {
    /// 打开（或创建）持久化数据库
    pub fn open(db_path: &Path, events: EventBus) -> Result<Self> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("创建备份状态连接池失败")?;

        let state = Self {
            pool: Arc::new(pool),
            events,
        };
        state.init_database()?;

        tracing::info!("备份状态数据库已打开: {:?}", db_path);
        Ok(state)
    }

    /// 内存数据库（测试与临时运行使用）
    ///
    /// 每个内存连接都是独立的数据库，因此连接池只保留一个连接
    pub fn in_memory(events: EventBus) -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("创建内存连接池失败")?;

        let state = Self {
            pool: Arc::new(pool),
            events,
        };
        state.init_database()?;
        Ok(state)
    }

    /// 获取数据库连接
    fn get_conn(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| anyhow!("获取数据库连接失败: {}", e))
    }

    /// 初始化数据库表
    fn init_database(&self) -> Result<()> {
        let conn = self.get_conn()?;

        // 启用 WAL 模式提升并发性能（内存数据库会忽略）
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute(
            "-- ============================================
            -- 表: backup_state (备份键值状态表)
            -- 描述: 每个键保存一个 JSON 值
            -- ============================================
            CREATE TABLE IF NOT EXISTS backup_state (
                key TEXT PRIMARY KEY,                   -- 键名
                value TEXT NOT NULL,                    -- JSON 值
                updated_at TEXT NOT NULL                -- 更新时间 (RFC3339格式)
            )",
            [],
        )?;

        Ok(())
    }

    /// 事件总线
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ==================== 通用键值操作 ====================

    /// 读取 JSON 值
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.get_conn()?;
        read_json(&conn, key)
    }

    /// 写入 JSON 值（单条 upsert）
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let conn = self.get_conn()?;
        write_json(&conn, key, value)
    }

    /// 删除键
    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM backup_state WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// 在 IMMEDIATE 事务中执行读-改-写
    fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// 读取值，损坏时记录警告并返回默认值
    fn load_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let conn = self.get_conn()?;
        Ok(load_or_default(&conn, key))
    }

    // ==================== 配置 ====================

    /// 读取备份配置（缺失字段使用默认值）
    pub fn config(&self) -> Result<BackupConfig> {
        self.load_or_default(KEY_CONFIG)
    }

    /// 保存备份配置
    pub fn set_config(&self, config: &BackupConfig) -> Result<()> {
        self.set_json(KEY_CONFIG, config)?;
        self.emit_change(StateChange::Config, None);
        Ok(())
    }

    // ==================== 脏标记 ====================

    /// 是否有未备份的本地修改
    pub fn is_dirty(&self) -> Result<bool> {
        self.load_or_default(KEY_IS_DIRTY)
    }

    /// 当前脏标记代数
    pub fn dirty_generation(&self) -> Result<u64> {
        self.load_or_default(KEY_DIRTY_GENERATION)
    }

    /// 设置脏标记
    ///
    /// 置脏时代数加一；仅在标记发生翻转时广播事件。返回设置后的代数
    pub fn set_dirty(&self, dirty: bool) -> Result<u64> {
        let (changed, generation) = self.with_transaction(|conn| {
            let current: bool = load_or_default(conn, KEY_IS_DIRTY);
            let mut generation: u64 = load_or_default(conn, KEY_DIRTY_GENERATION);

            if dirty {
                generation = generation.wrapping_add(1);
                write_json(conn, KEY_DIRTY_GENERATION, &generation)?;
            }
            if current != dirty {
                write_json(conn, KEY_IS_DIRTY, &dirty)?;
            }
            Ok((current != dirty, generation))
        })?;

        if changed {
            self.emit_change(StateChange::Dirty, Some(dirty));
        }
        Ok(generation)
    }

    /// 仅当代数未变化时清除脏标记
    ///
    /// 上传期间如果又有新的修改，代数会增加，此时保留脏标记
    pub fn clear_dirty_if_generation(&self, generation: u64) -> Result<bool> {
        let cleared = self.with_transaction(|conn| {
            let current: bool = load_or_default(conn, KEY_IS_DIRTY);
            let latest: u64 = load_or_default(conn, KEY_DIRTY_GENERATION);

            if latest != generation {
                return Ok(false);
            }
            if current {
                write_json(conn, KEY_IS_DIRTY, &false)?;
            }
            Ok(current)
        })?;

        if cleared {
            self.emit_change(StateChange::Dirty, Some(false));
        }
        Ok(cleared)
    }

    // ==================== 最近备份状态 ====================

    pub fn last_backup(&self) -> Result<LastBackup> {
        self.load_or_default(KEY_LAST_BACKUP)
    }

    /// 原子更新最近备份状态
    pub fn update_last_backup(&self, f: impl FnOnce(&mut LastBackup)) -> Result<LastBackup> {
        let updated = self.with_transaction(|conn| {
            let mut last: LastBackup = load_or_default(conn, KEY_LAST_BACKUP);
            f(&mut last);
            write_json(conn, KEY_LAST_BACKUP, &last)?;
            Ok(last)
        })?;

        self.emit_change(StateChange::LastBackup, None);
        Ok(updated)
    }

    // ==================== 重试队列 ====================

    /// 读取完整队列（FIFO 顺序）
    pub fn queue(&self) -> Result<Vec<QueueEntry>> {
        self.load_or_default(KEY_QUEUE)
    }

    /// 追加条目到队尾，返回后条目已持久化
    pub fn push_queue(&self, entry: QueueEntry) -> Result<usize> {
        let len = self.with_transaction(|conn| {
            let mut queue: Vec<QueueEntry> = load_queue_for_write(conn)?;
            queue.push(entry);
            write_json(conn, KEY_QUEUE, &queue)?;
            Ok(queue.len())
        })?;

        self.emit_change(StateChange::Queue, None);
        Ok(len)
    }

    /// 原子更新单个条目，条目不存在时返回 None
    pub fn update_queue_entry(
        &self,
        id: &str,
        f: impl FnOnce(&mut QueueEntry),
    ) -> Result<Option<QueueEntry>> {
        let updated = self.with_transaction(|conn| {
            let mut queue: Vec<QueueEntry> = load_queue_for_write(conn)?;
            let Some(entry) = queue.iter_mut().find(|e| e.id == id) else {
                return Ok(None);
            };
            f(entry);
            let updated = entry.clone();
            write_json(conn, KEY_QUEUE, &queue)?;
            Ok(Some(updated))
        })?;

        if updated.is_some() {
            self.emit_change(StateChange::Queue, None);
        }
        Ok(updated)
    }

    /// 删除条目，返回是否存在
    pub fn remove_queue_entry(&self, id: &str) -> Result<bool> {
        let removed = self.with_transaction(|conn| {
            let mut queue: Vec<QueueEntry> = load_queue_for_write(conn)?;
            let before = queue.len();
            queue.retain(|e| e.id != id);
            if queue.len() == before {
                return Ok(false);
            }
            write_json(conn, KEY_QUEUE, &queue)?;
            Ok(true)
        })?;

        if removed {
            self.emit_change(StateChange::Queue, None);
        }
        Ok(removed)
    }

    /// 清空队列，返回被清除的条目数
    pub fn clear_queue(&self) -> Result<usize> {
        let cleared = self.with_transaction(|conn| {
            let queue: Vec<QueueEntry> = load_or_default(conn, KEY_QUEUE);
            conn.execute("DELETE FROM backup_state WHERE key = ?1", params![KEY_QUEUE])?;
            Ok(queue.len())
        })?;

        self.emit_change(StateChange::Queue, None);
        Ok(cleared)
    }

    // ==================== 远程目录 ====================

    pub fn folder_id(&self) -> Result<Option<String>> {
        self.get_json(KEY_FOLDER_ID)
    }

    pub fn set_folder_id(&self, folder_id: &str) -> Result<()> {
        self.set_json(KEY_FOLDER_ID, &folder_id)?;
        self.emit_change(StateChange::Folder, None);
        Ok(())
    }

    pub fn clear_folder_id(&self) -> Result<()> {
        self.remove(KEY_FOLDER_ID)?;
        self.emit_change(StateChange::Folder, None);
        Ok(())
    }

    // ==================== 设备 ID ====================

    /// 获取设备 ID，首次调用时生成并持久化
    pub fn device_id(&self) -> Result<String> {
        self.with_transaction(|conn| {
            if let Some(id) = read_json::<String>(conn, KEY_DEVICE_ID)? {
                return Ok(id);
            }

            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(11)
                .map(char::from)
                .collect::<String>()
                .to_lowercase();
            let id = format!("device_{}_{}", Utc::now().timestamp_millis(), suffix);
            write_json(conn, KEY_DEVICE_ID, &id)?;

            tracing::info!("生成新的设备 ID: {}", id);
            Ok(id)
        })
    }

    // ==================== 重置 ====================

    /// 清除全部备份状态（保留设备 ID）
    pub fn reset(&self) -> Result<()> {
        self.with_transaction(|conn| {
            for key in RESETTABLE_KEYS {
                conn.execute("DELETE FROM backup_state WHERE key = ?1", params![key])?;
            }
            Ok(())
        })?;

        tracing::info!("备份状态已重置");
        self.emit_change(StateChange::Reset, None);
        Ok(())
    }

    fn emit_change(&self, change: StateChange, dirty: Option<bool>) {
        self.events.emit(BackupEvent::StateChanged { change, dirty });
    }
}

fn read_json<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM backup_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(text) => {
            let value = serde_json::from_str(&text)
                .with_context(|| format!("解析持久化值失败: key={}", key))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO backup_state (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, text, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// 读取队列用于改写
///
/// 原值损坏时先移到 `KEY_QUEUE_CORRUPT`，避免被随后的写入覆盖
fn load_queue_for_write(conn: &Connection) -> Result<Vec<QueueEntry>> {
    match read_json(conn, KEY_QUEUE) {
        Ok(queue) => Ok(queue.unwrap_or_default()),
        Err(e) => {
            tracing::error!(
                "重试队列已损坏，原值移至 {}: {:#}",
                KEY_QUEUE_CORRUPT,
                e
            );
            conn.execute(
                "INSERT INTO backup_state (key, value, updated_at)
                 SELECT ?1, value, ?2 FROM backup_state WHERE key = ?3
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![KEY_QUEUE_CORRUPT, Utc::now().to_rfc3339(), KEY_QUEUE],
            )?;
            conn.execute("DELETE FROM backup_state WHERE key = ?1", params![KEY_QUEUE])?;
            Ok(Vec::new())
        }
    }
}

fn load_or_default<T: DeserializeOwned + Default>(conn: &Connection, key: &str) -> T {
    match read_json(conn, key) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!("读取持久化值失败，使用默认值: key={}, error={:#}", key, e);
            T::default()
        }
    }
}
