use crate::{
    config::CheckpointConfig,
    error::{AppError, AppResult},
    models::Checkpoint,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tempfile::NamedTempFile;
use tokio::task;
use tracing::{debug, info, warn};

/// 单个feed的内存状态
#[derive(Default)]
struct Slot {
    state: RwLock<Checkpoint>,
    /// 串行化同一feed的提交
    write: tokio::sync::Mutex<()>,
    /// 内存状态与磁盘不一致，需要在 flush 时写回
    dirty: AtomicBool,
}

impl Slot {
    fn with(checkpoint: Checkpoint, dirty: bool) -> Self {
        Self {
            state: RwLock::new(checkpoint),
            write: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(dirty),
        }
    }

    fn read(&self) -> Checkpoint {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, checkpoint: Checkpoint) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = checkpoint;
    }
}

/// 检查点概要（CLI 列表用）
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub feed_key: String,
    pub path: PathBuf,
    pub processed_ids: usize,
    pub last_timestamp: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_full_scan: Option<DateTime<Utc>>,
}

/// 基于文件的检查点存储
///
/// 每个feed一个 JSON 文件 `<dir>/<prefix>_<feed_key>.json`，写入采用“临时文件 + rename”，
/// 内存状态只在落盘成功后替换。
pub struct CheckpointStore {
    config: CheckpointConfig,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    /// 加载失败的feed，对应feed在本次运行中不可用
    broken: Mutex<HashMap<String, String>>,
}

impl CheckpointStore {
    pub fn new(config: CheckpointConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&config.dir).map_err(|e| {
            AppError::checkpoint(format!(
                "创建检查点目录 {} 失败: {}",
                config.dir.display(),
                e
            ))
        })?;

        Ok(Self {
            config,
            slots: Mutex::new(HashMap::new()),
            broken: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// 检查点文件路径
    pub fn path_for(&self, feed_key: &str) -> PathBuf {
        self.config
            .dir
            .join(format!("{}_{}.json", self.config.key_prefix, feed_key))
    }

    fn feed_key_from_path(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(".json")?;
        let key = stem.strip_prefix(&format!("{}_", self.config.key_prefix))?;
        (!key.is_empty()).then(|| key.to_string())
    }

    fn checkpoint_files(&self) -> AppResult<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(key) = self.feed_key_from_path(&path) {
                files.push((key, path));
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_file(path: &Path) -> AppResult<Checkpoint> {
        let content = std::fs::read_to_string(path)?;
        let checkpoint = serde_json::from_str(&content).map_err(|e| {
            AppError::checkpoint(format!("解析检查点 {} 失败: {}", path.display(), e))
        })?;
        Ok(checkpoint)
    }

    fn slot(&self, feed_key: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(feed_key.to_string())
            .or_insert_with(|| Arc::new(self.load_slot(feed_key)))
            .clone()
    }

    /// 按需从磁盘加载单个feed
    fn load_slot(&self, feed_key: &str) -> Slot {
        let path = self.path_for(feed_key);
        if !path.exists() {
            return Slot::default();
        }
        match Self::read_file(&path) {
            Ok(checkpoint) => self.capped(checkpoint, feed_key),
            Err(e) => {
                warn!(feed = %feed_key, error = %e, "检查点不可读");
                self.mark_broken(feed_key, e.to_string());
                Slot::default()
            }
        }
    }

    /// 容量下调后加载的旧文件需要先裁剪
    fn capped(&self, mut checkpoint: Checkpoint, feed_key: &str) -> Slot {
        let evicted = checkpoint.processed_ids.evict_to(self.config.max_ids);
        if !evicted.is_empty() {
            debug!(feed = %feed_key, evicted = evicted.len(), "加载时裁剪检查点ID");
        }
        Slot::with(checkpoint, !evicted.is_empty())
    }

    fn mark_broken(&self, feed_key: &str, reason: String) {
        self.broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(feed_key.to_string(), reason);
    }

    fn ensure_usable(&self, feed_key: &str) -> AppResult<()> {
        let broken = self.broken.lock().unwrap_or_else(PoisonError::into_inner);
        match broken.get(feed_key) {
            Some(reason) => Err(AppError::checkpoint(format!(
                "feed {} 的检查点不可用: {}",
                feed_key, reason
            ))),
            None => Ok(()),
        }
    }

    /// 加载目录中的全部检查点，返回成功加载的数量
    ///
    /// 内存状态整体按磁盘重建：文件已被删除的feed回到空检查点，损坏标记也重新判定。
    /// 单个文件损坏只影响对应feed。
    pub fn load_all(&self) -> AppResult<usize> {
        let files = self.checkpoint_files()?;
        let mut fresh = HashMap::new();
        let mut broken = HashMap::new();
        for (feed_key, path) in files {
            match Self::read_file(&path) {
                Ok(checkpoint) => {
                    let slot = self.capped(checkpoint, &feed_key);
                    fresh.insert(feed_key, Arc::new(slot));
                }
                Err(e) => {
                    warn!(feed = %feed_key, error = %e, "检查点不可读，该feed本次将失败");
                    broken.insert(feed_key, e.to_string());
                }
            }
        }

        let loaded = fresh.len();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = slots.keys().filter(|key| !fresh.contains_key(*key)).count();
        if dropped > 0 {
            debug!(dropped, "磁盘上已不存在的检查点从内存中移除");
        }
        *slots = fresh;
        *self.broken.lock().unwrap_or_else(PoisonError::into_inner) = broken;
        info!("已加载 {} 个检查点", loaded);
        Ok(loaded)
    }

    /// 当前检查点的副本
    pub fn snapshot(&self, feed_key: &str) -> AppResult<Checkpoint> {
        let slot = self.slot(feed_key);
        self.ensure_usable(feed_key)?;
        Ok(slot.read())
    }

    /// 记录是否需要处理
    ///
    /// 时间去重的feed传入记录时间戳，其余feed传 `None`。不可用的检查点一律返回 false。
    pub fn should_process(
        &self,
        feed_key: &str,
        record_id: &str,
        record_timestamp: Option<i64>,
    ) -> bool {
        let slot = self.slot(feed_key);
        if self.ensure_usable(feed_key).is_err() {
            return false;
        }
        let state = slot.state.read().unwrap_or_else(PoisonError::into_inner);
        state.should_process(record_id, record_timestamp)
    }

    /// 提交一个已确认批次的ID与时间高水位
    ///
    /// 唯一的检查点变更入口：先写新版本到磁盘，成功后才替换内存状态。返回淘汰的ID数。
    pub async fn commit(
        &self,
        feed_key: &str,
        record_ids: Vec<String>,
        high_water_mark: Option<i64>,
    ) -> AppResult<usize> {
        let max_ids = self.config.max_ids;
        self.update(feed_key, move |checkpoint| {
            checkpoint.apply_commit(record_ids, high_water_mark, max_ids, Utc::now())
        })
        .await
    }

    /// 记录一次全量快照扫描的时间
    pub async fn record_full_scan(&self, feed_key: &str, at: DateTime<Utc>) -> AppResult<()> {
        self.update(feed_key, move |checkpoint| {
            checkpoint.last_full_scan = Some(at);
            checkpoint.updated_at = Some(Utc::now());
        })
        .await
    }

    async fn update<F, R>(&self, feed_key: &str, mutate: F) -> AppResult<R>
    where
        F: FnOnce(&mut Checkpoint) -> R,
    {
        let slot = self.slot(feed_key);
        self.ensure_usable(feed_key)?;

        let _write = slot.write.lock().await;
        let mut next = slot.read();
        let result = mutate(&mut next);

        self.persist(feed_key, &next).await?;
        slot.replace(next);
        slot.dirty.store(false, Ordering::SeqCst);
        Ok(result)
    }

    async fn persist(&self, feed_key: &str, checkpoint: &Checkpoint) -> AppResult<()> {
        let path = self.path_for(feed_key);
        let data = serde_json::to_vec_pretty(checkpoint)?;

        task::spawn_blocking(move || write_atomic(&path, &data))
            .await
            .map_err(|e| AppError::checkpoint(format!("检查点写入任务失败: {}", e)))?
            .map_err(|e| AppError::checkpoint(format!("写入 {} 的检查点失败: {}", feed_key, e)))
    }

    /// 写回所有未落盘的检查点
    pub async fn flush(&self) -> AppResult<usize> {
        let dirty: Vec<(String, Arc<Slot>)> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .filter(|(_, slot)| slot.dirty.load(Ordering::SeqCst))
                .map(|(key, slot)| (key.clone(), slot.clone()))
                .collect()
        };

        let mut written = 0;
        for (feed_key, slot) in dirty {
            let _write = slot.write.lock().await;
            let checkpoint = slot.read();
            self.persist(&feed_key, &checkpoint).await?;
            slot.dirty.store(false, Ordering::SeqCst);
            written += 1;
        }
        if written > 0 {
            debug!("flush 写回 {} 个检查点", written);
        }
        Ok(written)
    }

    /// 删除超过保留期未更新的检查点，返回被删除的feed键
    pub fn purge_expired(&self, retention: ChronoDuration) -> AppResult<Vec<String>> {
        let horizon = Utc::now() - retention;
        let mut purged = Vec::new();

        for (feed_key, path) in self.checkpoint_files()? {
            let updated_at = match Self::read_file(&path) {
                Ok(checkpoint) => checkpoint.updated_at,
                Err(e) => {
                    debug!(feed = %feed_key, error = %e, "跳过不可读的检查点");
                    continue;
                }
            };
            let updated_at = match updated_at {
                Some(ts) => ts,
                None => match file_modified(&path) {
                    Some(ts) => ts,
                    None => continue,
                },
            };

            if updated_at < horizon {
                std::fs::remove_file(&path)?;
                self.slots
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&feed_key);
                info!(feed = %feed_key, updated_at = %updated_at, "清理过期检查点");
                purged.push(feed_key);
            }
        }
        Ok(purged)
    }

    fn purge_stamp_path(&self) -> PathBuf {
        self.config
            .dir
            .join(format!(".{}_last_purge", self.config.key_prefix))
    }

    /// 距上次清理超过 `purge_interval_hours` 时执行保留期清理
    pub fn purge_if_due(&self) -> AppResult<Vec<String>> {
        let stamp = self.purge_stamp_path();
        let now = Utc::now();
        let last = std::fs::read_to_string(&stamp)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|ts| ts.with_timezone(&Utc));

        let interval = ChronoDuration::hours(self.config.purge_interval_hours as i64);
        if let Some(last) = last {
            if now - last < interval {
                return Ok(Vec::new());
            }
        }

        let retention = ChronoDuration::days(self.config.retention_days as i64);
        let purged = self.purge_expired(retention)?;
        write_atomic(&stamp, now.to_rfc3339().as_bytes())?;
        Ok(purged)
    }

    /// 删除单个feed的检查点，下次运行将重新采集该feed
    pub fn clear(&self, feed_key: &str) -> AppResult<bool> {
        let path = self.path_for(feed_key);
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(feed_key);
        self.broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(feed_key);

        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(feed = %feed_key, "已删除检查点 {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 列出磁盘上的检查点
    pub fn list(&self) -> AppResult<Vec<CheckpointInfo>> {
        let mut infos = Vec::new();
        for (feed_key, path) in self.checkpoint_files()? {
            let checkpoint = Self::read_file(&path)?;
            infos.push(CheckpointInfo {
                feed_key,
                path,
                processed_ids: checkpoint.processed_ids.len(),
                last_timestamp: checkpoint.last_timestamp,
                updated_at: checkpoint.updated_at,
                last_full_scan: checkpoint.last_full_scan,
            });
        }
        Ok(infos)
    }
}

/// 先写同目录临时文件再 rename 覆盖目标，崩溃时只会看到旧版本或新版本
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn file_modified(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
