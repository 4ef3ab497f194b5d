use crate::{
    config::LockConfig,
    error::{AppError, AppResult},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RECLAIM_GUARD_ATTEMPTS: u32 = 100;
const RECLAIM_GUARD_WAIT: Duration = Duration::from_millis(50);

/// 锁文件内容：持有者身份与获取时间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
    /// 每次获取生成的唯一令牌，释放时用来确认仍是自己持有
    pub token: String,
}

impl LockRecord {
    fn new_for_current_process() -> Self {
        Self {
            pid: std::process::id(),
            host: local_hostname(),
            acquired_at: Utc::now(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// 获取结果
#[derive(Debug)]
pub enum AcquireOutcome {
    Held(LockGuard),
    /// 锁被其他存活实例持有（内容不可读时为 `None`）
    Busy(Option<LockRecord>),
    /// 回收了过期锁
    Reclaimed {
        guard: LockGuard,
        previous: Option<LockRecord>,
    },
}

/// 基于锁文件的跨进程互斥
#[derive(Debug, Clone)]
pub struct ProcessLock {
    path: PathBuf,
    timeout: Duration,
}

impl ProcessLock {
    pub fn new(config: &LockConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&config.dir).map_err(|e| {
            AppError::lock(format!("创建锁目录 {} 失败: {}", config.dir.display(), e))
        })?;
        Ok(Self {
            path: config.path(),
            timeout: config.timeout(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn guard_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".reclaim");
        PathBuf::from(name)
    }

    /// 持有者是否已超时
    pub fn is_stale(holder: &LockRecord, timeout: Duration) -> bool {
        let age = Utc::now().signed_duration_since(holder.acquired_at);
        age.to_std().map(|age| age > timeout).unwrap_or(false)
    }

    /// 尝试获取锁
    pub fn try_acquire(&self) -> AppResult<AcquireOutcome> {
        let record = LockRecord::new_for_current_process();

        if self.create_exclusive(&record)? {
            info!(pid = record.pid, host = %record.host, "已获取进程锁");
            return Ok(AcquireOutcome::Held(self.guard(record)));
        }

        let existing = self.read_record();
        if !self.existing_is_stale(existing.as_ref()) {
            if let Some(holder) = &existing {
                warn!(
                    pid = holder.pid,
                    host = %holder.host,
                    acquired_at = %holder.acquired_at,
                    "另一个采集实例正在运行"
                );
            }
            return Ok(AcquireOutcome::Busy(existing));
        }

        // 过期锁的检查与替换在回收守护文件内完成，避免与旧持有者的释放或其他回收者竞争
        let Some(_guard) = ReclaimGuard::acquire(&self.guard_path(), self.timeout)? else {
            return Ok(AcquireOutcome::Busy(existing));
        };

        let current = self.read_record();
        if current.is_none() && !self.path.exists() {
            // 旧持有者已在此期间释放
            return if self.create_exclusive(&record)? {
                info!(pid = record.pid, "已获取进程锁");
                Ok(AcquireOutcome::Held(self.guard(record)))
            } else {
                Ok(AcquireOutcome::Busy(self.read_record()))
            };
        }
        if current != existing || !self.existing_is_stale(current.as_ref()) {
            return Ok(AcquireOutcome::Busy(current));
        }

        self.write_replace(&record)?;
        match &current {
            Some(previous) => warn!(
                pid = previous.pid,
                host = %previous.host,
                acquired_at = %previous.acquired_at,
                "回收了过期的进程锁"
            ),
            None => warn!("回收了无法解析的过期进程锁"),
        }
        Ok(AcquireOutcome::Reclaimed {
            guard: self.guard(record),
            previous: current,
        })
    }

    /// 释放锁；若锁已被他人回收则不做任何事
    pub fn release(&self, record: &LockRecord) -> AppResult<bool> {
        let Some(_guard) = ReclaimGuard::acquire(&self.guard_path(), self.timeout)? else {
            warn!("释放进程锁时未能进入回收守护，锁将在超时后被回收");
            return Ok(false);
        };

        match self.read_record() {
            Some(current) if current.token == record.token => {
                std::fs::remove_file(&self.path)?;
                info!(pid = record.pid, "已释放进程锁");
                Ok(true)
            }
            Some(current) => {
                warn!(
                    holder_pid = current.pid,
                    "进程锁已被其他实例回收，跳过释放"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// 强制删除锁文件（CLI `unlock`）
    pub fn force_clear(&self) -> AppResult<Option<LockRecord>> {
        let previous = self.read_record();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let _ = std::fs::remove_file(self.guard_path());
        Ok(previous)
    }

    /// 读取当前锁记录
    pub fn read_record(&self) -> Option<LockRecord> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn existing_is_stale(&self, existing: Option<&LockRecord>) -> bool {
        match existing {
            Some(holder) => Self::is_stale(holder, self.timeout),
            // 内容不可读时按文件修改时间判断
            None => file_age(&self.path).is_some_and(|age| age > self.timeout),
        }
    }

    /// 原子地创建锁文件：内容写好后以不覆盖方式落位
    fn create_exclusive(&self, record: &LockRecord) -> AppResult<bool> {
        let tmp = self.temp_with(record)?;
        match tmp.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(AppError::lock(format!("创建锁文件失败: {}", e.error))),
        }
    }

    fn write_replace(&self, record: &LockRecord) -> AppResult<()> {
        let tmp = self.temp_with(record)?;
        tmp.persist(&self.path)
            .map_err(|e| AppError::lock(format!("替换锁文件失败: {}", e.error)))?;
        Ok(())
    }

    fn temp_with(&self, record: &LockRecord) -> AppResult<NamedTempFile> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(record)?)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    fn guard(&self, record: LockRecord) -> LockGuard {
        LockGuard {
            lock: self.clone(),
            record: Some(record),
        }
    }
}

/// 作用域锁：离开作用域时自动释放
#[derive(Debug)]
pub struct LockGuard {
    lock: ProcessLock,
    record: Option<LockRecord>,
}

impl LockGuard {
    pub fn record(&self) -> Option<&LockRecord> {
        self.record.as_ref()
    }

    /// 显式释放，返回是否真正删除了锁文件
    pub fn release(mut self) -> AppResult<bool> {
        match self.record.take() {
            Some(record) => self.lock.release(&record),
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            if let Err(e) = self.lock.release(&record) {
                error!("释放进程锁失败: {}", e);
            }
        }
    }
}

/// 回收守护文件，保证过期锁的“检查 + 替换”与释放互斥
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn acquire(path: &Path, timeout: Duration) -> AppResult<Option<Self>> {
        for _ in 0..RECLAIM_GUARD_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // 持有守护文件的进程崩溃后残留
                    if file_age(path).is_some_and(|age| age > timeout) {
                        debug!("删除残留的回收守护文件 {}", path.display());
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    std::thread::sleep(RECLAIM_GUARD_WAIT);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified.elapsed().ok()
}

/// 本机主机名：优先环境变量 `HOSTNAME`，其次系统调用
pub fn local_hostname() -> String {
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.trim().is_empty() {
            return host.trim().to_string();
        }
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn lock_in(dir: &TempDir, timeout_secs: u64) -> ProcessLock {
        ProcessLock::new(&LockConfig {
            dir: dir.path().to_path_buf(),
            timeout_secs,
            ..LockConfig::default()
        })
        .unwrap()
    }

    fn write_record(lock: &ProcessLock, record: &LockRecord) {
        std::fs::write(lock.path(), serde_json::to_vec(record).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_busy_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, 600);

        let guard = match lock.try_acquire().unwrap() {
            AcquireOutcome::Held(guard) => guard,
            other => panic!("expected Held, got {:?}", other),
        };
        assert!(lock.path().ends_with("tenable_collector.lock"));
        assert_eq!(lock.read_record().unwrap().pid, std::process::id());

        match lock_in(&dir, 600).try_acquire().unwrap() {
            AcquireOutcome::Busy(Some(holder)) => {
                assert_eq!(holder.token, guard.record().unwrap().token)
            }
            other => panic!("expected Busy, got {:?}", other),
        }

        assert!(guard.release().unwrap());
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, 600);
        {
            let _outcome = lock.try_acquire().unwrap();
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_concurrent_acquire_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, 600);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    match lock.try_acquire().unwrap() {
                        AcquireOutcome::Held(guard) => {
                            // 持有一段时间，让其他线程都完成尝试
                            std::thread::sleep(Duration::from_millis(200));
                            drop(guard);
                            1
                        }
                        _ => 0,
                    }
                })
            })
            .collect();

        let held: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(held, 1);
    }

    #[test]
    fn test_stale_lock_reclaimed_and_old_release_is_noop() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, 600);

        let stale = LockRecord {
            pid: 4242,
            host: "old-host".into(),
            acquired_at: Utc::now() - chrono::Duration::seconds(3600),
            token: "old-token".into(),
        };
        assert!(ProcessLock::is_stale(&stale, Duration::from_secs(600)));
        write_record(&lock, &stale);

        let guard = match lock.try_acquire().unwrap() {
            AcquireOutcome::Reclaimed { guard, previous } => {
                assert_eq!(previous.unwrap().pid, 4242);
                guard
            }
            other => panic!("expected Reclaimed, got {:?}", other),
        };

        // 旧持有者晚到的释放不影响新持有者
        assert!(!lock.release(&stale).unwrap());
        assert_eq!(
            lock.read_record().unwrap().token,
            guard.record().unwrap().token
        );

        drop(guard);
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_fresh_lock_from_other_host_is_busy() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, 600);
        write_record(
            &lock,
            &LockRecord {
                pid: 1,
                host: "other".into(),
                acquired_at: Utc::now(),
                token: "t".into(),
            },
        );
        assert!(matches!(
            lock.try_acquire().unwrap(),
            AcquireOutcome::Busy(Some(_))
        ));

        let cleared = lock.force_clear().unwrap();
        assert_eq!(cleared.unwrap().host, "other");
        assert!(lock.force_clear().unwrap().is_none());
    }
}
