use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod hec;
pub mod tenable;

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tenable: tenable::TenableConfig,
    pub hec: hec::HecConfig,
    pub checkpoint: CheckpointConfig,
    pub lock: LockConfig,
    pub collector: CollectorConfig,
    /// 日志级别（RUST_LOG 优先）
    pub log_level: String,
}

/// 检查点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    pub key_prefix: String,
    /// 每个feed保留的已处理ID上限
    pub max_ids: usize,
    /// 超过该天数未更新的检查点会被清理
    pub retention_days: u32,
    /// 清理周期（小时），守护模式下生效
    pub purge_interval_hours: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            key_prefix: "tenable".to_string(),
            max_ids: 100_000,
            retention_days: 30,
            purge_interval_hours: 24,
        }
    }
}

/// 进程锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub dir: PathBuf,
    pub file_name: String,
    /// 锁超时时间（秒），超过即视为遗弃
    pub timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("locks"),
            file_name: "tenable_collector.lock".to_string(),
            timeout_secs: 600,
        }
    }
}

impl LockConfig {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 采集调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// 每批事件数
    pub batch_size: usize,
    /// 单个feed最多发送的事件数（0 = 不限制）
    pub max_events_per_feed: u64,
    /// 同时运行的feed上限
    pub max_concurrent_feeds: usize,
    /// 同组feed之间的冷却时间（秒）
    pub inter_feed_delay_secs: u64,
    /// 已删除资产全量扫描的最小间隔（小时）
    pub deleted_asset_scan_interval_hours: u64,
    /// 守护模式运行间隔（秒）
    pub daemon_interval_secs: u64,
    /// 进度日志间隔（事件数）
    pub progress_log_interval: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            max_events_per_feed: 0,
            max_concurrent_feeds: 2,
            inter_feed_delay_secs: 30,
            deleted_asset_scan_interval_hours: 24,
            daemon_interval_secs: 3600,
            progress_log_interval: 1000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenable: tenable::TenableConfig::default(),
            hec: hec::HecConfig::default(),
            checkpoint: CheckpointConfig::default(),
            lock: LockConfig::default(),
            collector: CollectorConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| AppError::config(format!("解析配置文件失败: {}", e)))?;
        Ok(config)
    }

    /// 加载配置：配置文件（不存在则使用默认值） -> 环境变量覆盖
    ///
    /// 此时日志尚未初始化，调用方负责输出加载结果；采集命令需要再调用 [`Config::validate`]。
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// 应用环境变量覆盖
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TENABLE_ACCESS_KEY") {
            self.tenable.access_key = v;
        }
        if let Some(v) = get("TENABLE_SECRET_KEY") {
            self.tenable.secret_key = v;
        }
        if let Some(v) = get("TENABLE_URL") {
            self.tenable.url = v;
        }
        if let Some(v) = get("CRIBL_HEC_HOST") {
            self.hec.host = v;
        }
        if let Some(v) = get("CRIBL_HEC_PORT") {
            self.hec.port = parse_env("CRIBL_HEC_PORT", &v)?;
        }
        if let Some(v) = get("CRIBL_HEC_TOKEN") {
            self.hec.token = v;
        }
        if let Some(v) = get("CRIBL_HEC_SSL_VERIFY") {
            self.hec.verify_tls = parse_bool("CRIBL_HEC_SSL_VERIFY", &v)?;
        }
        if let Some(v) = get("HEC_BATCH_SIZE") {
            self.collector.batch_size = parse_env("HEC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_EVENTS_PER_FEED") {
            self.collector.max_events_per_feed = parse_env("MAX_EVENTS_PER_FEED", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_FEEDS") {
            self.collector.max_concurrent_feeds = parse_env("MAX_CONCURRENT_FEEDS", &v)?;
        }
        if let Some(v) = get("INTER_FEED_DELAY_SECS") {
            self.collector.inter_feed_delay_secs = parse_env("INTER_FEED_DELAY_SECS", &v)?;
        }
        if let Some(v) = get("DELETED_ASSET_SCAN_INTERVAL_HOURS") {
            self.collector.deleted_asset_scan_interval_hours =
                parse_env("DELETED_ASSET_SCAN_INTERVAL_HOURS", &v)?;
        }
        if let Some(v) = get("CHECKPOINT_DIR") {
            self.checkpoint.dir = PathBuf::from(v);
        }
        if let Some(v) = get("CHECKPOINT_MAX_IDS") {
            self.checkpoint.max_ids = parse_env("CHECKPOINT_MAX_IDS", &v)?;
        }
        if let Some(v) = get("CHECKPOINT_RETENTION_DAYS") {
            self.checkpoint.retention_days = parse_env("CHECKPOINT_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("LOCK_DIR") {
            self.lock.dir = PathBuf::from(v);
        }
        if let Some(v) = get("LOCK_TIMEOUT") {
            self.lock.timeout_secs = parse_env("LOCK_TIMEOUT", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v.to_lowercase();
        }
        Ok(())
    }

    /// 验证配置有效性
    pub fn validate(&self) -> AppResult<()> {
        if let Err(e) = self.tenable.validate() {
            return Err(AppError::config(format!("Tenable配置无效: {}", e)));
        }

        if let Err(e) = self.hec.validate() {
            return Err(AppError::config(format!("HEC配置无效: {}", e)));
        }

        if self.collector.batch_size == 0 {
            return Err(AppError::config("批次大小不能为0"));
        }

        if self.collector.max_concurrent_feeds == 0 {
            return Err(AppError::config("最大并发feed数不能为0"));
        }

        if self.checkpoint.max_ids == 0 {
            return Err(AppError::config("检查点ID上限不能为0"));
        }

        if self.checkpoint.retention_days == 0 {
            return Err(AppError::config("检查点保留天数不能为0"));
        }

        if self.lock.timeout_secs == 0 {
            return Err(AppError::config("锁超时时间不能为0"));
        }

        Ok(())
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::config(format!("序列化配置失败: {}", e)))?;

        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> AppResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| AppError::config(format!("环境变量 {} 的值无效: {}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> AppResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::config(format!(
            "环境变量 {} 的值无效: {}",
            key, value
        ))),
    }
}
