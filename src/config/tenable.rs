use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 初始退避时间（秒）
    pub initial_backoff_secs: u64,
    /// 最大退避时间（秒）
    pub max_backoff_secs: u64,
    /// 退避倍率
    pub backoff_multiplier: f64,
    /// 添加随机抖动以避免惊群效应
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::api_default()
    }
}

impl RetryConfig {
    /// 普通列表接口：30秒起，每次 ×1.5，共3次
    pub fn api_default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 30,
            max_backoff_secs: 300,
            backoff_multiplier: 1.5,
            jitter: true,
        }
    }

    /// 导出任务启动：60秒起，每次 ×1.5，上限5分钟，最多重试3次
    pub fn export_default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_secs: 60,
            max_backoff_secs: 300,
            backoff_multiplier: 1.5,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("最大尝试次数必须大于0".into());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("退避倍率不能小于1".into());
        }
        if self.initial_backoff_secs > self.max_backoff_secs {
            return Err("初始退避时间不能超过最大退避时间".into());
        }
        Ok(())
    }
}

/// 导出任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// 状态轮询间隔（秒）
    pub poll_interval_secs: u64,
    /// 单个导出任务最长等待时间（秒）
    pub max_wait_secs: u64,
    /// 漏洞导出每个分块包含的资产数（Tenable 建议 1000-3000）
    pub num_assets: u32,
    /// 资产导出分块大小
    pub asset_chunk_size: u32,
    pub include_unlicensed: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_wait_secs: 3600,
            num_assets: 2000,
            asset_chunk_size: 1000,
            include_unlicensed: true,
        }
    }
}

impl ExportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// Tenable.io 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenableConfig {
    pub url: String,
    pub access_key: String,
    pub secret_key: String,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    pub export: ExportConfig,
    /// 导出任务启动的冲突重试
    pub export_retry: RetryConfig,
    /// 列表接口与分块下载的限流重试
    pub api_retry: RetryConfig,
}

impl Default for TenableConfig {
    fn default() -> Self {
        Self {
            url: "https://cloud.tenable.com".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            request_timeout_secs: 120,
            export: ExportConfig::default(),
            export_retry: RetryConfig::export_default(),
            api_retry: RetryConfig::api_default(),
        }
    }
}

impl TenableConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Tenable url 不能为空".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Tenable url 必须以 http:// 或 https:// 开头".to_string());
        }

        if self.access_key.is_empty() || self.secret_key.is_empty() {
            return Err("缺少 Tenable access_key/secret_key".to_string());
        }

        if self.export.poll_interval_secs == 0 {
            return Err("导出轮询间隔必须大于0".to_string());
        }

        if self.export.max_wait_secs < self.export.poll_interval_secs {
            return Err("导出最长等待时间不能小于轮询间隔".to_string());
        }

        self.export_retry
            .validate()
            .map_err(|e| format!("export_retry: {}", e))?;
        self.api_retry
            .validate()
            .map_err(|e| format!("api_retry: {}", e))?;

        Ok(())
    }

    /// 拼接API地址
    pub fn get_api_url(&self, endpoint: &str) -> String {
        let base = self.url.trim_end_matches('/');
        let endpoint = endpoint.trim_start_matches('/');
        format!("{}/{}", base, endpoint)
    }
}

/// 通用的重试执行器
///
/// 仅对临时性错误（限流、导出冲突、5xx、连接失败）重试，退避等待可被关停信号打断。
pub struct RetryExecutor {
    config: RetryConfig,
    shutdown: CancellationToken,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// 执行带重试的异步操作
    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F, label: &str) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 1;
        let mut backoff_secs = self.config.initial_backoff_secs;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("{} 在第 {} 次尝试后成功", label, attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_transient() {
                        return Err(error);
                    }

                    if attempt >= self.config.max_attempts {
                        error!(
                            "{} 达到最大尝试次数 {}，最终失败: {}",
                            label, self.config.max_attempts, error
                        );
                        return Err(error);
                    }

                    let delay_secs = if self.config.jitter {
                        self.add_jitter(backoff_secs)
                    } else {
                        backoff_secs
                    };

                    warn!(
                        "{} 第 {}/{} 次尝试失败: {}，{}秒后重试",
                        label, attempt, self.config.max_attempts, error, delay_secs
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(AppError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
                    }

                    // 指数退避
                    backoff_secs = (backoff_secs as f64 * self.config.backoff_multiplier) as u64;
                    backoff_secs = backoff_secs.min(self.config.max_backoff_secs);

                    attempt += 1;
                }
            }
        }
    }

    fn add_jitter(&self, base_secs: u64) -> u64 {
        let jitter_range = (base_secs as f64 * 0.1) as u64; // 10% 抖动
        let jitter = rand::random::<f64>() * jitter_range.max(1) as f64;
        base_secs + jitter as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_secs: 0,
            max_backoff_secs: 0,
            backoff_multiplier: 1.5,
            jitter: false,
        }
    }

    #[test]
    fn test_tenable_config_validation() {
        let mut config = TenableConfig {
            access_key: "a".into(),
            secret_key: "s".into(),
            ..TenableConfig::default()
        };
        assert!(config.validate().is_ok());

        config.url = "cloud.tenable.com".to_string();
        assert!(config.validate().is_err());

        config.url = "https://cloud.tenable.com".to_string();
        config.secret_key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_config_defaults() {
        let export = RetryConfig::export_default();
        assert_eq!(export.max_attempts, 4);
        assert_eq!(export.initial_backoff_secs, 60);
        assert_eq!(export.max_backoff_secs, 300);

        let api = RetryConfig::api_default();
        assert_eq!(api.max_attempts, 3);
        assert_eq!(api.initial_backoff_secs, 30);
    }

    #[test]
    fn test_get_api_url() {
        let config = TenableConfig::default();
        assert_eq!(
            config.get_api_url("/assets/export"),
            "https://cloud.tenable.com/assets/export"
        );
        assert_eq!(
            config.get_api_url("vulns/export"),
            "https://cloud.tenable.com/vulns/export"
        );
    }

    #[tokio::test]
    async fn test_retry_executor_retries_transient_errors() {
        let executor = RetryExecutor::new(fast_retry(3), CancellationToken::new());
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = executor
            .execute_with_retry(
                || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(AppError::throttled(Some(429), "rate limited"))
                    } else {
                        Ok(n)
                    }
                },
                "列表查询",
            )
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_executor_is_bounded() {
        let executor = RetryExecutor::new(fast_retry(2), CancellationToken::new());
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: AppResult<()> = executor
            .execute_with_retry(
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::duplicate_export("Duplicate export not allowed"))
                },
                "导出启动",
            )
            .await;

        assert!(matches!(result, Err(AppError::DuplicateExport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_executor_skips_permanent_errors() {
        let executor = RetryExecutor::new(fast_retry(5), CancellationToken::new());
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: AppResult<()> = executor
            .execute_with_retry(
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::upstream(Some(403), "forbidden"))
                },
                "插件详情",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_executor_honours_shutdown() {
        let mut config = fast_retry(5);
        config.initial_backoff_secs = 30;
        config.max_backoff_secs = 30;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let executor = RetryExecutor::new(config, shutdown);

        let result: AppResult<()> = executor
            .execute_with_retry(
                || async { Err(AppError::throttled(Some(429), "slow down")) },
                "扫描列表",
            )
            .await;

        assert!(matches!(result, Err(AppError::Cancelled)));
    }
}
