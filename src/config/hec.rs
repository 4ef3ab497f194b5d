use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 自适应发送节奏配置（AIMD 风格）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// 初始批次间隔（毫秒）
    pub initial_delay_ms: u64,
    /// 间隔下限（毫秒）
    pub min_delay_ms: u64,
    /// 间隔上限（毫秒）
    pub max_delay_ms: u64,
    /// 每次成功后间隔乘以该系数（< 1）
    pub decrease_factor: f64,
    /// 每次可重试失败后间隔乘以该系数（> 1）
    pub increase_factor: f64,
    /// 每次可重试失败至少增加的间隔（毫秒），保证从0开始也能增长
    pub increase_step_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            min_delay_ms: 0,
            max_delay_ms: 30_000,
            decrease_factor: 0.5,
            increase_factor: 2.0,
            increase_step_ms: 250,
        }
    }
}

impl PacingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err("节奏间隔下限不能大于上限".to_string());
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err("decrease_factor 必须在 (0, 1) 之间".to_string());
        }
        if self.increase_factor <= 1.0 {
            return Err("increase_factor 必须大于1".to_string());
        }
        if self.increase_step_ms == 0 {
            return Err("increase_step_ms 必须大于0".to_string());
        }
        Ok(())
    }
}

/// HTTP Event Collector 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HecConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    /// 使用 https
    pub use_tls: bool,
    /// 校验服务端证书
    pub verify_tls: bool,
    /// 事件 index（为空则不设置）
    pub index: String,
    /// 事件 source
    pub source: String,
    /// 事件中的 host 字段（为空则使用本机主机名）
    pub event_host: String,
    /// 单批次最大字节数
    pub max_batch_bytes: usize,
    /// 使用 gzip 压缩请求体
    pub gzip: bool,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    /// 单批次最大重试次数（不含首次）
    pub max_retries: u32,
    /// 重试退避基数（毫秒），第 n 次等待 base * 2^n 加抖动
    pub backoff_base_ms: u64,
    /// 每个主机保留的空闲连接数
    pub pool_max_idle_per_host: usize,
    pub pacing: PacingConfig,
}

impl Default for HecConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8088,
            token: String::new(),
            use_tls: true,
            verify_tls: true,
            index: String::new(),
            source: "tenable".to_string(),
            event_host: String::new(),
            max_batch_bytes: 1024 * 1024, // 1MB
            gzip: true,
            request_timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 1000,
            pool_max_idle_per_host: 10,
            pacing: PacingConfig::default(),
        }
    }
}

impl HecConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("HEC host 不能为空".to_string());
        }
        if self.port == 0 {
            return Err("HEC 端口不能为0".to_string());
        }
        if self.token.is_empty() {
            return Err("HEC token 不能为空".to_string());
        }
        if self.max_batch_bytes < 1024 {
            return Err("单批次最大字节数不应小于1KB".to_string());
        }
        self.pacing.validate()
    }

    /// 事件接收端点
    pub fn endpoint(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!(
            "{}://{}:{}/services/collector/event",
            scheme, self.host, self.port
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
