use crate::{
    config::hec::{HecConfig, PacingConfig},
    error::{AppError, AppResult},
    models::SenderStats,
};
use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use reqwest::{Client, StatusCode, header};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 单次发送的结果分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Ack,
    /// 不可重试的拒绝（除 408/429 外的 4xx）
    Rejected { status: u16, body: String },
    /// 限流、服务不可用、超时或连接失败
    Retryable { status: Option<u16>, reason: String },
}

/// 自适应发送节奏（AIMD）
///
/// 所有共享同一连接池的发送方共用一个实例：成功按系数缩短间隔，可重试失败按系数加长间隔。
#[derive(Debug)]
pub struct PacingController {
    config: PacingConfig,
    delay_ms: Mutex<u64>,
}

impl PacingController {
    pub fn new(config: PacingConfig) -> Self {
        let initial = config
            .initial_delay_ms
            .clamp(config.min_delay_ms, config.max_delay_ms);
        Self {
            config,
            delay_ms: Mutex::new(initial),
        }
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(*self.delay_ms.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// 成功后缩短间隔，不低于下限
    pub fn on_ack(&self) -> Duration {
        let mut delay = self.delay_ms.lock().unwrap_or_else(PoisonError::into_inner);
        let next = (*delay as f64 * self.config.decrease_factor).floor() as u64;
        *delay = next.max(self.config.min_delay_ms);
        Duration::from_millis(*delay)
    }

    /// 可重试失败后加长间隔，不超过上限
    pub fn on_retryable(&self) -> Duration {
        let mut delay = self.delay_ms.lock().unwrap_or_else(PoisonError::into_inner);
        let scaled = (*delay as f64 * self.config.increase_factor).ceil() as u64;
        let stepped = delay.saturating_add(self.config.increase_step_ms);
        *delay = scaled.max(stepped).min(self.config.max_delay_ms);
        Duration::from_millis(*delay)
    }

    /// 发送前等待当前间隔
    pub async fn wait(&self) {
        let delay = self.current_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// 按事件数与字节数封口的批次缓冲，内容为换行分隔的 JSON 信封
#[derive(Debug)]
pub struct EventBatch {
    buffer: Vec<u8>,
    events: usize,
    max_events: usize,
    max_bytes: usize,
}

impl EventBatch {
    pub fn new(max_events: usize, max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            events: 0,
            max_events: max_events.max(1),
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events == 0
    }

    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    /// 加入该行后是否会超过字节上限（空批次总能容纳一行）
    pub fn would_overflow(&self, line_len: usize) -> bool {
        self.events > 0 && self.buffer.len() + 1 + line_len > self.max_bytes
    }

    pub fn push(&mut self, line: &[u8]) {
        if self.events > 0 {
            self.buffer.push(b'\n');
        }
        self.buffer.extend_from_slice(line);
        self.events += 1;
    }

    pub fn is_full(&self) -> bool {
        self.events >= self.max_events || self.buffer.len() >= self.max_bytes
    }

    /// 生成请求体，按需 gzip 压缩
    pub fn encode(&self, gzip: bool) -> AppResult<EncodedBatch> {
        let body = if gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.buffer)?;
            Bytes::from(encoder.finish()?)
        } else {
            Bytes::copy_from_slice(&self.buffer)
        };
        Ok(EncodedBatch {
            body,
            gzip,
            events: self.events,
        })
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.events = 0;
    }
}

/// 编码后的批次，重试时复用同一请求体
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    body: Bytes,
    gzip: bool,
    events: usize,
}

#[derive(Debug, Default)]
struct Counters {
    sent_events: AtomicU64,
    sent_batches: AtomicU64,
    retries: AtomicU64,
    rejected: AtomicU64,
}

/// HEC 批量发送客户端
///
/// 内部的 reqwest 连接池与节奏控制器被所有 feed 共享。
pub struct HecClient {
    client: Client,
    endpoint: String,
    auth_header: String,
    gzip: bool,
    max_retries: u32,
    backoff_base: Duration,
    pacing: Arc<PacingController>,
    counters: Counters,
    shutdown: CancellationToken,
}

impl HecClient {
    pub fn new(config: &HecConfig, shutdown: CancellationToken) -> AppResult<Self> {
        if !config.verify_tls {
            warn!("HEC 证书校验已关闭");
        }
        let client = Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint(),
            auth_header: format!("Splunk {}", config.token),
            gzip: config.gzip,
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            pacing: Arc::new(PacingController::new(config.pacing.clone())),
            counters: Counters::default(),
            shutdown,
        })
    }

    pub fn gzip(&self) -> bool {
        self.gzip
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            sent_events: self.counters.sent_events.load(Ordering::Relaxed),
            sent_batches: self.counters.sent_batches.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// 发送一次并分类响应
    pub async fn send_once(&self, batch: &EncodedBatch) -> SendOutcome {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(header::AUTHORIZATION, &self.auth_header)
            .header(header::CONTENT_TYPE, "application/json")
            .body(batch.body.clone());
        if batch.gzip {
            request = request.header(header::CONTENT_ENCODING, "gzip");
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return SendOutcome::Retryable {
                    status: None,
                    reason: e.to_string(),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return SendOutcome::Ack;
        }

        let body = response.text().await.unwrap_or_default();
        if is_retryable_status(status) {
            SendOutcome::Retryable {
                status: Some(status.as_u16()),
                reason: body,
            }
        } else {
            SendOutcome::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }

    /// 投递一个批次：节奏等待后发送，可重试失败按抖动指数退避重发同一批次
    ///
    /// 返回 `Ok` 表示下游已确认；退避等待期间收到关停信号时返回 `Cancelled`，批次视为未发送。
    pub async fn deliver(&self, batch: &EncodedBatch) -> AppResult<()> {
        let mut attempt: u32 = 0;
        loop {
            self.pacing.wait().await;

            match self.send_once(batch).await {
                SendOutcome::Ack => {
                    let delay = self.pacing.on_ack();
                    self.counters
                        .sent_events
                        .fetch_add(batch.events as u64, Ordering::Relaxed);
                    self.counters.sent_batches.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        events = batch.events,
                        bytes = batch.body.len(),
                        pacing_ms = delay.as_millis() as u64,
                        "HEC 批次已确认"
                    );
                    return Ok(());
                }
                SendOutcome::Rejected { status, body } => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    error!("HEC 拒绝批次 ({}): {}", status, body);
                    return Err(AppError::SinkRejected { status, body });
                }
                SendOutcome::Retryable { status, reason } => {
                    let delay = self.pacing.on_retryable();
                    if attempt >= self.max_retries {
                        return Err(AppError::SinkUnavailable {
                            attempts: attempt + 1,
                            reason: match status {
                                Some(code) => format!("{}: {}", code, reason),
                                None => reason,
                            },
                        });
                    }
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);

                    let wait = self.backoff(attempt);
                    warn!(
                        "HEC 返回 {:?}，{:.1} 秒后重试（第 {}/{} 次），节奏间隔调整为 {} 毫秒",
                        status,
                        wait.as_secs_f64(),
                        attempt + 1,
                        self.max_retries + 1,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(AppError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// base * 2^attempt，附加至多 25% 的随机抖动
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.saturating_mul(2u32.saturating_pow(attempt));
        base.mul_f64(1.0 + rand::random::<f64>() * 0.25)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
