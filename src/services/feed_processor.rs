use crate::{
    error::{AppError, AppResult},
    models::{
        Checkpoint, EnvelopeDefaults, ExclusivityGroup, FeedDescriptor, FeedOutcome, FeedSummary,
        HecEnvelope,
    },
    services::{
        export::UpstreamContext,
        hec_sender::{EventBatch, HecClient},
    },
    storage::CheckpointStore,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 上游记录：去重标识、可选的记录时间（Unix秒）与原始内容
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: String,
    pub timestamp: Option<i64>,
    pub payload: JsonValue,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, timestamp: Option<i64>, payload: JsonValue) -> Self {
        Self {
            id: id.into(),
            timestamp,
            payload,
        }
    }
}

/// 记录交给 sink 后的流程控制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// 达到事件上限或收到关停信号，来源应停止拉取
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Truncated,
    Cancelled,
}

/// 一类 feed 的数据来源
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn descriptor(&self) -> &'static FeedDescriptor;

    fn group(&self) -> ExclusivityGroup {
        self.descriptor().group
    }

    /// 是否按记录时间过滤（早于高水位的记录直接跳过）
    fn keyed_on_time(&self) -> bool {
        false
    }

    /// 从上游拉取记录并逐条交给 sink
    async fn collect(&self, upstream: &UpstreamContext, sink: &mut FeedSink<'_>) -> AppResult<()>;
}

/// 单个 feed 运行期间的参数
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub batch_size: usize,
    pub max_batch_bytes: usize,
    /// 0 表示不限制
    pub max_events: u64,
    pub progress_log_interval: u64,
}

/// 检查点过滤 + 批次发送 + 确认后提交
///
/// 每个批次在下游确认后立即提交其中的ID，中途崩溃最多丢失一个未确认批次的进度。
pub struct FeedSink<'a> {
    descriptor: &'static FeedDescriptor,
    store: &'a CheckpointStore,
    sender: &'a HecClient,
    envelope: &'a EnvelopeDefaults,
    shutdown: CancellationToken,
    settings: &'a SinkSettings,
    keyed_on_time: bool,
    batch: EventBatch,
    batch_ids: Vec<String>,
    batch_id_set: HashSet<String>,
    batch_high_water: Option<i64>,
    accepted: u64,
    committed: u64,
    skipped: u64,
    batches: u64,
    stop: Option<StopReason>,
    skip_reason: Option<String>,
    started: Instant,
}

impl<'a> FeedSink<'a> {
    pub fn new(
        descriptor: &'static FeedDescriptor,
        keyed_on_time: bool,
        store: &'a CheckpointStore,
        sender: &'a HecClient,
        envelope: &'a EnvelopeDefaults,
        settings: &'a SinkSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            store,
            sender,
            envelope,
            shutdown,
            settings,
            keyed_on_time,
            batch: EventBatch::new(settings.batch_size, settings.max_batch_bytes),
            batch_ids: Vec::new(),
            batch_id_set: HashSet::new(),
            batch_high_water: None,
            accepted: 0,
            committed: 0,
            skipped: 0,
            batches: 0,
            stop: None,
            skip_reason: None,
            started: Instant::now(),
        }
    }

    pub fn feed_key(&self) -> &'static str {
        self.descriptor.key
    }

    /// 当前检查点副本
    pub fn checkpoint(&self) -> AppResult<Checkpoint> {
        self.store.snapshot(self.descriptor.key)
    }

    /// 是否已停止接收（事件上限或关停）
    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    /// 标记本次跳过该feed（例如未到扫描间隔）
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.skip_reason = Some(reason.into());
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// 在拉取详情前判断标识是否已处理过，已处理的计入跳过数
    pub fn already_seen(&mut self, record_id: &str) -> bool {
        let seen = self.batch_id_set.contains(record_id)
            || !self.store.should_process(self.descriptor.key, record_id, None);
        if seen {
            self.skipped += 1;
        }
        seen
    }

    pub async fn record_full_scan(&self, at: chrono::DateTime<Utc>) -> AppResult<()> {
        self.store.record_full_scan(self.descriptor.key, at).await
    }

    /// 提交一条记录
    pub async fn offer(&mut self, record: SourceRecord) -> AppResult<Flow> {
        if self.stop.is_some() {
            return Ok(Flow::Stop);
        }
        if self.shutdown.is_cancelled() {
            self.flush().await?;
            self.stop = Some(StopReason::Cancelled);
            info!(feed = %self.descriptor.key, "收到关停信号，停止拉取");
            return Ok(Flow::Stop);
        }

        let time_key = if self.keyed_on_time {
            record.timestamp
        } else {
            None
        };
        if self.batch_id_set.contains(&record.id)
            || !self
                .store
                .should_process(self.descriptor.key, &record.id, time_key)
        {
            self.skipped += 1;
            return Ok(Flow::Continue);
        }

        let time = record
            .timestamp
            .map(|ts| ts as f64)
            .unwrap_or_else(|| Utc::now().timestamp_millis() as f64 / 1000.0);
        let envelope = HecEnvelope::new(self.descriptor, record.payload, time, self.envelope);
        let line = serde_json::to_vec(&envelope)?;

        if self.batch.would_overflow(line.len()) {
            self.flush().await?;
        }
        self.batch.push(&line);
        self.batch_id_set.insert(record.id.clone());
        self.batch_ids.push(record.id);
        if let Some(ts) = time_key {
            self.batch_high_water = Some(self.batch_high_water.map_or(ts, |hw| hw.max(ts)));
        }
        self.accepted += 1;
        self.log_progress();

        if self.batch.is_full() {
            self.flush().await?;
        }

        let max_events = self.settings.max_events;
        if max_events > 0 && self.accepted >= max_events {
            self.flush().await?;
            self.stop = Some(StopReason::Truncated);
            info!(
                feed = %self.descriptor.key,
                "达到单feed事件上限 {}，提前结束本次采集",
                max_events
            );
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    fn log_progress(&self) {
        let interval = self.settings.progress_log_interval;
        if interval == 0 || self.accepted % interval != 0 {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.accepted as f64 / elapsed
        } else {
            0.0
        };
        info!(
            "{}: 已处理 {} 条事件（{:.1} 条/秒，已运行 {:.1} 分钟）",
            self.descriptor.name,
            self.accepted,
            rate,
            elapsed / 60.0
        );
    }

    /// 发送当前批次，确认后提交其中的ID
    ///
    /// 发送失败时批次被丢弃且不提交，下次运行会重新采集这些记录。
    pub async fn flush(&mut self) -> AppResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let ids = std::mem::take(&mut self.batch_ids);
        let high_water = self.batch_high_water.take();
        self.batch_id_set.clear();
        let encoded = self.batch.encode(self.sender.gzip());
        self.batch.clear();

        let encoded = encoded?;
        self.sender.deliver(&encoded).await?;

        let count = ids.len() as u64;
        let evicted = self
            .store
            .commit(self.descriptor.key, ids, high_water)
            .await?;
        if evicted > 0 {
            info!(
                feed = %self.descriptor.key,
                evicted,
                "检查点ID达到上限，已淘汰最早的记录"
            );
        }
        self.committed += count;
        self.batches += 1;
        Ok(())
    }

    /// 数据集读完后推进时间高水位（增量导出的下一次起点）
    ///
    /// 仅在未被截断或取消时生效，确保未到达的记录下次仍会被查询到。
    pub async fn complete_with_mark(&mut self, mark: i64) -> AppResult<()> {
        self.flush().await?;
        if self.stop.is_some() {
            return Ok(());
        }
        self.store
            .commit(self.descriptor.key, Vec::new(), Some(mark))
            .await?;
        Ok(())
    }

    /// 快照对比完成后提交新的基线ID（不发送事件）
    pub async fn complete_with_baseline(&mut self, baseline: Vec<String>) -> AppResult<bool> {
        self.flush().await?;
        if self.stop.is_some() {
            return Ok(false);
        }
        self.store.commit(self.descriptor.key, baseline, None).await?;
        Ok(true)
    }

    fn outcome(&self) -> FeedOutcome {
        if let Some(reason) = &self.skip_reason {
            return FeedOutcome::Skipped(reason.clone());
        }
        match self.stop {
            None => FeedOutcome::Completed,
            Some(StopReason::Truncated) => FeedOutcome::Truncated,
            Some(StopReason::Cancelled) => FeedOutcome::Cancelled,
        }
    }
}

/// 运行单个 feed 的执行器
pub struct FeedProcessor<'a> {
    pub store: &'a CheckpointStore,
    pub sender: &'a HecClient,
    pub upstream: &'a UpstreamContext,
    pub envelope: &'a EnvelopeDefaults,
    pub settings: &'a SinkSettings,
}

impl FeedProcessor<'_> {
    /// 运行一个 feed 并汇总结果；单个 feed 的错误不会向上传播
    pub async fn run(&self, source: &dyn FeedSource) -> FeedSummary {
        let descriptor = source.descriptor();
        let started = Instant::now();
        info!("========== 开始采集 {} ({}) ==========", descriptor.name, descriptor.key);

        let mut sink = FeedSink::new(
            descriptor,
            source.keyed_on_time(),
            self.store,
            self.sender,
            self.envelope,
            self.settings,
            self.upstream.shutdown().clone(),
        );

        let result = match self.store.snapshot(descriptor.key) {
            Ok(_) => source.collect(self.upstream, &mut sink).await,
            Err(e) => Err(e),
        };
        // 来源正常结束或中途出错时，已接收的记录仍要发送并提交
        let result = match result {
            Ok(()) => sink.flush().await,
            Err(e) if is_sink_error(&e) => Err(e),
            Err(e) => match sink.flush().await {
                Ok(()) => Err(e),
                Err(flush_err) => {
                    warn!(feed = %descriptor.key, error = %flush_err, "出错后发送剩余批次失败");
                    Err(e)
                }
            },
        };

        let outcome = match result {
            Ok(()) => sink.outcome(),
            Err(AppError::Cancelled) => FeedOutcome::Cancelled,
            Err(e) => {
                error!(feed = %descriptor.key, error = %e, "feed 采集失败");
                FeedOutcome::Failed(e.to_string())
            }
        };

        let duration = started.elapsed().as_secs_f64();
        info!(
            "========== {} 结束: {:?}，发送 {} 条事件，跳过 {} 条，耗时 {:.1} 分钟 ==========",
            descriptor.name,
            outcome,
            sink.committed,
            sink.skipped,
            duration / 60.0
        );

        FeedSummary {
            feed_key: descriptor.key.to_string(),
            feed_name: descriptor.name.to_string(),
            outcome,
            events_sent: sink.committed,
            records_skipped: sink.skipped,
            batches: sink.batches,
            duration_secs: duration,
        }
    }
}

fn is_sink_error(error: &AppError) -> bool {
    matches!(
        error,
        AppError::SinkRejected { .. } | AppError::SinkUnavailable { .. } | AppError::Checkpoint(_)
    )
}
