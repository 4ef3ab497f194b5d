use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::{EnvelopeDefaults, FeedKind, FeedSummary, RunStatus, RunSummary, SenderStats},
    services::{
        export::UpstreamContext,
        feed_processor::SinkSettings,
        hec_sender::HecClient,
        scheduler::{FeedRuntime, GroupScheduler},
        tenable_client::UpstreamApi,
    },
    storage::{AcquireOutcome, CheckpointStore, LockGuard, ProcessLock, local_hostname},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 采集运行的编排器：进程锁、检查点维护、分组调度与运行汇总
pub struct Collector {
    runtime: Arc<FeedRuntime>,
    lock: ProcessLock,
    shutdown: CancellationToken,
}

impl Collector {
    pub fn new(
        config: &Config,
        api: Arc<dyn UpstreamApi>,
        shutdown: CancellationToken,
    ) -> AppResult<Self> {
        let store = CheckpointStore::new(config.checkpoint.clone())?;
        let sender = HecClient::new(&config.hec, shutdown.clone())?;
        let upstream = UpstreamContext::new(api, &config.tenable, shutdown.clone());

        let host = if config.hec.event_host.trim().is_empty() {
            local_hostname()
        } else {
            config.hec.event_host.clone()
        };
        let envelope = EnvelopeDefaults {
            host,
            source: config.hec.source.clone(),
            index: Some(config.hec.index.clone()).filter(|i| !i.trim().is_empty()),
        };
        let settings = SinkSettings {
            batch_size: config.collector.batch_size,
            max_batch_bytes: config.hec.max_batch_bytes,
            max_events: config.collector.max_events_per_feed,
            progress_log_interval: config.collector.progress_log_interval,
        };

        let runtime = FeedRuntime {
            store,
            sender,
            upstream,
            envelope,
            settings,
            collector: config.collector.clone(),
        };
        let lock = ProcessLock::new(&config.lock)?;
        Ok(Self::from_parts(Arc::new(runtime), lock, shutdown))
    }

    pub fn from_parts(runtime: Arc<FeedRuntime>, lock: ProcessLock, shutdown: CancellationToken) -> Self {
        Self {
            runtime,
            lock,
            shutdown,
        }
    }

    async fn acquire_lock(&self) -> AppResult<Option<LockGuard>> {
        let lock = self.lock.clone();
        let outcome = tokio::task::spawn_blocking(move || lock.try_acquire())
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("获取进程锁的任务异常: {}", e)))??;

        match outcome {
            AcquireOutcome::Held(guard) => Ok(Some(guard)),
            AcquireOutcome::Reclaimed { guard, previous } => {
                if let Some(previous) = previous {
                    warn!(
                        pid = previous.pid,
                        host = %previous.host,
                        acquired_at = %previous.acquired_at,
                        "回收了过期的进程锁"
                    );
                }
                Ok(Some(guard))
            }
            AcquireOutcome::Busy(holder) => {
                match holder {
                    Some(holder) => info!(
                        "另一个实例正在运行（pid {}，主机 {}，开始于 {}），本次跳过",
                        holder.pid, holder.host, holder.acquired_at
                    ),
                    None => info!("进程锁被占用，本次跳过"),
                }
                Ok(None)
            }
        }
    }

    /// 执行一次完整采集
    ///
    /// 锁被占用时直接返回 `SkippedLocked`，不读写任何检查点。单个 feed 的失败
    /// 记录在汇总中，不会让整个运行返回错误。
    pub async fn run_once(&self, selected: &[FeedKind]) -> AppResult<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let Some(guard) = self.acquire_lock().await? else {
            return Ok(RunSummary::skipped(run_id, started_at));
        };
        info!(run_id = %run_id, "开始采集运行，共 {} 个 feed", selected.len());

        let collected = self.collect(selected).await;
        self.release_lock(guard).await;
        let (feeds, sender) = collected?;

        let summary = RunSummary::from_feeds(
            run_id,
            started_at,
            feeds,
            sender,
            self.shutdown.is_cancelled(),
        );
        log_summary(&summary);
        Ok(summary)
    }

    async fn collect(&self, selected: &[FeedKind]) -> AppResult<(Vec<FeedSummary>, SenderStats)> {
        let store = &self.runtime.store;
        match store.purge_if_due() {
            Ok(purged) if !purged.is_empty() => info!("清理过期检查点: {:?}", purged),
            Ok(_) => {}
            Err(e) => warn!("清理过期检查点失败: {}", e),
        }
        let loaded = store.load_all()?;
        debug!("已加载 {} 个检查点", loaded);

        let stats_before = self.runtime.sender.stats();
        let feeds = GroupScheduler::new(self.runtime.clone()).run(selected).await;

        match store.flush().await {
            Ok(0) => {}
            Ok(written) => debug!("运行结束写回 {} 个检查点", written),
            Err(e) => error!("写回检查点失败: {}", e),
        }
        let sender = self.runtime.sender.stats().since(&stats_before);
        Ok((feeds, sender))
    }

    /// 释放锁可能等待回收守护文件，放到阻塞线程执行
    async fn release_lock(&self, guard: LockGuard) {
        match tokio::task::spawn_blocking(move || guard.release()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("释放进程锁失败: {}", e),
            Err(e) => warn!("释放进程锁的任务异常: {}", e),
        }
    }

    /// 守护模式：按固定间隔重复运行，直到收到关停信号
    pub async fn run_daemon(&self, selected: &[FeedKind], interval: Duration) -> AppResult<()> {
        info!("守护模式启动，运行间隔 {} 秒", interval.as_secs());
        let mut runs = 0u64;

        while !self.shutdown.is_cancelled() {
            runs += 1;
            match self.run_once(selected).await {
                Ok(summary) if summary.status == RunStatus::SkippedLocked => {
                    info!("第 {} 次运行因进程锁被占用而跳过", runs)
                }
                Ok(_) => {}
                Err(e) => error!("第 {} 次运行失败: {}", runs, e),
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            info!("下一次运行在 {} 秒后", interval.as_secs());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("守护模式结束，共运行 {} 次", runs);
        Ok(())
    }
}

fn log_summary(summary: &RunSummary) {
    let elapsed = (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0;
    info!("================ 运行汇总 ({}) ================", summary.run_id);
    for feed in &summary.feeds {
        info!(
            "  {:<36} {:?}: 发送 {} 条，跳过 {} 条，{} 批，{:.1} 秒",
            feed.feed_key,
            feed.outcome,
            feed.events_sent,
            feed.records_skipped,
            feed.batches,
            feed.duration_secs
        );
    }
    info!(
        "状态 {:?}，共发送 {} 条事件（HEC 批次 {}，重试 {}，拒绝 {}），耗时 {:.1} 分钟",
        summary.status,
        summary.total_events(),
        summary.sender.sent_batches,
        summary.sender.retries,
        summary.sender.rejected,
        elapsed / 60.0
    );
    let failed = summary.failed_feeds();
    if !failed.is_empty() {
        error!("失败的 feed: {}", failed.join(", "));
    }
}
