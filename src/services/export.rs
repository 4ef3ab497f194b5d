use crate::{
    config::tenable::{ExportConfig, RetryExecutor, TenableConfig},
    error::{AppError, AppResult},
    models::{ExportKind, ExportState},
    services::tenable_client::UpstreamApi,
};
use serde_json::Value as JsonValue;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// feed 访问上游时共享的上下文：接口、导出参数、两类重试策略与关停信号
pub struct UpstreamContext {
    pub api: Arc<dyn UpstreamApi>,
    pub export: ExportConfig,
    export_retry: RetryExecutor,
    api_retry: RetryExecutor,
    shutdown: CancellationToken,
}

impl UpstreamContext {
    pub fn new(api: Arc<dyn UpstreamApi>, config: &TenableConfig, shutdown: CancellationToken) -> Self {
        Self {
            api,
            export: config.export.clone(),
            export_retry: RetryExecutor::new(config.export_retry.clone(), shutdown.clone()),
            api_retry: RetryExecutor::new(config.api_retry.clone(), shutdown.clone()),
            shutdown,
        }
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// 以列表接口的重试策略执行上游调用
    pub async fn call<T, F, Fut>(&self, label: &str, operation: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.api_retry.execute_with_retry(operation, label).await
    }

    /// 创建导出任务；遇到导出冲突或限流按导出重试策略等待
    pub async fn start_export(
        &self,
        kind: ExportKind,
        request: &JsonValue,
        label: &str,
    ) -> AppResult<ExportJob<'_>> {
        let api = self.api.as_ref();
        let export_uuid = self
            .export_retry
            .execute_with_retry(move || api.start_export(kind, request), label)
            .await?;

        info!("{} 导出任务已创建: {}", label, export_uuid);
        Ok(ExportJob {
            ctx: self,
            kind,
            export_uuid,
            label: label.to_string(),
            pending: VecDeque::new(),
            seen: HashSet::new(),
            started: Instant::now(),
            polling_since: None,
            upstream_finished: false,
            cancelled: false,
        })
    }
}

/// 进行中的导出任务
///
/// 分块一出现在 `chunks_available` 中就下载，不必等整个任务完成。
pub struct ExportJob<'a> {
    ctx: &'a UpstreamContext,
    kind: ExportKind,
    export_uuid: String,
    label: String,
    pending: VecDeque<u64>,
    seen: HashSet<u64>,
    started: Instant,
    /// 本轮无新分块的等待起点；下游处理分块的耗时不计入
    polling_since: Option<Instant>,
    upstream_finished: bool,
    cancelled: bool,
}

impl ExportJob<'_> {
    pub fn export_uuid(&self) -> &str {
        &self.export_uuid
    }

    /// 所有分块都已交付
    pub fn is_drained(&self) -> bool {
        self.upstream_finished && self.pending.is_empty()
    }

    fn enqueue(&mut self, chunks: &[u64]) -> usize {
        let mut added = 0;
        let mut fresh: Vec<u64> = chunks
            .iter()
            .copied()
            .filter(|c| !self.seen.contains(c))
            .collect();
        fresh.sort_unstable();
        for chunk in fresh {
            self.seen.insert(chunk);
            self.pending.push_back(chunk);
            added += 1;
        }
        added
    }

    /// 下一个分块的记录；任务完成且分块耗尽时返回 `None`
    pub async fn next_chunk(&mut self) -> AppResult<Option<(u64, Vec<JsonValue>)>> {
        loop {
            if let Some(chunk_id) = self.pending.pop_front() {
                let api = self.ctx.api.as_ref();
                let kind = self.kind;
                let uuid = self.export_uuid.as_str();
                let label = format!("{} 分块 {}", self.label, chunk_id);
                let records = self
                    .ctx
                    .call(&label, move || api.download_chunk(kind, uuid, chunk_id))
                    .await?;
                debug!("{} 下载分块 {}：{} 条记录", self.label, chunk_id, records.len());
                return Ok(Some((chunk_id, records)));
            }

            if self.upstream_finished {
                return Ok(None);
            }

            let waited = self.polling_since.get_or_insert_with(Instant::now).elapsed();
            if waited >= self.ctx.export.max_wait() {
                return Err(AppError::ExportTimeout {
                    export_uuid: self.export_uuid.clone(),
                    waited_secs: waited.as_secs(),
                });
            }

            let api = self.ctx.api.as_ref();
            let kind = self.kind;
            let uuid = self.export_uuid.as_str();
            let status = self
                .ctx
                .call(&format!("{} 状态查询", self.label), move || {
                    api.export_status(kind, uuid)
                })
                .await?;

            let state = status.state();
            if state.is_terminal_failure() {
                return Err(AppError::ExportFailed {
                    export_uuid: self.export_uuid.clone(),
                    status: status.status,
                });
            }
            if !status.chunks_failed.is_empty() {
                warn!(
                    "{} 导出有 {} 个失败分块: {:?}",
                    self.label,
                    status.chunks_failed.len(),
                    status.chunks_failed
                );
            }

            let added = self.enqueue(&status.chunks_available);
            if added > 0 {
                self.polling_since = None;
            }
            if state == ExportState::Finished {
                self.upstream_finished = true;
                info!(
                    "{} 导出完成，共 {} 个分块，耗时 {:.0} 秒",
                    self.label,
                    self.seen.len(),
                    self.started.elapsed().as_secs_f64()
                );
                continue;
            }
            if added > 0 {
                continue;
            }

            debug!("{} 导出状态 {}，等待下一次轮询", self.label, status.status);
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(self.ctx.export.poll_interval()) => {}
            }
        }
    }

    /// 提前放弃时取消上游任务，释放该资源类别的导出名额
    pub async fn cancel(&mut self) {
        if self.upstream_finished || self.cancelled {
            return;
        }
        self.cancelled = true;
        match self
            .ctx
            .api
            .cancel_export(self.kind, &self.export_uuid)
            .await
        {
            Ok(()) => info!("{} 已取消导出任务 {}", self.label, self.export_uuid),
            Err(e) => warn!("{} 取消导出任务 {} 失败: {}", self.label, self.export_uuid, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! 测试用的内存上游实现

    use super::*;
    use crate::models::{ExportStatus, PluginFamily, PluginSummary, ScanHost, ScanSummary};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeUpstream {
        /// 每次导出返回的分块（按创建顺序依次消费）
        pub exports: Mutex<VecDeque<Vec<Vec<JsonValue>>>>,
        /// 在成功之前返回“导出冲突”的次数
        pub duplicate_failures: Mutex<u32>,
        /// 在状态变为 FINISHED 之前返回 PROCESSING 的次数
        pub processing_polls: Mutex<u32>,
        /// 状态查询固定返回该状态
        pub forced_status: Mutex<Option<String>>,
        pub started: Mutex<Vec<(ExportKind, JsonValue)>>,
        pub cancelled: Mutex<Vec<String>>,
        pub active: Mutex<HashMap<String, Vec<Vec<JsonValue>>>>,
        pub families: Vec<PluginFamily>,
        pub family_plugins: HashMap<u64, Vec<PluginSummary>>,
        pub plugins: HashMap<u64, JsonValue>,
        pub scans: Vec<ScanSummary>,
        pub hosts: HashMap<u64, Vec<ScanHost>>,
        pub compliance: HashMap<(u64, u64), Vec<JsonValue>>,
    }

    impl FakeUpstream {
        pub fn with_exports(exports: Vec<Vec<Vec<JsonValue>>>) -> Self {
            Self {
                exports: Mutex::new(exports.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl UpstreamApi for FakeUpstream {
        async fn start_export(&self, kind: ExportKind, request: &JsonValue) -> AppResult<String> {
            {
                let mut failures = self.duplicate_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(AppError::duplicate_export("Duplicate export not allowed"));
                }
            }
            let mut started = self.started.lock().unwrap();
            started.push((kind, request.clone()));
            let uuid = format!("export-{}", started.len());
            let chunks = self.exports.lock().unwrap().pop_front().unwrap_or_default();
            self.active.lock().unwrap().insert(uuid.clone(), chunks);
            Ok(uuid)
        }

        async fn export_status(&self, _kind: ExportKind, export_uuid: &str) -> AppResult<ExportStatus> {
            if let Some(status) = self.forced_status.lock().unwrap().clone() {
                return Ok(ExportStatus {
                    status,
                    chunks_available: Vec::new(),
                    chunks_failed: Vec::new(),
                });
            }
            let chunk_count = self
                .active
                .lock()
                .unwrap()
                .get(export_uuid)
                .map(|c| c.len() as u64)
                .unwrap_or(0);
            let mut polls = self.processing_polls.lock().unwrap();
            let status = if *polls > 0 {
                *polls -= 1;
                "PROCESSING"
            } else {
                "FINISHED"
            };
            Ok(ExportStatus {
                status: status.to_string(),
                chunks_available: (1..=chunk_count).collect(),
                chunks_failed: Vec::new(),
            })
        }

        async fn download_chunk(
            &self,
            _kind: ExportKind,
            export_uuid: &str,
            chunk_id: u64,
        ) -> AppResult<Vec<JsonValue>> {
            let active = self.active.lock().unwrap();
            Ok(active
                .get(export_uuid)
                .and_then(|chunks| chunks.get(chunk_id as usize - 1))
                .cloned()
                .unwrap_or_default())
        }

        async fn cancel_export(&self, _kind: ExportKind, export_uuid: &str) -> AppResult<()> {
            self.cancelled.lock().unwrap().push(export_uuid.to_string());
            Ok(())
        }

        async fn plugin_families(&self) -> AppResult<Vec<PluginFamily>> {
            Ok(self.families.clone())
        }

        async fn family_plugins(&self, family_id: u64) -> AppResult<Vec<PluginSummary>> {
            Ok(self.family_plugins.get(&family_id).cloned().unwrap_or_default())
        }

        async fn plugin_details(&self, plugin_id: u64) -> AppResult<JsonValue> {
            self.plugins
                .get(&plugin_id)
                .cloned()
                .ok_or_else(|| AppError::upstream(Some(404), format!("plugin {} not found", plugin_id)))
        }

        async fn list_scans(&self) -> AppResult<Vec<ScanSummary>> {
            Ok(self.scans.clone())
        }

        async fn scan_hosts(&self, scan_id: u64) -> AppResult<Vec<ScanHost>> {
            Ok(self.hosts.get(&scan_id).cloned().unwrap_or_default())
        }

        async fn host_compliance(&self, scan_id: u64, host_id: u64) -> AppResult<Vec<JsonValue>> {
            Ok(self
                .compliance
                .get(&(scan_id, host_id))
                .cloned()
                .unwrap_or_default())
        }
    }

    /// 零等待的上游上下文
    pub fn context(api: Arc<dyn UpstreamApi>, shutdown: CancellationToken) -> UpstreamContext {
        let mut config = TenableConfig::default();
        config.export.poll_interval_secs = 0;
        config.export.max_wait_secs = 5;
        for retry in [&mut config.export_retry, &mut config.api_retry] {
            retry.initial_backoff_secs = 0;
            retry.max_backoff_secs = 0;
            retry.jitter = false;
        }
        UpstreamContext::new(api, &config, shutdown)
    }
}
