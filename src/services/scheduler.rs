use crate::{
    config::CollectorConfig,
    models::{EnvelopeDefaults, ExclusivityGroup, FeedKind, FeedOutcome, FeedSummary},
    services::{
        export::UpstreamContext,
        feed_processor::{FeedProcessor, SinkSettings},
        feeds::build_source,
        hec_sender::HecClient,
    },
    storage::CheckpointStore,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info};

/// 一次运行中所有 feed 共享的组件
pub struct FeedRuntime {
    pub store: CheckpointStore,
    pub sender: HecClient,
    pub upstream: UpstreamContext,
    pub envelope: EnvelopeDefaults,
    pub settings: SinkSettings,
    pub collector: CollectorConfig,
}

impl FeedRuntime {
    pub fn processor(&self) -> FeedProcessor<'_> {
        FeedProcessor {
            store: &self.store,
            sender: &self.sender,
            upstream: &self.upstream,
            envelope: &self.envelope,
            settings: &self.settings,
        }
    }

    fn inter_feed_delay(&self) -> Duration {
        Duration::from_secs(self.collector.inter_feed_delay_secs)
    }
}

/// 按互斥组拆分选中的 feed，组的顺序与组内顺序都保持选择顺序
pub fn plan(selected: &[FeedKind]) -> Vec<(ExclusivityGroup, Vec<FeedKind>)> {
    let mut groups: Vec<(ExclusivityGroup, Vec<FeedKind>)> = Vec::new();
    for &kind in selected {
        match groups.iter_mut().find(|(group, _)| *group == kind.group()) {
            Some((_, feeds)) => {
                if !feeds.contains(&kind) {
                    feeds.push(kind);
                }
            }
            None => groups.push((kind.group(), vec![kind])),
        }
    }
    groups
}

/// 分组调度器
///
/// 不同组并发运行，组内严格串行并在两个 feed 之间冷却；
/// 同时运行的 feed 数受 `max_concurrent_feeds` 限制。
pub struct GroupScheduler {
    runtime: Arc<FeedRuntime>,
    permits: Arc<Semaphore>,
}

impl GroupScheduler {
    pub fn new(runtime: Arc<FeedRuntime>) -> Self {
        let limit = runtime.collector.max_concurrent_feeds.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// 运行所有选中的 feed，按选择顺序返回每个 feed 的汇总
    pub async fn run(&self, selected: &[FeedKind]) -> Vec<FeedSummary> {
        let groups = plan(selected);
        info!(
            "调度 {} 个 feed，分为 {} 个互斥组，最大并发 {}",
            selected.len(),
            groups.len(),
            self.permits.available_permits()
        );

        let mut tasks = JoinSet::new();
        for (group, feeds) in groups {
            tasks.spawn(run_group(
                self.runtime.clone(),
                self.permits.clone(),
                group,
                feeds,
            ));
        }

        let mut summaries: HashMap<String, FeedSummary> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(results) => {
                    for summary in results {
                        summaries.insert(summary.feed_key.clone(), summary);
                    }
                }
                Err(e) => error!("互斥组任务异常退出: {}", e),
            }
        }

        let mut ordered = Vec::with_capacity(selected.len());
        for kind in selected {
            if ordered.iter().any(|s: &FeedSummary| s.feed_key == kind.key()) {
                continue;
            }
            let summary = summaries.remove(kind.key()).unwrap_or_else(|| {
                FeedSummary::not_run(
                    kind.descriptor(),
                    FeedOutcome::Failed("互斥组任务异常退出".to_string()),
                )
            });
            ordered.push(summary);
        }
        ordered
    }
}

async fn run_group(
    runtime: Arc<FeedRuntime>,
    permits: Arc<Semaphore>,
    group: ExclusivityGroup,
    feeds: Vec<FeedKind>,
) -> Vec<FeedSummary> {
    let shutdown = runtime.upstream.shutdown().clone();
    let mut summaries = Vec::with_capacity(feeds.len());
    debug!("互斥组 {} 开始: {:?}", group, feeds);

    for (n, kind) in feeds.into_iter().enumerate() {
        let descriptor = kind.descriptor();

        // 上游释放该资源类别的导出锁需要时间
        if n > 0 && runtime.collector.inter_feed_delay_secs > 0 {
            debug!("互斥组 {} 冷却 {} 秒", group, runtime.collector.inter_feed_delay_secs);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(runtime.inter_feed_delay()) => {}
            }
        }
        if shutdown.is_cancelled() {
            summaries.push(FeedSummary::not_run(descriptor, FeedOutcome::Cancelled));
            continue;
        }

        let permit = tokio::select! {
            _ = shutdown.cancelled() => None,
            permit = permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            summaries.push(FeedSummary::not_run(descriptor, FeedOutcome::Cancelled));
            continue;
        };

        let source = build_source(kind, &runtime.collector);
        debug!("互斥组 {} 运行 {}", source.group(), descriptor.key);
        let summary = runtime.processor().run(source.as_ref()).await;
        drop(permit);
        summaries.push(summary);
    }

    debug!("互斥组 {} 结束", group);
    summaries
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::services::feed_processor::testing::Harness;
    use mockito::ServerGuard;
    use tempfile::TempDir;

    /// 把测试装配转成共享组件，HEC 服务器与临时目录需要在调用方继续存活
    pub fn runtime(
        harness: Harness,
        upstream: UpstreamContext,
        collector: CollectorConfig,
    ) -> (ServerGuard, TempDir, Arc<FeedRuntime>) {
        let Harness {
            server,
            dir,
            store,
            sender,
            envelope,
            settings,
        } = harness;
        (
            server,
            dir,
            Arc::new(FeedRuntime {
                store,
                sender,
                upstream,
                envelope,
                settings,
                collector,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::runtime;
    use super::*;
    use crate::services::export::testing::{FakeUpstream, context};
    use crate::services::feed_processor::testing::Harness;
    use serde_json::json;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_plan_groups_by_exclusivity() {
        let selected = [
            FeedKind::Vulnerability,
            FeedKind::Asset,
            FeedKind::Compliance,
            FeedKind::FixedVulnerability,
            FeedKind::TerminatedAsset,
            FeedKind::Asset,
        ];
        let groups = plan(&selected);
        assert_eq!(
            groups,
            vec![
                (
                    ExclusivityGroup::VulnExport,
                    vec![FeedKind::Vulnerability, FeedKind::FixedVulnerability]
                ),
                (
                    ExclusivityGroup::AssetExport,
                    vec![FeedKind::Asset, FeedKind::TerminatedAsset]
                ),
                (ExclusivityGroup::ScanResults, vec![FeedKind::Compliance]),
            ]
        );
    }

    #[tokio::test]
    async fn test_exports_in_a_group_never_overlap() {
        let mut harness = Harness::new(10, 0).await;
        harness
            .server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .create_async()
            .await;

        let fake = Arc::new(FakeUpstream::with_exports(vec![
            vec![vec![json!({"id": "a1"})]],
            vec![vec![json!({"id": "t1", "terminated_at": "2024-01-01T00:00:00Z"})]],
        ]));
        let upstream = context(fake.clone(), CancellationToken::new());
        let collector = CollectorConfig {
            max_concurrent_feeds: 4,
            inter_feed_delay_secs: 0,
            ..CollectorConfig::default()
        };
        let (_server, _dir, runtime) = runtime(harness, upstream, collector);

        let summaries = GroupScheduler::new(runtime)
            .run(&[FeedKind::Asset, FeedKind::TerminatedAsset])
            .await;

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].feed_key, "tenableio_asset");
        assert_eq!(summaries[1].feed_key, "tenableio_terminated_asset");
        assert!(summaries.iter().all(|s| s.outcome == FeedOutcome::Completed));

        // 组内按选择顺序依次创建导出任务
        let started = fake.started.lock().unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].1["filters"]["is_deleted"], false);
        assert_eq!(started[1].1["filters"]["is_terminated"], true);
    }

    #[tokio::test]
    async fn test_failed_feed_does_not_stop_siblings() {
        let mut harness = Harness::new(10, 0).await;
        harness
            .server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .create_async()
            .await;

        // 导出一直处于 ERROR，资产 feed 失败；插件 feed 不受影响
        let fake = Arc::new(FakeUpstream::default());
        *fake.forced_status.lock().unwrap() = Some("ERROR".into());
        let upstream = context(fake, CancellationToken::new());
        let (_server, _dir, runtime) = runtime(harness, upstream, CollectorConfig::default());

        let summaries = GroupScheduler::new(runtime)
            .run(&[FeedKind::Asset, FeedKind::Plugin])
            .await;
        assert!(summaries[0].outcome.is_failure());
        assert_eq!(summaries[1].outcome, FeedOutcome::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiting_feeds() {
        let harness = Harness::new(10, 0).await;
        let shutdown = CancellationToken::new();
        let upstream = context(Arc::new(FakeUpstream::default()), shutdown.clone());
        let collector = CollectorConfig {
            inter_feed_delay_secs: 600,
            ..CollectorConfig::default()
        };
        let (_server, _dir, runtime) = runtime(harness, upstream, collector);

        let started = Instant::now();
        let canceller = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.cancel();
            }
        });
        let summaries = GroupScheduler::new(runtime)
            .run(&[FeedKind::Plugin, FeedKind::Asset, FeedKind::DeletedAsset])
            .await;
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(60));
        let deleted = summaries
            .iter()
            .find(|s| s.feed_key == "tenableio_deleted_asset")
            .unwrap();
        assert_eq!(deleted.outcome, FeedOutcome::Cancelled);
    }
}
