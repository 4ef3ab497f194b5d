use super::scalar_string;
use crate::{
    error::{AppError, AppResult},
    models::{FeedDescriptor, FeedKind, ScanSummary},
    services::{
        export::UpstreamContext,
        feed_processor::{FeedSink, FeedSource, Flow, SourceRecord},
    },
};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

/// 合规检查结果，按扫描的最后修改时间增量采集
///
/// 扫描按修改时间升序处理，批次提交的高水位即已处理扫描的修改时间。
/// 修改时间等于高水位的扫描仍会重新遍历，被截断的扫描下次可以继续。
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplianceFeed;

fn pending_scans(scans: Vec<ScanSummary>, mark: Option<i64>) -> Vec<ScanSummary> {
    let mut pending: Vec<ScanSummary> = scans
        .into_iter()
        .filter(|scan| scan.status.eq_ignore_ascii_case("completed"))
        .filter(|scan| mark.is_none_or(|mark| scan.last_modification_date >= mark))
        .collect();
    pending.sort_by_key(|scan| scan.last_modification_date);
    pending
}

#[async_trait]
impl FeedSource for ComplianceFeed {
    fn descriptor(&self) -> &'static FeedDescriptor {
        FeedKind::Compliance.descriptor()
    }

    fn keyed_on_time(&self) -> bool {
        true
    }

    async fn collect(&self, upstream: &UpstreamContext, sink: &mut FeedSink<'_>) -> AppResult<()> {
        let api = upstream.api.as_ref();
        let mark = sink.checkpoint()?.last_timestamp;
        let scans = upstream.call("扫描列表", move || api.list_scans()).await?;
        let total = scans.len();
        let scans = pending_scans(scans, mark);
        info!(
            "{}: 共 {} 个扫描，{} 个待处理（高水位 {:?}）",
            sink.feed_key(),
            total,
            scans.len(),
            mark
        );

        for scan in scans {
            let scan_id = scan.id;
            let hosts = match upstream
                .call(&format!("扫描 {} 主机列表", scan_id), move || {
                    api.scan_hosts(scan_id)
                })
                .await
            {
                Ok(hosts) => hosts,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!("{}: 获取扫描 {} 主机失败，跳过: {}", sink.feed_key(), scan.name, e);
                    continue;
                }
            };
            debug!("{}: 扫描 {} 有 {} 台主机", sink.feed_key(), scan.name, hosts.len());

            for host in hosts {
                let host_id = host.host_id;
                let items = match upstream
                    .call(&format!("扫描 {} 主机 {}", scan_id, host_id), move || {
                        api.host_compliance(scan_id, host_id)
                    })
                    .await
                {
                    Ok(items) => items,
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(e) => {
                        warn!(
                            "{}: 获取主机 {} 合规结果失败，跳过: {}",
                            sink.feed_key(),
                            host.hostname,
                            e
                        );
                        continue;
                    }
                };

                for item in items {
                    let plugin_id =
                        scalar_string(&item["plugin_id"]).unwrap_or_else(|| "unknown".to_string());
                    let id = format!("{}_{}_{}", scan_id, host_id, plugin_id);
                    let payload = json!({
                        "scan_id": scan_id,
                        "scan_name": scan.name,
                        "host_id": host_id,
                        "hostname": host.hostname,
                        "compliance_data": item,
                    });
                    let record = SourceRecord::new(id, Some(scan.last_modification_date), payload);
                    if sink.offer(record).await? == Flow::Stop {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeedOutcome, ScanHost};
    use crate::services::export::testing::{FakeUpstream, context};
    use crate::services::feed_processor::testing::Harness;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn scan(id: u64, status: &str, modified: i64) -> ScanSummary {
        ScanSummary {
            id,
            name: format!("scan-{}", id),
            status: status.into(),
            last_modification_date: modified,
        }
    }

    fn upstream_with(scans: Vec<ScanSummary>) -> FakeUpstream {
        let mut hosts = HashMap::new();
        let mut compliance = HashMap::new();
        for s in &scans {
            hosts.insert(s.id, vec![ScanHost { host_id: 1, hostname: "web-01".into() }]);
            compliance.insert(
                (s.id, 1),
                vec![json!({"plugin_id": 1001, "status": "PASSED"}), json!({"plugin_id": 1002, "status": "FAILED"})],
            );
        }
        FakeUpstream {
            scans,
            hosts,
            compliance,
            ..FakeUpstream::default()
        }
    }

    #[test]
    fn test_pending_scans_order_and_filter() {
        let scans = vec![
            scan(1, "completed", 300),
            scan(2, "running", 400),
            scan(3, "completed", 100),
            scan(4, "Completed", 200),
        ];
        let ids: Vec<u64> = pending_scans(scans.clone(), None).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 4, 1]);
        let ids: Vec<u64> = pending_scans(scans, Some(200)).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![4, 1]);
    }

    #[tokio::test]
    async fn test_compliance_advances_scan_mark() {
        let mut harness = Harness::new(10, 0).await;
        harness
            .server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .create_async()
            .await;

        let ctx = context(
            Arc::new(upstream_with(vec![scan(5, "completed", 100), scan(6, "completed", 200)])),
            CancellationToken::new(),
        );
        let first = harness.processor(&ctx).run(&ComplianceFeed).await;
        assert_eq!(first.outcome, FeedOutcome::Completed);
        assert_eq!(first.events_sent, 4);

        let cp = harness.store.snapshot("tenableio_compliance").unwrap();
        assert_eq!(cp.last_timestamp, Some(200));
        assert!(cp.processed_ids.contains("5_1_1001"));

        // 高水位之前的扫描不再遍历，等于高水位的扫描只会被去重
        let second = harness.processor(&ctx).run(&ComplianceFeed).await;
        assert_eq!(second.events_sent, 0);
        assert_eq!(second.records_skipped, 2);
    }

    #[tokio::test]
    async fn test_truncated_scan_resumes_next_run() {
        let mut harness = Harness::new(1, 1).await;
        harness
            .server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .create_async()
            .await;

        let ctx = context(
            Arc::new(upstream_with(vec![scan(5, "completed", 100)])),
            CancellationToken::new(),
        );
        let first = harness.processor(&ctx).run(&ComplianceFeed).await;
        assert_eq!(first.outcome, FeedOutcome::Truncated);

        let second = harness.processor(&ctx).run(&ComplianceFeed).await;
        assert_eq!(second.events_sent, 1);
        let cp = harness.store.snapshot("tenableio_compliance").unwrap();
        assert!(cp.processed_ids.contains("5_1_1002"));
    }
}
