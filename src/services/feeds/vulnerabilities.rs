use super::{diff_snapshot, parse_timestamp, scalar_string, snapshot_export, stream_export};
use crate::{
    error::AppResult,
    models::{ExportKind, FeedDescriptor, FeedKind},
    services::{
        export::UpstreamContext,
        feed_processor::{FeedSink, FeedSource, SourceRecord},
    },
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::info;

/// 漏洞唯一键：`<资产uuid>_<插件id>_<端口>_<协议>`
pub fn vulnerability_key(vuln: &JsonValue) -> String {
    let field = |pointer: &str, default: &str| {
        vuln.pointer(pointer)
            .and_then(scalar_string)
            .unwrap_or_else(|| default.to_string())
    };
    format!(
        "{}_{}_{}_{}",
        field("/asset/uuid", "unknown"),
        field("/plugin/id", "unknown"),
        field("/port/port", "0"),
        field("/port/protocol", "tcp"),
    )
}

/// 增量漏洞 feed：活跃漏洞、信息级漏洞、Agent 漏洞
///
/// 以上次完整运行的开始时间作为 `since` 过滤，数据集读完后才推进该时间。
#[derive(Debug, Clone, Copy)]
pub struct VulnerabilityFeed {
    kind: FeedKind,
}

impl VulnerabilityFeed {
    pub fn new(kind: FeedKind) -> Self {
        debug_assert!(matches!(
            kind,
            FeedKind::Vulnerability
                | FeedKind::VulnerabilityNoInfo
                | FeedKind::VulnerabilitySelfScan
        ));
        Self { kind }
    }

    fn filters(&self, since: Option<i64>) -> JsonValue {
        let mut filters = match self.kind {
            FeedKind::VulnerabilityNoInfo => json!({"severity": ["info"]}),
            FeedKind::VulnerabilitySelfScan => json!({"state": ["OPEN"]}),
            _ => json!({"severity": ["medium", "high", "critical"]}),
        };
        if let Some(since) = since {
            filters["since"] = json!(since);
        }
        filters
    }
}

#[async_trait]
impl FeedSource for VulnerabilityFeed {
    fn descriptor(&self) -> &'static FeedDescriptor {
        self.kind.descriptor()
    }

    async fn collect(&self, upstream: &UpstreamContext, sink: &mut FeedSink<'_>) -> AppResult<()> {
        let run_started = Utc::now().timestamp();
        let since = sink.checkpoint()?.last_timestamp;
        match since {
            Some(since) => info!("{}: 增量查询 since={}", sink.feed_key(), since),
            None => info!("{}: 首次运行，全量查询", sink.feed_key()),
        }

        let request = json!({
            "num_assets": upstream.export.num_assets,
            "include_unlicensed": upstream.export.include_unlicensed,
            "filters": self.filters(since),
        });
        let agent_only = self.kind == FeedKind::VulnerabilitySelfScan;

        let drained = stream_export(upstream, sink, ExportKind::Vulns, &request, |vuln| {
            let has_agent = vuln
                .pointer("/asset/has_agent")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            if agent_only && !has_agent {
                return None;
            }
            let key = vulnerability_key(&vuln);
            let timestamp = parse_timestamp(&vuln["last_found"]);
            Some(SourceRecord::new(key, timestamp, vuln))
        })
        .await?;

        if drained {
            sink.complete_with_mark(run_started).await?;
        }
        Ok(())
    }
}

/// 已修复漏洞：对比当前开放漏洞快照与上次基线
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedVulnerabilityFeed;

/// 从漏洞键还原各组成部分，资产 uuid 中可能含有下划线
fn split_key(key: &str) -> (&str, &str, &str, &str) {
    let mut parts = key.rsplitn(4, '_');
    let protocol = parts.next().unwrap_or("tcp");
    let port = parts.next().unwrap_or("0");
    let plugin = parts.next().unwrap_or("unknown");
    let asset = parts.next().unwrap_or("unknown");
    (asset, plugin, port, protocol)
}

#[async_trait]
impl FeedSource for FixedVulnerabilityFeed {
    fn descriptor(&self) -> &'static FeedDescriptor {
        FeedKind::FixedVulnerability.descriptor()
    }

    async fn collect(&self, upstream: &UpstreamContext, sink: &mut FeedSink<'_>) -> AppResult<()> {
        let request = json!({
            "num_assets": upstream.export.num_assets,
            "include_unlicensed": upstream.export.include_unlicensed,
            "filters": {"state": ["OPEN"]},
        });
        let current = snapshot_export(
            upstream,
            ExportKind::Vulns,
            &request,
            sink.feed_key(),
            |vuln| Some(vulnerability_key(vuln)),
        )
        .await?;

        diff_snapshot(sink, current, "fixed", |key, detected_at| {
            let (asset, plugin, port, protocol) = split_key(key);
            json!({
                "vulnerability_key": key,
                "asset_uuid": asset,
                "plugin_id": plugin,
                "port": port,
                "protocol": protocol,
                "event_type": "vulnerability_fixed",
                "detected_at": detected_at,
            })
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeedOutcome;
    use crate::services::export::testing::{FakeUpstream, context};
    use crate::services::feed_processor::testing::Harness;
    use mockito::Matcher;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn vuln(asset: &str, plugin: u64, port: u64, has_agent: bool) -> JsonValue {
        json!({
            "asset": {"uuid": asset, "has_agent": has_agent},
            "plugin": {"id": plugin},
            "port": {"port": port, "protocol": "tcp"},
            "last_found": "2024-05-01T00:00:00Z",
        })
    }

    #[test]
    fn test_vulnerability_key_defaults() {
        assert_eq!(vulnerability_key(&vuln("u-1", 19506, 443, false)), "u-1_19506_443_tcp");
        assert_eq!(vulnerability_key(&json!({})), "unknown_unknown_0_tcp");
        assert_eq!(split_key("u_1_19506_443_udp"), ("u_1", "19506", "443", "udp"));
    }

    #[tokio::test]
    async fn test_incremental_mark_advances_only_when_drained() {
        let mut harness = Harness::new(10, 0).await;
        harness
            .server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .create_async()
            .await;

        let fake = Arc::new(FakeUpstream::with_exports(vec![
            vec![vec![vuln("u-1", 1, 443, false), vuln("u-2", 1, 443, false)]],
            vec![vec![vuln("u-3", 1, 443, false)]],
        ]));
        let ctx = context(fake.clone(), CancellationToken::new());
        let source = VulnerabilityFeed::new(FeedKind::Vulnerability);

        let before = Utc::now().timestamp();
        let first = harness.processor(&ctx).run(&source).await;
        assert_eq!(first.outcome, FeedOutcome::Completed);
        let mark = harness
            .store
            .snapshot("tenableio_vulnerability")
            .unwrap()
            .last_timestamp
            .unwrap();
        assert!(mark >= before);

        harness.processor(&ctx).run(&source).await;
        let started = fake.started.lock().unwrap();
        assert!(started[0].1["filters"].get("since").is_none());
        assert_eq!(started[1].1["filters"]["since"], mark);
        assert_eq!(started[1].1["filters"]["severity"][0], "medium");
    }

    #[tokio::test]
    async fn test_truncated_run_keeps_previous_mark() {
        let mut harness = Harness::new(10, 1).await;
        harness
            .server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .create_async()
            .await;

        let fake = Arc::new(FakeUpstream::with_exports(vec![vec![vec![
            vuln("u-1", 1, 443, false),
            vuln("u-2", 1, 443, false),
        ]]]));
        let ctx = context(fake, CancellationToken::new());

        let summary = harness
            .processor(&ctx)
            .run(&VulnerabilityFeed::new(FeedKind::VulnerabilityNoInfo))
            .await;
        assert_eq!(summary.outcome, FeedOutcome::Truncated);
        let cp = harness.store.snapshot("tenableio_vulnerability_no_info").unwrap();
        assert_eq!(cp.last_timestamp, None);
        assert!(cp.processed_ids.contains("u-1_1_443_tcp"));
    }

    #[tokio::test]
    async fn test_self_scan_keeps_agent_findings_only() {
        let mut harness = Harness::new(10, 0).await;
        harness
            .server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .create_async()
            .await;

        let fake = Arc::new(FakeUpstream::with_exports(vec![vec![vec![
            vuln("agent", 1, 0, true),
            vuln("remote", 1, 0, false),
        ]]]));
        let ctx = context(fake, CancellationToken::new());

        let summary = harness
            .processor(&ctx)
            .run(&VulnerabilityFeed::new(FeedKind::VulnerabilitySelfScan))
            .await;
        assert_eq!(summary.events_sent, 1);
    }

    #[tokio::test]
    async fn test_fixed_vulnerabilities_detected_once() {
        let mut harness = Harness::new(10, 0).await;
        let fixed = harness
            .server
            .mock("POST", "/services/collector/event")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""vulnerability_key":"u-2_7_22_tcp""#.into()),
                Matcher::Regex(r#""event_type":"vulnerability_fixed""#.into()),
                Matcher::Regex(r#""asset_uuid":"u-2""#.into()),
            ]))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let fake = Arc::new(FakeUpstream::with_exports(vec![
            vec![vec![vuln("u-1", 7, 22, false), vuln("u-2", 7, 22, false)]],
            vec![vec![vuln("u-1", 7, 22, false)]],
            vec![vec![vuln("u-1", 7, 22, false)]],
        ]));
        let ctx = context(fake, CancellationToken::new());
        let source = FixedVulnerabilityFeed;

        assert_eq!(harness.processor(&ctx).run(&source).await.events_sent, 0);
        assert_eq!(harness.processor(&ctx).run(&source).await.events_sent, 1);
        assert_eq!(harness.processor(&ctx).run(&source).await.events_sent, 0);
        fixed.assert_async().await;
    }
}
