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
use chrono::{Duration, Utc};
use serde_json::{Value as JsonValue, json};
use tracing::info;

/// 资产导出类 feed：全部资产、Agent 资产、已终止资产
#[derive(Debug, Clone, Copy)]
pub struct AssetFeed {
    kind: FeedKind,
}

impl AssetFeed {
    pub fn new(kind: FeedKind) -> Self {
        debug_assert!(matches!(
            kind,
            FeedKind::Asset | FeedKind::AssetSelfScan | FeedKind::TerminatedAsset
        ));
        Self { kind }
    }

    fn request(&self, upstream: &UpstreamContext) -> JsonValue {
        let filters = match self.kind {
            FeedKind::AssetSelfScan => json!({"sources": ["NESSUS_AGENT"]}),
            FeedKind::TerminatedAsset => json!({"is_terminated": true}),
            _ => json!({"is_deleted": false}),
        };
        json!({
            "chunk_size": upstream.export.asset_chunk_size,
            "include_unlicensed": upstream.export.include_unlicensed,
            "filters": filters,
        })
    }

    /// 上游过滤之外的本地筛选
    fn accepts(&self, asset: &JsonValue) -> bool {
        match self.kind {
            FeedKind::AssetSelfScan => asset["has_agent"].as_bool().unwrap_or(false),
            FeedKind::TerminatedAsset => !asset["terminated_at"].is_null(),
            _ => true,
        }
    }
}

pub(crate) fn asset_id(asset: &JsonValue) -> Option<String> {
    scalar_string(&asset["id"])
}

#[async_trait]
impl FeedSource for AssetFeed {
    fn descriptor(&self) -> &'static FeedDescriptor {
        self.kind.descriptor()
    }

    async fn collect(&self, upstream: &UpstreamContext, sink: &mut FeedSink<'_>) -> AppResult<()> {
        let request = self.request(upstream);
        stream_export(upstream, sink, ExportKind::Assets, &request, |asset| {
            if !self.accepts(&asset) {
                return None;
            }
            let id = asset_id(&asset)?;
            let timestamp = parse_timestamp(&asset["updated_at"]);
            Some(SourceRecord::new(id, timestamp, asset))
        })
        .await?;
        Ok(())
    }
}

/// 已删除资产：对比全量快照与上次基线
#[derive(Debug, Clone, Copy)]
pub struct DeletedAssetFeed {
    scan_interval_hours: u64,
}

impl DeletedAssetFeed {
    pub fn new(scan_interval_hours: u64) -> Self {
        Self {
            scan_interval_hours,
        }
    }
}

#[async_trait]
impl FeedSource for DeletedAssetFeed {
    fn descriptor(&self) -> &'static FeedDescriptor {
        FeedKind::DeletedAsset.descriptor()
    }

    async fn collect(&self, upstream: &UpstreamContext, sink: &mut FeedSink<'_>) -> AppResult<()> {
        let checkpoint = sink.checkpoint()?;
        let now = Utc::now();
        let interval = Duration::hours(self.scan_interval_hours as i64);
        if let Some(last) = checkpoint.last_full_scan {
            let next = last + interval;
            if now < next {
                let reason = format!(
                    "上次全量扫描 {}，下次不早于 {}",
                    last.format("%Y-%m-%d %H:%M:%S"),
                    next.format("%Y-%m-%d %H:%M:%S")
                );
                info!("{}: 未到扫描时间，{}", sink.feed_key(), reason);
                sink.skip(reason);
                return Ok(());
            }
        }

        let request = json!({
            "chunk_size": upstream.export.asset_chunk_size,
            "include_unlicensed": upstream.export.include_unlicensed,
            "filters": {"has_plugin_results": true},
        });
        let current = snapshot_export(
            upstream,
            ExportKind::Assets,
            &request,
            sink.feed_key(),
            asset_id,
        )
        .await?;

        let committed = diff_snapshot(sink, current, "deleted", |id, detected_at| {
            json!({
                "asset_id": id,
                "event_type": "asset_deleted",
                "detected_at": detected_at,
            })
        })
        .await?;

        if committed {
            sink.record_full_scan(now).await?;
        }
        Ok(())
    }
}
