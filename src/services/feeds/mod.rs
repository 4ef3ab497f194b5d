//! 各类 feed 的具体实现

pub mod assets;
pub mod compliance;
pub mod plugins;
pub mod vulnerabilities;

use crate::{
    config::CollectorConfig,
    error::{AppError, AppResult},
    models::{ExportKind, FeedKind},
    services::{
        export::UpstreamContext,
        feed_processor::{FeedSink, FeedSource, Flow, SourceRecord},
    },
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use tracing::{debug, info};

pub use assets::{AssetFeed, DeletedAssetFeed};
pub use compliance::ComplianceFeed;
pub use plugins::PluginFeed;
pub use vulnerabilities::{FixedVulnerabilityFeed, VulnerabilityFeed};

/// 按 feed 类型构造数据来源
pub fn build_source(kind: FeedKind, collector: &CollectorConfig) -> Box<dyn FeedSource> {
    match kind {
        FeedKind::Asset | FeedKind::AssetSelfScan | FeedKind::TerminatedAsset => {
            Box::new(AssetFeed::new(kind))
        }
        FeedKind::DeletedAsset => Box::new(DeletedAssetFeed::new(
            collector.deleted_asset_scan_interval_hours,
        )),
        FeedKind::Vulnerability
        | FeedKind::VulnerabilityNoInfo
        | FeedKind::VulnerabilitySelfScan => Box::new(VulnerabilityFeed::new(kind)),
        FeedKind::FixedVulnerability => Box::new(FixedVulnerabilityFeed),
        FeedKind::Plugin => Box::new(PluginFeed),
        FeedKind::Compliance => Box::new(ComplianceFeed),
    }
}

/// 数字或字符串字段转为字符串
pub(crate) fn scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 解析记录时间：Unix 秒/毫秒、数字字符串或 RFC3339
pub(crate) fn parse_timestamp(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().map(normalize_epoch),
        JsonValue::String(s) => s.parse::<i64>().ok().map(normalize_epoch).or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc).timestamp())
        }),
        _ => None,
    }
}

fn normalize_epoch(value: i64) -> i64 {
    // 13 位时间戳按毫秒处理
    if value > 100_000_000_000 {
        value / 1000
    } else {
        value
    }
}

/// 导出所有记录并交给 sink，返回数据集是否完整读完
///
/// 提前结束（事件上限、关停、出错）时取消上游任务。
pub(crate) async fn stream_export<F>(
    upstream: &UpstreamContext,
    sink: &mut FeedSink<'_>,
    kind: ExportKind,
    request: &JsonValue,
    mut accept: F,
) -> AppResult<bool>
where
    F: FnMut(JsonValue) -> Option<SourceRecord> + Send,
{
    let label = sink.feed_key();
    let mut job = upstream.start_export(kind, request, label).await?;

    let result = async {
        while let Some((_, records)) = job.next_chunk().await? {
            for raw in records {
                let Some(record) = accept(raw) else {
                    continue;
                };
                if sink.offer(record).await? == Flow::Stop {
                    return Ok(false);
                }
            }
        }
        Ok::<bool, AppError>(true)
    }
    .await;

    if !job.is_drained() {
        job.cancel().await;
    }
    result
}

/// 导出全量快照，只收集记录标识
pub(crate) async fn snapshot_export<F>(
    upstream: &UpstreamContext,
    kind: ExportKind,
    request: &JsonValue,
    label: &str,
    key: F,
) -> AppResult<HashSet<String>>
where
    F: Fn(&JsonValue) -> Option<String> + Send,
{
    let started = std::time::Instant::now();
    let mut job = upstream.start_export(kind, request, label).await?;
    let mut current = HashSet::new();
    debug!("{}: 快照导出 {}", label, job.export_uuid());

    let result = async {
        while let Some((_, records)) = job.next_chunk().await? {
            if upstream.shutdown().is_cancelled() {
                return Err(AppError::Cancelled);
            }
            current.extend(records.iter().filter_map(&key));
            info!(
                "{}: 已获取 {} 条快照记录（{:.0} 条/秒）",
                label,
                current.len(),
                current.len() as f64 / started.elapsed().as_secs_f64().max(0.001)
            );
        }
        Ok::<(), AppError>(())
    }
    .await;

    if result.is_err() {
        job.cancel().await;
    }
    result?;

    info!(
        "{}: 快照共 {} 条，耗时 {:.1} 分钟",
        label,
        current.len(),
        started.elapsed().as_secs_f64() / 60.0
    );
    Ok(current)
}

/// 快照对比：对基线中消失的标识发送一次合成事件，然后提交当前快照为新基线
///
/// 合成事件以 `<marker>:<id>` 为标识，依靠正常的去重规则避免重复发送。返回新基线是否已提交。
pub(crate) async fn diff_snapshot<F>(
    sink: &mut FeedSink<'_>,
    current: HashSet<String>,
    marker: &str,
    make_event: F,
) -> AppResult<bool>
where
    F: Fn(&str, i64) -> JsonValue + Send,
{
    let prefix = format!("{}:", marker);
    let checkpoint = sink.checkpoint()?;
    let baseline: Vec<String> = checkpoint
        .processed_ids
        .iter()
        .filter(|id| !id.starts_with(&prefix))
        .map(str::to_string)
        .collect();

    let mut snapshot: Vec<String> = current.iter().cloned().collect();
    snapshot.sort();

    if baseline.is_empty() {
        info!("{}: 没有历史基线，仅建立基线（{} 条）", sink.feed_key(), snapshot.len());
        return sink.complete_with_baseline(snapshot).await;
    }

    let detected_at = Utc::now().timestamp();
    let disappeared: Vec<String> = baseline
        .into_iter()
        .filter(|id| !current.contains(id))
        .collect();
    info!("{}: 检测到 {} 条消失的记录", sink.feed_key(), disappeared.len());

    for id in &disappeared {
        let record = SourceRecord::new(
            format!("{}{}", prefix, id),
            Some(detected_at),
            make_event(id, detected_at),
        );
        if sink.offer(record).await? == Flow::Stop {
            break;
        }
    }

    sink.complete_with_baseline(snapshot).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp(&json!(1700000000)), Some(1700000000));
        assert_eq!(parse_timestamp(&json!(1700000000123i64)), Some(1700000000));
        assert_eq!(parse_timestamp(&json!("1700000000")), Some(1700000000));
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20Z")),
            Some(1700000000)
        );
        assert_eq!(parse_timestamp(&json!(null)), None);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(&json!(42)), Some("42".to_string()));
        assert_eq!(scalar_string(&json!("abc")), Some("abc".to_string()));
        assert_eq!(scalar_string(&json!("")), None);
        assert_eq!(scalar_string(&json!({"a": 1})), None);
    }

    #[test]
    fn test_every_kind_has_a_source() {
        let collector = CollectorConfig::default();
        for kind in FeedKind::ALL {
            assert_eq!(build_source(kind, &collector).descriptor().kind, kind);
        }
    }
}
