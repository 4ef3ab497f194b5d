use crate::{
    error::{AppError, AppResult},
    models::{FeedDescriptor, FeedKind},
    services::{
        export::UpstreamContext,
        feed_processor::{FeedSink, FeedSource, Flow, SourceRecord},
    },
};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

/// 插件元数据：逐个插件族列出插件，只为未处理过的插件拉取详情
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginFeed;

#[async_trait]
impl FeedSource for PluginFeed {
    fn descriptor(&self) -> &'static FeedDescriptor {
        FeedKind::Plugin.descriptor()
    }

    async fn collect(&self, upstream: &UpstreamContext, sink: &mut FeedSink<'_>) -> AppResult<()> {
        let api = upstream.api.as_ref();
        let families = upstream
            .call("插件族列表", move || api.plugin_families())
            .await?;
        info!("{}: 共 {} 个插件族", sink.feed_key(), families.len());

        for family in families {
            if sink.is_stopped() {
                break;
            }
            let family_id = family.id;
            let plugins = match upstream
                .call(&format!("插件族 {}", family.name), move || {
                    api.family_plugins(family_id)
                })
                .await
            {
                Ok(plugins) => plugins,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!("{}: 获取插件族 {} 失败，跳过: {}", sink.feed_key(), family.name, e);
                    continue;
                }
            };

            for plugin in plugins {
                let plugin_id = plugin.id;
                if sink.already_seen(&plugin_id.to_string()) {
                    continue;
                }
                let mut details = match upstream
                    .call(&format!("插件 {}", plugin_id), move || {
                        api.plugin_details(plugin_id)
                    })
                    .await
                {
                    Ok(details) => details,
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(e) => {
                        warn!("{}: 获取插件 {} 详情失败，跳过: {}", sink.feed_key(), plugin_id, e);
                        continue;
                    }
                };

                if !details.is_object() {
                    details = json!({"id": plugin_id, "name": plugin.name, "data": details});
                }
                if let Some(fields) = details.as_object_mut() {
                    fields.insert("family_name".into(), JsonValue::from(family.name.clone()));
                    fields.insert("family_id".into(), JsonValue::from(family.id));
                }

                let record = SourceRecord::new(plugin_id.to_string(), None, details);
                if sink.offer(record).await? == Flow::Stop {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeedOutcome, PluginFamily, PluginSummary};
    use crate::services::export::testing::{FakeUpstream, context};
    use crate::services::feed_processor::testing::Harness;
    use mockito::Matcher;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn catalogue() -> FakeUpstream {
        FakeUpstream {
            families: vec![
                PluginFamily { id: 1, name: "Web Servers".into(), count: Some(2) },
                PluginFamily { id: 2, name: "Windows".into(), count: Some(1) },
            ],
            family_plugins: HashMap::from([
                (
                    1,
                    vec![
                        PluginSummary { id: 100, name: "Apache".into() },
                        PluginSummary { id: 101, name: "nginx".into() },
                    ],
                ),
                (2, vec![PluginSummary { id: 200, name: "SMB".into() }]),
            ]),
            plugins: HashMap::from([
                (100, json!({"id": 100, "name": "Apache"})),
                (200, json!({"id": 200, "name": "SMB"})),
            ]),
            ..FakeUpstream::default()
        }
    }

    #[tokio::test]
    async fn test_plugins_enriched_with_family() {
        let mut harness = Harness::new(10, 0).await;
        let mock = harness
            .server
            .mock("POST", "/services/collector/event")
            .match_body(Matcher::Regex(r#""family_name":"Web Servers""#.into()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let ctx = context(Arc::new(catalogue()), CancellationToken::new());
        let summary = harness.processor(&ctx).run(&PluginFeed).await;

        // 101 没有详情，记录警告后跳过
        assert_eq!(summary.outcome, FeedOutcome::Completed);
        assert_eq!(summary.events_sent, 2);
        mock.assert_async().await;

        let cp = harness.store.snapshot("tenableio_plugin").unwrap();
        assert!(cp.processed_ids.contains("100"));
        assert!(cp.processed_ids.contains("200"));
        assert!(!cp.processed_ids.contains("101"));
    }

    #[tokio::test]
    async fn test_processed_plugins_are_not_fetched_again() {
        let mut harness = Harness::new(10, 0).await;
        harness
            .server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .create_async()
            .await;

        let ctx = context(Arc::new(catalogue()), CancellationToken::new());
        harness.processor(&ctx).run(&PluginFeed).await;
        let second = harness.processor(&ctx).run(&PluginFeed).await;
        assert_eq!(second.events_sent, 0);
        assert_eq!(second.records_skipped, 2);
    }
}
