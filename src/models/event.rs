use super::feed::FeedDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 发往 HEC 的事件公共字段
#[derive(Debug, Clone, Default)]
pub struct EnvelopeDefaults {
    pub host: String,
    pub source: String,
    pub index: Option<String>,
}

/// HEC 事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HecEnvelope {
    /// Unix 秒，允许毫秒小数
    pub time: f64,
    pub host: String,
    pub source: String,
    pub sourcetype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    pub event: Value,
}

impl HecEnvelope {
    pub fn new(
        descriptor: &FeedDescriptor,
        record: Value,
        time: f64,
        defaults: &EnvelopeDefaults,
    ) -> Self {
        Self {
            time,
            host: defaults.host.clone(),
            source: defaults.source.clone(),
            sourcetype: descriptor.sourcetype.to_string(),
            index: defaults.index.clone(),
            event: tag_record(descriptor, record),
        }
    }
}

/// 在记录顶层合并 `feed_type` 与 `feed_name`
///
/// 非对象记录包装为 `{"data": ...}` 后再合并。
pub fn tag_record(descriptor: &FeedDescriptor, record: Value) -> Value {
    let mut object = match record {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    object.insert(
        "feed_type".to_string(),
        Value::String(descriptor.feed_type.to_string()),
    );
    object.insert(
        "feed_name".to_string(),
        Value::String(descriptor.name.to_string()),
    );
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeedKind;
    use serde_json::json;

    #[test]
    fn test_tag_record_merges_metadata() {
        let descriptor = FeedKind::Plugin.descriptor();
        let tagged = tag_record(descriptor, json!({"id": 19506, "name": "Nessus Scan Information"}));
        assert_eq!(tagged["feed_type"], "plugin");
        assert_eq!(tagged["feed_name"], "Plugin Metadata");
        assert_eq!(tagged["id"], 19506);

        let wrapped = tag_record(descriptor, json!("plain"));
        assert_eq!(wrapped["data"], "plain");
        assert_eq!(wrapped["feed_type"], "plugin");
    }

    #[test]
    fn test_envelope_omits_empty_index() {
        let defaults = EnvelopeDefaults {
            host: "collector-01".into(),
            source: "tenable".into(),
            index: None,
        };
        let envelope = HecEnvelope::new(
            FeedKind::Asset.descriptor(),
            json!({"id": "a-1"}),
            1700000000.5,
            &defaults,
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("index").is_none());
        assert_eq!(value["sourcetype"], "tenable:io:asset");
        assert_eq!(value["event"]["feed_type"], "asset");
    }
}
