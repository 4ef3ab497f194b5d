use serde::{Deserialize, Serialize};

/// 导出任务创建响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportStarted {
    pub export_uuid: String,
}

/// 导出任务状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportState {
    Queued,
    Processing,
    Finished,
    Cancelled,
    Error,
    Unknown(String),
}

impl ExportState {
    pub fn from_status(status: &str) -> Self {
        match status.to_uppercase().as_str() {
            "QUEUED" => ExportState::Queued,
            "PROCESSING" => ExportState::Processing,
            "FINISHED" => ExportState::Finished,
            "CANCELLED" => ExportState::Cancelled,
            "ERROR" => ExportState::Error,
            other => ExportState::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, ExportState::Cancelled | ExportState::Error)
    }
}

/// `GET /{assets|vulns}/export/{uuid}/status` 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportStatus {
    pub status: String,
    #[serde(default)]
    pub chunks_available: Vec<u64>,
    #[serde(default)]
    pub chunks_failed: Vec<u64>,
}

impl ExportStatus {
    pub fn state(&self) -> ExportState {
        ExportState::from_status(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginFamily {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub last_modification_date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanHost {
    pub host_id: u64,
    #[serde(default = "unknown_hostname")]
    pub hostname: String,
}

fn unknown_hostname() -> String {
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_status_parsing() {
        let json = r#"{"status": "PROCESSING", "chunks_available": [1, 2], "total_chunks": 5}"#;
        let status: ExportStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.state(), ExportState::Processing);
        assert_eq!(status.chunks_available, vec![1, 2]);

        assert!(ExportState::from_status("error").is_terminal_failure());
        assert!(!ExportState::from_status("FINISHED").is_terminal_failure());
    }

    #[test]
    fn test_scan_host_default_hostname() {
        let host: ScanHost = serde_json::from_str(r#"{"host_id": 7}"#).unwrap();
        assert_eq!(host.hostname, "unknown");
    }
}
