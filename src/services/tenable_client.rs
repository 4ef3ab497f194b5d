use crate::{
    config::tenable::TenableConfig,
    error::{AppError, AppResult},
    models::{ExportKind, ExportStarted, ExportStatus, PluginFamily, PluginSummary, ScanHost, ScanSummary},
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

/// 上游漏洞管理平台接口
///
/// feed 只依赖这个 trait，测试中用内存实现替代。
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// 创建导出任务，返回 export_uuid
    async fn start_export(&self, kind: ExportKind, request: &JsonValue) -> AppResult<String>;

    async fn export_status(&self, kind: ExportKind, export_uuid: &str) -> AppResult<ExportStatus>;

    async fn download_chunk(
        &self,
        kind: ExportKind,
        export_uuid: &str,
        chunk_id: u64,
    ) -> AppResult<Vec<JsonValue>>;

    async fn cancel_export(&self, kind: ExportKind, export_uuid: &str) -> AppResult<()>;

    async fn plugin_families(&self) -> AppResult<Vec<PluginFamily>>;

    async fn family_plugins(&self, family_id: u64) -> AppResult<Vec<PluginSummary>>;

    async fn plugin_details(&self, plugin_id: u64) -> AppResult<JsonValue>;

    async fn list_scans(&self) -> AppResult<Vec<ScanSummary>>;

    async fn scan_hosts(&self, scan_id: u64) -> AppResult<Vec<ScanHost>>;

    /// 单个主机在某次扫描中的合规检查项
    async fn host_compliance(&self, scan_id: u64, host_id: u64) -> AppResult<Vec<JsonValue>>;
}

/// Tenable.io REST 客户端
#[derive(Debug, Clone)]
pub struct TenableClient {
    client: Client,
    config: TenableConfig,
}

#[derive(Deserialize)]
struct FamiliesResponse {
    #[serde(default)]
    families: Vec<PluginFamily>,
}

#[derive(Deserialize)]
struct FamilyDetailsResponse {
    #[serde(default)]
    plugins: Vec<PluginSummary>,
}

#[derive(Deserialize)]
struct ScansResponse {
    #[serde(default)]
    scans: Option<Vec<ScanSummary>>,
}

#[derive(Deserialize)]
struct ScanDetailsResponse {
    #[serde(default)]
    hosts: Option<Vec<ScanHost>>,
}

#[derive(Deserialize)]
struct HostDetailsResponse {
    #[serde(default)]
    compliance: Option<Vec<JsonValue>>,
}

impl TenableClient {
    pub fn new(config: TenableConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    fn api_keys_header(&self) -> String {
        format!(
            "accessKey={};secretKey={}",
            self.config.access_key, self.config.secret_key
        )
    }

    /// 发送请求并按状态码分类错误
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&JsonValue>,
    ) -> AppResult<JsonValue> {
        let url = self.config.get_api_url(endpoint);
        debug!("请求上游: {} {}", method, url);

        let mut builder = self
            .client
            .request(method, &url)
            .header("X-ApiKeys", self.api_keys_header())
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(classify_failure(status, endpoint, &text));
        }
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn get_as<T: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> AppResult<T> {
        let value = self.request(Method::GET, endpoint, None).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// 上游错误分类：429 与导出冲突视为可重试的争用，5xx 为临时错误，其余为永久错误
fn classify_failure(status: StatusCode, endpoint: &str, body: &str) -> AppError {
    let message = format!("{} 返回 {}: {}", endpoint, status, truncate(body, 512));
    let code = status.as_u16();

    if code == 429 {
        return AppError::throttled(Some(code), message);
    }
    if code == 409 || body.to_lowercase().contains("duplicate export") {
        return AppError::duplicate_export(message);
    }
    AppError::upstream(Some(code), message)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

#[async_trait]
impl UpstreamApi for TenableClient {
    async fn start_export(&self, kind: ExportKind, request: &JsonValue) -> AppResult<String> {
        let endpoint = format!("/{}/export", kind.path());
        let value = self.request(Method::POST, &endpoint, Some(request)).await?;
        let started: ExportStarted = serde_json::from_value(value)?;
        Ok(started.export_uuid)
    }

    async fn export_status(&self, kind: ExportKind, export_uuid: &str) -> AppResult<ExportStatus> {
        self.get_as(&format!("/{}/export/{}/status", kind.path(), export_uuid))
            .await
    }

    async fn download_chunk(
        &self,
        kind: ExportKind,
        export_uuid: &str,
        chunk_id: u64,
    ) -> AppResult<Vec<JsonValue>> {
        let endpoint = format!("/{}/export/{}/chunks/{}", kind.path(), export_uuid, chunk_id);
        match self.request(Method::GET, &endpoint, None).await? {
            JsonValue::Array(records) => Ok(records),
            JsonValue::Null => Ok(Vec::new()),
            other => Err(AppError::upstream(
                None,
                format!("分块 {} 不是数组: {}", chunk_id, truncate(&other.to_string(), 128)),
            )),
        }
    }

    async fn cancel_export(&self, kind: ExportKind, export_uuid: &str) -> AppResult<()> {
        let endpoint = format!("/{}/export/{}/cancel", kind.path(), export_uuid);
        self.request(Method::POST, &endpoint, None).await?;
        Ok(())
    }

    async fn plugin_families(&self) -> AppResult<Vec<PluginFamily>> {
        let response: FamiliesResponse = self.get_as("/plugins/families").await?;
        Ok(response.families)
    }

    async fn family_plugins(&self, family_id: u64) -> AppResult<Vec<PluginSummary>> {
        let response: FamilyDetailsResponse = self
            .get_as(&format!("/plugins/families/{}", family_id))
            .await?;
        Ok(response.plugins)
    }

    async fn plugin_details(&self, plugin_id: u64) -> AppResult<JsonValue> {
        self.request(Method::GET, &format!("/plugins/plugin/{}", plugin_id), None)
            .await
    }

    async fn list_scans(&self) -> AppResult<Vec<ScanSummary>> {
        let response: ScansResponse = self.get_as("/scans").await?;
        Ok(response.scans.unwrap_or_default())
    }

    async fn scan_hosts(&self, scan_id: u64) -> AppResult<Vec<ScanHost>> {
        let response: ScanDetailsResponse = self.get_as(&format!("/scans/{}", scan_id)).await?;
        Ok(response.hosts.unwrap_or_default())
    }

    async fn host_compliance(&self, scan_id: u64, host_id: u64) -> AppResult<Vec<JsonValue>> {
        let response: HostDetailsResponse = self
            .get_as(&format!("/scans/{}/hosts/{}", scan_id, host_id))
            .await?;
        Ok(response.compliance.unwrap_or_default())
    }
}
