use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 上游导出接口的资源类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Assets,
    Vulns,
}

impl ExportKind {
    /// API 路径前缀
    pub fn path(self) -> &'static str {
        match self {
            ExportKind::Assets => "assets",
            ExportKind::Vulns => "vulns",
        }
    }
}

/// 上游查询方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// 异步导出任务，需要轮询完成
    Export(ExportKind),
    /// 普通列表/详情接口
    Listing,
}

/// 互斥组：同组feed共享上游“同一资源类别只允许一个活动导出”的约束，组内串行执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusivityGroup {
    AssetExport,
    VulnExport,
    PluginCatalog,
    ScanResults,
}

impl fmt::Display for ExclusivityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExclusivityGroup::AssetExport => "asset_export",
            ExclusivityGroup::VulnExport => "vuln_export",
            ExclusivityGroup::PluginCatalog => "plugin_catalog",
            ExclusivityGroup::ScanResults => "scan_results",
        };
        f.write_str(name)
    }
}

/// 所有feed类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Asset,
    AssetSelfScan,
    DeletedAsset,
    TerminatedAsset,
    Vulnerability,
    VulnerabilityNoInfo,
    VulnerabilitySelfScan,
    FixedVulnerability,
    Plugin,
    Compliance,
}

/// feed的静态描述：身份、分类标签、查询方式与互斥组
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDescriptor {
    pub kind: FeedKind,
    /// 检查点键，同时作为CLI选择用的feed键
    pub key: &'static str,
    pub name: &'static str,
    pub feed_type: &'static str,
    pub sourcetype: &'static str,
    pub strategy: QueryStrategy,
    pub group: ExclusivityGroup,
}

const DESCRIPTORS: [FeedDescriptor; 10] = [
    FeedDescriptor {
        kind: FeedKind::Asset,
        key: "tenableio_asset",
        name: "Asset Inventory",
        feed_type: "asset",
        sourcetype: "tenable:io:asset",
        strategy: QueryStrategy::Export(ExportKind::Assets),
        group: ExclusivityGroup::AssetExport,
    },
    FeedDescriptor {
        kind: FeedKind::AssetSelfScan,
        key: "tenableio_asset_self_scan",
        name: "Agent-Based Assets",
        feed_type: "asset_self_scan",
        sourcetype: "tenable:io:asset:self_scan",
        strategy: QueryStrategy::Export(ExportKind::Assets),
        group: ExclusivityGroup::AssetExport,
    },
    FeedDescriptor {
        kind: FeedKind::DeletedAsset,
        key: "tenableio_deleted_asset",
        name: "Deleted Assets",
        feed_type: "deleted_asset",
        sourcetype: "tenable:io:asset:deleted",
        strategy: QueryStrategy::Export(ExportKind::Assets),
        group: ExclusivityGroup::AssetExport,
    },
    FeedDescriptor {
        kind: FeedKind::TerminatedAsset,
        key: "tenableio_terminated_asset",
        name: "Terminated Assets",
        feed_type: "terminated_asset",
        sourcetype: "tenable:io:asset:terminated",
        strategy: QueryStrategy::Export(ExportKind::Assets),
        group: ExclusivityGroup::AssetExport,
    },
    FeedDescriptor {
        kind: FeedKind::Vulnerability,
        key: "tenableio_vulnerability",
        name: "Active Vulnerabilities",
        feed_type: "vulnerability",
        sourcetype: "tenable:io:vulnerability",
        strategy: QueryStrategy::Export(ExportKind::Vulns),
        group: ExclusivityGroup::VulnExport,
    },
    FeedDescriptor {
        kind: FeedKind::VulnerabilityNoInfo,
        key: "tenableio_vulnerability_no_info",
        name: "Informational Vulnerabilities",
        feed_type: "vulnerability_info",
        sourcetype: "tenable:io:vulnerability:info",
        strategy: QueryStrategy::Export(ExportKind::Vulns),
        group: ExclusivityGroup::VulnExport,
    },
    FeedDescriptor {
        kind: FeedKind::VulnerabilitySelfScan,
        key: "tenableio_vulnerability_self_scan",
        name: "Agent-Based Vulnerabilities",
        feed_type: "vulnerability_self_scan",
        sourcetype: "tenable:io:vulnerability:self_scan",
        strategy: QueryStrategy::Export(ExportKind::Vulns),
        group: ExclusivityGroup::VulnExport,
    },
    FeedDescriptor {
        kind: FeedKind::FixedVulnerability,
        key: "tenableio_fixed_vulnerability",
        name: "Fixed Vulnerabilities",
        feed_type: "fixed_vulnerability",
        sourcetype: "tenable:io:vulnerability:fixed",
        strategy: QueryStrategy::Export(ExportKind::Vulns),
        group: ExclusivityGroup::VulnExport,
    },
    FeedDescriptor {
        kind: FeedKind::Plugin,
        key: "tenableio_plugin",
        name: "Plugin Metadata",
        feed_type: "plugin",
        sourcetype: "tenable:io:plugin",
        strategy: QueryStrategy::Listing,
        group: ExclusivityGroup::PluginCatalog,
    },
    FeedDescriptor {
        kind: FeedKind::Compliance,
        key: "tenableio_compliance",
        name: "Compliance Findings",
        feed_type: "compliance",
        sourcetype: "tenable:io:compliance",
        strategy: QueryStrategy::Listing,
        group: ExclusivityGroup::ScanResults,
    },
];

impl FeedKind {
    pub const ALL: [FeedKind; 10] = [
        FeedKind::Asset,
        FeedKind::AssetSelfScan,
        FeedKind::DeletedAsset,
        FeedKind::TerminatedAsset,
        FeedKind::Vulnerability,
        FeedKind::VulnerabilityNoInfo,
        FeedKind::VulnerabilitySelfScan,
        FeedKind::FixedVulnerability,
        FeedKind::Plugin,
        FeedKind::Compliance,
    ];

    pub fn descriptor(self) -> &'static FeedDescriptor {
        &DESCRIPTORS[self as usize]
    }

    pub fn key(self) -> &'static str {
        self.descriptor().key
    }

    pub fn group(self) -> ExclusivityGroup {
        self.descriptor().group
    }

    /// 解析feed键或简写别名
    pub fn from_key(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        if let Some(d) = DESCRIPTORS.iter().find(|d| d.key == value) {
            return Some(d.kind);
        }
        let kind = match value.as_str() {
            "assets" | "asset" => FeedKind::Asset,
            "assets_self_scan" | "asset_self_scan" => FeedKind::AssetSelfScan,
            "deleted_assets" | "deleted_asset" => FeedKind::DeletedAsset,
            "terminated_assets" | "terminated_asset" => FeedKind::TerminatedAsset,
            "vulnerabilities" | "vulnerability" => FeedKind::Vulnerability,
            "vulnerabilities_no_info" | "vulnerability_no_info" => FeedKind::VulnerabilityNoInfo,
            "vulnerabilities_self_scan" | "vulnerability_self_scan" => {
                FeedKind::VulnerabilitySelfScan
            }
            "fixed_vulnerabilities" | "fixed_vulnerability" => FeedKind::FixedVulnerability,
            "plugins" | "plugin" => FeedKind::Plugin,
            "compliance" => FeedKind::Compliance,
            _ => return None,
        };
        Some(kind)
    }

    /// 解析命令行feed选择，支持 `all`，保持输入顺序并去重
    pub fn parse_selection<S: AsRef<str>>(items: &[S]) -> AppResult<Vec<FeedKind>> {
        if items.is_empty() || items.iter().any(|s| s.as_ref().trim() == "all") {
            return Ok(Self::ALL.to_vec());
        }

        let mut selected = Vec::new();
        for item in items {
            let kind = Self::from_key(item.as_ref())
                .ok_or_else(|| AppError::config(format!("未知的feed: {}", item.as_ref())))?;
            if !selected.contains(&kind) {
                selected.push(kind);
            }
        }
        Ok(selected)
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
