use thiserror::Error;

/// 应用程序错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("检查点错误: {0}")]
    Checkpoint(String),

    #[error("进程锁错误: {0}")]
    Lock(String),

    /// 上游限流（429）或服务暂时不可用
    #[error("上游限流或暂不可用 ({status:?}): {message}")]
    UpstreamThrottled {
        status: Option<u16>,
        message: String,
    },

    /// 同一资源类别已有导出任务在运行
    #[error("上游导出任务冲突: {0}")]
    DuplicateExport(String),

    #[error("上游请求失败 ({status:?}): {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("导出任务 {export_uuid} 状态异常: {status}")]
    ExportFailed { export_uuid: String, status: String },

    #[error("导出任务 {export_uuid} 等待超时（{waited_secs}秒）")]
    ExportTimeout {
        export_uuid: String,
        waited_secs: u64,
    },

    /// HEC 拒绝了批次（不可重试的 4xx）
    #[error("HEC拒绝批次 ({status}): {body}")]
    SinkRejected { status: u16, body: String },

    /// HEC 在有限次重试后仍不可用
    #[error("HEC在 {attempts} 次尝试后仍不可用: {reason}")]
    SinkUnavailable { attempts: u32, reason: String },

    #[error("操作已取消")]
    Cancelled,

    #[error("HTTP错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),
}

/// 应用程序Result类型别名
pub type AppResult<T> = Result<T, AppError>;

/// 错误构造辅助函数
impl AppError {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn checkpoint<T: Into<String>>(msg: T) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn lock<T: Into<String>>(msg: T) -> Self {
        Self::Lock(msg.into())
    }

    pub fn upstream<T: Into<String>>(status: Option<u16>, msg: T) -> Self {
        Self::Upstream {
            status,
            message: msg.into(),
        }
    }

    pub fn throttled<T: Into<String>>(status: Option<u16>, msg: T) -> Self {
        Self::UpstreamThrottled {
            status,
            message: msg.into(),
        }
    }

    pub fn duplicate_export<T: Into<String>>(msg: T) -> Self {
        Self::DuplicateExport(msg.into())
    }

    /// 是否为可重试的临时性错误（限流、不可用、超时、导出冲突）
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::UpstreamThrottled { .. } | AppError::DuplicateExport(_) => true,
            AppError::Upstream { status, .. } => {
                matches!(status, Some(s) if *s >= 500) || status.is_none()
            }
            AppError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// 导出冲突与限流需要较长的等待窗口
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamThrottled { .. } | AppError::DuplicateExport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AppError::config("缺少令牌");
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(err.to_string(), "配置错误: 缺少令牌");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::throttled(Some(429), "slow down").is_transient());
        assert!(AppError::duplicate_export("Duplicate export not allowed").is_transient());
        assert!(AppError::upstream(Some(503), "unavailable").is_transient());
        assert!(AppError::upstream(None, "connection reset").is_transient());

        assert!(!AppError::upstream(Some(401), "unauthorized").is_transient());
        assert!(
            !AppError::SinkRejected {
                status: 400,
                body: "bad".into()
            }
            .is_transient()
        );
        assert!(!AppError::Cancelled.is_transient());
    }

    #[test]
    fn test_contention_is_subset_of_transient() {
        let err = AppError::duplicate_export("export already running");
        assert!(err.is_contention());
        assert!(err.is_transient());
        assert!(!AppError::upstream(Some(502), "bad gateway").is_contention());
    }
}
