use super::FeedDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单个feed的结束状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FeedOutcome {
    Completed,
    /// 达到单feed事件上限，已确认的批次已提交
    Truncated,
    /// 本次未执行（例如未到全量扫描间隔）
    Skipped(String),
    /// 收到关停信号提前结束
    Cancelled,
    Failed(String),
}

impl FeedOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FeedOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSummary {
    pub feed_key: String,
    pub feed_name: String,
    pub outcome: FeedOutcome,
    /// 已确认并提交的事件数
    pub events_sent: u64,
    /// 被检查点过滤掉的记录数
    pub records_skipped: u64,
    pub batches: u64,
    pub duration_secs: f64,
}

impl FeedSummary {
    /// 未实际运行的 feed（关停或调度任务异常）
    pub fn not_run(descriptor: &FeedDescriptor, outcome: FeedOutcome) -> Self {
        Self {
            feed_key: descriptor.key.to_string(),
            feed_name: descriptor.name.to_string(),
            outcome,
            events_sent: 0,
            records_skipped: 0,
            batches: 0,
            duration_secs: 0.0,
        }
    }
}

/// 批次发送统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderStats {
    pub sent_events: u64,
    pub sent_batches: u64,
    pub retries: u64,
    pub rejected: u64,
}

impl SenderStats {
    /// 相对于之前某次快照的增量（守护模式下按次统计）
    pub fn since(&self, earlier: &SenderStats) -> SenderStats {
        SenderStats {
            sent_events: self.sent_events.saturating_sub(earlier.sent_events),
            sent_batches: self.sent_batches.saturating_sub(earlier.sent_batches),
            retries: self.retries.saturating_sub(earlier.retries),
            rejected: self.rejected.saturating_sub(earlier.rejected),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PartialFailure,
    /// 其他实例持有进程锁，本次运行跳过
    SkippedLocked,
    Cancelled,
}

/// 运行退出码
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const STARTUP_ERROR: i32 = 1;
    pub const LOCKED: i32 = 2;
    pub const FEED_FAILURE: i32 = 3;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedSummary>,
    pub sender: SenderStats,
}

impl RunSummary {
    pub fn skipped(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::SkippedLocked,
            started_at,
            finished_at: Utc::now(),
            feeds: Vec::new(),
            sender: SenderStats::default(),
        }
    }

    pub fn from_feeds(
        run_id: String,
        started_at: DateTime<Utc>,
        feeds: Vec<FeedSummary>,
        sender: SenderStats,
        cancelled: bool,
    ) -> Self {
        let status = if feeds.iter().any(|f| f.outcome.is_failure()) {
            RunStatus::PartialFailure
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        Self {
            run_id,
            status,
            started_at,
            finished_at: Utc::now(),
            feeds,
            sender,
        }
    }

    pub fn total_events(&self) -> u64 {
        self.feeds.iter().map(|f| f.events_sent).sum()
    }

    pub fn failed_feeds(&self) -> Vec<&str> {
        self.feeds
            .iter()
            .filter(|f| f.outcome.is_failure())
            .map(|f| f.feed_key.as_str())
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed | RunStatus::Cancelled => exit_code::OK,
            RunStatus::SkippedLocked => exit_code::LOCKED,
            RunStatus::PartialFailure => exit_code::FEED_FAILURE,
        }
    }
}
