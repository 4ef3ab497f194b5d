// 服务层模块
pub mod collector;
pub mod export;
pub mod feed_processor;
pub mod feeds;
pub mod hec_sender;
pub mod scheduler;
pub mod tenable_client;

pub use collector::Collector;
pub use export::{ExportJob, UpstreamContext};
pub use feed_processor::{FeedProcessor, FeedSink, FeedSource, Flow, SinkSettings, SourceRecord};
pub use feeds::build_source;
pub use hec_sender::{EventBatch, HecClient, PacingController, SendOutcome};
pub use scheduler::{FeedRuntime, GroupScheduler};
pub use tenable_client::{TenableClient, UpstreamApi};
