/*
 * Tenable Collector - Tenable.io to HTTP Event Collector forwarder
 * Copyright (c) 2024 SampleFarm Project
 *
 * This work is licensed under CC BY-NC-SA 4.0
 * https://creativecommons.org/licenses/by-nc-sa/4.0/
 */

use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tenable_collector::{
    config::Config,
    error::{AppError, AppResult},
    models::{FeedKind, exit_code},
    services::{Collector, TenableClient},
    signal::spawn_shutdown_listener,
    storage::{CheckpointStore, ProcessLock},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tenable.io 数据采集并转发到 HEC
#[derive(Parser, Debug)]
#[command(name = "tenable-collector")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（不存在时使用默认值与环境变量）
    #[arg(short, long, env = "COLLECTOR_CONFIG", default_value = "collector.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 执行一次采集
    Run {
        /// 要采集的 feed（可重复；省略或 `all` 表示全部）
        #[arg(short, long = "feed", value_name = "FEED")]
        feeds: Vec<String>,
    },
    /// 守护模式，按固定间隔重复采集
    Daemon {
        /// 运行间隔（秒），默认取配置中的 daemon_interval_secs
        #[arg(long)]
        interval_secs: Option<u64>,
        #[arg(short, long = "feed", value_name = "FEED")]
        feeds: Vec<String>,
    },
    /// 查看或清除检查点
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// 强制清除进程锁
    Unlock,
    /// 写出默认配置文件
    InitConfig {
        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointAction {
    List,
    /// 删除某个 feed 的检查点，下次运行重新采集该 feed
    Clear { feed: String },
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tenable_collector={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn to_exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败 ({}): {}", cli.config.display(), e);
            return to_exit_code(exit_code::STARTUP_ERROR);
        }
    };
    init_tracing(&config.log_level);

    if cli.config.exists() {
        tracing::info!("已加载配置文件: {}", cli.config.display());
    } else {
        tracing::warn!(
            "未找到配置文件 {}，使用默认配置与环境变量",
            cli.config.display()
        );
    }

    match execute(cli, config).await {
        Ok(code) => to_exit_code(code),
        Err(e) => {
            tracing::error!("启动失败: {}", e);
            to_exit_code(exit_code::STARTUP_ERROR)
        }
    }
}

async fn execute(cli: Cli, config: Config) -> AppResult<i32> {
    match cli.command {
        Command::Run { feeds } => {
            let (collector, selected) = prepare(&config, &feeds)?;
            let summary = collector.run_once(&selected).await?;
            Ok(summary.exit_code())
        }
        Command::Daemon {
            interval_secs,
            feeds,
        } => {
            let (collector, selected) = prepare(&config, &feeds)?;
            let interval =
                Duration::from_secs(interval_secs.unwrap_or(config.collector.daemon_interval_secs));
            collector.run_daemon(&selected, interval).await?;
            Ok(exit_code::OK)
        }
        Command::Checkpoints { action } => {
            let store = CheckpointStore::new(config.checkpoint.clone())?;
            match action {
                CheckpointAction::List => {
                    let checkpoints = store.list()?;
                    if checkpoints.is_empty() {
                        println!("{} 下没有检查点", store.dir().display());
                    }
                    for cp in checkpoints {
                        println!(
                            "{:<36} ids={:<8} last_timestamp={:<12} updated_at={} last_full_scan={}",
                            cp.feed_key,
                            cp.processed_ids,
                            cp.last_timestamp
                                .map(|t| t.to_string())
                                .unwrap_or_else(|| "-".into()),
                            cp.updated_at
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "-".into()),
                            cp.last_full_scan
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "-".into()),
                        );
                    }
                }
                CheckpointAction::Clear { feed } => {
                    let kind = FeedKind::from_key(&feed)
                        .ok_or_else(|| AppError::config(format!("未知的feed: {}", feed)))?;
                    if store.clear(kind.key())? {
                        println!("已删除 {} 的检查点", kind.key());
                    } else {
                        println!("{} 没有检查点", kind.key());
                    }
                }
            }
            Ok(exit_code::OK)
        }
        Command::Unlock => {
            let lock = ProcessLock::new(&config.lock)?;
            match lock.force_clear()? {
                Some(previous) => println!(
                    "已清除进程锁（pid {}，主机 {}，获取于 {}）",
                    previous.pid, previous.host, previous.acquired_at
                ),
                None => println!("{} 不存在或内容不可读，已确保删除", lock.path().display()),
            }
            Ok(exit_code::OK)
        }
        Command::InitConfig { force } => {
            if cli.config.exists() && !force {
                return Err(AppError::config(format!(
                    "{} 已存在，使用 --force 覆盖",
                    cli.config.display()
                )));
            }
            Config::default().save_to_file(&cli.config)?;
            println!("已写出默认配置: {}", cli.config.display());
            Ok(exit_code::OK)
        }
    }
}

fn prepare(config: &Config, feeds: &[String]) -> AppResult<(Collector, Vec<FeedKind>)> {
    config.validate()?;
    let selected = FeedKind::parse_selection(feeds)?;

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let client = TenableClient::new(config.tenable.clone())?;
    let collector = Collector::new(config, Arc::new(client), shutdown)?;
    Ok((collector, selected))
}
