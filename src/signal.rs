//! 关停信号处理

use crate::error::AppResult;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 等待关停信号（Unix 下为 SIGINT、SIGTERM 或 SIGQUIT）
#[cfg(unix)]
pub async fn shutdown_signal() -> AppResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "收到关停信号"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "收到关停信号"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "收到关停信号"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> AppResult<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "收到关停信号");
    Ok(())
}

/// 在后台监听信号，收到后取消 `token`
///
/// 正在发送的批次会完成发送与提交后再退出。
pub fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                info!("正在停止：等待当前批次发送并提交");
                token.cancel();
            }
            Err(e) => error!("注册信号处理失败: {}", e),
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nix::sys::signal::{Signal, raise};
    use std::time::Duration;
    use tokio::signal::unix::{SignalKind, signal};

    #[tokio::test]
    async fn test_sigterm_cancels_listener_token() {
        // 先注册一个处理器，保证信号不会按默认动作终止测试进程
        let _own = signal(SignalKind::terminate()).unwrap();

        let shutdown = CancellationToken::new();
        spawn_shutdown_listener(shutdown.clone());
        // 让监听任务完成注册
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!shutdown.is_cancelled());

        raise(Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .expect("listener should cancel the token on SIGTERM");
    }
}
