pub mod access;
pub mod admin;
pub mod bundle;
pub mod ca;
pub mod config;
pub mod enforcer;
pub mod internal_api;
pub mod monitor;
pub mod notifier;
pub mod session_control;
pub mod status;
pub mod store;
pub mod traffic;
pub mod warden;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use warden::Warden;

/// 初始化日志：设置了日志目录时按天轮转写文件，否则输出到控制台
pub fn init_tracing(log_dir: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(dir) = log_dir {
        let file_appender = tracing_appender::rolling::daily(dir, "ovpn-guard.log");
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(file_appender).with_ansi(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

/// 守护进程：监控循环 + 管理 API，直到收到终止信号
pub async fn run_server(config_path: &str) -> Result<()> {
    // 先定位配置，日志订阅器装好后再汇报结果
    let located = Config::locate(config_path);
    let config = match &located {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    init_tracing(config.log_dir.as_deref());

    info!("ovpn-guard 守护进程启动");
    match &located {
        Some(path) => info!("📋 加载配置文件: {}", path.display()),
        None => warn!("找不到配置文件 {}，使用默认配置", config_path),
    }
    info!("status 文件: {}", config.paths.status_log.display());
    info!("ccd 目录: {}", config.paths.ccd_dir.display());
    info!("数据目录: {}", config.paths.data_dir.display());
    if config.telegram.is_none() {
        warn!("未配置 Telegram，告警只写入日志");
    }

    let config = Arc::new(config);
    let secret = config.get_admin_secret()?;
    let warden = Arc::new(Warden::from_config(config.clone())?);
    let token = CancellationToken::new();

    let mut monitor_handle = tokio::spawn(monitor::run_monitor(warden.clone(), token.clone()));

    let bind = config.admin.bind.clone();
    let api_warden = warden.clone();
    let api_token = token.clone();
    let mut api_handle = tokio::spawn(async move {
        internal_api::start_admin_api(&bind, secret, api_warden, api_token).await
    });

    info!("所有服务已启动");

    // 等待终止信号
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C 信号，正在关闭服务...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("收到 SIGTERM 信号，正在关闭服务...");
        }
        result = &mut api_handle => {
            match result {
                Ok(Ok(())) => warn!("管理 API 已退出"),
                Ok(Err(e)) => error!("管理 API 启动失败: {:#}", e),
                Err(e) => error!("管理 API 任务异常: {}", e),
            }
        }
        result = &mut monitor_handle => {
            match result {
                Ok(()) => warn!("监控循环意外退出"),
                Err(e) => error!("监控任务异常: {}", e),
            }
        }
    }

    token.cancel();

    if !monitor_handle.is_finished()
        && tokio::time::timeout(Duration::from_secs(10), monitor_handle).await.is_err()
    {
        warn!("监控循环未能在 10 秒内停止");
    }
    if !api_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;
    }

    info!("服务已关闭");
    Ok(())
}
