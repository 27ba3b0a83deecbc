mod config;
mod config_manager;
mod entity;
mod error;
mod migration;
mod scheduler;
mod synthesizer;
mod traffic;
mod traffic_limiter;
mod xray;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::protocol::control::LiveControlConnector;
use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::config_manager::ConfigManager;
use crate::entity::system_config::config_keys;
use crate::migration::init_sqlite;
use crate::scheduler::Scheduler;
use crate::synthesizer::ConfigSynthesizer;
use crate::traffic::TrafficAccountant;
use crate::xray::api::XrayApiConnector;
use crate::xray::config::ProcessConfig;
use crate::xray::process::ProcessSupervisor;

#[derive(Parser)]
#[command(name = "xui-controller", version, about = "xray 进程管理与流量记账")]
struct Cli {
    /// 配置文件路径（默认 ./controller.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// 前台运行（默认）
    Run,

    /// 输出 xray 配置文件路径
    ConfigPath,

    /// 生成并输出 xray 配置，不启动进程
    PrintConfig,

    /// 从 JSON 文件导入 xray 配置模板
    SetTemplate {
        /// 模板文件路径
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let command = cli.command.unwrap_or(Command::Run);

    if let Command::ConfigPath = command {
        println!("{}", config.xray_config_path().display());
        return Ok(());
    }

    init_logging(config.log_dir.as_deref(), !matches!(command, Command::Run));

    // 初始化数据库
    let db = init_sqlite(&config.db_path).await?;
    // 运行数据库迁移
    migration::Migrator::up(&db, None).await?;
    info!("✅ 数据库初始化完成: {}", config.db_path.display());

    let config_manager = Arc::new(ConfigManager::new(db.clone()));
    config_manager.load_from_db().await?;

    match command {
        Command::Run => run(config, db, config_manager).await,
        Command::PrintConfig => {
            let synthesizer = ConfigSynthesizer::new(db, config_manager);
            let cfg = synthesizer.synthesize().await?;
            println!("{}", cfg.to_json_pretty()?);
            Ok(())
        }
        Command::SetTemplate { file } => set_template(&config_manager, &file).await,
        Command::ConfigPath => Ok(()),
    }
}

/// 初始化 tracing 日志系统
fn init_logging(log_dir: Option<&Path>, to_stderr: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx::query=warn"));

    if let Some(dir) = log_dir {
        // 按天轮转文件日志
        let file_appender = tracing_appender::rolling::daily(dir, "controller.log");
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(file_appender).with_ansi(false))
            .init();
    } else if to_stderr {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

async fn run(config: Config, db: DatabaseConnection, config_manager: Arc<ConfigManager>) -> Result<()> {
    info!("📋 controller 启动");
    info!("xray 可执行文件: {}", config.binary_path().display());
    info!("xray 配置文件: {}", config.xray_config_path().display());

    let connector: Arc<dyn LiveControlConnector> =
        Arc::new(XrayApiConnector::new(config.api_timeout()));
    let supervisor = Arc::new(ProcessSupervisor::new(
        config.binary_path(),
        config.xray_config_path(),
        config.stop_grace(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        supervisor.clone(),
        ConfigSynthesizer::new(db.clone(), config_manager.clone()),
        config_manager,
        TrafficAccountant::new(db, connector.clone()),
        connector,
        config.traffic_interval(),
        config.restart_check_interval(),
    ));

    // 首次启动失败时交给重启任务重试
    if let Err(e) = scheduler.restart_now(false).await {
        error!("{:#}", e);
        scheduler.request_restart();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = scheduler.clone().start(shutdown_rx);

    info!("✅ 所有服务已启动，等待终止信号...");
    wait_for_signal().await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        warn!("调度任务异常结束: {}", e);
    }
    supervisor.shutdown().await;
    info!("controller 已退出");
    Ok(())
}

async fn wait_for_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C 信号，正在关闭服务...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("无法监听 SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("收到 SIGTERM 信号，正在关闭服务...");
        }
    }
}

async fn set_template(config_manager: &ConfigManager, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("无法读取模板文件: {}", file.display()))?;
    ProcessConfig::parse(&content)?;

    config_manager
        .set_json(config_keys::XRAY_TEMPLATE_CONFIG, content)
        .await?;
    info!("✅ xray 配置模板已更新，下次重启 xray 时生效");
    Ok(())
}
