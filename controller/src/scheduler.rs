//! 周期任务
//!
//! - 流量任务：拉取并清零 xray 统计计数器，记账，热更新失败时标记需要重启
//! - 重启任务：检测 xray 崩溃并强制重启；处理“需要重启”标记
//!
//! 两个任务在同一个循环里执行，保证记账不会并发。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::protocol::control::LiveControlConnector;
use common::protocol::traffic::TrafficReport;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config_manager::ConfigManager;
use crate::synthesizer::ConfigSynthesizer;
use crate::traffic::TrafficAccountant;
use crate::xray::process::ProcessSupervisor;

/// 连续多少次检测到进程已退出才重启
const CRASH_CHECKS_BEFORE_RESTART: u32 = 2;

pub struct Scheduler {
    supervisor: Arc<ProcessSupervisor>,
    synthesizer: ConfigSynthesizer,
    config_manager: Arc<ConfigManager>,
    accountant: TrafficAccountant,
    connector: Arc<dyn LiveControlConnector>,
    need_restart: AtomicBool,
    crash_checks: AtomicU32,
    /// 已从 xray 取出（计数器已清零）但尚未记账成功的流量
    unapplied: Mutex<Option<TrafficReport>>,
    traffic_interval: Duration,
    restart_interval: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        synthesizer: ConfigSynthesizer,
        config_manager: Arc<ConfigManager>,
        accountant: TrafficAccountant,
        connector: Arc<dyn LiveControlConnector>,
        traffic_interval: Duration,
        restart_interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            synthesizer,
            config_manager,
            accountant,
            connector,
            need_restart: AtomicBool::new(false),
            crash_checks: AtomicU32::new(0),
            unapplied: Mutex::new(None),
            traffic_interval,
            restart_interval,
        }
    }

    /// 标记需要重启，由下一次重启任务执行
    pub fn request_restart(&self) {
        self.need_restart.store(true, Ordering::SeqCst);
    }

    pub fn is_restart_pending(&self) -> bool {
        self.need_restart.load(Ordering::SeqCst)
    }

    /// 重新生成配置并重启 xray
    ///
    /// 先做一次空记账，让过期/超额状态在新配置中生效。
    pub async fn restart_now(&self, force: bool) -> anyhow::Result<()> {
        let api_port = self.supervisor.api_port().await;
        if let Err(e) = self.accountant.apply(&TrafficReport::default(), api_port).await {
            warn!("重启前记账失败: {}", e);
        }

        if let Err(e) = self.config_manager.reload().await {
            warn!("重新加载系统配置失败，使用缓存: {:#}", e);
        }

        let cfg = self
            .synthesizer
            .synthesize()
            .await
            .context("生成 xray 配置失败")?;
        self.supervisor
            .restart(cfg, force)
            .await
            .context("重启 xray 失败")?;
        Ok(())
    }

    /// 流量任务的一次执行
    pub async fn traffic_tick(&self) -> anyhow::Result<()> {
        if !self.supervisor.is_running().await {
            return Ok(());
        }
        let Some(api_port) = self.supervisor.api_port().await else {
            return Ok(());
        };

        let control = self
            .connector
            .connect(api_port)
            .await
            .context("连接 xray 管理通道失败")?;
        let report = control.query_traffic(true).await;
        control.disconnect();
        let fresh = report.context("查询 xray 流量失败")?;

        // 上次记账失败的流量与本次合并，直到记账成功
        let mut unapplied = self.unapplied.lock().await;
        let mut report = unapplied.take().unwrap_or_default();
        report.merge(fresh);
        let outcome = match self.accountant.apply(&report, Some(api_port)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                *unapplied = Some(report);
                return Err(e.into());
            }
        };
        drop(unapplied);
        self.supervisor.set_online_clients(outcome.online_clients).await;

        if outcome.need_restart {
            info!("热更新失败，等待重启 xray");
            self.need_restart.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// 重启任务的一次执行
    pub async fn restart_tick(&self) {
        if self.supervisor.has_exited().await {
            let checks = self.crash_checks.fetch_add(1, Ordering::SeqCst) + 1;
            if checks < CRASH_CHECKS_BEFORE_RESTART {
                return;
            }
            self.crash_checks.store(0, Ordering::SeqCst);
            warn!("⚠️ xray 已停止运行: {}，正在重启", self.supervisor.result().await);
            if let Err(e) = self.restart_now(true).await {
                // 启动失败后句柄已清空，靠重启标记继续重试
                error!("{:#}", e);
                self.need_restart.store(true, Ordering::SeqCst);
            }
            return;
        }
        self.crash_checks.store(0, Ordering::SeqCst);

        if self.need_restart.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.restart_now(false).await {
                error!("{:#}", e);
                self.need_restart.store(true, Ordering::SeqCst);
            }
        }
    }

    /// 启动调度循环，shutdown 变化或关闭时退出
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut traffic = interval_at(Instant::now() + self.traffic_interval, self.traffic_interval);
            traffic.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut restart = interval_at(Instant::now() + self.restart_interval, self.restart_interval);
            restart.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                "📋 调度器已启动：流量统计每 {:?}，进程检查每 {:?}",
                self.traffic_interval, self.restart_interval
            );

            loop {
                tokio::select! {
                    _ = traffic.tick() => {
                        if let Err(e) = self.traffic_tick().await {
                            warn!("流量统计失败: {:#}", e);
                        }
                    }
                    _ = restart.tick() => self.restart_tick().await,
                    _ = shutdown.changed() => break,
                }
            }

            info!("调度器已停止");
        })
    }
}
