//! xray 进程管理
//!
//! 同一时间只管理一个 xray 进程。启动、停止、重启和状态查询由同一把锁串行化；
//! 进程退出由后台任务等待，异常退出只记录在句柄上，通过 `status()` / `result()` 暴露。

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::config::ProcessConfig;
use crate::error::ProcessError;

const OUTPUT_MAX_LINES: usize = 100;
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);
const UNKNOWN_VERSION: &str = "Unknown";

#[derive(Debug, Default)]
struct OutputBuffer {
    lines: VecDeque<String>,
}

impl OutputBuffer {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > OUTPUT_MAX_LINES {
            self.lines.pop_front();
        }
    }

    fn last_line(&self) -> Option<String> {
        self.lines.back().cloned()
    }
}

/// 后台任务写入的运行时状态
#[derive(Debug, Default)]
struct RuntimeState {
    output: OutputBuffer,
    exit_error: Option<String>,
    stop_requested: bool,
}

struct ProcessHandle {
    pid: Option<u32>,
    started_at: Instant,
    version: String,
    api_port: Option<u16>,
    config: ProcessConfig,
    runtime: Arc<Mutex<RuntimeState>>,
    exit_rx: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    fn is_running(&self) -> bool {
        !*self.exit_rx.borrow()
    }
}

/// 进程状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub last_output_line: Option<String>,
    pub version: String,
    pub uptime_secs: u64,
    pub api_port: Option<u16>,
}

#[derive(Default)]
struct SupervisorState {
    handle: Option<ProcessHandle>,
    /// 最近一次启动失败的原因
    last_failure: Option<String>,
}

/// xray 进程管理器
pub struct ProcessSupervisor {
    binary: PathBuf,
    config_path: PathBuf,
    stop_grace: Duration,
    state: Mutex<SupervisorState>,
    online_clients: RwLock<Vec<String>>,
}

impl ProcessSupervisor {
    pub fn new(binary: PathBuf, config_path: PathBuf, stop_grace: Duration) -> Self {
        Self {
            binary,
            config_path,
            stop_grace,
            state: Mutex::new(SupervisorState::default()),
            online_clients: RwLock::new(Vec::new()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 启动 xray；已有进程在运行时返回 [`ProcessError::AlreadyRunning`]
    pub async fn start(&self, cfg: ProcessConfig) -> Result<(), ProcessError> {
        let mut state = self.state.lock().await;
        if state.handle.as_ref().is_some_and(ProcessHandle::is_running) {
            return Err(ProcessError::AlreadyRunning);
        }
        self.launch(&mut state, cfg).await
    }

    /// 发送终止信号，不等待进程退出
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let mut state = self.state.lock().await;
        match state.handle.take() {
            Some(handle) if handle.is_running() => {
                info!("🔄 停止 xray (pid {:?})", handle.pid);
                terminate(handle, None).await;
                Ok(())
            }
            other => {
                state.handle = other;
                Err(ProcessError::NotRunning)
            }
        }
    }

    /// 重启 xray
    ///
    /// 非强制且运行中的配置与新配置相同时不做任何事。
    /// 旧进程会先被停止并等待退出（超过宽限时间则强制结束），以便新进程绑定端口。
    pub async fn restart(&self, cfg: ProcessConfig, force: bool) -> Result<(), ProcessError> {
        let mut state = self.state.lock().await;

        if let Some(handle) = &state.handle {
            if !force && handle.is_running() && handle.config == cfg {
                debug!("xray 配置未变化，跳过重启");
                return Ok(());
            }
        }

        if let Some(handle) = state.handle.take() {
            if handle.is_running() {
                info!("🔄 重启 xray (pid {:?})", handle.pid);
                terminate(handle, Some(self.stop_grace)).await;
            }
        }

        self.launch(&mut state, cfg).await
    }

    /// 程序退出前显式结束 xray
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.handle.take() {
            if handle.is_running() {
                info!("停止 xray (pid {:?})", handle.pid);
                terminate(handle, Some(self.stop_grace)).await;
            }
        }
        self.online_clients.write().await.clear();
    }

    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        state.handle.as_ref().is_some_and(ProcessHandle::is_running)
    }

    /// 进程句柄存在但进程已经退出（崩溃或被外部结束）
    pub async fn has_exited(&self) -> bool {
        let state = self.state.lock().await;
        state.handle.as_ref().is_some_and(|h| !h.is_running())
    }

    pub async fn status(&self) -> ProcessStatus {
        let state = self.state.lock().await;
        let Some(handle) = &state.handle else {
            return ProcessStatus {
                last_error: state.last_failure.clone(),
                version: UNKNOWN_VERSION.to_string(),
                ..Default::default()
            };
        };

        let runtime = handle.runtime.lock().await;
        let running = handle.is_running();
        ProcessStatus {
            running,
            pid: handle.pid,
            last_error: runtime.exit_error.clone(),
            last_output_line: runtime.output.last_line(),
            version: handle.version.clone(),
            uptime_secs: if running {
                handle.started_at.elapsed().as_secs()
            } else {
                0
            },
            api_port: handle.api_port,
        }
    }

    /// 最近一行输出，没有输出时返回退出错误
    pub async fn result(&self) -> String {
        let status = self.status().await;
        status
            .last_output_line
            .or(status.last_error)
            .unwrap_or_default()
    }

    pub async fn version(&self) -> String {
        let state = self.state.lock().await;
        state
            .handle
            .as_ref()
            .map(|h| h.version.clone())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
    }

    /// 运行中进程的管理通道端口
    pub async fn api_port(&self) -> Option<u16> {
        let state = self.state.lock().await;
        state
            .handle
            .as_ref()
            .filter(|h| h.is_running())
            .and_then(|h| h.api_port)
    }

    pub async fn set_online_clients(&self, clients: Vec<String>) {
        *self.online_clients.write().await = clients;
    }

    pub async fn online_clients(&self) -> Vec<String> {
        self.online_clients.read().await.clone()
    }

    async fn launch(&self, state: &mut SupervisorState, cfg: ProcessConfig) -> Result<(), ProcessError> {
        match self.spawn(cfg).await {
            Ok(handle) => {
                info!(
                    "✅ xray {} 已启动 (pid {:?}, api 端口 {:?})",
                    handle.version, handle.pid, handle.api_port
                );
                state.handle = Some(handle);
                state.last_failure = None;
                Ok(())
            }
            Err(e) => {
                warn!("启动 xray 失败: {}", e);
                state.handle = None;
                state.last_failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn spawn(&self, cfg: ProcessConfig) -> Result<ProcessHandle, ProcessError> {
        self.write_config(&cfg).await?;

        let mut child = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::SpawnFailed {
                binary: self.binary.display().to_string(),
                source,
            })?;

        let pid = child.id();
        let runtime = Arc::new(Mutex::new(RuntimeState::default()));

        if let Some(out) = child.stdout.take() {
            spawn_output_reader(out, runtime.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_output_reader(err, runtime.clone());
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let waiter_runtime = runtime.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                res = child.wait() => res,
                Ok(()) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("强制结束 xray 失败: {}", e);
                    }
                    child.wait().await
                }
            };

            let mut runtime = waiter_runtime.lock().await;
            match result {
                Ok(status) if status.success() || runtime.stop_requested => {
                    debug!("xray 已退出: {}", status);
                }
                Ok(status) => {
                    warn!("xray 异常退出: {}", status);
                    runtime.exit_error = Some(format!("xray 异常退出: {}", status));
                }
                Err(e) => {
                    warn!("等待 xray 退出失败: {}", e);
                    runtime.exit_error = Some(format!("等待 xray 退出失败: {}", e));
                }
            }
            drop(runtime);
            let _ = exit_tx.send(true);
        });

        let version = probe_version(&self.binary).await;

        Ok(ProcessHandle {
            pid,
            started_at: Instant::now(),
            version,
            api_port: cfg.api_port(),
            config: cfg,
            runtime,
            exit_rx,
            kill_tx: Some(kill_tx),
        })
    }

    async fn write_config(&self, cfg: &ProcessConfig) -> Result<(), ProcessError> {
        let write_failed = |reason: String| ProcessError::ConfigWriteFailed {
            path: self.config_path.display().to_string(),
            reason,
        };

        let json = cfg.to_json_pretty().map_err(|e| write_failed(e.to_string()))?;
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_failed(e.to_string()))?;
        }
        tokio::fs::write(&self.config_path, json)
            .await
            .map_err(|e| write_failed(e.to_string()))
    }
}

fn spawn_output_reader<R>(reader: R, runtime: Arc<Mutex<RuntimeState>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "xray", "{}", line);
            runtime.lock().await.output.push_line(line);
        }
    });
}

/// 结束进程；grace 为 None 时只发送信号不等待
async fn terminate(mut handle: ProcessHandle, grace: Option<Duration>) {
    handle.runtime.lock().await.stop_requested = true;

    if !send_sigterm(handle.pid) {
        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    let Some(grace) = grace else {
        return;
    };

    let mut exit_rx = handle.exit_rx.clone();
    if tokio::time::timeout(grace, exit_rx.wait_for(|exited| *exited))
        .await
        .is_ok()
    {
        return;
    }

    warn!("xray 未在 {:?} 内退出，强制结束", grace);
    if let Some(kill_tx) = handle.kill_tx.take() {
        let _ = kill_tx.send(());
    }
    if tokio::time::timeout(KILL_WAIT, exit_rx.wait_for(|exited| *exited))
        .await
        .is_err()
    {
        warn!("xray (pid {:?}) 强制结束后仍未退出", handle.pid);
    }
}

/// 发送 SIGTERM，成功返回 true
#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) -> bool {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return false;
    };
    // SAFETY: 只向自己启动的子进程发送信号
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        warn!("向 xray (pid {}) 发送 SIGTERM 失败: {}", pid, std::io::Error::last_os_error());
    }
    ret == 0
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) -> bool {
    false
}

/// 运行 `<binary> -version` 获取版本号，失败返回 "Unknown"
async fn probe_version(binary: &Path) -> String {
    let output = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) => parse_version(&String::from_utf8_lossy(&out.stdout)),
        Ok(Err(e)) => {
            debug!("获取 xray 版本失败: {}", e);
            UNKNOWN_VERSION.to_string()
        }
        Err(_) => {
            debug!("获取 xray 版本超时");
            UNKNOWN_VERSION.to_string()
        }
    }
}

/// 版本号是输出中第二个空白分隔的字段
fn parse_version(output: &str) -> String {
    output
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}
