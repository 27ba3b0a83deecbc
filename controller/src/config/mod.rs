//! Controller 配置模块

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::xray;

/// Controller 配置（controller.toml）
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// 数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// xray 可执行文件及 config.json 所在目录
    #[serde(default = "default_bin_folder")]
    pub bin_folder: PathBuf,

    /// xray 可执行文件名，默认 `xray-<os>-<arch>`
    #[serde(default = "xray::default_binary_name")]
    pub binary_name: String,

    /// 日志目录，设置后按天滚动写入 controller.log
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 流量统计周期（秒）
    #[serde(default = "default_traffic_interval")]
    pub traffic_interval_secs: u64,

    /// 进程存活检查周期（秒）
    #[serde(default = "default_restart_check_interval")]
    pub restart_check_interval_secs: u64,

    /// 管理通道调用超时（秒）
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    /// 停止进程时等待退出的时间（秒），超时后强制结束
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/x-ui.db")
}

fn default_bin_folder() -> PathBuf {
    PathBuf::from("./bin")
}

fn default_traffic_interval() -> u64 {
    10
}

fn default_restart_check_interval() -> u64 {
    30
}

fn default_api_timeout() -> u64 {
    5
}

fn default_stop_grace() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bin_folder: default_bin_folder(),
            binary_name: xray::default_binary_name(),
            log_dir: None,
            traffic_interval_secs: default_traffic_interval(),
            restart_check_interval_secs: default_restart_check_interval(),
            api_timeout_secs: default_api_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl Config {
    /// 加载配置：指定路径必须存在；未指定时依次尝试默认位置，都不存在则使用默认配置
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = ["controller.toml", "../controller.toml"];
        for path_str in &config_paths {
            let path = Path::new(path_str);
            if path.exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.bin_folder.join(&self.binary_name)
    }

    pub fn xray_config_path(&self) -> PathBuf {
        xray::config_path(&self.bin_folder)
    }

    pub fn traffic_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_interval_secs.max(1))
    }

    pub fn restart_check_interval(&self) -> Duration {
        Duration::from_secs(self.restart_check_interval_secs.max(1))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
