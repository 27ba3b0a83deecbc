//! xray 进程相关：配置文档、入站设置、进程管理和 gRPC 管理通道

pub mod api;
pub mod config;
pub mod process;
pub mod settings;

use std::path::{Path, PathBuf};

/// 内置的默认配置模板，首次迁移时写入 system_config
pub const DEFAULT_TEMPLATE_CONFIG: &str = include_str!("default_config.json");

/// 当前平台的 xray 可执行文件名：`xray-<os>-<arch>`
pub fn default_binary_name() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("xray-{}-{}", std::env::consts::OS, arch)
}

/// xray 配置文件路径
pub fn config_path(bin_folder: &Path) -> PathBuf {
    bin_folder.join("config.json")
}
