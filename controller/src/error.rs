//! Controller 各组件的错误类型

use std::io;

use thiserror::Error;

/// xray 进程管理错误
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("xray 已在运行")]
    AlreadyRunning,

    #[error("xray 未运行")]
    NotRunning,

    #[error("启动 xray 失败 ({binary}): {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("写入 xray 配置失败 ({path}): {reason}")]
    ConfigWriteFailed { path: String, reason: String },
}

/// 流量记账错误
#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("数据库操作失败: {0}")]
    PersistenceFailed(#[from] sea_orm::DbErr),

    #[error("入站 {tag} 的 settings 无法解析: {source}")]
    MalformedSettings {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 配置生成错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("解析 {context} 失败: {source}")]
    ParseFailed {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("入站 {tag} 端口无效: {port}")]
    InvalidPort { tag: String, port: i32 },

    #[error("读取数据库失败: {0}")]
    Persistence(#[from] sea_orm::DbErr),
}

impl ConfigError {
    pub(crate) fn parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        ConfigError::ParseFailed {
            context: context.into(),
            source,
        }
    }
}
