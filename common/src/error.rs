//! 管理通道错误类型

use thiserror::Error;

/// 管理通道（xray API）调用错误
///
/// 调用方应把所有变体都视为"无法热更新"。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    #[error("无效的 API 端口: {0}")]
    InvalidPort(u16),

    #[error("无法连接 xray API: {0}")]
    Unreachable(String),

    #[error("xray API 调用失败: {0}")]
    RpcFailed(String),
}
