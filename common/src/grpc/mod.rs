//! xray gRPC 管理 API 的消息定义

pub mod xray;

pub use xray::*;
