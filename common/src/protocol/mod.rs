//! 共享协议类型定义
//!
//! 此模块定义了 Controller 与运行中的 xray 进程之间交互所需的类型，
//! 包括热更新控制 trait、用户凭据以及流量统计结构体。

pub mod control;
pub mod traffic;
