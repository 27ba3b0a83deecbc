//! 热更新控制 trait 和相关类型
//!
//! 定义了 Controller 在不重启 xray 的前提下修改其运行时入站/用户的接口。
//! 生产实现基于 xray 的 gRPC 管理 API，测试中可以替换为记录调用的实现。

use async_trait::async_trait;

use super::traffic::TrafficReport;
use crate::error::ConnError;

/// 旧版 shadowsocks 加密方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowsocksCipher {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
    Xchacha20Poly1305,
}

impl ShadowsocksCipher {
    /// 解析加密方式名称，2022 系列及未知名称返回 None
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "aes-128-gcm" => Some(Self::Aes128Gcm),
            "aes-256-gcm" => Some(Self::Aes256Gcm),
            "chacha20-poly1305" | "chacha20-ietf-poly1305" => Some(Self::Chacha20Poly1305),
            "xchacha20-poly1305" | "xchacha20-ietf-poly1305" => Some(Self::Xchacha20Poly1305),
            _ => None,
        }
    }
}

/// 客户端凭据，按入站协议区分
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Account {
    Vmess { id: String },
    Vless { id: String, flow: String },
    Trojan { password: String },
    Shadowsocks { password: String, cipher: ShadowsocksCipher },
    /// shadowsocks 2022 多用户身份
    Shadowsocks2022 { key: String },
}

impl Account {
    /// 根据加密方式构造 shadowsocks 凭据
    pub fn shadowsocks(password: String, method: &str) -> Self {
        match ShadowsocksCipher::from_method(method) {
            Some(cipher) => Account::Shadowsocks { password, cipher },
            None => Account::Shadowsocks2022 { key: password },
        }
    }
}

/// 需要热添加到入站的用户
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveUser {
    pub email: String,
    pub account: Account,
}

/// 已连接的管理通道
///
/// 所有调用都有超时上限，超时与连接失败一样返回 [`ConnError`]，不做重试。
#[async_trait]
pub trait LiveControl: Send + Sync {
    /// 向指定入站添加用户
    async fn add_user(&self, inbound_tag: &str, user: &LiveUser) -> Result<(), ConnError>;

    /// 从指定入站移除用户
    async fn remove_user(&self, inbound_tag: &str, email: &str) -> Result<(), ConnError>;

    /// 移除整个入站
    async fn remove_inbound(&self, tag: &str) -> Result<(), ConnError>;

    /// 查询流量计数器，reset 为 true 时读取后清零
    async fn query_traffic(&self, reset: bool) -> Result<TrafficReport, ConnError>;

    /// 关闭连接
    fn disconnect(self: Box<Self>);
}

/// 管理通道连接器
#[async_trait]
pub trait LiveControlConnector: Send + Sync {
    async fn connect(&self, api_port: u16) -> Result<Box<dyn LiveControl>, ConnError>;
}
