//! 入站 settings / streamSettings 文档的强类型视图
//!
//! 未建模的字段通过 `extra` 原样保留，写回数据库时不会丢失。

use common::protocol::control::Account;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 下发给 xray 的客户端对象只允许包含这些字段
pub const CLIENT_FIELD_ALLOW_LIST: [&str; 5] = ["email", "id", "password", "flow", "method"];

const DEPRECATED_VISION_FLOW: &str = "xtls-rprx-vision-udp443";
const VISION_FLOW: &str = "xtls-rprx-vision";

/// 入站协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    /// 不支持热添加用户的协议
    Other,
}

impl Protocol {
    pub fn parse(protocol: &str) -> Self {
        match protocol {
            "vmess" => Protocol::Vmess,
            "vless" => Protocol::Vless,
            "trojan" => Protocol::Trojan,
            "shadowsocks" => Protocol::Shadowsocks,
            _ => Protocol::Other,
        }
    }
}

/// settings.clients 中的单个客户端
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(rename = "expiryTime", default, skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientEntry {
    /// 未显式写 `enable: false` 即视为启用
    pub fn is_enabled(&self) -> bool {
        self.enable != Some(false)
    }

    fn normalized_flow(&self) -> Option<String> {
        self.flow.as_ref().map(|flow| {
            if flow == DEPRECATED_VISION_FLOW {
                VISION_FLOW.to_string()
            } else {
                flow.clone()
            }
        })
    }

    /// 下发给进程的形式：仅保留白名单字段，并规范化废弃的 flow
    pub fn emitted(&self) -> ClientEntry {
        ClientEntry {
            email: self.email.clone(),
            id: self.id.clone(),
            password: self.password.clone(),
            flow: self.normalized_flow(),
            method: self.method.clone(),
            ..Default::default()
        }
    }

    /// 构造热添加用的凭据；协议不支持或缺少凭据字段时返回 None
    pub fn account(&self, protocol: Protocol, inbound_method: Option<&str>) -> Option<Account> {
        match protocol {
            Protocol::Vmess => Some(Account::Vmess {
                id: self.id.clone()?,
            }),
            Protocol::Vless => Some(Account::Vless {
                id: self.id.clone()?,
                flow: self.normalized_flow().unwrap_or_default(),
            }),
            Protocol::Trojan => Some(Account::Trojan {
                password: self.password.clone()?,
            }),
            Protocol::Shadowsocks => {
                let method = self.method.as_deref().or(inbound_method).unwrap_or_default();
                Some(Account::shadowsocks(self.password.clone()?, method))
            }
            Protocol::Other => None,
        }
    }
}

/// 入站 settings 文档
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientEntry>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundSettings {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// 入站级别的 shadowsocks 加密方式
    pub fn method(&self) -> Option<&str> {
        self.extra.get("method").and_then(Value::as_str)
    }

    pub fn client(&self, email: &str) -> Option<&ClientEntry> {
        self.clients.as_ref()?.iter().find(|c| c.email == email)
    }

    pub fn client_mut(&mut self, email: &str) -> Option<&mut ClientEntry> {
        self.clients.as_mut()?.iter_mut().find(|c| c.email == email)
    }
}

/// 清理 streamSettings：去掉 TLS / reality 块里的 settings 子对象以及 externalProxy
///
/// 空文档返回 None。
pub fn clean_stream_settings(raw: &str) -> Result<Option<Value>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let mut stream: Value = serde_json::from_str(raw)?;
    if let Some(obj) = stream.as_object_mut() {
        for block in ["tlsSettings", "realitySettings"] {
            if let Some(Value::Object(inner)) = obj.get_mut(block) {
                inner.remove("settings");
            }
        }
        obj.remove("externalProxy");
    }
    Ok(Some(stream))
}
