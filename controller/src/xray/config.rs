//! xray 配置文档
//!
//! 只对 `inbounds` 做强类型建模，其余顶层段（log、routing、dns、outbounds、
//! policy、api、stats ...）原样透传。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::inbound;
use crate::error::ConfigError;

/// 交给进程的完整配置
///
/// 相等性是完整的结构比较：入站的任一字段或模板任一段变化都视为不同配置。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(flatten)]
    pub sections: Map<String, Value>,
}

impl ProcessConfig {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::parse("配置模板", e))
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// 管理通道端口，取自 tag 为 `api` 的入站
    pub fn api_port(&self) -> Option<u16> {
        self.inbounds
            .iter()
            .find(|inbound| inbound.tag == "api")
            .map(|inbound| inbound.port)
            .filter(|port| *port > 0)
    }
}

/// 配置中的单个入站
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<Value>,
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<Value>,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocate: Option<Value>,
}

impl InboundConfig {
    /// 由数据库记录和已清理的 settings / streamSettings 生成入站块
    pub fn from_record(
        record: &inbound::Model,
        settings: Value,
        stream_settings: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let port = u16::try_from(record.port).map_err(|_| ConfigError::InvalidPort {
            tag: record.tag.clone(),
            port: record.port,
        })?;

        let listen = match record.listen.trim() {
            "" => None,
            listen => Some(Value::String(listen.to_string())),
        };

        Ok(Self {
            listen,
            port,
            protocol: record.protocol.clone(),
            settings: Some(settings),
            stream_settings,
            tag: record.tag.clone(),
            sniffing: optional_document(&record.tag, "sniffing", &record.sniffing)?,
            allocate: optional_document(&record.tag, "allocate", &record.allocate)?,
        })
    }
}

fn optional_document(tag: &str, field: &str, raw: &str) -> Result<Option<Value>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| ConfigError::parse(format!("入站 {} 的 {}", tag, field), e))
}
