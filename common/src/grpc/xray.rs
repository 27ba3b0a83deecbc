//! xray 管理 API 的 protobuf 消息
//!
//! 只声明 Controller 实际用到的 HandlerService / StatsService 方法及其消息，
//! 字段编号与 xray-core 的 proto 定义保持一致。

use prost::Message;

use crate::protocol::control::{Account, LiveUser, ShadowsocksCipher};

pub const ALTER_INBOUND_PATH: &str = "/xray.app.proxyman.command.HandlerService/AlterInbound";
pub const REMOVE_INBOUND_PATH: &str = "/xray.app.proxyman.command.HandlerService/RemoveInbound";
pub const QUERY_STATS_PATH: &str = "/xray.app.stats.command.StatsService/QueryStats";

/// xray.common.serial.TypedMessage
#[derive(Clone, PartialEq, Message)]
pub struct TypedMessage {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

impl TypedMessage {
    pub fn pack<M: Message>(type_name: &str, message: &M) -> Self {
        Self {
            r#type: type_name.to_string(),
            value: message.encode_to_vec(),
        }
    }
}

/// xray.common.protocol.User
#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(message, optional, tag = "3")]
    pub account: Option<TypedMessage>,
}

/// xray.proxy.vmess.Account
#[derive(Clone, PartialEq, Message)]
pub struct VmessAccount {
    #[prost(string, tag = "1")]
    pub id: String,
}

/// xray.proxy.vless.Account
#[derive(Clone, PartialEq, Message)]
pub struct VlessAccount {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub flow: String,
    #[prost(string, tag = "3")]
    pub encryption: String,
}

/// xray.proxy.trojan.Account
#[derive(Clone, PartialEq, Message)]
pub struct TrojanAccount {
    #[prost(string, tag = "1")]
    pub password: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CipherType {
    Unknown = 0,
    Aes128Gcm = 5,
    Aes256Gcm = 6,
    Chacha20Poly1305 = 7,
    Xchacha20Poly1305 = 8,
}

impl From<ShadowsocksCipher> for CipherType {
    fn from(cipher: ShadowsocksCipher) -> Self {
        match cipher {
            ShadowsocksCipher::Aes128Gcm => CipherType::Aes128Gcm,
            ShadowsocksCipher::Aes256Gcm => CipherType::Aes256Gcm,
            ShadowsocksCipher::Chacha20Poly1305 => CipherType::Chacha20Poly1305,
            ShadowsocksCipher::Xchacha20Poly1305 => CipherType::Xchacha20Poly1305,
        }
    }
}

/// xray.proxy.shadowsocks.Account
#[derive(Clone, PartialEq, Message)]
pub struct ShadowsocksAccount {
    #[prost(string, tag = "1")]
    pub password: String,
    #[prost(enumeration = "CipherType", tag = "2")]
    pub cipher_type: i32,
    #[prost(bool, tag = "3")]
    pub iv_check: bool,
}

/// xray.proxy.shadowsocks_2022.User
#[derive(Clone, PartialEq, Message)]
pub struct Shadowsocks2022User {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(int32, tag = "3")]
    pub level: i32,
}

/// xray.app.proxyman.command.AddUserOperation
#[derive(Clone, PartialEq, Message)]
pub struct AddUserOperation {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

/// xray.app.proxyman.command.RemoveUserOperation
#[derive(Clone, PartialEq, Message)]
pub struct RemoveUserOperation {
    #[prost(string, tag = "1")]
    pub email: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveInboundResponse {}

/// xray.app.stats.command.QueryStatsRequest
#[derive(Clone, PartialEq, Message)]
pub struct QueryStatsRequest {
    #[prost(string, tag = "1")]
    pub pattern: String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: Vec<Stat>,
}

/// 把用户凭据编码为 xray 的账户消息
pub fn account_message(user: &LiveUser) -> TypedMessage {
    match &user.account {
        Account::Vmess { id } => TypedMessage::pack(
            "xray.proxy.vmess.Account",
            &VmessAccount { id: id.clone() },
        ),
        Account::Vless { id, flow } => TypedMessage::pack(
            "xray.proxy.vless.Account",
            &VlessAccount {
                id: id.clone(),
                flow: flow.clone(),
                encryption: "none".to_string(),
            },
        ),
        Account::Trojan { password } => TypedMessage::pack(
            "xray.proxy.trojan.Account",
            &TrojanAccount {
                password: password.clone(),
            },
        ),
        Account::Shadowsocks { password, cipher } => TypedMessage::pack(
            "xray.proxy.shadowsocks.Account",
            &ShadowsocksAccount {
                password: password.clone(),
                cipher_type: CipherType::from(*cipher) as i32,
                iv_check: false,
            },
        ),
        Account::Shadowsocks2022 { key } => TypedMessage::pack(
            "xray.proxy.shadowsocks_2022.User",
            &Shadowsocks2022User {
                key: key.clone(),
                email: user.email.clone(),
                level: 0,
            },
        ),
    }
}

/// 构造"向入站添加用户"请求
pub fn add_user_request(inbound_tag: &str, user: &LiveUser) -> AlterInboundRequest {
    let operation = AddUserOperation {
        user: Some(User {
            level: 0,
            email: user.email.clone(),
            account: Some(account_message(user)),
        }),
    };
    AlterInboundRequest {
        tag: inbound_tag.to_string(),
        operation: Some(TypedMessage::pack(
            "xray.app.proxyman.command.AddUserOperation",
            &operation,
        )),
    }
}

/// 构造"从入站移除用户"请求
pub fn remove_user_request(inbound_tag: &str, email: &str) -> AlterInboundRequest {
    AlterInboundRequest {
        tag: inbound_tag.to_string(),
        operation: Some(TypedMessage::pack(
            "xray.app.proxyman.command.RemoveUserOperation",
            &RemoveUserOperation {
                email: email.to_string(),
            },
        )),
    }
}
