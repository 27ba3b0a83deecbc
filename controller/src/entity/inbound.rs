use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 入站监听器
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inbound")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub remark: String,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    /// 总流量配额（字节），0 表示不限
    pub total: i64,
    /// 到期时间（毫秒时间戳），0 表示永不过期
    #[serde(rename = "expiryTime")]
    pub expiry_time: i64,
    pub listen: String,
    pub port: i32,
    pub protocol: String,
    /// 协议相关设置（JSON），包含客户端列表
    #[sea_orm(column_type = "Text")]
    pub settings: String,
    #[serde(rename = "streamSettings")]
    #[sea_orm(column_type = "Text")]
    pub stream_settings: String,
    #[sea_orm(unique)]
    pub tag: String,
    #[sea_orm(column_type = "Text")]
    pub sniffing: String,
    #[sea_orm(column_type = "Text")]
    pub allocate: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::client_traffic::Entity")]
    ClientTraffic,
}

impl Related<super::client_traffic::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ClientTraffic.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
