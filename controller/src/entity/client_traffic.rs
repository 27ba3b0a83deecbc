use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 单个客户端（入站 + email）的流量与有效期记录
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "client_traffic")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[serde(rename = "inboundId")]
    pub inbound_id: i64,
    pub enable: bool,
    #[sea_orm(unique)]
    pub email: String,
    pub up: i64,
    pub down: i64,
    /// 到期时间（毫秒时间戳）
    /// - 0: 永不过期
    /// - 负数: 首次使用后才开始计时，待换算为绝对时间
    #[serde(rename = "expiryTime")]
    pub expiry_time: i64,
    /// 总流量配额（字节），0 表示不限
    pub total: i64,
    /// 自动续期周期（天），0 表示不续期
    pub reset: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::inbound::Entity",
        from = "Column::InboundId",
        to = "super::inbound::Column::Id"
    )]
    Inbound,
}

impl Related<super::inbound::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Inbound.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
