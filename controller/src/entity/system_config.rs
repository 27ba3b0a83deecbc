use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "system_config")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// 配置键名
    pub key: String,
    /// 配置值
    #[sea_orm(column_type = "Text")]
    pub value: String,
    /// 配置说明
    pub description: String,
    /// 配置类型：number, string, boolean, json
    pub value_type: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// 配置键常量
pub mod config_keys {
    /// xray 配置模板（JSON）
    pub const XRAY_TEMPLATE_CONFIG: &str = "xray_template_config";
}
