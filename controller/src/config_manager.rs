use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter, Set};
use tokio::sync::RwLock;
use tracing::info;

use crate::entity::system_config::config_keys;
use crate::entity::{system_config, SystemConfig};
use crate::xray::DEFAULT_TEMPLATE_CONFIG;

const VALUE_TYPE_JSON: &str = "json";

/// 系统配置缓存管理器
///
/// 缓存保存数据库中的原始文本，解析由使用方负责。
#[derive(Clone)]
pub struct ConfigManager {
    db: DatabaseConnection,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl ConfigManager {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 从数据库加载所有配置到缓存
    pub async fn load_from_db(&self) -> anyhow::Result<()> {
        let configs = SystemConfig::find().all(&self.db).await?;

        let mut cache = self.cache.write().await;
        cache.clear();
        for config in configs {
            cache.insert(config.key, config.value);
        }

        info!("✅ 已加载 {} 个系统配置项", cache.len());
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let cache = self.cache.read().await;
        cache.get(key).cloned()
    }

    /// xray 配置模板，未配置或为空时使用内置模板
    pub async fn xray_template(&self) -> String {
        match self.get(config_keys::XRAY_TEMPLATE_CONFIG).await {
            Some(template) if !template.trim().is_empty() => template,
            _ => DEFAULT_TEMPLATE_CONFIG.to_string(),
        }
    }

    /// 写入 JSON 配置，不存在时插入
    pub async fn set_json(&self, key: &str, value: String) -> anyhow::Result<()> {
        let now = chrono::Utc::now().naive_utc();

        if let Some(config) = SystemConfig::find()
            .filter(system_config::Column::Key.eq(key))
            .one(&self.db)
            .await?
        {
            let mut active_model: system_config::ActiveModel = config.into();
            active_model.value = Set(value.clone());
            active_model.value_type = Set(VALUE_TYPE_JSON.to_string());
            active_model.updated_at = Set(now);
            active_model.update(&self.db).await?;
        } else {
            system_config::ActiveModel {
                id: NotSet,
                key: Set(key.to_string()),
                value: Set(value.clone()),
                description: Set(String::new()),
                value_type: Set(VALUE_TYPE_JSON.to_string()),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&self.db)
            .await?;
        }

        let mut cache = self.cache.write().await;
        cache.insert(key.to_string(), value);
        Ok(())
    }

    /// 重新加载配置（外部修改数据库后刷新）
    pub async fn reload(&self) -> anyhow::Result<()> {
        self.load_from_db().await
    }
}
