use anyhow::{Context, Result};
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::prelude::*;
use std::fs::{self, create_dir_all};
use std::path::Path;

mod m20250301_000001_create_inbound;
mod m20250301_000002_create_system_config;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_inbound::Migration),
            Box::new(m20250301_000002_create_system_config::Migration),
        ]
    }
}

/// 打开（必要时创建）sqlite 数据库文件
pub async fn init_sqlite(path: &Path) -> Result<DatabaseConnection> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .with_context(|| format!("创建数据目录失败: {}", parent.display()))?;
        }
        fs::write(path, "").with_context(|| format!("创建数据库文件失败: {}", path.display()))?;
    }

    let url = format!("sqlite://{}?mode=rwc", path.display());
    let db = Database::connect(url)
        .await
        .with_context(|| format!("连接 sqlite 失败: {}", path.display()))?;

    Ok(db)
}

/// 测试用内存数据库，单连接保证所有查询看到同一个库
#[cfg(test)]
pub(crate) async fn memory_db() -> DatabaseConnection {
    use sea_orm::ConnectOptions;

    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opts).await.expect("connect memory sqlite");
    Migrator::up(&db, None).await.expect("run migrations");
    db
}
