//! 配置生成器
//!
//! 模板 + 已启用入站（过滤后的客户端列表）→ 交给进程的完整配置。

use std::collections::HashSet;
use std::sync::Arc;

use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder};
use tracing::info;

use crate::config_manager::ConfigManager;
use crate::entity::{client_traffic, inbound, ClientTraffic, Inbound};
use crate::error::ConfigError;
use crate::xray::config::{InboundConfig, ProcessConfig};
use crate::xray::settings::{clean_stream_settings, ClientEntry, InboundSettings};

/// 入站记录及其客户端流量行
#[derive(Debug, Clone)]
pub struct InboundSnapshot {
    pub inbound: inbound::Model,
    pub client_stats: Vec<client_traffic::Model>,
}

/// 读取所有已启用入站（按 id 排序）及其客户端流量行
pub async fn load_enabled_inbounds<C: ConnectionTrait>(db: &C) -> Result<Vec<InboundSnapshot>, DbErr> {
    let rows = Inbound::find()
        .filter(inbound::Column::Enable.eq(true))
        .order_by_asc(inbound::Column::Id)
        .find_with_related(ClientTraffic)
        .all(db)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(inbound, client_stats)| InboundSnapshot { inbound, client_stats })
        .collect())
}

/// 由模板和入站快照生成配置
///
/// 清理后的 settings / streamSettings 会写回快照中的记录（仅内存）。
/// 任一入站解析失败则整体失败，不会产出部分配置。
pub fn build(template: &str, snapshots: &mut [InboundSnapshot]) -> Result<ProcessConfig, ConfigError> {
    let mut config = ProcessConfig::parse(template)?;

    for snapshot in snapshots.iter_mut() {
        let record = &mut snapshot.inbound;
        if !record.enable {
            continue;
        }

        let mut settings = InboundSettings::parse(&record.settings)
            .map_err(|e| ConfigError::parse(format!("入站 {} 的 settings", record.tag), e))?;

        if let Some(clients) = settings.clients.take() {
            let disabled: HashSet<&str> = snapshot
                .client_stats
                .iter()
                .filter(|stat| !stat.enable)
                .map(|stat| stat.email.as_str())
                .collect();

            let kept: Vec<ClientEntry> = clients
                .into_iter()
                .filter(|client| {
                    if disabled.contains(client.email.as_str()) {
                        info!("入站 {} 移除用户 {}（已过期或流量耗尽）", record.tag, client.email);
                        return false;
                    }
                    client.is_enabled()
                })
                .map(|client| client.emitted())
                .collect();

            settings.clients = Some(kept);
            record.settings = settings
                .to_json_pretty()
                .map_err(|e| ConfigError::parse(format!("入站 {} 的 settings", record.tag), e))?;
        }

        let stream = clean_stream_settings(&record.stream_settings)
            .map_err(|e| ConfigError::parse(format!("入站 {} 的 streamSettings", record.tag), e))?;
        if let Some(stream) = &stream {
            record.stream_settings = serde_json::to_string_pretty(stream)
                .map_err(|e| ConfigError::parse(format!("入站 {} 的 streamSettings", record.tag), e))?;
        }

        let settings_value = serde_json::to_value(&settings)
            .map_err(|e| ConfigError::parse(format!("入站 {} 的 settings", record.tag), e))?;
        config
            .inbounds
            .push(InboundConfig::from_record(record, settings_value, stream)?);
    }

    Ok(config)
}

/// 从数据库读取模板与入站并生成配置
#[derive(Clone)]
pub struct ConfigSynthesizer {
    db: DatabaseConnection,
    config_manager: Arc<ConfigManager>,
}

impl ConfigSynthesizer {
    pub fn new(db: DatabaseConnection, config_manager: Arc<ConfigManager>) -> Self {
        Self { db, config_manager }
    }

    pub async fn synthesize(&self) -> Result<ProcessConfig, ConfigError> {
        let template = self.config_manager.xray_template().await;
        let mut snapshots = load_enabled_inbounds(&self.db).await?;
        build(&template, &mut snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::memory_db;
    use crate::test_support::{insert_client, insert_inbound, NewInbound};
    use crate::xray::settings::CLIENT_FIELD_ALLOW_LIST;
    use crate::xray::DEFAULT_TEMPLATE_CONFIG;
    use serde_json::Value;

    fn model(id: i64, tag: &str, port: i32, enable: bool, settings: &str, stream: &str) -> inbound::Model {
        inbound::Model {
            id,
            remark: String::new(),
            enable,
            up: 0,
            down: 0,
            total: 0,
            expiry_time: 0,
            listen: String::new(),
            port,
            protocol: "vless".into(),
            settings: settings.into(),
            stream_settings: stream.into(),
            tag: tag.into(),
            sniffing: String::new(),
            allocate: String::new(),
        }
    }

    fn stat(inbound_id: i64, email: &str, enable: bool) -> client_traffic::Model {
        client_traffic::Model {
            id: 0,
            inbound_id,
            enable,
            email: email.into(),
            up: 0,
            down: 0,
            expiry_time: 0,
            total: 0,
            reset: 0,
        }
    }

    const SETTINGS: &str = r#"{"clients":[
        {"id":"1","email":"a@x","flow":"xtls-rprx-vision-udp443","totalGB":0,"subId":"s"},
        {"id":"2","email":"b@x","enable":false},
        {"id":"3","email":"c@x","limitIp":1}
    ],"decryption":"none"}"#;

    #[test]
    fn test_build_filters_clients() {
        let mut snapshots = vec![InboundSnapshot {
            inbound: model(1, "in-1", 1001, true, SETTINGS, ""),
            client_stats: vec![stat(1, "a@x", true), stat(1, "c@x", false)],
        }];

        let cfg = build(DEFAULT_TEMPLATE_CONFIG, &mut snapshots).unwrap();
        // 模板中的 api 入站在前
        assert_eq!(cfg.inbounds.len(), 2);
        assert_eq!(cfg.inbounds[0].tag, "api");

        let settings = cfg.inbounds[1].settings.as_ref().unwrap();
        let clients = settings["clients"].as_array().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["email"], "a@x");
        assert_eq!(clients[0]["flow"], "xtls-rprx-vision");
        for client in clients {
            for key in client.as_object().unwrap().keys() {
                assert!(CLIENT_FIELD_ALLOW_LIST.contains(&key.as_str()));
            }
        }
        assert_eq!(settings["decryption"], "none");

        // 规范化结果写回记录
        let written: Value = serde_json::from_str(&snapshots[0].inbound.settings).unwrap();
        assert_eq!(written, *settings);
    }

    #[test]
    fn test_build_skips_disabled_inbound_and_keeps_order() {
        let mut snapshots = vec![
            InboundSnapshot {
                inbound: model(2, "in-2", 1002, true, r#"{"clients":[]}"#, ""),
                client_stats: vec![],
            },
            InboundSnapshot {
                inbound: model(3, "in-3", 1003, false, r#"{"clients":[]}"#, ""),
                client_stats: vec![],
            },
            InboundSnapshot {
                inbound: model(4, "in-4", 1004, true, r#"{"clients":[]}"#, ""),
                client_stats: vec![],
            },
        ];
        let cfg = build(r#"{"log":{}}"#, &mut snapshots).unwrap();
        let tags: Vec<&str> = cfg.inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["in-2", "in-4"]);
    }

    #[test]
    fn test_build_cleans_stream_settings() {
        let stream = r#"{"security":"tls","tlsSettings":{"serverName":"s","settings":{"fingerprint":"chrome"}},"externalProxy":[]}"#;
        let mut snapshots = vec![InboundSnapshot {
            inbound: model(1, "in-1", 1001, true, r#"{"clients":[]}"#, stream),
            client_stats: vec![],
        }];
        let cfg = build("{}", &mut snapshots).unwrap();
        let emitted = cfg.inbounds[0].stream_settings.as_ref().unwrap();
        assert!(emitted.get("externalProxy").is_none());
        assert!(emitted["tlsSettings"].get("settings").is_none());
        assert!(!snapshots[0].inbound.stream_settings.contains("externalProxy"));
    }

    #[test]
    fn test_build_aborts_on_malformed_settings() {
        let mut snapshots = vec![
            InboundSnapshot {
                inbound: model(1, "ok", 1001, true, r#"{"clients":[]}"#, ""),
                client_stats: vec![],
            },
            InboundSnapshot {
                inbound: model(2, "broken", 1002, true, "{not json", ""),
                client_stats: vec![],
            },
        ];
        match build("{}", &mut snapshots) {
            Err(ConfigError::ParseFailed { context, .. }) => assert!(context.contains("broken")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_synthesize_from_database() {
        let db = memory_db().await;
        let first = insert_inbound(&db, NewInbound::vless("in-a", 2001, SETTINGS)).await;
        let mut off = NewInbound::vless("in-b", 2002, r#"{"clients":[]}"#);
        off.enable = false;
        insert_inbound(&db, off).await;
        insert_client(&db, first.id, "b@x", |_| {}).await;
        insert_client(&db, first.id, "c@x", |row| row.enable = false).await;

        let config_manager = Arc::new(ConfigManager::new(db.clone()));
        config_manager.load_from_db().await.unwrap();
        let synthesizer = ConfigSynthesizer::new(db.clone(), config_manager);

        let cfg = synthesizer.synthesize().await.unwrap();
        let tags: Vec<&str> = cfg.inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["api", "in-a"]);
        let clients = cfg.inbounds[1].settings.as_ref().unwrap()["clients"].as_array().unwrap().clone();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["email"], "a@x");
        assert_eq!(cfg.api_port(), Some(62789));
    }
}
