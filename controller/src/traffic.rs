//! 流量记账
//!
//! 每次统计结果在一个事务内处理，分五个阶段：
//! 1. 入站流量累加
//! 2. 客户端流量累加（含相对有效期换算）
//! 3. 到期客户端自动续期
//! 4. 禁用超额/过期客户端
//! 5. 禁用超额/过期入站
//!
//! 阶段 1、2 失败时整个事务回滚；阶段 3–5 各自在嵌套事务中执行，
//! 失败只回滚该阶段并记录日志，已累加的流量不会丢失。
//! 策略执行优先通过管理通道热更新运行中的 xray，热更新失败时才要求重启。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use common::error::ConnError;
use common::protocol::control::{Account, LiveControl, LiveControlConnector, LiveUser};
use common::protocol::traffic::{ClientTraffic as ClientDelta, Traffic, TrafficReport};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr,
    EntityTrait, QueryFilter, Set, TransactionTrait,
};
use tracing::{debug, info, warn};

use crate::entity::{client_traffic, inbound, ClientTraffic, Inbound};
use crate::error::AccountingError;
use crate::traffic_limiter::{
    is_client_depleted, is_inbound_depleted, is_renewable, renewed_expiry, resolve_relative_expiry,
};
use crate::xray::settings::{InboundSettings, Protocol};

/// 一次记账的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountingOutcome {
    /// 有热更新失败，需要重启 xray 才能生效
    pub need_restart: bool,
    /// 本次有流量的客户端
    pub online_clients: Vec<String>,
    pub renewed: u64,
    pub disabled_clients: u64,
    pub disabled_inbounds: u64,
}

#[derive(Debug, Default)]
struct PhaseResult {
    need_restart: bool,
    count: u64,
}

pub struct TrafficAccountant {
    db: DatabaseConnection,
    connector: Arc<dyn LiveControlConnector>,
}

impl TrafficAccountant {
    pub fn new(db: DatabaseConnection, connector: Arc<dyn LiveControlConnector>) -> Self {
        Self { db, connector }
    }

    /// 记账并执行配额/有效期策略
    ///
    /// `api_port` 为 None 表示 xray 未运行，此时只更新数据库，不做热更新。
    pub async fn apply(
        &self,
        report: &TrafficReport,
        api_port: Option<u16>,
    ) -> Result<AccountingOutcome, AccountingError> {
        self.apply_at(report, api_port, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub async fn apply_at(
        &self,
        report: &TrafficReport,
        api_port: Option<u16>,
        now_ms: i64,
    ) -> Result<AccountingOutcome, AccountingError> {
        let txn = self.db.begin().await?;

        let online_clients = match ingest(&txn, report, now_ms).await {
            Ok(online) => online,
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!("回滚流量事务失败: {}", rollback_err);
                }
                return Err(e);
            }
        };

        let mut outcome = AccountingOutcome {
            online_clients,
            ..Default::default()
        };
        let mut hot = HotPatchSession::new(self.connector.clone(), api_port);

        let phase = txn.begin().await?;
        let applied = hot.applied;
        let result = auto_renew_clients(&phase, &mut hot, now_ms).await;
        if let Some(r) = finish_phase("自动续期", phase, result, hot.applied != applied).await {
            outcome.renewed = r.count;
            outcome.need_restart |= r.need_restart;
        } else {
            outcome.need_restart |= hot.applied != applied;
        }

        let phase = txn.begin().await?;
        let applied = hot.applied;
        let result = disable_invalid_clients(&phase, &mut hot, now_ms).await;
        if let Some(r) = finish_phase("禁用客户端", phase, result, hot.applied != applied).await {
            outcome.disabled_clients = r.count;
            outcome.need_restart |= r.need_restart;
        } else {
            outcome.need_restart |= hot.applied != applied;
        }

        let phase = txn.begin().await?;
        let applied = hot.applied;
        let result = disable_invalid_inbounds(&phase, &mut hot, now_ms).await;
        if let Some(r) = finish_phase("禁用入站", phase, result, hot.applied != applied).await {
            outcome.disabled_inbounds = r.count;
            outcome.need_restart |= r.need_restart;
        } else {
            outcome.need_restart |= hot.applied != applied;
        }

        hot.close();
        txn.commit().await?;

        if outcome.renewed > 0 {
            info!("🔄 {} 个客户端已自动续期", outcome.renewed);
        }
        if outcome.disabled_clients > 0 {
            info!("⚠️ {} 个客户端因过期或流量耗尽被禁用", outcome.disabled_clients);
        }
        if outcome.disabled_inbounds > 0 {
            info!("⚠️ {} 个入站因过期或流量耗尽被禁用", outcome.disabled_inbounds);
        }

        Ok(outcome)
    }
}

/// 提交或回滚一个策略阶段的嵌套事务；失败返回 None
async fn finish_phase(
    name: &str,
    phase: DatabaseTransaction,
    result: Result<PhaseResult, AccountingError>,
    patched: bool,
) -> Option<PhaseResult> {
    match result {
        Ok(r) => match phase.commit().await {
            Ok(()) => Some(r),
            Err(e) => {
                warn!("{}阶段提交失败: {}", name, e);
                None
            }
        },
        Err(e) => {
            warn!("{}阶段失败，已回滚该阶段: {}", name, e);
            if patched {
                warn!("{}阶段已对 xray 做过热更新，需要重启以保持一致", name);
            }
            if let Err(e) = phase.rollback().await {
                warn!("{}阶段回滚失败: {}", name, e);
            }
            None
        }
    }
}

async fn ingest(
    txn: &DatabaseTransaction,
    report: &TrafficReport,
    now_ms: i64,
) -> Result<Vec<String>, AccountingError> {
    add_inbound_traffic(txn, &report.inbounds).await?;
    add_client_traffic(txn, &report.clients, now_ms).await
}

async fn add_inbound_traffic<C: ConnectionTrait>(db: &C, traffics: &[Traffic]) -> Result<(), DbErr> {
    for traffic in traffics.iter().filter(|t| t.is_inbound) {
        if traffic.up == 0 && traffic.down == 0 {
            continue;
        }
        Inbound::update_many()
            .col_expr(inbound::Column::Up, Expr::col(inbound::Column::Up).add(traffic.up))
            .col_expr(inbound::Column::Down, Expr::col(inbound::Column::Down).add(traffic.down))
            .filter(inbound::Column::Tag.eq(traffic.tag.as_str()))
            .exec(db)
            .await?;
    }
    Ok(())
}

/// 累加客户端流量，返回有流量的客户端 email
async fn add_client_traffic<C: ConnectionTrait>(
    db: &C,
    deltas: &[ClientDelta],
    now_ms: i64,
) -> Result<Vec<String>, AccountingError> {
    if deltas.is_empty() {
        return Ok(Vec::new());
    }

    let emails: Vec<&str> = deltas.iter().map(|d| d.email.as_str()).collect();
    let mut rows = ClientTraffic::find()
        .filter(client_traffic::Column::Email.is_in(emails))
        .all(db)
        .await?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    resolve_pending_expiry(db, &mut rows, now_ms).await?;

    let mut rows: HashMap<String, client_traffic::Model> =
        rows.into_iter().map(|row| (row.email.clone(), row)).collect();
    let mut touched: Vec<String> = Vec::new();
    let mut online: Vec<String> = Vec::new();

    // 同一 email 出现多次时累加
    for delta in deltas {
        let Some(row) = rows.get_mut(&delta.email) else {
            continue;
        };
        row.up += delta.up;
        row.down += delta.down;
        if !touched.contains(&delta.email) {
            touched.push(delta.email.clone());
        }
        if delta.up + delta.down > 0 && !online.contains(&delta.email) {
            online.push(delta.email.clone());
        }
    }

    for email in &touched {
        let Some(row) = rows.remove(email) else {
            continue;
        };
        let (up, down, expiry_time) = (row.up, row.down, row.expiry_time);
        let mut active: client_traffic::ActiveModel = row.into();
        active.up = Set(up);
        active.down = Set(down);
        active.expiry_time = Set(expiry_time);
        active.update(db).await?;
    }

    Ok(online)
}

/// 负数到期时间表示“首次使用后开始计时”，在这里换算成绝对时间，
/// 同时写回入站 settings 中对应客户端的 expiryTime
async fn resolve_pending_expiry<C: ConnectionTrait>(
    db: &C,
    rows: &mut [client_traffic::Model],
    now_ms: i64,
) -> Result<(), AccountingError> {
    let inbound_ids: BTreeSet<i64> = rows
        .iter()
        .filter(|row| row.expiry_time < 0)
        .map(|row| row.inbound_id)
        .collect();
    if inbound_ids.is_empty() {
        return Ok(());
    }

    let inbounds = Inbound::find()
        .filter(inbound::Column::Id.is_in(inbound_ids))
        .all(db)
        .await?;

    for record in inbounds {
        let mut settings = parse_settings(&record)?;
        let mut changed = false;

        for row in rows
            .iter_mut()
            .filter(|row| row.inbound_id == record.id && row.expiry_time < 0)
        {
            let placeholder = settings
                .client(&row.email)
                .and_then(|client| client.expiry_time)
                .unwrap_or(row.expiry_time);
            let expiry = resolve_relative_expiry(placeholder, now_ms);
            debug!("客户端 {} 首次使用，到期时间换算为 {}", row.email, expiry);
            row.expiry_time = expiry;

            if let Some(client) = settings.client_mut(&row.email) {
                client.expiry_time = Some(expiry);
                changed = true;
            }
        }

        if changed {
            save_settings(db, record, &settings).await?;
        }
    }

    Ok(())
}

struct PendingAdd {
    tag: String,
    protocol: Protocol,
    email: String,
    account: Option<Account>,
}

/// 阶段 3：到期且设置了续期周期的客户端按周期顺延，流量清零；
/// 原先被禁用的重新启用并热添加回入站
async fn auto_renew_clients<C: ConnectionTrait>(
    db: &C,
    hot: &mut HotPatchSession,
    now_ms: i64,
) -> Result<PhaseResult, AccountingError> {
    let mut rows: Vec<client_traffic::Model> = ClientTraffic::find()
        .filter(client_traffic::Column::Reset.gt(0))
        .filter(client_traffic::Column::ExpiryTime.gt(0))
        .filter(client_traffic::Column::ExpiryTime.lte(now_ms))
        .all(db)
        .await?
        .into_iter()
        .filter(|row| is_renewable(row, now_ms))
        .collect();
    if rows.is_empty() {
        return Ok(PhaseResult::default());
    }

    let inbound_ids: BTreeSet<i64> = rows.iter().map(|row| row.inbound_id).collect();
    let inbounds = Inbound::find()
        .filter(inbound::Column::Id.is_in(inbound_ids))
        .all(db)
        .await?;

    let mut pending = Vec::new();
    for record in inbounds {
        let mut settings = parse_settings(&record)?;
        let method = settings.method().map(str::to_string);
        let protocol = Protocol::parse(&record.protocol);
        let mut changed = false;

        for row in rows.iter_mut().filter(|row| row.inbound_id == record.id) {
            let expiry = renewed_expiry(row.expiry_time, row.reset, now_ms);
            row.expiry_time = expiry;
            row.up = 0;
            row.down = 0;

            let account = match settings.client_mut(&row.email) {
                Some(client) => {
                    client.expiry_time = Some(expiry);
                    changed = true;
                    client.account(protocol, method.as_deref())
                }
                None => None,
            };

            if !row.enable {
                row.enable = true;
                pending.push(PendingAdd {
                    tag: record.tag.clone(),
                    protocol,
                    email: row.email.clone(),
                    account,
                });
            }
        }

        if changed {
            save_settings(db, record, &settings).await?;
        }
    }

    let count = rows.len() as u64;
    for row in rows {
        let (enable, expiry_time) = (row.enable, row.expiry_time);
        let mut active: client_traffic::ActiveModel = row.into();
        active.enable = Set(enable);
        active.expiry_time = Set(expiry_time);
        active.up = Set(0);
        active.down = Set(0);
        active.update(db).await?;
    }

    let mut need_restart = false;
    for add in pending {
        if !hot.add_user(&add.tag, add.protocol, &add.email, add.account).await {
            need_restart = true;
        }
    }

    Ok(PhaseResult { need_restart, count })
}

/// 阶段 4：禁用超额或过期的客户端
async fn disable_invalid_clients<C: ConnectionTrait>(
    db: &C,
    hot: &mut HotPatchSession,
    now_ms: i64,
) -> Result<PhaseResult, AccountingError> {
    let depleted: Vec<(client_traffic::Model, Option<inbound::Model>)> = ClientTraffic::find()
        .filter(client_traffic::Column::Enable.eq(true))
        .find_also_related(Inbound)
        .all(db)
        .await?
        .into_iter()
        .filter(|(row, _)| is_client_depleted(row, now_ms))
        .collect();
    if depleted.is_empty() {
        return Ok(PhaseResult::default());
    }

    let mut need_restart = false;
    for (row, record) in &depleted {
        // 所属入站未启用时不在运行配置中，无需热更新
        let Some(record) = record.as_ref().filter(|r| r.enable) else {
            continue;
        };
        if !hot.remove_user(&record.tag, &row.email).await {
            need_restart = true;
        }
    }

    let ids: Vec<i64> = depleted.iter().map(|(row, _)| row.id).collect();
    let result = ClientTraffic::update_many()
        .col_expr(client_traffic::Column::Enable, Expr::value(false))
        .filter(client_traffic::Column::Id.is_in(ids))
        .filter(client_traffic::Column::Enable.eq(true))
        .exec(db)
        .await?;

    Ok(PhaseResult {
        need_restart,
        count: result.rows_affected,
    })
}

/// 阶段 5：禁用超额或过期的入站
async fn disable_invalid_inbounds<C: ConnectionTrait>(
    db: &C,
    hot: &mut HotPatchSession,
    now_ms: i64,
) -> Result<PhaseResult, AccountingError> {
    let depleted: Vec<inbound::Model> = Inbound::find()
        .filter(inbound::Column::Enable.eq(true))
        .all(db)
        .await?
        .into_iter()
        .filter(|record| is_inbound_depleted(record, now_ms))
        .collect();
    if depleted.is_empty() {
        return Ok(PhaseResult::default());
    }

    let mut need_restart = false;
    for record in &depleted {
        if !hot.remove_inbound(&record.tag).await {
            need_restart = true;
        }
    }

    let ids: Vec<i64> = depleted.iter().map(|record| record.id).collect();
    let result = Inbound::update_many()
        .col_expr(inbound::Column::Enable, Expr::value(false))
        .filter(inbound::Column::Id.is_in(ids))
        .filter(inbound::Column::Enable.eq(true))
        .exec(db)
        .await?;

    Ok(PhaseResult {
        need_restart,
        count: result.rows_affected,
    })
}

fn parse_settings(record: &inbound::Model) -> Result<InboundSettings, AccountingError> {
    InboundSettings::parse(&record.settings).map_err(|source| AccountingError::MalformedSettings {
        tag: record.tag.clone(),
        source,
    })
}

async fn save_settings<C: ConnectionTrait>(
    db: &C,
    record: inbound::Model,
    settings: &InboundSettings,
) -> Result<(), AccountingError> {
    let json = settings
        .to_json_pretty()
        .map_err(|source| AccountingError::MalformedSettings {
            tag: record.tag.clone(),
            source,
        })?;
    let mut active: inbound::ActiveModel = record.into();
    active.settings = Set(json);
    active.update(db).await?;
    Ok(())
}

/// 一次记账中的热更新会话
///
/// 首次需要时才连接管理通道，结束时关闭。xray 未运行（没有端口）时所有操作直接视为成功，
/// 下次启动时生成的配置本身就已包含变更。
struct HotPatchSession {
    connector: Arc<dyn LiveControlConnector>,
    api_port: Option<u16>,
    control: Option<Box<dyn LiveControl>>,
    connect_error: Option<ConnError>,
    /// 成功执行的热更新次数
    applied: usize,
}

impl HotPatchSession {
    fn new(connector: Arc<dyn LiveControlConnector>, api_port: Option<u16>) -> Self {
        Self {
            connector,
            api_port,
            control: None,
            connect_error: None,
            applied: 0,
        }
    }

    async fn control(&mut self) -> Result<&dyn LiveControl, ConnError> {
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        let port = self.api_port.ok_or(ConnError::InvalidPort(0))?;

        if self.control.is_none() {
            match self.connector.connect(port).await {
                Ok(control) => self.control = Some(control),
                Err(e) => {
                    warn!("连接 xray 管理通道失败: {}", e);
                    self.connect_error = Some(e.clone());
                    return Err(e);
                }
            }
        }

        self.control
            .as_deref()
            .ok_or_else(|| ConnError::Unreachable("管理通道未连接".to_string()))
    }

    /// 返回 false 表示热更新失败，需要重启
    async fn add_user(
        &mut self,
        tag: &str,
        protocol: Protocol,
        email: &str,
        account: Option<Account>,
    ) -> bool {
        if self.api_port.is_none() || protocol == Protocol::Other {
            return true;
        }
        let Some(account) = account else {
            warn!("入站 {} 中找不到用户 {} 的凭据，无法热添加", tag, email);
            return false;
        };
        let user = LiveUser {
            email: email.to_string(),
            account,
        };

        let result = match self.control().await {
            Ok(control) => control.add_user(tag, &user).await,
            Err(e) => Err(e),
        };
        self.record("添加用户", email, result)
    }

    async fn remove_user(&mut self, tag: &str, email: &str) -> bool {
        if self.api_port.is_none() {
            return true;
        }
        let result = match self.control().await {
            Ok(control) => control.remove_user(tag, email).await,
            Err(e) => Err(e),
        };
        self.record("移除用户", email, result)
    }

    async fn remove_inbound(&mut self, tag: &str) -> bool {
        if self.api_port.is_none() {
            return true;
        }
        let result = match self.control().await {
            Ok(control) => control.remove_inbound(tag).await,
            Err(e) => Err(e),
        };
        self.record("移除入站", tag, result)
    }

    fn record(&mut self, action: &str, target: &str, result: Result<(), ConnError>) -> bool {
        match result {
            Ok(()) => {
                debug!("热更新{}成功: {}", action, target);
                self.applied += 1;
                true
            }
            Err(e) => {
                debug!("热更新{}失败: {}: {}", action, target, e);
                false
            }
        }
    }

    fn close(self) {
        if let Some(control) = self.control {
            control.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::memory_db;
    use crate::synthesizer::{build, load_enabled_inbounds};
    use crate::test_support::{insert_client, insert_inbound, NewInbound, RecordingConnector};
    use crate::traffic_limiter::DAY_MILLIS;

    const NOW: i64 = 1_700_000_000_000;
    const API_PORT: Option<u16> = Some(62789);

    fn client_report(email: &str, up: i64, down: i64) -> TrafficReport {
        TrafficReport {
            inbounds: vec![],
            clients: vec![ClientDelta {
                email: email.into(),
                up,
                down,
            }],
        }
    }

    async fn client_row(db: &DatabaseConnection, email: &str) -> client_traffic::Model {
        ClientTraffic::find()
            .filter(client_traffic::Column::Email.eq(email))
            .one(db)
            .await
            .unwrap()
            .unwrap()
    }

    const VLESS_SETTINGS: &str = r#"{"clients":[{"id":"uuid-a","email":"a@x","flow":"","expiryTime":0,"enable":true}],"decryption":"none"}"#;

    async fn quota_fixture(fail_ops: bool) -> (DatabaseConnection, Arc<RecordingConnector>, TrafficAccountant) {
        let db = memory_db().await;
        let record = insert_inbound(&db, NewInbound::vless("in-1", 1001, VLESS_SETTINGS)).await;
        insert_client(&db, record.id, "a@x", |row| {
            row.total = 1000;
            row.up = 900;
        })
        .await;

        let connector = Arc::new(RecordingConnector {
            fail_ops,
            ..Default::default()
        });
        let accountant = TrafficAccountant::new(db.clone(), connector.clone());
        (db, connector, accountant)
    }

    #[tokio::test]
    async fn test_quota_disables_client_with_hot_remove() {
        let (db, connector, accountant) = quota_fixture(false).await;

        let outcome = accountant
            .apply_at(&client_report("a@x", 60, 0), API_PORT, NOW)
            .await
            .unwrap();
        let row = client_row(&db, "a@x").await;
        assert_eq!(row.up, 960);
        assert!(row.enable);
        assert!(!outcome.need_restart);
        assert_eq!(outcome.online_clients, vec!["a@x".to_string()]);
        assert_eq!(outcome.disabled_clients, 0);

        let outcome = accountant
            .apply_at(&client_report("a@x", 100, 0), API_PORT, NOW)
            .await
            .unwrap();
        let row = client_row(&db, "a@x").await;
        assert_eq!(row.up, 1060);
        assert!(!row.enable);
        assert!(!outcome.need_restart);
        assert_eq!(outcome.disabled_clients, 1);
        assert_eq!(
            connector.calls(),
            vec!["connect 62789", "remove_user in-1 a@x", "disconnect"]
        );
    }

    #[tokio::test]
    async fn test_quota_hot_remove_failure_requires_restart() {
        let (db, _connector, accountant) = quota_fixture(true).await;

        let outcome = accountant
            .apply_at(&client_report("a@x", 160, 0), API_PORT, NOW)
            .await
            .unwrap();
        assert!(outcome.need_restart);
        // 热更新失败也要落库
        assert!(!client_row(&db, "a@x").await.enable);
    }

    #[tokio::test]
    async fn test_unreachable_channel_requires_restart() {
        let db = memory_db().await;
        let record = insert_inbound(&db, NewInbound::vless("in-1", 1001, VLESS_SETTINGS)).await;
        insert_client(&db, record.id, "a@x", |row| row.expiry_time = NOW - 1).await;
        let connector = Arc::new(RecordingConnector {
            fail_connect: true,
            ..Default::default()
        });
        let accountant = TrafficAccountant::new(db.clone(), connector.clone());

        let outcome = accountant.apply_at(&TrafficReport::default(), API_PORT, NOW).await.unwrap();
        assert!(outcome.need_restart);
        assert!(!client_row(&db, "a@x").await.enable);
    }

    #[tokio::test]
    async fn test_no_process_updates_database_only() {
        let (db, connector, accountant) = quota_fixture(true).await;

        let outcome = accountant
            .apply_at(&client_report("a@x", 100, 0), None, NOW)
            .await
            .unwrap();
        assert!(!outcome.need_restart);
        assert!(!client_row(&db, "a@x").await.enable);
        assert!(connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_disabling_is_idempotent() {
        let (_db, connector, accountant) = quota_fixture(false).await;

        let first = accountant
            .apply_at(&client_report("a@x", 100, 0), API_PORT, NOW)
            .await
            .unwrap();
        assert_eq!(first.disabled_clients, 1);
        let calls = connector.calls().len();

        let second = accountant.apply_at(&TrafficReport::default(), API_PORT, NOW).await.unwrap();
        assert_eq!(second.disabled_clients, 0);
        assert_eq!(second.disabled_inbounds, 0);
        assert!(!second.need_restart);
        assert_eq!(connector.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_relative_expiry_resolved_on_first_use() {
        let db = memory_db().await;
        let settings = r#"{"clients":[{"id":"uuid-a","email":"a@x","expiryTime":-5000}]}"#;
        let record = insert_inbound(&db, NewInbound::vless("in-1", 1001, settings)).await;
        insert_client(&db, record.id, "a@x", |row| row.expiry_time = -5000).await;
        let accountant = TrafficAccountant::new(db.clone(), Arc::new(RecordingConnector::default()));

        accountant
            .apply_at(&client_report("a@x", 10, 10), API_PORT, NOW)
            .await
            .unwrap();

        let row = client_row(&db, "a@x").await;
        assert_eq!(row.expiry_time, NOW + 5000);
        assert_eq!(row.up, 10);
        assert!(row.enable);

        let record = Inbound::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        let settings = InboundSettings::parse(&record.settings).unwrap();
        assert_eq!(settings.client("a@x").unwrap().expiry_time, Some(NOW + 5000));
    }

    #[tokio::test]
    async fn test_auto_renew_reenables_and_hot_adds() {
        let db = memory_db().await;
        let expiry = NOW - 45 * DAY_MILLIS;
        let settings = format!(
            r#"{{"clients":[{{"id":"uuid-a","email":"a@x","flow":"xtls-rprx-vision","expiryTime":{}}}]}}"#,
            expiry
        );
        let record = insert_inbound(&db, NewInbound::vless("in-1", 1001, &settings)).await;
        insert_client(&db, record.id, "a@x", |row| {
            row.enable = false;
            row.reset = 30;
            row.expiry_time = expiry;
            row.up = 500;
            row.down = 20;
        })
        .await;
        let connector = Arc::new(RecordingConnector::default());
        let accountant = TrafficAccountant::new(db.clone(), connector.clone());

        let outcome = accountant.apply_at(&TrafficReport::default(), API_PORT, NOW).await.unwrap();
        assert_eq!(outcome.renewed, 1);
        assert!(!outcome.need_restart);

        let row = client_row(&db, "a@x").await;
        assert!(row.enable);
        assert_eq!((row.up, row.down), (0, 0));
        assert!(row.expiry_time > NOW);
        assert_eq!((row.expiry_time - expiry) % (30 * DAY_MILLIS), 0);
        assert_eq!(
            connector.calls(),
            vec!["connect 62789", "add_user in-1 a@x", "disconnect"]
        );

        let record = Inbound::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        let settings = InboundSettings::parse(&record.settings).unwrap();
        assert_eq!(settings.client("a@x").unwrap().expiry_time, Some(row.expiry_time));
    }

    #[tokio::test]
    async fn test_auto_renew_hot_add_failure_requires_restart() {
        let db = memory_db().await;
        let record = insert_inbound(
            &db,
            NewInbound::vless("in-1", 1001, r#"{"clients":[{"id":"uuid-a","email":"a@x"}]}"#),
        )
        .await;
        insert_client(&db, record.id, "a@x", |row| {
            row.enable = false;
            row.reset = 1;
            row.expiry_time = NOW;
        })
        .await;
        let connector = Arc::new(RecordingConnector {
            fail_ops: true,
            ..Default::default()
        });
        let accountant = TrafficAccountant::new(db.clone(), connector);

        let outcome = accountant.apply_at(&TrafficReport::default(), API_PORT, NOW).await.unwrap();
        assert!(outcome.need_restart);
        let row = client_row(&db, "a@x").await;
        assert!(row.enable);
        assert_eq!(row.expiry_time, NOW + DAY_MILLIS);
    }

    #[tokio::test]
    async fn test_inbound_quota_disables_inbound() {
        let db = memory_db().await;
        let mut new = NewInbound::vless("in-q", 1002, r#"{"clients":[]}"#);
        new.total = 5000;
        new.up = 5000;
        let record = insert_inbound(&db, new).await;
        insert_inbound(&db, NewInbound::vless("in-free", 1003, r#"{"clients":[]}"#)).await;

        let connector = Arc::new(RecordingConnector::default());
        let accountant = TrafficAccountant::new(db.clone(), connector.clone());
        let report = TrafficReport {
            inbounds: vec![Traffic {
                is_inbound: true,
                is_outbound: false,
                tag: "in-q".into(),
                up: 0,
                down: 200,
            }],
            clients: vec![],
        };

        let outcome = accountant.apply_at(&report, API_PORT, NOW).await.unwrap();
        assert_eq!(outcome.disabled_inbounds, 1);
        assert!(!outcome.need_restart);
        assert!(connector.calls().contains(&"remove_inbound in-q".to_string()));

        let stored = Inbound::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        assert_eq!(stored.up + stored.down, 5200);
        assert!(!stored.enable);

        let mut snapshots = load_enabled_inbounds(&db).await.unwrap();
        let cfg = build("{}", &mut snapshots).unwrap();
        let tags: Vec<&str> = cfg.inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["in-free"]);
    }

    #[tokio::test]
    async fn test_outbound_traffic_ignored() {
        let db = memory_db().await;
        let record = insert_inbound(&db, NewInbound::vless("direct", 1004, r#"{"clients":[]}"#)).await;
        let accountant = TrafficAccountant::new(db.clone(), Arc::new(RecordingConnector::default()));
        let report = TrafficReport {
            inbounds: vec![
                Traffic {
                    is_inbound: false,
                    is_outbound: true,
                    tag: "direct".into(),
                    up: 7,
                    down: 7,
                },
                Traffic {
                    is_inbound: true,
                    is_outbound: false,
                    tag: "direct".into(),
                    up: 3,
                    down: 4,
                },
            ],
            clients: vec![],
        };

        accountant.apply_at(&report, None, NOW).await.unwrap();
        let stored = Inbound::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        assert_eq!((stored.up, stored.down), (3, 4));
    }

    #[tokio::test]
    async fn test_malformed_settings_rolls_back_counters() {
        let db = memory_db().await;
        let record = insert_inbound(&db, NewInbound::vless("broken", 1005, "{not json")).await;
        insert_client(&db, record.id, "a@x", |row| row.expiry_time = -1000).await;
        let accountant = TrafficAccountant::new(db.clone(), Arc::new(RecordingConnector::default()));

        let report = TrafficReport {
            inbounds: vec![Traffic {
                is_inbound: true,
                is_outbound: false,
                tag: "broken".into(),
                up: 100,
                down: 100,
            }],
            clients: vec![ClientDelta {
                email: "a@x".into(),
                up: 1,
                down: 1,
            }],
        };

        let err = accountant.apply_at(&report, None, NOW).await.unwrap_err();
        assert!(matches!(err, AccountingError::MalformedSettings { ref tag, .. } if tag == "broken"));

        let stored = Inbound::find_by_id(record.id).one(&db).await.unwrap().unwrap();
        assert_eq!((stored.up, stored.down), (0, 0));
        let row = client_row(&db, "a@x").await;
        assert_eq!((row.up, row.expiry_time), (0, -1000));
    }

    #[tokio::test]
    async fn test_online_clients_only_with_traffic() {
        let db = memory_db().await;
        let record = insert_inbound(&db, NewInbound::vless("in-1", 1001, r#"{"clients":[]}"#)).await;
        insert_client(&db, record.id, "a@x", |_| {}).await;
        insert_client(&db, record.id, "b@x", |_| {}).await;
        let accountant = TrafficAccountant::new(db.clone(), Arc::new(RecordingConnector::default()));

        let report = TrafficReport {
            inbounds: vec![],
            clients: vec![
                ClientDelta {
                    email: "a@x".into(),
                    up: 0,
                    down: 0,
                },
                ClientDelta {
                    email: "b@x".into(),
                    up: 0,
                    down: 12,
                },
                ClientDelta {
                    email: "ghost@x".into(),
                    up: 5,
                    down: 5,
                },
            ],
        };

        let outcome = accountant.apply_at(&report, None, NOW).await.unwrap();
        assert_eq!(outcome.online_clients, vec!["b@x".to_string()]);
        assert_eq!(client_row(&db, "b@x").await.down, 12);
    }
    #[tokio::test]
    async fn test_policy_failure_keeps_counted_traffic() {
        let db = memory_db().await;
        let healthy = insert_inbound(&db, NewInbound::vless("in-1", 1001, VLESS_SETTINGS)).await;
        insert_client(&db, healthy.id, "a@x", |_| {}).await;
        // 续期阶段需要解析这个入站的 settings，会失败
        let broken = insert_inbound(&db, NewInbound::vless("broken", 1002, "{not json")).await;
        insert_client(&db, broken.id, "r@x", |row| {
            row.reset = 1;
            row.expiry_time = NOW - 1;
        })
        .await;
        let accountant = TrafficAccountant::new(db.clone(), Arc::new(RecordingConnector::default()));

        let outcome = accountant
            .apply_at(&client_report("a@x", 7, 3), API_PORT, NOW)
            .await
            .unwrap();
        assert_eq!(outcome.renewed, 0);
        assert_eq!(outcome.online_clients, vec!["a@x".to_string()]);

        let row = client_row(&db, "a@x").await;
        assert_eq!((row.up, row.down), (7, 3));
        // 续期回滚后，后续阶段仍按到期禁用
        assert!(!client_row(&db, "r@x").await.enable);
    }

    #[tokio::test]
    async fn test_phase_failure_after_hot_patch_requires_restart() {
        let db = memory_db().await;
        let record = insert_inbound(&db, NewInbound::vless("in-1", 1001, VLESS_SETTINGS)).await;
        insert_client(&db, record.id, "a@x", |row| row.expiry_time = NOW - 1).await;
        // 热移除成功之后，禁用写库失败
        db.execute_unprepared(
            "CREATE TRIGGER deny_disable BEFORE UPDATE ON client_traffic \
             WHEN NEW.enable = 0 BEGIN SELECT RAISE(ABORT, 'disable denied'); END;",
        )
        .await
        .unwrap();
        let connector = Arc::new(RecordingConnector::default());
        let accountant = TrafficAccountant::new(db.clone(), connector.clone());

        let outcome = accountant.apply_at(&TrafficReport::default(), API_PORT, NOW).await.unwrap();
        assert!(outcome.need_restart);
        assert_eq!(outcome.disabled_clients, 0);
        assert!(connector.calls().contains(&"remove_user in-1 a@x".to_string()));
        assert!(client_row(&db, "a@x").await.enable);
    }

    #[tokio::test]
    async fn test_repeated_email_in_batch_is_summed() {
        let db = memory_db().await;
        let record = insert_inbound(&db, NewInbound::vless("in-1", 1001, VLESS_SETTINGS)).await;
        insert_client(&db, record.id, "a@x", |_| {}).await;
        let accountant = TrafficAccountant::new(db.clone(), Arc::new(RecordingConnector::default()));

        let report = TrafficReport {
            inbounds: vec![],
            clients: vec![
                ClientDelta {
                    email: "a@x".into(),
                    up: 5,
                    down: 1,
                },
                ClientDelta {
                    email: "a@x".into(),
                    up: 2,
                    down: 4,
                },
            ],
        };

        let outcome = accountant.apply_at(&report, None, NOW).await.unwrap();
        assert_eq!(outcome.online_clients, vec!["a@x".to_string()]);
        let row = client_row(&db, "a@x").await;
        assert_eq!((row.up, row.down), (7, 5));
    }
}
