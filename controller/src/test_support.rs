//! 测试用数据构造

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::error::ConnError;
use common::protocol::control::{LiveControl, LiveControlConnector, LiveUser};
use common::protocol::traffic::TrafficReport;
use sea_orm::{ActiveModelTrait, DatabaseConnection, NotSet, Set};

use crate::entity::{client_traffic, inbound};

pub struct NewInbound {
    pub tag: String,
    pub port: i32,
    pub protocol: String,
    pub settings: String,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    pub total: i64,
    pub expiry_time: i64,
}

impl NewInbound {
    pub fn vless(tag: &str, port: i32, settings: &str) -> Self {
        Self {
            tag: tag.to_string(),
            port,
            protocol: "vless".to_string(),
            settings: settings.to_string(),
            enable: true,
            up: 0,
            down: 0,
            total: 0,
            expiry_time: 0,
        }
    }
}

pub async fn insert_inbound(db: &DatabaseConnection, new: NewInbound) -> inbound::Model {
    inbound::ActiveModel {
        id: NotSet,
        remark: Set(String::new()),
        enable: Set(new.enable),
        up: Set(new.up),
        down: Set(new.down),
        total: Set(new.total),
        expiry_time: Set(new.expiry_time),
        listen: Set(String::new()),
        port: Set(new.port),
        protocol: Set(new.protocol),
        settings: Set(new.settings),
        stream_settings: Set(String::new()),
        tag: Set(new.tag),
        sniffing: Set(String::new()),
        allocate: Set(String::new()),
    }
    .insert(db)
    .await
    .expect("insert inbound")
}

/// 插入客户端流量行，默认启用、无配额、永不过期
pub async fn insert_client(
    db: &DatabaseConnection,
    inbound_id: i64,
    email: &str,
    tweak: impl FnOnce(&mut client_traffic::Model),
) -> client_traffic::Model {
    let mut row = client_traffic::Model {
        id: 0,
        inbound_id,
        enable: true,
        email: email.to_string(),
        up: 0,
        down: 0,
        expiry_time: 0,
        total: 0,
        reset: 0,
    };
    tweak(&mut row);

    client_traffic::ActiveModel {
        id: NotSet,
        inbound_id: Set(row.inbound_id),
        enable: Set(row.enable),
        email: Set(row.email),
        up: Set(row.up),
        down: Set(row.down),
        expiry_time: Set(row.expiry_time),
        total: Set(row.total),
        reset: Set(row.reset),
    }
    .insert(db)
    .await
    .expect("insert client traffic")
}

/// 记录所有管理通道调用的连接器
#[derive(Default)]
pub struct RecordingConnector {
    pub calls: Arc<Mutex<Vec<String>>>,
    /// 连接成功但每次调用都失败
    pub fail_ops: bool,
    pub fail_connect: bool,
    /// query_traffic 返回的统计
    pub report: TrafficReport,
}

impl RecordingConnector {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

struct RecordingControl {
    calls: Arc<Mutex<Vec<String>>>,
    fail: bool,
    report: TrafficReport,
}

impl RecordingControl {
    fn push(&self, call: String) -> Result<(), ConnError> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            Err(ConnError::RpcFailed("mock failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LiveControl for RecordingControl {
    async fn add_user(&self, inbound_tag: &str, user: &LiveUser) -> Result<(), ConnError> {
        self.push(format!("add_user {} {}", inbound_tag, user.email))
    }

    async fn remove_user(&self, inbound_tag: &str, email: &str) -> Result<(), ConnError> {
        self.push(format!("remove_user {} {}", inbound_tag, email))
    }

    async fn remove_inbound(&self, tag: &str) -> Result<(), ConnError> {
        self.push(format!("remove_inbound {}", tag))
    }

    async fn query_traffic(&self, reset: bool) -> Result<TrafficReport, ConnError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("query_traffic reset={}", reset));
        Ok(self.report.clone())
    }

    fn disconnect(self: Box<Self>) {
        self.calls.lock().unwrap().push("disconnect".into());
    }
}

#[async_trait]
impl LiveControlConnector for RecordingConnector {
    async fn connect(&self, api_port: u16) -> Result<Box<dyn LiveControl>, ConnError> {
        self.calls.lock().unwrap().push(format!("connect {}", api_port));
        if self.fail_connect {
            return Err(ConnError::Unreachable("refused".into()));
        }
        Ok(Box::new(RecordingControl {
            calls: self.calls.clone(),
            fail: self.fail_ops,
            report: self.report.clone(),
        }))
    }
}
