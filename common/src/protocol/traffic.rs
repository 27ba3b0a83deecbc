//! 流量统计相关类型
//!
//! xray 的统计计数器名称格式为 `kind>>>name>>>traffic>>>uplink|downlink`，
//! 其中 kind 为 inbound / outbound / user。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 入站或出站的流量增量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub is_inbound: bool,
    pub is_outbound: bool,
    pub tag: String,
    pub up: i64,
    pub down: i64,
}

/// 单个客户端（按 email）的流量增量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTraffic {
    pub email: String,
    pub up: i64,
    pub down: i64,
}

/// 一次统计查询得到的全部增量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficReport {
    pub inbounds: Vec<Traffic>,
    pub clients: Vec<ClientTraffic>,
}

impl TrafficReport {
    pub fn is_empty(&self) -> bool {
        self.inbounds.is_empty() && self.clients.is_empty()
    }

    /// 把另一批增量累加进来，按 (方向, tag) 和 email 合并
    pub fn merge(&mut self, other: TrafficReport) {
        for traffic in other.inbounds {
            match self
                .inbounds
                .iter_mut()
                .find(|t| t.is_inbound == traffic.is_inbound && t.tag == traffic.tag)
            {
                Some(existing) => {
                    existing.up += traffic.up;
                    existing.down += traffic.down;
                }
                None => self.inbounds.push(traffic),
            }
        }
        for client in other.clients {
            match self.clients.iter_mut().find(|c| c.email == client.email) {
                Some(existing) => {
                    existing.up += client.up;
                    existing.down += client.down;
                }
                None => self.clients.push(client),
            }
        }
    }

    /// 从 (计数器名, 数值) 列表聚合出流量报告
    ///
    /// 无法识别的计数器名会被忽略。输出按首次出现的顺序排列。
    pub fn from_stats<I, S>(stats: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: AsRef<str>,
    {
        let mut report = TrafficReport::default();
        let mut tag_index: HashMap<(bool, String), usize> = HashMap::new();
        let mut email_index: HashMap<String, usize> = HashMap::new();

        for (name, value) in stats {
            let parts: Vec<&str> = name.as_ref().split(">>>").collect();
            if parts.len() != 4 || parts[2] != "traffic" {
                continue;
            }
            let is_up = match parts[3] {
                "uplink" => true,
                "downlink" => false,
                _ => continue,
            };
            let (kind, key) = (parts[0], parts[1]);

            match kind {
                "inbound" | "outbound" => {
                    let is_inbound = kind == "inbound";
                    let idx = *tag_index
                        .entry((is_inbound, key.to_string()))
                        .or_insert_with(|| {
                            report.inbounds.push(Traffic {
                                is_inbound,
                                is_outbound: !is_inbound,
                                tag: key.to_string(),
                                up: 0,
                                down: 0,
                            });
                            report.inbounds.len() - 1
                        });
                    let entry = &mut report.inbounds[idx];
                    if is_up {
                        entry.up += value;
                    } else {
                        entry.down += value;
                    }
                }
                "user" => {
                    let idx = *email_index.entry(key.to_string()).or_insert_with(|| {
                        report.clients.push(ClientTraffic {
                            email: key.to_string(),
                            up: 0,
                            down: 0,
                        });
                        report.clients.len() - 1
                    });
                    let entry = &mut report.clients[idx];
                    if is_up {
                        entry.up += value;
                    } else {
                        entry.down += value;
                    }
                }
                _ => {}
            }
        }

        report
    }
}
