//! 流量配额与有效期判定

use crate::entity::{client_traffic, inbound};

/// 一天的毫秒数
pub const DAY_MILLIS: i64 = 86_400_000;

/// 配额耗尽或已过期
///
/// `total` 为 0 表示不限流量，`expiry` 不大于 0 表示永不过期（或尚未换算）。
pub fn is_depleted(up: i64, down: i64, total: i64, expiry: i64, now_ms: i64) -> bool {
    (total > 0 && up + down >= total) || (expiry > 0 && expiry <= now_ms)
}

pub fn is_client_depleted(row: &client_traffic::Model, now_ms: i64) -> bool {
    is_depleted(row.up, row.down, row.total, row.expiry_time, now_ms)
}

pub fn is_inbound_depleted(row: &inbound::Model, now_ms: i64) -> bool {
    is_depleted(row.up, row.down, row.total, row.expiry_time, now_ms)
}

/// 到期且设置了续期周期
pub fn is_renewable(row: &client_traffic::Model, now_ms: i64) -> bool {
    row.reset > 0 && row.expiry_time > 0 && row.expiry_time <= now_ms
}

/// 按整数个续期周期推进到期时间，结果严格大于 now
///
/// 返回值与原到期时间对周期同余，长时间未运行也只需一次计算。
pub fn renewed_expiry(expiry: i64, reset_days: i32, now_ms: i64) -> i64 {
    let period = i64::from(reset_days) * DAY_MILLIS;
    if period <= 0 || expiry > now_ms {
        return expiry;
    }
    let periods = (now_ms - expiry) / period + 1;
    expiry + periods * period
}

/// 首次使用时换算相对有效期：负数到期时间表示从现在起的时长
pub fn resolve_relative_expiry(placeholder: i64, now_ms: i64) -> i64 {
    now_ms - placeholder
}
