//! 时间处理工具
//!
//! # 设计原则
//!
//! - **数据层**: 所有时间字段使用 UTC 毫秒时间戳（i64），与服务端一致
//! - **业务层**: 统一使用 `now_millis()` 生成时间
//! - **计时器**: 过期/退避等单调计时用 `tokio::time::Instant`，与墙钟无关

use chrono::{DateTime, TimeZone, Utc};

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳转 `DateTime<Utc>`（越界时回退到 UNIX 纪元）
pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap_or_default())
}
