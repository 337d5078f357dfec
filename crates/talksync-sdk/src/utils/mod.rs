//! 通用工具模块

pub mod time;

pub use time::{millis_to_datetime, now_millis};
