//! 状态调和
//!
//! 推送事件与本端操作落到状态树的全部规则：
//! - `conversations`：会话列表的摘要、排序、未读与成员扇出
//! - `timeline`：当前会话消息时间线的插入、合并、删除与乐观收敛

pub mod conversations;
pub mod timeline;

pub use conversations::SortMode;
