//! 消息指纹去重存储
//!
//! 基于 (conversation_id, message_id) 记录已应用到时间线的消息，
//! 推送重复、拉取与推送重叠、乐观回执与推送回显都靠它幂等化。
//!
//! 存储随会话生命周期存在，不做基于时间的淘汰；
//! 会话的时间线被丢弃时调用 `forget_conversation` 释放对应指纹。

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// 指纹存储统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintStats {
    /// 有指纹记录的会话数
    pub conversations: usize,
    /// 指纹总数
    pub fingerprints: usize,
}

/// 消息指纹存储
///
/// 注意：本结构不做内部加锁，作为状态容器的一部分由外层写锁保护，
/// 这样归约函数保持纯函数语义，可重放。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintStore {
    /// conversation_id -> 已应用的消息 ID 集合
    applied: HashMap<u64, HashSet<u64>>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 检查消息是否已应用过
    pub fn contains(&self, conversation_id: u64, message_id: u64) -> bool {
        self.applied
            .get(&conversation_id)
            .map(|ids| ids.contains(&message_id))
            .unwrap_or(false)
    }

    /// 记录指纹
    ///
    /// 返回 false 表示指纹已存在（重复消息）。
    pub fn record(&mut self, conversation_id: u64, message_id: u64) -> bool {
        let inserted = self
            .applied
            .entry(conversation_id)
            .or_default()
            .insert(message_id);
        if !inserted {
            debug!(
                "🔄 检测到重复消息: conversation_id={} message_id={}",
                conversation_id, message_id
            );
        }
        inserted
    }

    /// 移除单条指纹（乐观条目收敛时把临时 ID 的指纹换成服务端 ID）
    pub fn remove(&mut self, conversation_id: u64, message_id: u64) -> bool {
        match self.applied.get_mut(&conversation_id) {
            Some(ids) => ids.remove(&message_id),
            None => false,
        }
    }

    /// 丢弃某个会话的全部指纹（时间线被丢弃/重载时调用）
    pub fn forget_conversation(&mut self, conversation_id: u64) {
        if let Some(ids) = self.applied.remove(&conversation_id) {
            debug!(
                "🧹 释放会话指纹: conversation_id={} count={}",
                conversation_id,
                ids.len()
            );
        }
    }

    /// 清空所有记录
    pub fn clear(&mut self) {
        self.applied.clear();
    }

    /// 获取统计信息
    pub fn stats(&self) -> FingerprintStats {
        FingerprintStats {
            conversations: self.applied.len(),
            fingerprints: self.applied.values().map(|ids| ids.len()).sum(),
        }
    }
}
