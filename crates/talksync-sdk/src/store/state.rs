//! 会话状态容器
//!
//! 单一状态树：会话列表、当前会话的消息时间线、指纹、草稿与视口标记。
//! 所有字段都是普通数据，不含锁与句柄，整棵树可克隆、可序列化，
//! 归约器对它做纯变换（见 `store::reducer`）。

use crate::dedup::FingerprintStore;
use crate::entities::{Conversation, Message, Profile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 同步器的完整会话状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatState {
    /// 当前登录用户的资料
    pub self_user: Option<Profile>,
    /// 会话列表，按最近活跃降序维护
    pub conversations: Vec<Conversation>,
    /// 当前选中的会话
    pub active_conversation: Option<u64>,
    /// 当前会话的消息时间线，按 (created_at, id) 升序
    pub timeline: Vec<Message>,
    /// 已物化消息指纹，防止重复落地
    pub fingerprints: FingerprintStore,
    /// 未发送草稿，conversation_id -> 文本
    pub drafts: HashMap<u64, String>,
    /// 视口是否停留在时间线底部（决定新消息是否自动跟随）
    pub view_at_bottom: bool,
}

impl ChatState {
    pub fn new() -> Self {
        Self {
            view_at_bottom: true,
            ..Default::default()
        }
    }

    /// 当前用户 ID（未登录时为 0，不会匹配任何真实用户）
    pub fn self_user_id(&self) -> u64 {
        self.self_user.as_ref().map(|p| p.id).unwrap_or(0)
    }

    /// 指定会话是否为当前选中会话
    pub fn is_active(&self, conversation_id: u64) -> bool {
        self.active_conversation == Some(conversation_id)
    }

    pub fn conversation(&self, conversation_id: u64) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn conversation_mut(&mut self, conversation_id: u64) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
    }

    /// 时间线中查找消息（当前会话）
    pub fn timeline_message(&self, message_id: u64) -> Option<&Message> {
        self.timeline.iter().find(|m| m.id == message_id)
    }

    /// 全部未读总数
    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    /// 状态概览（日志与调试用）
    pub fn stats(&self) -> StateStats {
        StateStats {
            conversations: self.conversations.len(),
            timeline_messages: self.timeline.len(),
            pending_drafts: self.drafts.len(),
            total_unread: self.total_unread(),
            fingerprints: self.fingerprints.stats().fingerprints,
        }
    }
}

/// 状态概览
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStats {
    pub conversations: usize,
    pub timeline_messages: usize,
    pub pending_drafts: usize,
    pub total_unread: u32,
    pub fingerprints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::MessageContent;

    fn conversation(id: u64) -> Conversation {
        Conversation {
            id,
            name: Some(format!("conv-{}", id)),
            is_group: true,
            created_at: 1000,
            created_by: 1,
            members: vec![],
            last_message: None,
            unread_count: 0,
        }
    }

    #[test]
    fn test_new_starts_at_bottom() {
        let state = ChatState::new();
        assert!(state.view_at_bottom);
        assert!(state.active_conversation.is_none());
        assert_eq!(state.self_user_id(), 0);
    }

    #[test]
    fn test_lookup_and_unread_sum() {
        let mut state = ChatState::new();
        state.conversations.push(conversation(1));
        state.conversations.push(conversation(2));
        state.conversation_mut(1).unwrap().unread_count = 3;
        state.conversation_mut(2).unwrap().unread_count = 2;

        assert_eq!(state.total_unread(), 5);
        assert!(state.conversation(3).is_none());
    }

    #[test]
    fn test_stats_snapshot() {
        let mut state = ChatState::new();
        state.conversations.push(conversation(1));
        state.timeline.push(Message {
            id: 10,
            conversation_id: 1,
            sender_id: 2,
            sender: None,
            content: MessageContent::text("hi"),
            created_at: 5,
            edited: false,
            reactions: vec![],
            delivery: Default::default(),
            client_tag: 0,
        });
        state.fingerprints.record(1, 10);
        state.drafts.insert(1, "wip".to_string());

        let stats = state.stats();
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.timeline_messages, 1);
        assert_eq!(stats.pending_drafts, 1);
        assert_eq!(stats.fingerprints, 1);
    }
}
