//! 会话列表调和
//!
//! 维护"按最近活跃降序"的会话列表：新消息落地刷新摘要并重排，
//! 资料更新向成员扇出，未读计数在非当前会话上累加。
//! 另提供排序/检索投影，供门面查询使用。

use crate::entities::{Conversation, Message, Profile};
use crate::events::event_builders;
use crate::store::actions::StateEffect;
use crate::store::state::ChatState;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 会话列表排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    /// 最近活跃优先（默认）
    #[default]
    Recency,
    /// 有未读的优先，其余按最近活跃
    UnreadFirst,
    /// 按显示名称字典序
    Name,
}

/// 按最近活跃降序排列，时间相同时 ID 大者在前
pub fn sort_by_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.sort_timestamp()
            .cmp(&a.sort_timestamp())
            .then(b.id.cmp(&a.id))
    });
}

/// 新会话入列（已存在则按新行覆盖摘要以外的字段不动）
pub fn apply_created(
    state: &mut ChatState,
    conversation: Conversation,
    effects: &mut Vec<StateEffect>,
) {
    if state.conversation(conversation.id).is_some() {
        debug!("conversation already known: {}", conversation.id);
        return;
    }
    state.conversations.push(conversation);
    sort_by_recency(&mut state.conversations);
    effects.push(StateEffect::Emit(
        event_builders::conversation_list_changed(),
    ));
}

/// 消息落地后刷新所在会话的摘要并重排
///
/// 乱序推送不回退摘要：仅当新消息的 (created_at, id) 不早于
/// 现有摘要时才覆盖。返回该会话是否在列表中。
pub fn apply_summary(
    state: &mut ChatState,
    message: &Message,
    effects: &mut Vec<StateEffect>,
) -> bool {
    let summary = message.to_summary();
    let Some(conversation) = state.conversation_mut(message.conversation_id) else {
        debug!(
            "message for unknown conversation: conversation_id={} message_id={}",
            message.conversation_id, message.id
        );
        return false;
    };

    let newer = match &conversation.last_message {
        Some(current) => {
            (summary.created_at, summary.message_id) >= (current.created_at, current.message_id)
        }
        None => true,
    };
    if newer {
        conversation.last_message = Some(summary);
    }

    sort_by_recency(&mut state.conversations);
    effects.push(StateEffect::Emit(
        event_builders::conversation_list_changed(),
    ));
    true
}

/// 消息落地的列表侧处理：刷新摘要，非当前会话未读 +1
///
/// 会话未知时整体忽略（消息可能属于尚未拉取到的新会话）。
pub fn apply_new_message(
    state: &mut ChatState,
    message: &Message,
    effects: &mut Vec<StateEffect>,
) {
    if !apply_summary(state, message, effects) {
        return;
    }
    if !state.is_active(message.conversation_id) {
        bump_unread(state, message.conversation_id, effects);
    }
}

/// 删除了会话的最后一条消息后，从当前时间线回算摘要
///
/// 仅当该会话是当前会话（时间线已物化）时可用。
pub fn recompute_summary(
    state: &mut ChatState,
    conversation_id: u64,
    effects: &mut Vec<StateEffect>,
) {
    let summary = state.timeline.last().map(|m| m.to_summary());
    if let Some(conversation) = state.conversation_mut(conversation_id) {
        conversation.last_message = summary;
        sort_by_recency(&mut state.conversations);
        effects.push(StateEffect::Emit(
            event_builders::conversation_list_changed(),
        ));
    }
}

/// 非当前会话的未读数 +1
pub fn bump_unread(state: &mut ChatState, conversation_id: u64, effects: &mut Vec<StateEffect>) {
    if let Some(conversation) = state.conversation_mut(conversation_id) {
        conversation.unread_count += 1;
        let count = conversation.unread_count;
        effects.push(StateEffect::Emit(event_builders::unread_changed(
            conversation_id,
            count,
        )));
    }
}

/// 未读清零（进入会话时）
pub fn clear_unread(state: &mut ChatState, conversation_id: u64, effects: &mut Vec<StateEffect>) {
    if let Some(conversation) = state.conversation_mut(conversation_id) {
        if conversation.unread_count > 0 {
            conversation.unread_count = 0;
            effects.push(StateEffect::Emit(event_builders::unread_changed(
                conversation_id,
                0,
            )));
        }
    }
}

/// 资料更新向所有会话的成员列表扇出；有实际变更时刷新列表
pub fn apply_profile_change(
    state: &mut ChatState,
    profile: &Profile,
    effects: &mut Vec<StateEffect>,
) {
    let mut touched = false;
    for conversation in state.conversations.iter_mut() {
        for member in conversation.members.iter_mut() {
            if member.id == profile.id {
                member.merge_from(profile);
                touched = true;
            }
        }
        if let Some(last) = conversation.last_message.as_mut() {
            if last.sender_id == profile.id && last.sender_username != profile.username {
                last.sender_username = profile.username.clone();
                touched = true;
            }
        }
    }
    if touched {
        effects.push(StateEffect::Emit(
            event_builders::conversation_list_changed(),
        ));
    }
}

/// 会话列表投影：按给定排序方式输出副本
pub fn project(state: &ChatState, mode: SortMode) -> Vec<Conversation> {
    let mut list = state.conversations.clone();
    match mode {
        SortMode::Recency => sort_by_recency(&mut list),
        SortMode::UnreadFirst => {
            list.sort_by(|a, b| {
                (b.unread_count > 0)
                    .cmp(&(a.unread_count > 0))
                    .then(b.sort_timestamp().cmp(&a.sort_timestamp()))
                    .then(b.id.cmp(&a.id))
            });
        }
        SortMode::Name => {
            let self_id = state.self_user_id();
            list.sort_by_cached_key(|c| c.display_name(self_id).to_lowercase());
        }
    }
    list
}

/// 按显示名检索会话（大小写不敏感的子串匹配）
pub fn search(state: &ChatState, query: &str) -> Vec<Conversation> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return project(state, SortMode::Recency);
    }
    let self_id = state.self_user_id();
    let mut hits: Vec<Conversation> = state
        .conversations
        .iter()
        .filter(|c| c.display_name(self_id).to_lowercase().contains(&needle))
        .cloned()
        .collect();
    sort_by_recency(&mut hits);
    hits
}
