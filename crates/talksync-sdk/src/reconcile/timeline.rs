//! 消息时间线调和
//!
//! 当前会话的消息时间线按 (created_at, id) 全序维护。落地规则：
//! - 拉取结果带陈旧保护：与当前会话不符的结果在应用点整体丢弃
//! - 推送插入先过指纹，重复即丢；乱序插入走二分定位
//! - 本端发送走乐观条目（Pending），服务端确认后以正式行替换；
//!   回显与确认谁先到都收敛到同一条（client_tag 对账，近似匹配兜底）

use crate::entities::{DeliveryState, Message, MessageContent, Profile, Reaction};
use crate::events::{event_builders, SdkEvent};
use crate::reconcile::conversations;
use crate::store::actions::StateEffect;
use crate::store::state::ChatState;
use crate::utils::time::now_millis;
use tracing::{debug, warn};

/// 近似对账窗口：确认行与乐观行的 created_at 允许的最大偏差（毫秒）
pub const APPROX_MATCH_WINDOW_MILLIS: i64 = 5_000;

/// 二分定位插入，保持 (created_at, id) 升序
fn insert_sorted(timeline: &mut Vec<Message>, message: Message) -> usize {
    let key = message.ordering_key();
    let idx = timeline.partition_point(|m| m.ordering_key() <= key);
    timeline.insert(idx, message);
    idx
}

/// 时间线拉取完成
///
/// 与当前会话不符时整体丢弃（切换竞态下的陈旧结果）。
/// 已有的乐观条目（Pending/Failed）跨重载保留，除非拉取结果里
/// 已出现携带相同 client_tag 的正式行。
pub fn load(
    state: &mut ChatState,
    conversation_id: u64,
    mut messages: Vec<Message>,
    effects: &mut Vec<StateEffect>,
) {
    if !state.is_active(conversation_id) {
        debug!(
            "discarding stale timeline load: conversation_id={} active={:?}",
            conversation_id, state.active_conversation
        );
        return;
    }

    messages.sort_by_key(|m| m.ordering_key());

    // 跨重载保留未决的本端条目
    let carried: Vec<Message> = state
        .timeline
        .iter()
        .filter(|m| {
            m.conversation_id == conversation_id
                && m.delivery != DeliveryState::Delivered
                && m.client_tag != 0
                && !messages.iter().any(|f| f.client_tag == m.client_tag)
        })
        .cloned()
        .collect();

    state.fingerprints.forget_conversation(conversation_id);
    for message in &messages {
        state.fingerprints.record(conversation_id, message.id);
    }

    state.timeline = messages;
    for message in carried {
        state.fingerprints.record(conversation_id, message.id);
        insert_sorted(&mut state.timeline, message);
    }

    effects.push(StateEffect::Emit(SdkEvent::TimelineReset {
        conversation_id,
        message_count: state.timeline.len(),
        timestamp: now_millis(),
    }));
    effects.push(StateEffect::Emit(SdkEvent::ScrollToBottom {
        conversation_id,
        timestamp: now_millis(),
    }));
}

/// 推送插入落地
///
/// 指纹命中即为重复（自身回显、重复推送），直接丢弃。
/// 携带已知 client_tag 的插入视作本端发送的确认，走替换而非追加。
pub fn apply_insert(state: &mut ChatState, message: Message, effects: &mut Vec<StateEffect>) {
    if message.client_tag != 0
        && state.is_active(message.conversation_id)
        && state
            .timeline
            .iter()
            .any(|m| m.client_tag == message.client_tag && m.delivery != DeliveryState::Delivered)
    {
        confirm_optimistic(state, message, effects);
        return;
    }

    if !state
        .fingerprints
        .record(message.conversation_id, message.id)
    {
        debug!(
            "duplicate insert dropped: conversation_id={} message_id={}",
            message.conversation_id, message.id
        );
        return;
    }

    let conversation_id = message.conversation_id;
    conversations::apply_new_message(state, &message, effects);
    if state.is_active(conversation_id) {
        effects.push(StateEffect::Emit(SdkEvent::MessageReceived {
            message: message.clone(),
        }));
        insert_sorted(&mut state.timeline, message);
        if state.view_at_bottom {
            effects.push(StateEffect::Emit(SdkEvent::ScrollToBottom {
                conversation_id,
                timestamp: now_millis(),
            }));
        }
    }
}

/// 推送更新落地：并入当前会话中已有的消息
///
/// 非当前会话的更新没有可并入的物化行，丢弃（下次拉取自然带回）。
pub fn apply_update(state: &mut ChatState, row: &Message, effects: &mut Vec<StateEffect>) {
    if !state.is_active(row.conversation_id) {
        debug!(
            "update for inactive conversation ignored: conversation_id={} message_id={}",
            row.conversation_id, row.id
        );
        return;
    }
    let Some(existing) = state.timeline.iter_mut().find(|m| m.id == row.id) else {
        debug!(
            "update for unmaterialized message ignored: message_id={}",
            row.id
        );
        return;
    };

    existing.content = row.content.clone();
    existing.edited = row.edited;
    effects.push(StateEffect::Emit(SdkEvent::MessageUpdated {
        conversation_id: row.conversation_id,
        message_id: row.id,
        timestamp: now_millis(),
    }));
}

/// 推送删除落地
///
/// 物化行移除后指纹保留：同一消息的迟到重复推送不得复活。
/// 被删的是会话最后一条时，从剩余时间线回算摘要。
pub fn apply_delete(
    state: &mut ChatState,
    conversation_id: u64,
    message_id: u64,
    effects: &mut Vec<StateEffect>,
) {
    if !state.is_active(conversation_id) {
        return;
    }
    let before = state.timeline.len();
    state.timeline.retain(|m| m.id != message_id);
    if state.timeline.len() == before {
        return;
    }

    effects.push(StateEffect::Emit(SdkEvent::MessageDeleted {
        conversation_id,
        message_id,
        timestamp: now_millis(),
    }));

    let was_summary = state
        .conversation(conversation_id)
        .and_then(|c| c.last_message.as_ref())
        .map(|last| last.message_id == message_id)
        .unwrap_or(false);
    if was_summary {
        conversations::recompute_summary(state, conversation_id, effects);
    }
}

/// 本端发送：乐观条目入列
///
/// 条目以 client_tag 作临时 ID，视图上表现为"已显示、未确认"。
pub fn apply_optimistic(state: &mut ChatState, message: Message, effects: &mut Vec<StateEffect>) {
    if !state.is_active(message.conversation_id) {
        warn!(
            "optimistic message for inactive conversation: {}",
            message.conversation_id
        );
        return;
    }
    let conversation_id = message.conversation_id;
    state.fingerprints.record(conversation_id, message.id);
    effects.push(StateEffect::Emit(SdkEvent::MessageReceived {
        message: message.clone(),
    }));
    insert_sorted(&mut state.timeline, message);
    effects.push(StateEffect::Emit(SdkEvent::ScrollToBottom {
        conversation_id,
        timestamp: now_millis(),
    }));
}

/// 服务端确认：以正式行替换乐观行
///
/// 对账顺序：
/// 1. 指纹已含正式行（回显先到且已物化）→ 只移除残留的乐观行
/// 2. client_tag 精确匹配
/// 3. 近似匹配兜底：同会话、同发送者、同内容、时间差在窗口内，
///    取最早的未决条目
/// 4. 都未命中（确认前已切走会话）→ 只记指纹、刷新摘要
pub fn confirm_optimistic(
    state: &mut ChatState,
    confirmed: Message,
    effects: &mut Vec<StateEffect>,
) {
    let conversation_id = confirmed.conversation_id;
    let first_sight = state.fingerprints.record(conversation_id, confirmed.id);

    if !state.is_active(conversation_id) {
        if first_sight {
            conversations::apply_summary(state, &confirmed, effects);
        }
        return;
    }

    if !first_sight && state.timeline_message(confirmed.id).is_some() {
        // 回显已落地，乐观行成了冗余
        let before = state.timeline.len();
        state
            .timeline
            .retain(|m| !(m.client_tag == confirmed.client_tag && m.id != confirmed.id));
        if state.timeline.len() != before {
            state
                .fingerprints
                .remove(conversation_id, confirmed.client_tag);
            effects.push(StateEffect::Emit(SdkEvent::MessageDeleted {
                conversation_id,
                message_id: confirmed.client_tag,
                timestamp: now_millis(),
            }));
        }
        return;
    }

    let position = find_pending(state, &confirmed);
    match position {
        Some(idx) => {
            let provisional = state.timeline.remove(idx);
            state.fingerprints.remove(conversation_id, provisional.id);
            debug!(
                "optimistic message confirmed: provisional={} server={}",
                provisional.id, confirmed.id
            );
            insert_sorted(&mut state.timeline, confirmed.clone());
            effects.push(StateEffect::Emit(SdkEvent::MessageUpdated {
                conversation_id,
                message_id: confirmed.id,
                timestamp: now_millis(),
            }));
        }
        None => {
            if first_sight {
                effects.push(StateEffect::Emit(SdkEvent::MessageReceived {
                    message: confirmed.clone(),
                }));
                insert_sorted(&mut state.timeline, confirmed.clone());
            }
        }
    }
    conversations::apply_summary(state, &confirmed, effects);
}

fn find_pending(state: &ChatState, confirmed: &Message) -> Option<usize> {
    if confirmed.client_tag != 0 {
        if let Some(idx) = state.timeline.iter().position(|m| {
            m.client_tag == confirmed.client_tag && m.delivery != DeliveryState::Delivered
        }) {
            return Some(idx);
        }
    }
    // 近似兜底：平台不回显 client_tag 时仍能对上
    state
        .timeline
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            m.delivery == DeliveryState::Pending
                && m.sender_id == confirmed.sender_id
                && m.content == confirmed.content
                && (m.created_at - confirmed.created_at).abs() <= APPROX_MATCH_WINDOW_MILLIS
        })
        .min_by_key(|(_, m)| m.ordering_key())
        .map(|(idx, _)| idx)
}

/// 发送失败：乐观行转 Failed，并张贴瞬时通知
pub fn fail_optimistic(
    state: &mut ChatState,
    conversation_id: u64,
    provisional_id: u64,
    error: String,
    effects: &mut Vec<StateEffect>,
) {
    if let Some(message) = state
        .timeline
        .iter_mut()
        .find(|m| m.client_tag == provisional_id && m.conversation_id == conversation_id)
    {
        message.delivery = DeliveryState::Failed;
        effects.push(StateEffect::Emit(SdkEvent::MessageUpdated {
            conversation_id,
            message_id: message.id,
            timestamp: now_millis(),
        }));
    }
    effects.push(StateEffect::Emit(event_builders::message_send_failed(
        conversation_id,
        provisional_id,
        error.clone(),
    )));
    effects.push(StateEffect::PostNotice {
        text: format!("Failed to send message: {}", error),
    });
}

/// 重试发送：Failed 行回到 Pending
pub fn retry_pending(
    state: &mut ChatState,
    conversation_id: u64,
    provisional_id: u64,
    effects: &mut Vec<StateEffect>,
) {
    if let Some(message) = state.timeline.iter_mut().find(|m| {
        m.client_tag == provisional_id
            && m.conversation_id == conversation_id
            && m.delivery == DeliveryState::Failed
    }) {
        message.delivery = DeliveryState::Pending;
        effects.push(StateEffect::Emit(SdkEvent::MessageUpdated {
            conversation_id,
            message_id: message.id,
            timestamp: now_millis(),
        }));
    }
}

/// 放弃失败的乐观行
pub fn discard_optimistic(
    state: &mut ChatState,
    conversation_id: u64,
    provisional_id: u64,
    effects: &mut Vec<StateEffect>,
) {
    let before = state.timeline.len();
    state
        .timeline
        .retain(|m| !(m.client_tag == provisional_id && m.conversation_id == conversation_id));
    if state.timeline.len() != before {
        state.fingerprints.remove(conversation_id, provisional_id);
        effects.push(StateEffect::Emit(SdkEvent::MessageDeleted {
            conversation_id,
            message_id: provisional_id,
            timestamp: now_millis(),
        }));
    }
}

/// 编辑确认回填
pub fn apply_content_edit(
    state: &mut ChatState,
    conversation_id: u64,
    message_id: u64,
    content: MessageContent,
    effects: &mut Vec<StateEffect>,
) {
    if !state.is_active(conversation_id) {
        return;
    }
    if let Some(message) = state.timeline.iter_mut().find(|m| m.id == message_id) {
        message.content = content;
        message.edited = true;
        effects.push(StateEffect::Emit(SdkEvent::MessageUpdated {
            conversation_id,
            message_id,
            timestamp: now_millis(),
        }));
    }
}

/// 表态集合回填
pub fn merge_reactions(
    state: &mut ChatState,
    conversation_id: u64,
    message_id: u64,
    reactions: Vec<Reaction>,
    effects: &mut Vec<StateEffect>,
) {
    if !state.is_active(conversation_id) {
        return;
    }
    if let Some(message) = state.timeline.iter_mut().find(|m| m.id == message_id) {
        if message.reactions != reactions {
            message.reactions = reactions;
            effects.push(StateEffect::Emit(SdkEvent::MessageUpdated {
                conversation_id,
                message_id,
                timestamp: now_millis(),
            }));
        }
    }
}

/// 资料更新向时间线上的发送者扇出
pub fn apply_profile_change(state: &mut ChatState, profile: &Profile) {
    for message in state.timeline.iter_mut() {
        if message.sender_id == profile.id {
            match message.sender.as_mut() {
                Some(sender) => sender.merge_from(profile),
                None => message.sender = Some(profile.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Conversation;

    fn seed_state(active: u64) -> ChatState {
        let mut state = ChatState::new();
        state.conversations.push(Conversation {
            id: active,
            name: Some("room".to_string()),
            is_group: true,
            created_at: 0,
            created_by: 1,
            members: vec![],
            last_message: None,
            unread_count: 0,
        });
        state.conversations.push(Conversation {
            id: active + 1,
            name: Some("other".to_string()),
            is_group: true,
            created_at: 0,
            created_by: 1,
            members: vec![],
            last_message: None,
            unread_count: 0,
        });
        state.active_conversation = Some(active);
        state
    }

    fn remote(id: u64, conversation_id: u64, created_at: i64, body: &str) -> Message {
        Message {
            id,
            conversation_id,
            sender_id: 2,
            sender: None,
            content: MessageContent::text(body),
            created_at,
            edited: false,
            reactions: vec![],
            delivery: DeliveryState::Delivered,
            client_tag: 0,
        }
    }

    fn pending(client_tag: u64, conversation_id: u64, created_at: i64, body: &str) -> Message {
        Message {
            id: client_tag,
            conversation_id,
            sender_id: 1,
            sender: None,
            content: MessageContent::text(body),
            created_at,
            edited: false,
            reactions: vec![],
            delivery: DeliveryState::Pending,
            client_tag,
        }
    }

    fn timeline_ids(state: &ChatState) -> Vec<u64> {
        state.timeline.iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_duplicate_insert_is_dropped() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();

        apply_insert(&mut state, remote(10, 1, 100, "a"), &mut effects);
        let applied = effects.len();
        apply_insert(&mut state, remote(10, 1, 100, "a"), &mut effects);

        assert_eq!(state.timeline.len(), 1);
        assert_eq!(effects.len(), applied);
    }

    #[test]
    fn test_out_of_order_insert_lands_sorted() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();

        apply_insert(&mut state, remote(10, 1, 300, "c"), &mut effects);
        apply_insert(&mut state, remote(8, 1, 100, "a"), &mut effects);
        apply_insert(&mut state, remote(9, 1, 200, "b"), &mut effects);

        assert_eq!(timeline_ids(&state), vec![8, 9, 10]);
    }

    #[test]
    fn test_same_timestamp_breaks_tie_by_id() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();

        apply_insert(&mut state, remote(12, 1, 100, "b"), &mut effects);
        apply_insert(&mut state, remote(11, 1, 100, "a"), &mut effects);

        assert_eq!(timeline_ids(&state), vec![11, 12]);
    }

    #[test]
    fn test_insert_in_inactive_conversation_bumps_unread() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();

        apply_insert(&mut state, remote(10, 2, 100, "ping"), &mut effects);

        assert!(state.timeline.is_empty());
        assert_eq!(state.conversation(2).unwrap().unread_count, 1);
        assert_eq!(
            state.conversation(2).unwrap().last_message.as_ref().unwrap().preview,
            "ping"
        );
        // 重复推送不再累加
        apply_insert(&mut state, remote(10, 2, 100, "ping"), &mut effects);
        assert_eq!(state.conversation(2).unwrap().unread_count, 1);
    }

    #[test]
    fn test_insert_at_bottom_requests_scroll() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        state.view_at_bottom = true;
        apply_insert(&mut state, remote(10, 1, 100, "a"), &mut effects);
        assert!(effects.iter().any(|e| matches!(
            e,
            StateEffect::Emit(SdkEvent::ScrollToBottom { .. })
        )));

        effects.clear();
        state.view_at_bottom = false;
        apply_insert(&mut state, remote(11, 1, 200, "b"), &mut effects);
        assert!(!effects.iter().any(|e| matches!(
            e,
            StateEffect::Emit(SdkEvent::ScrollToBottom { .. })
        )));
    }

    #[test]
    fn test_stale_timeline_load_is_discarded() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();

        load(&mut state, 2, vec![remote(10, 2, 100, "x")], &mut effects);

        assert!(state.timeline.is_empty());
        assert!(effects.is_empty());
    }

    #[test]
    fn test_load_rebuilds_fingerprints() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();

        load(
            &mut state,
            1,
            vec![remote(10, 1, 100, "a"), remote(11, 1, 200, "b")],
            &mut effects,
        );

        // 与拉取重叠的推送被指纹挡住
        apply_insert(&mut state, remote(10, 1, 100, "a"), &mut effects);
        assert_eq!(state.timeline.len(), 2);
    }

    #[test]
    fn test_load_carries_pending_rows() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        apply_optimistic(&mut state, pending(900, 1, 500, "draft send"), &mut effects);

        load(&mut state, 1, vec![remote(10, 1, 100, "a")], &mut effects);

        assert_eq!(state.timeline.len(), 2);
        assert!(state
            .timeline
            .iter()
            .any(|m| m.client_tag == 900 && m.delivery == DeliveryState::Pending));
    }

    #[test]
    fn test_load_drops_pending_already_confirmed_by_fetch() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        apply_optimistic(&mut state, pending(900, 1, 500, "hello"), &mut effects);

        let mut fetched = remote(42, 1, 510, "hello");
        fetched.client_tag = 900;
        load(&mut state, 1, vec![fetched], &mut effects);

        assert_eq!(timeline_ids(&state), vec![42]);
    }

    #[test]
    fn test_confirm_replaces_by_client_tag() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        apply_optimistic(&mut state, pending(900, 1, 500, "hi"), &mut effects);

        let mut confirmed = remote(42, 1, 520, "hi");
        confirmed.sender_id = 1;
        confirmed.client_tag = 900;
        confirm_optimistic(&mut state, confirmed, &mut effects);

        assert_eq!(timeline_ids(&state), vec![42]);
        assert_eq!(state.timeline[0].delivery, DeliveryState::Delivered);
        // 回显再到：指纹挡住
        let mut echo = remote(42, 1, 520, "hi");
        echo.client_tag = 900;
        let len = state.timeline.len();
        apply_insert(&mut state, echo, &mut effects);
        assert_eq!(state.timeline.len(), len);
    }

    #[test]
    fn test_confirm_falls_back_to_approximate_match() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        apply_optimistic(&mut state, pending(900, 1, 500, "hi"), &mut effects);
        apply_optimistic(&mut state, pending(901, 1, 600, "hi"), &mut effects);

        // 平台没回显 client_tag，内容与时间都匹配 → 取最早的未决行
        let mut confirmed = remote(42, 1, 520, "hi");
        confirmed.sender_id = 1;
        confirmed.client_tag = 0;
        confirm_optimistic(&mut state, confirmed, &mut effects);

        assert_eq!(timeline_ids(&state), vec![42, 901]);
    }

    #[test]
    fn test_echo_arriving_before_confirm_converges() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        apply_optimistic(&mut state, pending(900, 1, 500, "hi"), &mut effects);

        // 推送回显先到：携带已知 client_tag 的插入按确认处理
        let mut echo = remote(42, 1, 520, "hi");
        echo.sender_id = 1;
        echo.client_tag = 900;
        apply_insert(&mut state, echo, &mut effects);
        assert_eq!(timeline_ids(&state), vec![42]);

        // insert() 返回值随后到达 → 幂等
        let mut confirmed = remote(42, 1, 520, "hi");
        confirmed.sender_id = 1;
        confirmed.client_tag = 900;
        confirm_optimistic(&mut state, confirmed, &mut effects);
        assert_eq!(timeline_ids(&state), vec![42]);
    }

    #[test]
    fn test_fail_then_retry_then_discard() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        apply_optimistic(&mut state, pending(900, 1, 500, "hi"), &mut effects);

        fail_optimistic(&mut state, 1, 900, "connection reset".to_string(), &mut effects);
        assert_eq!(state.timeline[0].delivery, DeliveryState::Failed);
        assert!(effects
            .iter()
            .any(|e| matches!(e, StateEffect::PostNotice { .. })));

        retry_pending(&mut state, 1, 900, &mut effects);
        assert_eq!(state.timeline[0].delivery, DeliveryState::Pending);

        discard_optimistic(&mut state, 1, 900, &mut effects);
        assert!(state.timeline.is_empty());
    }

    #[test]
    fn test_delete_of_last_message_recomputes_summary() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        apply_insert(&mut state, remote(10, 1, 100, "first"), &mut effects);
        apply_insert(&mut state, remote(11, 1, 200, "second"), &mut effects);
        assert_eq!(
            state.conversation(1).unwrap().last_message.as_ref().unwrap().preview,
            "second"
        );

        apply_delete(&mut state, 1, 11, &mut effects);

        assert_eq!(timeline_ids(&state), vec![10]);
        assert_eq!(
            state.conversation(1).unwrap().last_message.as_ref().unwrap().preview,
            "first"
        );
    }

    #[test]
    fn test_deleted_message_does_not_reappear() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        apply_insert(&mut state, remote(10, 1, 100, "a"), &mut effects);
        apply_delete(&mut state, 1, 10, &mut effects);

        // 指纹保留，迟到的重复推送不复活已删消息
        apply_insert(&mut state, remote(10, 1, 100, "a"), &mut effects);
        assert!(state.timeline.is_empty());
    }

    #[test]
    fn test_update_merges_content_and_keeps_sender() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        let mut original = remote(10, 1, 100, "typo");
        original.sender = Some(Profile::placeholder(2));
        apply_insert(&mut state, original, &mut effects);

        let mut patch = remote(10, 1, 100, "fixed");
        patch.edited = true;
        apply_update(&mut state, &patch, &mut effects);

        let merged = state.timeline_message(10).unwrap();
        assert_eq!(merged.content, MessageContent::text("fixed"));
        assert!(merged.edited);
        assert!(merged.sender.is_some());
    }

    #[test]
    fn test_profile_fanout_updates_senders() {
        let mut state = seed_state(1);
        let mut effects = Vec::new();
        let mut message = remote(10, 1, 100, "a");
        message.sender = Some(Profile::placeholder(2));
        apply_insert(&mut state, message, &mut effects);

        let mut renamed = Profile::placeholder(2);
        renamed.username = "carol".to_string();
        apply_profile_change(&mut state, &renamed);

        assert_eq!(state.timeline[0].sender_username(), "carol");
    }
}
