//! 内存版平台实现
//!
//! `RemotePlatform` 的进程内参考实现：表是内存 HashMap，推送是进程内通道。
//! 用途：
//! - SDK 门面与订阅生命周期的集成测试
//! - 嵌入方接入前的本地演示（见 examples/）
//!
//! 行为对齐真实平台：insert 分配服务端 ID 并回显 client_tag，
//! 推送行是裸行（不含联表资料），过滤器语义与 `ChangeFilter` 一致。

use super::{
    AttachmentUpload, AuthSession, ChangeEvent, ChangeFilter, ChannelStatus, MessagePatch,
    NewConversation, NewMessage, ProfilePatch, PushChannel, RemotePlatform, TableRow,
};
use crate::entities::{Conversation, Message, Profile, Reaction, TypingRow};
use crate::error::{Result, TalksyncError};
use crate::utils::time::now_millis;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// 会话存储行（成员关系单独存）
#[derive(Debug, Clone)]
struct StoredConversation {
    id: u64,
    name: Option<String>,
    is_group: bool,
    created_at: i64,
    created_by: u64,
}

struct SubRecord {
    filter: ChangeFilter,
    events: mpsc::UnboundedSender<ChangeEvent>,
    status: watch::Sender<ChannelStatus>,
}

struct Inner {
    next_id: AtomicU64,
    session: RwLock<Option<AuthSession>>,
    profiles: RwLock<HashMap<u64, Profile>>,
    conversations: RwLock<HashMap<u64, StoredConversation>>,
    /// conversation_id -> member user ids
    members: RwLock<HashMap<u64, Vec<u64>>>,
    /// message_id -> 裸消息行
    messages: RwLock<HashMap<u64, Message>>,
    /// message_id -> reactions
    reactions: RwLock<HashMap<u64, Vec<Reaction>>>,
    /// (conversation_id, user_id) -> updated_at
    typing: RwLock<HashMap<(u64, u64), i64>>,
    typing_upserts: AtomicU64,
    subscriptions: RwLock<HashMap<String, SubRecord>>,
    /// 测试注入：让下一次 insert_message 失败
    fail_next_insert: AtomicBool,
    /// 测试注入：接下来 N 次 subscribe 失败
    failing_subscribes: AtomicU64,
}

/// 内存版平台
#[derive(Clone)]
pub struct MemoryPlatform {
    inner: Arc<Inner>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                session: RwLock::new(None),
                profiles: RwLock::new(HashMap::new()),
                conversations: RwLock::new(HashMap::new()),
                members: RwLock::new(HashMap::new()),
                messages: RwLock::new(HashMap::new()),
                reactions: RwLock::new(HashMap::new()),
                typing: RwLock::new(HashMap::new()),
                typing_upserts: AtomicU64::new(0),
                subscriptions: RwLock::new(HashMap::new()),
                fail_next_insert: AtomicBool::new(false),
                failing_subscribes: AtomicU64::new(0),
            }),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // === 测试/演示辅助 ===

    /// 注册用户：建资料行并返回用户 ID
    pub fn register_user(&self, username: &str, email: Option<&str>) -> u64 {
        let id = self.alloc_id();
        let profile = Profile {
            id,
            username: username.to_string(),
            email: email.map(|s| s.to_string()),
            avatar_url: None,
            status: crate::entities::PresenceStatus::Offline,
            last_seen: None,
            has_completed_setup: true,
        };
        self.inner.profiles.write().insert(id, profile);
        id
    }

    /// 以某用户身份登录
    pub fn sign_in(&self, user_id: u64) {
        let email = self
            .inner
            .profiles
            .read()
            .get(&user_id)
            .and_then(|p| p.email.clone());
        *self.inner.session.write() = Some(AuthSession { user_id, email });
    }

    pub fn sign_out(&self) {
        *self.inner.session.write() = None;
    }

    /// 让下一次 insert_message 返回平台错误（发送失败路径测试用）
    pub fn fail_next_insert(&self) {
        self.inner.fail_next_insert.store(true, Ordering::SeqCst);
    }

    /// 让接下来 n 次 subscribe 返回平台错误（重连退避测试用）
    pub fn fail_subscribes(&self, n: u64) {
        self.inner.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// 强制所有活跃推送通道异常断开（订阅恢复路径测试用）
    pub fn break_channels(&self) {
        let mut subs = self.inner.subscriptions.write();
        for (channel_id, record) in subs.drain() {
            debug!("breaking push channel: {}", channel_id);
            let _ = record.status.send(ChannelStatus::Errored);
            // 丢弃 events sender，消费端 recv 返回 None
        }
    }

    /// 活跃通道数（测试断言用）
    pub fn live_channel_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// 裸消息行快照（测试断言用）
    pub fn raw_message(&self, message_id: u64) -> Option<Message> {
        self.inner.messages.read().get(&message_id).cloned()
    }

    /// 累计 upsert_typing 调用次数（去抖测试断言用）
    pub fn typing_upsert_count(&self) -> u64 {
        self.inner.typing_upserts.load(Ordering::SeqCst)
    }

    /// 指定 (会话, 用户) 是否存在输入状态行
    pub fn has_typing_row(&self, conversation_id: u64, user_id: u64) -> bool {
        self.inner
            .typing
            .read()
            .contains_key(&(conversation_id, user_id))
    }

    // === 内部 ===

    fn hydrate_message(&self, mut message: Message) -> Message {
        message.sender = self.inner.profiles.read().get(&message.sender_id).cloned();
        message.reactions = self
            .inner
            .reactions
            .read()
            .get(&message.id)
            .cloned()
            .unwrap_or_default();
        message
    }

    fn build_conversation(&self, stored: &StoredConversation) -> Conversation {
        let member_ids = self
            .inner
            .members
            .read()
            .get(&stored.id)
            .cloned()
            .unwrap_or_default();
        let profiles = self.inner.profiles.read();
        let members = member_ids
            .iter()
            .filter_map(|id| profiles.get(id).cloned())
            .collect();
        drop(profiles);

        let last_message = {
            let messages = self.inner.messages.read();
            messages
                .values()
                .filter(|m| m.conversation_id == stored.id)
                .max_by_key(|m| m.ordering_key())
                .cloned()
        }
        .map(|raw| self.hydrate_message(raw).to_summary());

        Conversation {
            id: stored.id,
            name: stored.name.clone(),
            is_group: stored.is_group,
            created_at: stored.created_at,
            created_by: stored.created_by,
            members,
            last_message,
            unread_count: 0,
        }
    }

    fn publish(&self, event: ChangeEvent) {
        let mut dead = Vec::new();
        {
            let subs = self.inner.subscriptions.read();
            for (channel_id, record) in subs.iter() {
                if !record.filter.matches(&event) {
                    continue;
                }
                if record.events.send(event.clone()).is_err() {
                    dead.push(channel_id.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.inner.subscriptions.write();
            for channel_id in dead {
                subs.remove(&channel_id);
            }
        }
    }
}

#[async_trait]
impl RemotePlatform for MemoryPlatform {
    async fn current_session(&self) -> Option<AuthSession> {
        self.inner.session.read().clone()
    }

    async fn fetch_profile(&self, user_id: u64) -> Result<Option<Profile>> {
        Ok(self.inner.profiles.read().get(&user_id).cloned())
    }

    async fn create_profile(&self, profile: Profile) -> Result<Profile> {
        self.inner
            .profiles
            .write()
            .insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn update_profile(&self, patch: ProfilePatch) -> Result<Profile> {
        let (updated, previous) = {
            let mut profiles = self.inner.profiles.write();
            let profile = profiles
                .get_mut(&patch.user_id)
                .ok_or_else(|| TalksyncError::Platform("profile not found".to_string()))?;
            let previous = profile.clone();
            if let Some(username) = patch.username {
                profile.username = username;
            }
            if let Some(avatar_url) = patch.avatar_url {
                profile.avatar_url = Some(avatar_url);
            }
            if let Some(status) = patch.status {
                profile.status = status;
            }
            if let Some(last_seen) = patch.last_seen {
                profile.last_seen = Some(last_seen);
            }
            if let Some(done) = patch.has_completed_setup {
                profile.has_completed_setup = done;
            }
            (profile.clone(), previous)
        };
        self.publish(ChangeEvent::update(
            TableRow::Profile(updated.clone()),
            Some(TableRow::Profile(previous)),
        ));
        Ok(updated)
    }

    async fn member_conversations(&self, user_id: u64) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .inner
            .members
            .read()
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn fetch_conversations(&self, user_id: u64) -> Result<Vec<Conversation>> {
        let ids = self.member_conversations(user_id).await?;
        let stored: Vec<StoredConversation> = {
            let conversations = self.inner.conversations.read();
            ids.iter()
                .filter_map(|id| conversations.get(id).cloned())
                .collect()
        };
        Ok(stored.iter().map(|s| self.build_conversation(s)).collect())
    }

    async fn create_conversation(
        &self,
        new_conversation: NewConversation,
    ) -> Result<Conversation> {
        let id = self.alloc_id();
        let stored = StoredConversation {
            id,
            name: new_conversation.name,
            is_group: new_conversation.is_group,
            created_at: now_millis(),
            created_by: new_conversation.created_by,
        };
        self.inner
            .members
            .write()
            .insert(id, new_conversation.member_ids);
        self.inner.conversations.write().insert(id, stored.clone());
        Ok(self.build_conversation(&stored))
    }

    async fn fetch_messages(&self, conversation_id: u64) -> Result<Vec<Message>> {
        let mut raw: Vec<Message> = {
            let messages = self.inner.messages.read();
            messages
                .values()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect()
        };
        raw.sort_by_key(|m| m.ordering_key());
        Ok(raw
            .into_iter()
            .map(|m| self.hydrate_message(m))
            .collect())
    }

    async fn fetch_message(&self, message_id: u64) -> Result<Option<Message>> {
        let raw = self.inner.messages.read().get(&message_id).cloned();
        Ok(raw.map(|m| self.hydrate_message(m)))
    }

    async fn insert_message(&self, new_message: NewMessage) -> Result<Message> {
        if self.inner.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(TalksyncError::Platform(
                "injected insert failure".to_string(),
            ));
        }

        let row = Message {
            id: self.alloc_id(),
            conversation_id: new_message.conversation_id,
            sender_id: new_message.sender_id,
            sender: None,
            content: new_message.content,
            created_at: now_millis(),
            edited: false,
            reactions: vec![],
            delivery: Default::default(),
            client_tag: new_message.client_tag,
        };
        self.inner.messages.write().insert(row.id, row.clone());

        // 推送裸行；返回值带联表资料（与真实平台的 insert+select 一致）
        self.publish(ChangeEvent::insert(TableRow::Message(row.clone())));
        Ok(self.hydrate_message(row))
    }

    async fn update_message(&self, patch: MessagePatch) -> Result<()> {
        let (updated, previous) = {
            let mut messages = self.inner.messages.write();
            let row = messages
                .get_mut(&patch.message_id)
                .ok_or_else(|| TalksyncError::Platform("message not found".to_string()))?;
            let previous = row.clone();
            if let Some(content) = patch.content {
                row.content = content;
            }
            row.edited = patch.edited;
            (row.clone(), previous)
        };
        self.publish(ChangeEvent::update(
            TableRow::Message(updated),
            Some(TableRow::Message(previous)),
        ));
        Ok(())
    }

    async fn delete_message(&self, conversation_id: u64, message_id: u64) -> Result<()> {
        let removed = self.inner.messages.write().remove(&message_id);
        self.inner.reactions.write().remove(&message_id);
        if let Some(row) = removed {
            self.publish(ChangeEvent::delete(TableRow::Message(row)));
        } else {
            debug!(
                "delete for unknown message: conversation_id={} message_id={}",
                conversation_id, message_id
            );
        }
        Ok(())
    }

    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<String> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(char::from)
            .collect();
        let ext = upload.extension();
        Ok(format!(
            "memory://chat-media/{}/{}_{}.{}",
            upload.conversation_id,
            now_millis(),
            suffix,
            ext
        ))
    }

    async fn upsert_typing(&self, row: TypingRow) -> Result<()> {
        self.inner.typing_upserts.fetch_add(1, Ordering::SeqCst);
        let key = (row.conversation_id, row.user_id);
        let previous = {
            let mut typing = self.inner.typing.write();
            typing.insert(key, row.updated_at)
        };
        let event = match previous {
            Some(updated_at) => ChangeEvent::update(
                TableRow::Typing(row.clone()),
                Some(TableRow::Typing(TypingRow {
                    updated_at,
                    ..row
                })),
            ),
            None => ChangeEvent::insert(TableRow::Typing(row)),
        };
        self.publish(event);
        Ok(())
    }

    async fn clear_typing(&self, conversation_id: u64, user_id: u64) -> Result<()> {
        let removed = {
            let mut typing = self.inner.typing.write();
            typing.remove(&(conversation_id, user_id))
        };
        if let Some(updated_at) = removed {
            self.publish(ChangeEvent::delete(TableRow::Typing(TypingRow {
                conversation_id,
                user_id,
                updated_at,
            })));
        }
        Ok(())
    }

    async fn fetch_typing_since(
        &self,
        conversation_id: u64,
        since_millis: i64,
    ) -> Result<Vec<TypingRow>> {
        let typing = self.inner.typing.read();
        Ok(typing
            .iter()
            .filter(|((conv, _), updated_at)| {
                *conv == conversation_id && **updated_at > since_millis
            })
            .map(|((conv, user), updated_at)| TypingRow {
                conversation_id: *conv,
                user_id: *user,
                updated_at: *updated_at,
            })
            .collect())
    }

    async fn add_reaction(&self, message_id: u64, user_id: u64, emoji: &str) -> Result<()> {
        let mut reactions = self.inner.reactions.write();
        let list = reactions.entry(message_id).or_default();
        // UNIQUE(message_id, user_id, emoji)
        if !list
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
        {
            list.push(Reaction {
                user_id,
                emoji: emoji.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_reaction(&self, message_id: u64, user_id: u64, emoji: &str) -> Result<()> {
        let mut reactions = self.inner.reactions.write();
        if let Some(list) = reactions.get_mut(&message_id) {
            list.retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        }
        Ok(())
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<PushChannel> {
        let remaining = self.inner.failing_subscribes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .failing_subscribes
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TalksyncError::Platform(
                "injected subscribe failure".to_string(),
            ));
        }

        let channel_id = format!("sub-{}", uuid::Uuid::new_v4());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Active);

        self.inner.subscriptions.write().insert(
            channel_id.clone(),
            SubRecord {
                filter,
                events: events_tx,
                status: status_tx,
            },
        );
        debug!("push channel established: {}", channel_id);
        Ok(PushChannel::new(channel_id, events_rx, status_rx))
    }

    async fn unsubscribe(&self, channel_id: &str) -> Result<()> {
        if let Some(record) = self.inner.subscriptions.write().remove(channel_id) {
            let _ = record.status.send(ChannelStatus::Closed);
            debug!("push channel closed: {}", channel_id);
        }
        Ok(())
    }
}
