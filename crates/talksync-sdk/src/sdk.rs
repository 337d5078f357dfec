//! 统一 SDK 接口 - TalksyncSdk 主入口
//!
//! 分层架构：
//! ```text
//! TalksyncSdk (门面层)
//!   ├── StateStore (状态树 + 归约器)
//!   ├── SubscriptionManager (推送通道生命周期)
//!   ├── TypingTracker (输入状态)
//!   ├── NoticeBoard (瞬时通知)
//!   └── EventManager (事件广播)
//! ```
//!
//! 数据流单向：远端推送与本端操作都折叠成 `ChatAction`，经归约器
//! 串行落进状态树，产生的 `StateEffect` 由门面统一执行（广播事件、
//! 张贴通知）。读路径永远是状态树的一致性快照。

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::entities::{
    Conversation, DeliveryState, Message, MessageContent, PresenceStatus, Profile,
};
use crate::error::{AttachmentError, Result, TalksyncError};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SdkEvent};
use crate::notify::{Notice, NoticeBoard};
use crate::platform::{
    AttachmentUpload, ChangeFilter, ChangeOp, MessagePatch, NewConversation, NewMessage,
    RemotePlatform,
};
use crate::presence::OwnPresence;
use crate::reconcile::{conversations, SortMode};
use crate::store::{ChatAction, ChatState, StateEffect, StateStats, StateStore};
use crate::subscription::{
    BackoffPolicy, RoutedEvent, SubscriptionManager, SubscriptionState,
};
use crate::typing::{TypingConfig, TypingTracker};
use crate::utils::time::now_millis;

/// 附件约束
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentLimits {
    /// 单个附件大小上限（字节）
    pub max_bytes: u64,
    /// 扩展名白名单（小写，不含点）
    pub allowed_extensions: Vec<String>,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            allowed_extensions: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "gif".to_string(),
                "pdf".to_string(),
                "doc".to_string(),
                "docx".to_string(),
            ],
        }
    }
}

/// Talksync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalksyncConfig {
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 输入状态参数
    pub typing: TypingConfig,
    /// 订阅重建退避参数
    pub backoff: BackoffPolicy,
    /// 瞬时通知存活时长
    pub notice_ttl: Duration,
    /// 附件约束
    pub attachment_limits: AttachmentLimits,
}

impl Default for TalksyncConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            typing: TypingConfig::default(),
            backoff: BackoffPolicy::default(),
            notice_ttl: Duration::from_millis(3000),
            attachment_limits: AttachmentLimits::default(),
        }
    }
}

impl TalksyncConfig {
    pub fn builder() -> TalksyncConfigBuilder {
        TalksyncConfigBuilder::new()
    }

    fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 {
            return Err(TalksyncError::Config(
                "event_buffer_size must be positive".to_string(),
            ));
        }
        if self.attachment_limits.max_bytes == 0 {
            return Err(TalksyncError::Config(
                "attachment max_bytes must be positive".to_string(),
            ));
        }
        if self.backoff.factor < 1.0 {
            return Err(TalksyncError::Config(
                "backoff factor must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Talksync SDK 配置构建器
pub struct TalksyncConfigBuilder {
    config: TalksyncConfig,
}

impl TalksyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TalksyncConfig::default(),
        }
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn typing(mut self, typing: TypingConfig) -> Self {
        self.config.typing = typing;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn notice_ttl(mut self, ttl: Duration) -> Self {
        self.config.notice_ttl = ttl;
        self
    }

    pub fn attachment_max_bytes(mut self, max_bytes: u64) -> Self {
        self.config.attachment_limits.max_bytes = max_bytes;
        self
    }

    /// 追加一个允许的附件扩展名
    pub fn allow_extension<S: Into<String>>(mut self, extension: S) -> Self {
        self.config
            .attachment_limits
            .allowed_extensions
            .push(extension.into().to_lowercase());
        self
    }

    pub fn build(self) -> TalksyncConfig {
        self.config
    }
}

impl Default for TalksyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 统一 SDK 主接口
///
/// 生命周期：`initialize` → `connect` → 操作 → `shutdown`。
/// 一个实例承载一次会话；`shutdown` 后需要新实例重新登录。
/// 通道级故障（推送断开）不在此列，由订阅管理器自动退避恢复。
pub struct TalksyncSdk {
    config: TalksyncConfig,

    /// 远端平台（权威存储的黑盒）
    platform: Arc<dyn RemotePlatform>,

    /// 事件广播
    events: Arc<EventManager>,

    /// 状态存储
    store: StateStore,

    /// 瞬时通知板
    notices: Arc<NoticeBoard>,

    /// 推送订阅管理器
    subscription: SubscriptionManager,

    /// 输入状态跟踪器（connect 时就位）
    typing: Arc<RwLock<Option<TypingTracker>>>,

    /// 自身资料管理（connect 时就位）
    presence: RwLock<Option<OwnPresence>>,

    /// Snowflake ID 生成器（乐观消息的临时 ID 与 client_tag）
    snowflake: Arc<snowflake_me::Snowflake>,

    /// 推送路由任务
    router: Mutex<Option<JoinHandle<()>>>,

    /// 是否已关闭
    shut_down: AtomicBool,
}

impl TalksyncSdk {
    /// 初始化 SDK
    ///
    /// 分层初始化：事件层 → 状态层 → 通知板 → 订阅管理器 → 路由任务。
    /// 需要在 Tokio 运行时上下文内调用（内部会 spawn 路由任务）。
    pub async fn initialize(
        platform: Arc<dyn RemotePlatform>,
        config: TalksyncConfig,
    ) -> Result<Arc<Self>> {
        info!("initializing talksync sdk v{}", crate::version::SDK_VERSION);
        config.validate()?;

        let events = Arc::new(EventManager::new(config.event_buffer_size));
        let store = StateStore::new();
        let notices = Arc::new(NoticeBoard::new(config.notice_ttl, events.clone()));

        let (routed_tx, routed_rx) = mpsc::unbounded_channel();
        let subscription = SubscriptionManager::new(
            platform.clone(),
            events.clone(),
            routed_tx,
            config.backoff,
        );

        // 手动指定 machine_id / data_center_id，避免 IP 地址探测失败。
        // 用 StdRng 而不是 thread_rng()：thread_rng() 不是 Send 的。
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::from_entropy();
        let machine_id: u16 = rng.gen_range(0..32);
        let data_center_id: u16 = rng.gen_range(0..32);
        let snowflake = snowflake_me::Snowflake::builder()
            .machine_id(&|| Ok(machine_id))
            .data_center_id(&|| Ok(data_center_id))
            .finalize()
            .map_err(|e| TalksyncError::Internal(format!("snowflake init failed: {:?}", e)))?;

        let typing: Arc<RwLock<Option<TypingTracker>>> = Arc::new(RwLock::new(None));
        let router = Self::spawn_router(
            store.clone(),
            events.clone(),
            notices.clone(),
            platform.clone(),
            typing.clone(),
            routed_rx,
        );

        info!("talksync sdk initialized");
        Ok(Arc::new(Self {
            config,
            platform,
            events,
            store,
            notices,
            subscription,
            typing,
            presence: RwLock::new(None),
            snowflake: Arc::new(snowflake),
            router: Mutex::new(Some(router)),
            shut_down: AtomicBool::new(false),
        }))
    }

    // ========== 生命周期 ==========

    /// 建立会话
    ///
    /// 流程：取登录会话 → 补建资料行 → 上线 → 拉会话列表 → 建推送订阅。
    /// 中途失败返回 `Err`，已应用的状态保持一致，可整体重试。
    pub async fn connect(&self) -> Result<Profile> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TalksyncError::InvalidOperation(
                "sdk has been shut down".to_string(),
            ));
        }
        if self.presence.read().is_some() {
            return Err(TalksyncError::InvalidOperation(
                "already connected".to_string(),
            ));
        }

        let session = self
            .platform
            .current_session()
            .await
            .ok_or(TalksyncError::NotConnected)?;
        info!("connecting: user_id={}", session.user_id);

        let profile = OwnPresence::ensure_profile(&self.platform, &session).await?;
        self.apply(ChatAction::SessionEstablished {
            profile: profile.clone(),
        })
        .await;

        let presence = OwnPresence::new(self.platform.clone(), session.user_id);
        if let Err(e) = presence.set_status(PresenceStatus::Online).await {
            warn!("failed to publish online status: {}", e);
        }

        let conversation_list = self.platform.fetch_conversations(session.user_id).await?;
        info!("conversations loaded: count={}", conversation_list.len());
        self.apply(ChatAction::ConversationsLoaded {
            conversations: conversation_list,
        })
        .await;

        let filter = self.member_filter(session.user_id).await?;
        self.subscription.rebuild(filter).await;

        let tracker = TypingTracker::new(
            self.platform.clone(),
            self.events.clone(),
            session.user_id,
            self.config.typing,
        );
        *self.typing.write() = Some(tracker);
        *self.presence.write() = Some(presence);

        info!(
            "connected: user_id={} username={}",
            session.user_id, profile.username
        );
        Ok(profile)
    }

    /// 关闭 SDK
    ///
    /// 尽力而为：清输入状态、撤订阅、置 Offline、停路由。重复调用无害。
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");

        let tracker = self.typing.write().take();
        if let Some(tracker) = tracker {
            tracker.detach().await;
        }

        self.subscription.teardown().await;

        let presence = self.presence.write().take();
        if let Some(presence) = presence {
            presence.set_offline_best_effort().await;
        }

        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        info!("shutdown complete");
    }

    pub fn is_connected(&self) -> bool {
        self.presence.read().is_some()
    }

    // ========== 会话 ==========

    /// 切换当前会话；`None` 退出会话视图
    ///
    /// 依次：应用选择（清时间线与未读）→ 输入跟踪换防 → 重建订阅
    /// （typing 过滤器跟随新会话）→ 拉取时间线。拉取结果在应用点
    /// 校验仍是当前会话，切换竞态下的迟到结果被丢弃。
    pub async fn select_conversation(&self, conversation_id: Option<u64>) -> Result<()> {
        let user_id = self.require_connected()?;
        let tracker = self
            .typing
            .read()
            .clone()
            .ok_or(TalksyncError::NotConnected)?;

        if let Some(id) = conversation_id {
            if self.store.read(|s| s.conversation(id).is_none()) {
                return Err(TalksyncError::UnknownConversation(id));
            }
        }

        self.apply(ChatAction::ConversationSelected { conversation_id })
            .await;

        match conversation_id {
            Some(id) => tracker.attach(id),
            None => tracker.detach().await,
        }

        let filter = self.member_filter(user_id).await?.typing_in(conversation_id);
        self.subscription.rebuild(filter).await;

        if let Some(id) = conversation_id {
            let messages = self.platform.fetch_messages(id).await?;
            self.apply(ChatAction::TimelineLoaded {
                conversation_id: id,
                messages,
            })
            .await;
        }
        Ok(())
    }

    /// 创建会话并纳入推送订阅
    pub async fn create_conversation(
        &self,
        new_conversation: NewConversation,
    ) -> Result<Conversation> {
        let user_id = self.require_connected()?;
        let conversation = self.platform.create_conversation(new_conversation).await?;
        info!("conversation created: id={}", conversation.id);
        self.apply(ChatAction::ConversationCreated {
            conversation: conversation.clone(),
        })
        .await;

        let filter = self
            .member_filter(user_id)
            .await?
            .typing_in(self.store.active_conversation());
        self.subscription.rebuild(filter).await;
        Ok(conversation)
    }

    /// 排序后的会话列表快照
    pub fn conversations(&self, mode: SortMode) -> Vec<Conversation> {
        self.store.read(|s| conversations::project(s, mode))
    }

    /// 按展示名称搜索会话；空查询等价于 `conversations(Recency)`
    pub fn search_conversations(&self, query: &str) -> Vec<Conversation> {
        self.store.read(|s| conversations::search(s, query))
    }

    /// 会话未读清零
    pub async fn mark_read(&self, conversation_id: u64) {
        self.apply(ChatAction::UnreadCleared { conversation_id })
            .await;
    }

    /// 视口位置上报；回到底部时清当前会话未读
    pub async fn set_viewport(&self, at_bottom: bool) {
        self.apply(ChatAction::ViewportChanged { at_bottom }).await;
    }

    // ========== 消息 ==========

    /// 发送文本消息
    ///
    /// 乐观路径：先以临时 ID 入时间线（Pending），写远端成功后以权威行
    /// 收敛替换；失败则标记 Failed、张贴通知，等待 `retry_send` 或
    /// `discard_failed`。返回临时 ID 供跟踪。
    pub async fn send_text<S: Into<String>>(
        &self,
        conversation_id: u64,
        body: S,
    ) -> Result<u64> {
        let body = body.into();
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(TalksyncError::InvalidOperation(
                "message body is empty".to_string(),
            ));
        }
        self.send_content(conversation_id, MessageContent::text(trimmed))
            .await
    }

    /// 发送附件
    ///
    /// 客户端先校验大小与扩展名（违例直接拒绝，不产生任何远端调用），
    /// 上传取回公开 URL 后走与文本一致的乐观路径。
    pub async fn send_attachment(
        &self,
        conversation_id: u64,
        upload: AttachmentUpload,
    ) -> Result<u64> {
        self.sending_context(conversation_id)?;
        self.validate_attachment(&upload)?;

        let file_name = upload.file_name.clone();
        let is_image = upload.is_image();
        let url = self.platform.upload_attachment(upload).await?;
        debug!("attachment uploaded: {}", url);

        let content = if is_image {
            MessageContent::Image {
                name: file_name,
                url,
            }
        } else {
            MessageContent::Document {
                name: file_name,
                url,
            }
        };
        self.send_content(conversation_id, content).await
    }

    /// 重试一条发送失败的消息（保持原 client_tag，远端可据此去重）
    pub async fn retry_send(&self, conversation_id: u64, provisional_id: u64) -> Result<()> {
        let sender = self.sending_context(conversation_id)?;
        let failed = self
            .store
            .read(|s| {
                s.timeline
                    .iter()
                    .find(|m| {
                        m.client_tag == provisional_id
                            && m.conversation_id == conversation_id
                            && m.delivery == DeliveryState::Failed
                    })
                    .cloned()
            })
            .ok_or_else(|| {
                TalksyncError::InvalidOperation(format!(
                    "no failed entry with provisional id {}",
                    provisional_id
                ))
            })?;

        self.apply(ChatAction::SendRetried {
            conversation_id,
            provisional_id,
        })
        .await;

        self.deliver(
            NewMessage {
                conversation_id,
                sender_id: sender.id,
                content: failed.content,
                client_tag: provisional_id,
            },
            provisional_id,
        )
        .await;
        Ok(())
    }

    /// 放弃一条发送失败的消息
    pub async fn discard_failed(&self, conversation_id: u64, provisional_id: u64) -> Result<()> {
        self.apply(ChatAction::OptimisticDiscarded {
            conversation_id,
            provisional_id,
        })
        .await;
        Ok(())
    }

    /// 编辑消息正文；远端成功后回填本地并置 `edited`
    pub async fn edit_message<S: Into<String>>(
        &self,
        conversation_id: u64,
        message_id: u64,
        body: S,
    ) -> Result<()> {
        self.require_connected()?;
        let body = body.into();
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(TalksyncError::InvalidOperation(
                "message body is empty".to_string(),
            ));
        }

        let content = MessageContent::text(trimmed);
        self.platform
            .update_message(MessagePatch {
                conversation_id,
                message_id,
                content: Some(content.clone()),
                edited: true,
            })
            .await?;

        self.apply(ChatAction::ContentEdited {
            conversation_id,
            message_id,
            content,
        })
        .await;
        Ok(())
    }

    /// 删除消息；远端成功后本地移除（推送回声是幂等的空操作）
    pub async fn delete_message(&self, conversation_id: u64, message_id: u64) -> Result<()> {
        self.require_connected()?;
        self.platform
            .delete_message(conversation_id, message_id)
            .await?;
        self.apply(ChatAction::RemoteMessageDeleted {
            conversation_id,
            message_id,
        })
        .await;
        Ok(())
    }

    /// 当前会话时间线快照
    pub fn timeline(&self) -> Vec<Message> {
        self.store.read(|s| s.timeline.clone())
    }

    // ========== 表情反馈 ==========

    pub async fn add_reaction(
        &self,
        conversation_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<()> {
        let user_id = self.require_connected()?;
        self.platform
            .add_reaction(message_id, user_id, emoji)
            .await?;
        self.refresh_reactions(conversation_id, message_id).await;
        Ok(())
    }

    pub async fn remove_reaction(
        &self,
        conversation_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<()> {
        let user_id = self.require_connected()?;
        self.platform
            .remove_reaction(message_id, user_id, emoji)
            .await?;
        self.refresh_reactions(conversation_id, message_id).await;
        Ok(())
    }

    // ========== 输入状态 ==========

    /// 上报本端正在输入（去抖与自清由跟踪器处理，上报失败只记日志）
    pub async fn signal_typing(&self, conversation_id: u64) -> Result<()> {
        let tracker = self
            .typing
            .read()
            .clone()
            .ok_or(TalksyncError::NotConnected)?;
        tracker.signal_local(conversation_id).await;
        Ok(())
    }

    /// 会话里正在输入的其他用户（仅当会话是当前会话时非空）
    pub fn typing_users(&self, conversation_id: u64) -> Vec<u64> {
        match self.typing.read().clone() {
            Some(tracker) => tracker.typing_users(conversation_id),
            None => Vec::new(),
        }
    }

    // ========== 自身资料 ==========

    /// 更新自身在线状态（变更经资料推送扇回本地状态树）
    pub async fn set_status(&self, status: PresenceStatus) -> Result<Profile> {
        let presence = self
            .presence
            .read()
            .clone()
            .ok_or(TalksyncError::NotConnected)?;
        presence.set_status(status).await
    }

    /// 完成首次资料设置
    pub async fn complete_setup(
        &self,
        username: String,
        avatar_url: Option<String>,
    ) -> Result<Profile> {
        let presence = self
            .presence
            .read()
            .clone()
            .ok_or(TalksyncError::NotConnected)?;
        presence.complete_setup(username, avatar_url).await
    }

    pub fn self_profile(&self) -> Option<Profile> {
        self.store.read(|s| s.self_user.clone())
    }

    // ========== 草稿 ==========

    /// 保存会话草稿；空文本等价于删除
    pub async fn save_draft<S: Into<String>>(&self, conversation_id: u64, text: S) {
        self.apply(ChatAction::DraftSaved {
            conversation_id,
            text: text.into(),
        })
        .await;
    }

    pub fn draft(&self, conversation_id: u64) -> Option<String> {
        self.store.read(|s| s.drafts.get(&conversation_id).cloned())
    }

    /// 取出并清除会话草稿
    pub async fn take_draft(&self, conversation_id: u64) -> Option<String> {
        let draft = self.draft(conversation_id);
        if draft.is_some() {
            self.apply(ChatAction::DraftCleared { conversation_id })
                .await;
        }
        draft
    }

    // ========== 通知 ==========

    /// 张贴一条瞬时通知
    pub async fn post_notice<S: Into<String>>(&self, text: S) -> u64 {
        self.notices.post(text).await
    }

    /// 未过期的通知
    pub fn active_notices(&self) -> Vec<Notice> {
        self.notices.active()
    }

    // ========== 观察 ==========

    /// 订阅 SDK 事件流
    pub fn subscribe_events(&self) -> broadcast::Receiver<SdkEvent> {
        self.events.subscribe()
    }

    /// 订阅过滤后的 SDK 事件流
    pub fn subscribe_events_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn subscription_state_stream(&self) -> watch::Receiver<SubscriptionState> {
        self.subscription.state_stream()
    }

    pub fn active_conversation(&self) -> Option<u64> {
        self.store.active_conversation()
    }

    /// 完整状态树快照
    pub fn snapshot(&self) -> ChatState {
        self.store.read(|s| s.clone())
    }

    /// 状态概览
    pub fn stats(&self) -> StateStats {
        self.store.stats()
    }

    // ========== 内部 ==========

    /// 应用动作并执行归约产生的副作用
    async fn apply(&self, action: ChatAction) {
        let effects = self.store.dispatch(action);
        perform_effects(&self.events, &self.notices, effects).await;
    }

    fn require_connected(&self) -> Result<u64> {
        if self.presence.read().is_none() {
            return Err(TalksyncError::NotConnected);
        }
        Ok(self.store.read(|s| s.self_user_id()))
    }

    /// 发送前置检查：已连接且目标是当前会话，返回发送者资料
    fn sending_context(&self, conversation_id: u64) -> Result<Profile> {
        let sender = self
            .store
            .read(|s| s.self_user.clone())
            .filter(|_| self.presence.read().is_some())
            .ok_or(TalksyncError::NotConnected)?;
        if self.store.active_conversation() != Some(conversation_id) {
            return Err(TalksyncError::InvalidOperation(format!(
                "conversation {} is not the active conversation",
                conversation_id
            )));
        }
        Ok(sender)
    }

    fn validate_attachment(&self, upload: &AttachmentUpload) -> Result<()> {
        let limits = &self.config.attachment_limits;
        let size = upload.data.len() as u64;
        if size > limits.max_bytes {
            return Err(AttachmentError::TooLarge {
                size,
                limit: limits.max_bytes,
            }
            .into());
        }
        let extension = upload.extension();
        if !limits.allowed_extensions.iter().any(|e| *e == extension) {
            return Err(AttachmentError::UnsupportedType { extension }.into());
        }
        Ok(())
    }

    async fn send_content(&self, conversation_id: u64, content: MessageContent) -> Result<u64> {
        let sender = self.sending_context(conversation_id)?;
        let provisional_id = self.next_id()?;

        let provisional = Message {
            id: provisional_id,
            conversation_id,
            sender_id: sender.id,
            sender: Some(sender.clone()),
            content: content.clone(),
            created_at: now_millis(),
            edited: false,
            reactions: Vec::new(),
            delivery: DeliveryState::Pending,
            client_tag: provisional_id,
        };
        self.apply(ChatAction::OptimisticQueued {
            message: provisional,
        })
        .await;

        self.deliver(
            NewMessage {
                conversation_id,
                sender_id: sender.id,
                content,
                client_tag: provisional_id,
            },
            provisional_id,
        )
        .await;
        Ok(provisional_id)
    }

    /// 写远端并收敛乐观条目；失败不返回 `Err`，失败态留在时间线上
    async fn deliver(&self, new_message: NewMessage, provisional_id: u64) {
        let conversation_id = new_message.conversation_id;
        match self.platform.insert_message(new_message).await {
            Ok(confirmed) => {
                debug!(
                    "send confirmed: provisional_id={} message_id={}",
                    provisional_id, confirmed.id
                );
                self.apply(ChatAction::OptimisticConfirmed { confirmed })
                    .await;
                self.apply(ChatAction::DraftCleared { conversation_id })
                    .await;
            }
            Err(e) => {
                warn!(
                    "send failed: conversation_id={} provisional_id={} error={}",
                    conversation_id, provisional_id, e
                );
                self.apply(ChatAction::OptimisticFailed {
                    conversation_id,
                    provisional_id,
                    error: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn refresh_reactions(&self, conversation_id: u64, message_id: u64) {
        match self.platform.fetch_message(message_id).await {
            Ok(Some(message)) => {
                self.apply(ChatAction::ReactionsMerged {
                    conversation_id,
                    message_id,
                    reactions: message.reactions,
                })
                .await;
            }
            Ok(None) => debug!("message {} gone before reaction refresh", message_id),
            Err(e) => warn!("reaction refresh failed for {}: {}", message_id, e),
        }
    }

    async fn member_filter(&self, user_id: u64) -> Result<ChangeFilter> {
        let conversation_ids = self.platform.member_conversations(user_id).await?;
        Ok(ChangeFilter::new().messages_in(conversation_ids))
    }

    fn next_id(&self) -> Result<u64> {
        self.snowflake
            .next_id()
            .map_err(|e| TalksyncError::Internal(format!("snowflake id failed: {:?}", e)))
    }

    /// 推送路由循环
    ///
    /// 消费订阅管理器分类后的事件：消息增删改折叠成动作进状态树，
    /// 输入状态行转交跟踪器，资料更新向状态树扇出。
    fn spawn_router(
        store: StateStore,
        events: Arc<EventManager>,
        notices: Arc<NoticeBoard>,
        platform: Arc<dyn RemotePlatform>,
        typing: Arc<RwLock<Option<TypingTracker>>>,
        mut routed_rx: mpsc::UnboundedReceiver<RoutedEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(routed) = routed_rx.recv().await {
                match routed {
                    RoutedEvent::Message {
                        op: ChangeOp::Insert,
                        row,
                    } => {
                        let message = hydrate_insert(&platform, row).await;
                        let effects =
                            store.dispatch(ChatAction::RemoteMessageInserted { message });
                        perform_effects(&events, &notices, effects).await;
                    }
                    RoutedEvent::Message {
                        op: ChangeOp::Update,
                        row,
                    } => {
                        let effects =
                            store.dispatch(ChatAction::RemoteMessageUpdated { message: row });
                        perform_effects(&events, &notices, effects).await;
                    }
                    RoutedEvent::Message {
                        op: ChangeOp::Delete,
                        row,
                    } => {
                        let effects = store.dispatch(ChatAction::RemoteMessageDeleted {
                            conversation_id: row.conversation_id,
                            message_id: row.id,
                        });
                        perform_effects(&events, &notices, effects).await;
                    }
                    RoutedEvent::Typing { op, row } => {
                        let tracker = typing.read().clone();
                        if let Some(tracker) = tracker {
                            tracker.handle_remote_event(op, &row).await;
                        }
                    }
                    RoutedEvent::Profile { row } => {
                        let effects = store.dispatch(ChatAction::ProfileChanged { profile: row });
                        perform_effects(&events, &notices, effects).await;
                    }
                }
            }
            debug!("router loop exited");
        })
    }
}

/// 推送的消息是裸行；按 ID 补取带发送者资料的完整行，失败降级为占位资料
async fn hydrate_insert(platform: &Arc<dyn RemotePlatform>, row: Message) -> Message {
    if row.sender.is_some() {
        return row;
    }
    match platform.fetch_message(row.id).await {
        Ok(Some(full)) => full,
        Ok(None) => {
            debug!("message row vanished during hydration: {}", row.id);
            with_placeholder_sender(row)
        }
        Err(e) => {
            warn!("hydration failed for message {}: {}", row.id, e);
            with_placeholder_sender(row)
        }
    }
}

fn with_placeholder_sender(mut row: Message) -> Message {
    row.sender = Some(Profile::placeholder(row.sender_id));
    row
}

/// 执行归约副作用：广播事件、张贴通知
async fn perform_effects(events: &EventManager, notices: &NoticeBoard, effects: Vec<StateEffect>) {
    for effect in effects {
        match effect {
            StateEffect::Emit(event) => events.emit(event).await,
            StateEffect::PostNotice { text } => {
                notices.post(text).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Reaction;
    use crate::platform::memory::MemoryPlatform;

    /// 让路由任务把已入队的推送事件处理完
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    async fn direct_chat_sdk() -> (Arc<TalksyncSdk>, MemoryPlatform, u64, u64, u64) {
        let platform = MemoryPlatform::new();
        let alice = platform.register_user("alice", Some("alice@example.com"));
        let bob = platform.register_user("bob", Some("bob@example.com"));
        let conversation = platform
            .create_conversation(NewConversation {
                name: None,
                is_group: false,
                created_by: alice,
                member_ids: vec![alice, bob],
            })
            .await
            .unwrap();
        platform.sign_in(alice);

        let sdk = TalksyncSdk::initialize(
            Arc::new(platform.clone()),
            TalksyncConfig::default(),
        )
        .await
        .unwrap();
        sdk.connect().await.unwrap();
        (sdk, platform, alice, bob, conversation.id)
    }

    #[tokio::test]
    async fn test_connect_establishes_session() {
        let (sdk, platform, alice, _bob, _conv) = direct_chat_sdk().await;

        assert!(sdk.is_connected());
        assert_eq!(sdk.self_profile().unwrap().username, "alice");
        assert_eq!(sdk.conversations(SortMode::Recency).len(), 1);
        assert_eq!(sdk.subscription_state(), SubscriptionState::Subscribed);

        // 上线状态已发布
        let profile = platform.fetch_profile(alice).await.unwrap().unwrap();
        assert_eq!(profile.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_connect_without_session_fails() {
        let platform = MemoryPlatform::new();
        let sdk = TalksyncSdk::initialize(
            Arc::new(platform.clone()),
            TalksyncConfig::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            sdk.connect().await,
            Err(TalksyncError::NotConnected)
        ));
        assert!(!sdk.is_connected());
    }

    #[tokio::test]
    async fn test_connect_creates_missing_profile() {
        let platform = MemoryPlatform::new();
        platform.sign_in(999);

        let sdk = TalksyncSdk::initialize(
            Arc::new(platform.clone()),
            TalksyncConfig::default(),
        )
        .await
        .unwrap();
        let profile = sdk.connect().await.unwrap();

        assert_eq!(profile.username, "user-999");
        assert!(!profile.has_completed_setup);
    }

    #[tokio::test]
    async fn test_send_text_converges_to_delivered() {
        let (sdk, _platform, alice, _bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        let provisional_id = sdk.send_text(conv, "hello").await.unwrap();
        settle().await;

        let timeline = sdk.timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].delivery, DeliveryState::Delivered);
        assert_ne!(timeline[0].id, provisional_id);
        assert_eq!(timeline[0].content, MessageContent::text("hello"));

        // 自己发的消息，会话摘要带 "You: " 前缀
        let list = sdk.conversations(SortMode::Recency);
        let last = list[0].last_message.as_ref().unwrap();
        assert_eq!(last.display_preview(alice), "You: hello");
    }

    #[tokio::test]
    async fn test_send_requires_active_conversation() {
        let (sdk, _platform, _alice, _bob, conv) = direct_chat_sdk().await;

        // 未选中任何会话
        assert!(matches!(
            sdk.send_text(conv, "hi").await,
            Err(TalksyncError::InvalidOperation(_))
        ));

        sdk.select_conversation(Some(conv)).await.unwrap();
        assert!(matches!(
            sdk.send_text(conv, "   ").await,
            Err(TalksyncError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_failure_marks_failed_then_retry_converges() {
        let (sdk, platform, _alice, _bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();
        let mut events = sdk.subscribe_events();

        platform.fail_next_insert();
        let provisional_id = sdk.send_text(conv, "doomed").await.unwrap();
        settle().await;

        let timeline = sdk.timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].delivery, DeliveryState::Failed);

        // 失败事件与瞬时通知都已发出
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SdkEvent::MessageSendFailed { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert!(sdk
            .active_notices()
            .iter()
            .any(|n| n.text.contains("Failed to send")));

        sdk.retry_send(conv, provisional_id).await.unwrap();
        settle().await;

        let timeline = sdk.timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].delivery, DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn test_discard_failed_removes_entry() {
        let (sdk, platform, _alice, _bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        platform.fail_next_insert();
        let provisional_id = sdk.send_text(conv, "doomed").await.unwrap();
        sdk.discard_failed(conv, provisional_id).await.unwrap();

        assert!(sdk.timeline().is_empty());
    }

    #[tokio::test]
    async fn test_attachment_validation_rejects_before_upload() {
        let (sdk, _platform, _alice, _bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        let oversized = AttachmentUpload {
            conversation_id: conv,
            file_name: "big.png".to_string(),
            mime_type: "image/png".to_string(),
            data: vec![0u8; 11 * 1024 * 1024],
        };
        assert!(matches!(
            sdk.send_attachment(conv, oversized).await,
            Err(TalksyncError::Attachment(AttachmentError::TooLarge { .. }))
        ));

        let executable = AttachmentUpload {
            conversation_id: conv,
            file_name: "setup.exe".to_string(),
            mime_type: "application/octet-stream".to_string(),
            data: vec![1, 2, 3],
        };
        assert!(matches!(
            sdk.send_attachment(conv, executable).await,
            Err(TalksyncError::Attachment(
                AttachmentError::UnsupportedType { .. }
            ))
        ));

        // 违例被拒后时间线无残留
        assert!(sdk.timeline().is_empty());
    }

    #[tokio::test]
    async fn test_send_attachment_delivers_image() {
        let (sdk, _platform, _alice, _bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        let upload = AttachmentUpload {
            conversation_id: conv,
            file_name: "photo.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            data: vec![0u8; 128],
        };
        sdk.send_attachment(conv, upload).await.unwrap();
        settle().await;

        let timeline = sdk.timeline();
        assert_eq!(timeline.len(), 1);
        match &timeline[0].content {
            MessageContent::Image { name, url } => {
                assert_eq!(name, "photo.jpg");
                assert!(url.ends_with(".jpg"));
            }
            other => panic!("expected image content, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_insert_hydrates_sender() {
        let (sdk, platform, _alice, bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        platform
            .insert_message(NewMessage {
                conversation_id: conv,
                sender_id: bob,
                content: MessageContent::text("hey"),
                client_tag: 0,
            })
            .await
            .unwrap();
        settle().await;

        let timeline = sdk.timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].sender_username(), "bob");
        // 当前会话不计未读
        assert_eq!(sdk.conversations(SortMode::Recency)[0].unread_count, 0);
    }

    #[tokio::test]
    async fn test_remote_insert_bumps_unread_when_inactive() {
        let (sdk, platform, _alice, bob, conv) = direct_chat_sdk().await;

        platform
            .insert_message(NewMessage {
                conversation_id: conv,
                sender_id: bob,
                content: MessageContent::text("psst"),
                client_tag: 0,
            })
            .await
            .unwrap();
        settle().await;

        assert!(sdk.timeline().is_empty());
        let list = sdk.conversations(SortMode::Recency);
        assert_eq!(list[0].unread_count, 1);
        assert_eq!(list[0].last_message.as_ref().unwrap().preview, "psst");
    }

    #[tokio::test]
    async fn test_select_conversation_loads_history_and_clears_unread() {
        let (sdk, platform, _alice, bob, conv) = direct_chat_sdk().await;
        for body in ["one", "two"] {
            platform
                .insert_message(NewMessage {
                    conversation_id: conv,
                    sender_id: bob,
                    content: MessageContent::text(body),
                    client_tag: 0,
                })
                .await
                .unwrap();
        }
        settle().await;
        assert_eq!(sdk.conversations(SortMode::Recency)[0].unread_count, 2);

        sdk.select_conversation(Some(conv)).await.unwrap();

        let timeline = sdk.timeline();
        assert_eq!(timeline.len(), 2);
        assert!(timeline[0].created_at <= timeline[1].created_at);
        assert_eq!(sdk.conversations(SortMode::Recency)[0].unread_count, 0);
    }

    #[tokio::test]
    async fn test_select_unknown_conversation_fails() {
        let (sdk, _platform, _alice, _bob, _conv) = direct_chat_sdk().await;
        assert!(matches!(
            sdk.select_conversation(Some(424242)).await,
            Err(TalksyncError::UnknownConversation(424242))
        ));
    }

    #[tokio::test]
    async fn test_remote_typing_flows_to_tracker() {
        let (sdk, platform, _alice, bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        platform
            .upsert_typing(crate::entities::TypingRow {
                conversation_id: conv,
                user_id: bob,
                updated_at: now_millis(),
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(sdk.typing_users(conv), vec![bob]);
    }

    #[tokio::test]
    async fn test_edit_and_delete_roundtrip() {
        let (sdk, platform, _alice, _bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        sdk.send_text(conv, "draft wording").await.unwrap();
        settle().await;
        let message_id = sdk.timeline()[0].id;

        sdk.edit_message(conv, message_id, "final wording")
            .await
            .unwrap();
        settle().await;

        let timeline = sdk.timeline();
        assert_eq!(
            timeline[0].content,
            MessageContent::text("final wording")
        );
        assert!(timeline[0].edited);
        // 远端权威行同步更新
        let raw = platform.raw_message(message_id).unwrap();
        assert_eq!(raw.content, MessageContent::text("final wording"));

        sdk.delete_message(conv, message_id).await.unwrap();
        settle().await;

        assert!(sdk.timeline().is_empty());
        assert!(platform.raw_message(message_id).is_none());
    }

    #[tokio::test]
    async fn test_reaction_roundtrip() {
        let (sdk, _platform, alice, _bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        sdk.send_text(conv, "react to me").await.unwrap();
        settle().await;
        let message_id = sdk.timeline()[0].id;

        sdk.add_reaction(conv, message_id, "👍").await.unwrap();
        assert_eq!(
            sdk.timeline()[0].reactions,
            vec![Reaction {
                user_id: alice,
                emoji: "👍".to_string()
            }]
        );

        sdk.remove_reaction(conv, message_id, "👍").await.unwrap();
        assert!(sdk.timeline()[0].reactions.is_empty());
    }

    #[tokio::test]
    async fn test_drafts_survive_conversation_switch() {
        let (sdk, _platform, alice, bob, conv) = direct_chat_sdk().await;
        let second = sdk
            .create_conversation(NewConversation {
                name: Some("plans".to_string()),
                is_group: true,
                created_by: alice,
                member_ids: vec![alice, bob],
            })
            .await
            .unwrap();

        sdk.select_conversation(Some(conv)).await.unwrap();
        sdk.save_draft(conv, "half-typed thought").await;

        sdk.select_conversation(Some(second.id)).await.unwrap();
        assert_eq!(sdk.draft(conv).as_deref(), Some("half-typed thought"));
        assert_eq!(sdk.draft(second.id), None);

        assert_eq!(
            sdk.take_draft(conv).as_deref(),
            Some("half-typed thought")
        );
        assert_eq!(sdk.draft(conv), None);
    }

    #[tokio::test]
    async fn test_profile_change_fans_out() {
        let (sdk, platform, alice, bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        platform
            .update_profile(crate::platform::ProfilePatch {
                user_id: bob,
                username: Some("bobby".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        settle().await;

        // 单聊展示名跟随对方用户名
        let list = sdk.conversations(SortMode::Recency);
        assert_eq!(list[0].display_name(alice), "bobby");
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let (sdk, platform, alice, _bob, conv) = direct_chat_sdk().await;
        sdk.select_conversation(Some(conv)).await.unwrap();

        sdk.shutdown().await;

        assert!(!sdk.is_connected());
        assert_eq!(sdk.subscription_state(), SubscriptionState::Unsubscribed);
        assert_eq!(platform.live_channel_count(), 0);
        let profile = platform.fetch_profile(alice).await.unwrap().unwrap();
        assert_eq!(profile.status, PresenceStatus::Offline);

        // 关闭后不可重新连接
        assert!(matches!(
            sdk.connect().await,
            Err(TalksyncError::InvalidOperation(_))
        ));
        // 重复关闭无害
        sdk.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_builder() {
        let config = TalksyncConfig::builder()
            .event_buffer_size(64)
            .notice_ttl(Duration::from_millis(500))
            .attachment_max_bytes(1024)
            .allow_extension("SVG")
            .build();

        assert_eq!(config.event_buffer_size, 64);
        assert_eq!(config.notice_ttl, Duration::from_millis(500));
        assert_eq!(config.attachment_limits.max_bytes, 1024);
        assert!(config
            .attachment_limits
            .allowed_extensions
            .contains(&"svg".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let platform = MemoryPlatform::new();
        let config = TalksyncConfig::builder().event_buffer_size(0).build();
        assert!(matches!(
            TalksyncSdk::initialize(Arc::new(platform), config).await,
            Err(TalksyncError::Config(_))
        ));
    }
}
