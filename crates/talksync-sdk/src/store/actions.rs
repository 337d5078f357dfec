//! 状态动作与归约副作用
//!
//! `ChatAction` 是状态树唯一的变更入口：推送路由、门面操作都收敛成动作，
//! 由归约器串行应用。`StateEffect` 是归约产生的待执行副作用，
//! 由运行时（门面）统一执行，归约器本身不触碰通道与时钟。

use crate::entities::{Conversation, Message, MessageContent, Profile, Reaction};
use crate::events::SdkEvent;

/// 状态变更动作
#[derive(Debug, Clone)]
pub enum ChatAction {
    /// 登录完成，自身资料就绪
    SessionEstablished { profile: Profile },
    /// 会话列表整体拉取完成
    ConversationsLoaded { conversations: Vec<Conversation> },
    /// 新会话创建完成（本端或远端）
    ConversationCreated { conversation: Conversation },
    /// 切换当前会话；None 表示退出会话视图
    ConversationSelected { conversation_id: Option<u64> },
    /// 指定会话的时间线拉取完成；与当前会话不符时在应用点丢弃
    TimelineLoaded {
        conversation_id: u64,
        messages: Vec<Message>,
    },
    /// 推送：新消息落地（已补齐发送者资料）
    RemoteMessageInserted { message: Message },
    /// 推送：消息行更新（裸行，按字段并入已有消息）
    RemoteMessageUpdated { message: Message },
    /// 推送：消息被删除
    RemoteMessageDeleted {
        conversation_id: u64,
        message_id: u64,
    },
    /// 推送：某用户资料更新，向会话成员与消息发送者扇出
    ProfileChanged { profile: Profile },
    /// 本端发送：乐观消息入列（delivery = Pending）
    OptimisticQueued { message: Message },
    /// 本端发送：服务端确认，以正式行替换乐观行
    OptimisticConfirmed { confirmed: Message },
    /// 本端发送：失败，标记 Failed 并张贴通知
    OptimisticFailed {
        conversation_id: u64,
        provisional_id: u64,
        error: String,
    },
    /// 重试发送：失败行回到 Pending
    SendRetried {
        conversation_id: u64,
        provisional_id: u64,
    },
    /// 放弃失败的乐观行
    OptimisticDiscarded {
        conversation_id: u64,
        provisional_id: u64,
    },
    /// 编辑确认后的内容回填
    ContentEdited {
        conversation_id: u64,
        message_id: u64,
        content: MessageContent,
    },
    /// 表态集合回填（添加/移除后的重拉结果）
    ReactionsMerged {
        conversation_id: u64,
        message_id: u64,
        reactions: Vec<Reaction>,
    },
    /// 清零某会话未读
    UnreadCleared { conversation_id: u64 },
    /// 保存草稿；空文本等价于删除
    DraftSaved {
        conversation_id: u64,
        text: String,
    },
    /// 丢弃草稿（发送成功后）
    DraftCleared { conversation_id: u64 },
    /// 视口位置变化
    ViewportChanged { at_bottom: bool },
}

impl ChatAction {
    /// 动作类型名（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            ChatAction::SessionEstablished { .. } => "session_established",
            ChatAction::ConversationsLoaded { .. } => "conversations_loaded",
            ChatAction::ConversationCreated { .. } => "conversation_created",
            ChatAction::ConversationSelected { .. } => "conversation_selected",
            ChatAction::TimelineLoaded { .. } => "timeline_loaded",
            ChatAction::RemoteMessageInserted { .. } => "remote_message_inserted",
            ChatAction::RemoteMessageUpdated { .. } => "remote_message_updated",
            ChatAction::RemoteMessageDeleted { .. } => "remote_message_deleted",
            ChatAction::ProfileChanged { .. } => "profile_changed",
            ChatAction::OptimisticQueued { .. } => "optimistic_queued",
            ChatAction::OptimisticConfirmed { .. } => "optimistic_confirmed",
            ChatAction::OptimisticFailed { .. } => "optimistic_failed",
            ChatAction::SendRetried { .. } => "send_retried",
            ChatAction::OptimisticDiscarded { .. } => "optimistic_discarded",
            ChatAction::ContentEdited { .. } => "content_edited",
            ChatAction::ReactionsMerged { .. } => "reactions_merged",
            ChatAction::UnreadCleared { .. } => "unread_cleared",
            ChatAction::DraftSaved { .. } => "draft_saved",
            ChatAction::DraftCleared { .. } => "draft_cleared",
            ChatAction::ViewportChanged { .. } => "viewport_changed",
        }
    }
}

/// 归约副作用
#[derive(Debug, Clone)]
pub enum StateEffect {
    /// 向订阅者广播一条 SDK 事件
    Emit(SdkEvent),
    /// 张贴一条瞬时通知（由通知板分配 ID 与过期时间）
    PostNotice { text: String },
}
