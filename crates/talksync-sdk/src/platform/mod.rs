//! 远端平台接口 - 权威存储的黑盒抽象
//!
//! SDK 不关心传输与存储细节，只通过本接口：
//! - 拉取/变更数据（会话、消息、输入状态、资料、表情反馈）
//! - 订阅数据变更推送（单一推送通道，携带行级变更事件）
//!
//! 认证协议、持久化、SQL、网络传输都是平台实现的内部事务。
//! 订阅/过滤/行变更的形状参照 Postgres 行级变更推送的惯例：
//! 每个事件是 (操作, 表行)，消息按会话集合过滤，输入状态按活跃会话过滤，
//! 资料变更不过滤。

pub mod memory;

use crate::entities::{Conversation, Message, MessageContent, Profile, TypingRow};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

/// 登录会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: u64,
    pub email: Option<String>,
}

/// 行级变更操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// 变更事件携带的表行
///
/// 推送行是"裸行"：消息行不含联表取回的发送者资料，
/// 消费侧需要时自行按 ID 补取。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableRow {
    Message(Message),
    Typing(TypingRow),
    Profile(Profile),
}

/// 行级变更事件
///
/// `row` 携带路由所需的权威行：Insert/Update 是新行，Delete 是被删的行
/// （平台至少保证主键字段）。`old_row` 是 Update 的前像，平台可能不提供。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub row: TableRow,
    pub old_row: Option<TableRow>,
}

impl ChangeEvent {
    pub fn insert(row: TableRow) -> Self {
        Self {
            op: ChangeOp::Insert,
            row,
            old_row: None,
        }
    }

    pub fn update(row: TableRow, old_row: Option<TableRow>) -> Self {
        Self {
            op: ChangeOp::Update,
            row,
            old_row,
        }
    }

    pub fn delete(row: TableRow) -> Self {
        Self {
            op: ChangeOp::Delete,
            row,
            old_row: None,
        }
    }
}

/// 推送过滤器
///
/// - 消息行：只推送 `conversation_ids` 内的会话
/// - 输入状态行：只推送 `typing_conversation_id` 指定的会话；None 表示不订阅
/// - 资料行：恒推送
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub conversation_ids: Vec<u64>,
    pub typing_conversation_id: Option<u64>,
}

impl ChangeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_in(mut self, conversation_ids: Vec<u64>) -> Self {
        self.conversation_ids = conversation_ids;
        self
    }

    pub fn typing_in(mut self, conversation_id: Option<u64>) -> Self {
        self.typing_conversation_id = conversation_id;
        self
    }

    /// 事件是否落在过滤器内
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match &event.row {
            TableRow::Message(message) => {
                self.conversation_ids.contains(&message.conversation_id)
            }
            TableRow::Typing(row) => self.typing_conversation_id == Some(row.conversation_id),
            TableRow::Profile(_) => true,
        }
    }
}

/// 推送通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// 握手中
    Pending,
    /// 活跃，事件正在推送
    Active,
    /// 已正常关闭
    Closed,
    /// 异常断开
    Errored,
}

/// 推送通道
///
/// 事件流单消费者；`status` 是可观察的通道状态。
/// 丢弃本结构即放弃消费，平台侧应在 `unsubscribe` 时关闭发送端。
#[derive(Debug)]
pub struct PushChannel {
    pub channel_id: String,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    status: watch::Receiver<ChannelStatus>,
}

impl PushChannel {
    pub fn new(
        channel_id: String,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        status: watch::Receiver<ChannelStatus>,
    ) -> Self {
        Self {
            channel_id,
            events,
            status,
        }
    }

    /// 接收下一个变更事件；通道关闭时返回 None
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// 当前通道状态
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// 通道状态观察流
    pub fn status_stream(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }
}

/// 新消息写入请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: u64,
    pub sender_id: u64,
    pub content: MessageContent,
    /// 客户端幂等标记，平台需在返回行中原样回显
    pub client_tag: u64,
}

/// 新会话创建请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    /// 群聊名称；单聊为 None
    pub name: Option<String>,
    pub is_group: bool,
    pub created_by: u64,
    /// 成员用户 ID（含创建者）
    pub member_ids: Vec<u64>,
}

/// 消息变更请求（编辑）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub conversation_id: u64,
    pub message_id: u64,
    pub content: Option<MessageContent>,
    pub edited: bool,
}

/// 资料变更请求（None 字段表示不改动）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    pub user_id: u64,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub status: Option<crate::entities::PresenceStatus>,
    pub last_seen: Option<i64>,
    pub has_completed_setup: Option<bool>,
}

/// 附件上传请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentUpload {
    pub conversation_id: u64,
    /// 原始文件名（含扩展名）
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl AttachmentUpload {
    /// 小写扩展名（无扩展名时为空串）
    pub fn extension(&self) -> String {
        self.file_name
            .rsplit('.')
            .next()
            .filter(|ext| *ext != self.file_name.as_str())
            .unwrap_or("")
            .to_ascii_lowercase()
    }

    /// 按 MIME 判断是否图片（决定消息内容走 Image 还是 Document）
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// 远端平台接口
///
/// 所有方法都可能因网络/服务端原因失败，失败时返回 `Platform` 错误，
/// SDK 侧保证不半更新本地状态。
#[async_trait]
pub trait RemotePlatform: Send + Sync {
    /// 当前登录会话；None 表示未登录
    async fn current_session(&self) -> Option<AuthSession>;

    // === 资料 ===

    async fn fetch_profile(&self, user_id: u64) -> Result<Option<Profile>>;

    /// 创建资料行（首次登录补建）
    async fn create_profile(&self, profile: Profile) -> Result<Profile>;

    async fn update_profile(&self, patch: ProfilePatch) -> Result<Profile>;

    // === 会话 ===

    /// 用户是成员的全部会话 ID（订阅过滤器用）
    async fn member_conversations(&self, user_id: u64) -> Result<Vec<u64>>;

    /// 拉取用户的会话列表（含成员资料与最后一条消息）
    async fn fetch_conversations(&self, user_id: u64) -> Result<Vec<Conversation>>;

    /// 创建会话，返回带成员资料的完整行
    async fn create_conversation(&self, new_conversation: NewConversation)
        -> Result<Conversation>;

    // === 消息 ===

    /// 拉取某会话全部消息（含发送者资料与表情反馈），created_at 升序
    async fn fetch_messages(&self, conversation_id: u64) -> Result<Vec<Message>>;

    /// 按 ID 补取单条消息（含发送者资料）
    async fn fetch_message(&self, message_id: u64) -> Result<Option<Message>>;

    /// 写入消息，返回服务端权威行（回显 client_tag）
    async fn insert_message(&self, new_message: NewMessage) -> Result<Message>;

    async fn update_message(&self, patch: MessagePatch) -> Result<()>;

    async fn delete_message(&self, conversation_id: u64, message_id: u64) -> Result<()>;

    /// 上传附件，返回公开访问 URL
    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<String>;

    // === 输入状态 ===

    /// upsert (conversation_id, user_id) 行，冲突时覆盖 updated_at
    async fn upsert_typing(&self, row: TypingRow) -> Result<()>;

    async fn clear_typing(&self, conversation_id: u64, user_id: u64) -> Result<()>;

    /// 拉取 updated_at > since 的输入状态行（轮询兜底用）
    async fn fetch_typing_since(
        &self,
        conversation_id: u64,
        since_millis: i64,
    ) -> Result<Vec<TypingRow>>;

    // === 表情反馈 ===

    async fn add_reaction(&self, message_id: u64, user_id: u64, emoji: &str) -> Result<()>;

    async fn remove_reaction(&self, message_id: u64, user_id: u64, emoji: &str) -> Result<()>;

    // === 推送 ===

    /// 建立推送通道
    async fn subscribe(&self, filter: ChangeFilter) -> Result<PushChannel>;

    /// 撤销推送通道（按通道 ID）
    async fn unsubscribe(&self, channel_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::MessageContent;

    fn message_event(conversation_id: u64) -> ChangeEvent {
        ChangeEvent::insert(TableRow::Message(Message {
            id: 1,
            conversation_id,
            sender_id: 2,
            sender: None,
            content: MessageContent::text("hi"),
            created_at: 1000,
            edited: false,
            reactions: vec![],
            delivery: Default::default(),
            client_tag: 0,
        }))
    }

    #[test]
    fn test_filter_matches_messages_by_membership() {
        let filter = ChangeFilter::new().messages_in(vec![1, 2]);
        assert!(filter.matches(&message_event(1)));
        assert!(!filter.matches(&message_event(3)));
    }

    #[test]
    fn test_filter_matches_typing_by_active_conversation() {
        let filter = ChangeFilter::new().typing_in(Some(7));
        let event = ChangeEvent::update(
            TableRow::Typing(TypingRow {
                conversation_id: 7,
                user_id: 3,
                updated_at: 1000,
            }),
            None,
        );
        assert!(filter.matches(&event));

        let other = ChangeEvent::update(
            TableRow::Typing(TypingRow {
                conversation_id: 8,
                user_id: 3,
                updated_at: 1000,
            }),
            None,
        );
        assert!(!filter.matches(&other));
        assert!(!ChangeFilter::new().matches(&other));
    }

    #[test]
    fn test_profiles_always_pass_filter() {
        let filter = ChangeFilter::new();
        let event = ChangeEvent::update(TableRow::Profile(Profile::placeholder(9)), None);
        assert!(filter.matches(&event));
    }

    #[test]
    fn test_attachment_extension() {
        let upload = AttachmentUpload {
            conversation_id: 1,
            file_name: "Report.Final.PDF".to_string(),
            mime_type: "application/pdf".to_string(),
            data: vec![0u8; 16],
        };
        assert_eq!(upload.extension(), "pdf");
        assert!(!upload.is_image());

        let no_ext = AttachmentUpload {
            conversation_id: 1,
            file_name: "README".to_string(),
            mime_type: "text/plain".to_string(),
            data: vec![],
        };
        assert_eq!(no_ext.extension(), "");
    }
}
