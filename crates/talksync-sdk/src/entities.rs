//! 数据实体定义 - 对应远端数据表结构
//!
//! 这里定义了远端表对应的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 统一的状态表示
//! - 序列化/反序列化支持
//!
//! 所有 ID 都是 u64（与服务端一致），时间戳都是毫秒（i64）。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 预览文本的最大字符数（超出部分截断为 `…`）
pub const PREVIEW_MAX_CHARS: usize = 30;

/// 成员资料缺失时的占位用户名
pub const UNKNOWN_USER: &str = "Unknown User";

/// 群聊未命名时的占位名称
pub const UNNAMED_GROUP: &str = "Unnamed Group";

/// 用户在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    #[default]
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }

    /// 状态图标（🟢 在线 / 🟡 离开 / 🔴 忙碌 / ⚫ 离线）
    pub fn icon(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "🟢",
            PresenceStatus::Away => "🟡",
            PresenceStatus::Busy => "🔴",
            PresenceStatus::Offline => "⚫",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 用户资料实体 - 对应 profiles 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: u64,  // u64，与服务端一致
    pub username: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    pub last_seen: Option<i64>,  // 毫秒时间戳
    /// 首次登录后是否已完成资料设置
    #[serde(default)]
    pub has_completed_setup: bool,
}

impl Profile {
    /// 资料缺失时的占位资料（用户名为 "Unknown User"）
    pub fn placeholder(id: u64) -> Self {
        Self {
            id,
            username: UNKNOWN_USER.to_string(),
            email: None,
            avatar_url: None,
            status: PresenceStatus::Offline,
            last_seen: None,
            has_completed_setup: false,
        }
    }

    /// 合并远端变更：覆盖展示字段，保留本地没有新值的字段
    pub fn merge_from(&mut self, other: &Profile) {
        self.username = other.username.clone();
        if other.email.is_some() {
            self.email = other.email.clone();
        }
        self.avatar_url = other.avatar_url.clone();
        self.status = other.status;
        if other.last_seen.is_some() {
            self.last_seen = other.last_seen;
        }
        self.has_completed_setup = other.has_completed_setup;
    }
}

/// 消息内容（带类型标签的联合体）
///
/// 附件的 `name` 是原始文件名，`url` 是平台签发的公开地址。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text { body: String },
    Image { name: String, url: String },
    Document { name: String, url: String },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text { body: body.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::Text { .. } => MessageKind::Text,
            MessageContent::Image { .. } => MessageKind::Image,
            MessageContent::Document { .. } => MessageKind::Document,
        }
    }

    /// 会话列表里的预览文本：正文截断到 PREVIEW_MAX_CHARS，附件显示占位符
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { body } => truncate_chars(body, PREVIEW_MAX_CHARS),
            MessageContent::Image { .. } => "📷 Image".to_string(),
            MessageContent::Document { .. } => "📎 Document".to_string(),
        }
    }
}

/// 消息内容种类（不携带数据的判别标签）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Document,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Document => "document",
        };
        write!(f, "{}", s)
    }
}

/// 消息投递状态
///
/// 远端推送/拉取到的行总是 `Delivered`；`Pending`/`Failed` 只出现在
/// 本端乐观写入的条目上。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    #[default]
    Delivered,
    Pending,
    Failed,
}

/// 表情反馈实体 - 对应 message_reactions 表
///
/// 约束：同一条消息上 (user_id, emoji) 至多一条。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: u64,  // u64，与服务端一致
    pub emoji: String,
}

/// 消息实体 - 对应 messages 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,  // u64，与服务端一致；乐观条目上是本端临时 ID
    pub conversation_id: u64,
    pub sender_id: u64,
    /// 发送者资料快照（联表取回；缺失时展示层降级为占位资料）
    pub sender: Option<Profile>,
    pub content: MessageContent,
    pub created_at: i64,  // 毫秒时间戳（与服务端一致）
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub delivery: DeliveryState,
    /// 客户端消息编号（client_tag）
    ///
    /// ⚠️ 重要：client_tag 设计原则
    ///
    /// client_tag is a local transport identifier,
    /// it MUST NOT be persisted, synced, or relied on across devices.
    ///
    /// - 作用域：仅发送端本地
    /// - 用途：乐观条目与服务端回执的收敛匹配、失败回滚
    /// - 远端来源的行恒为 0
    #[serde(default)]
    pub client_tag: u64,
}

impl Message {
    /// 时间线排序键：(created_at, id) 升序
    pub fn ordering_key(&self) -> (i64, u64) {
        (self.created_at, self.id)
    }

    /// 发送者用户名（缺失时返回占位名）
    pub fn sender_username(&self) -> &str {
        self.sender
            .as_ref()
            .map(|p| p.username.as_str())
            .unwrap_or(UNKNOWN_USER)
    }

    /// 生成会话列表用的最后一条消息摘要
    pub fn to_summary(&self) -> LastMessage {
        LastMessage {
            message_id: self.id,
            sender_id: self.sender_id,
            sender_username: self.sender_username().to_string(),
            kind: self.content.kind(),
            preview: self.content.preview(),
            created_at: self.created_at,
        }
    }
}

/// 会话最后一条消息的反规范化摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub message_id: u64,
    pub sender_id: u64,
    pub sender_username: String,
    pub kind: MessageKind,
    pub preview: String,
    pub created_at: i64,  // 毫秒时间戳
}

impl LastMessage {
    /// 展示用预览：自己发的消息加 "You: " 前缀
    pub fn display_preview(&self, self_user_id: u64) -> String {
        if self.sender_id == self_user_id {
            format!("You: {}", self.preview)
        } else {
            self.preview.clone()
        }
    }
}

/// 会话实体 - 对应 chats 表（含联表取回的成员资料）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: u64,  // u64，与服务端一致
    /// 群聊名称；单聊为 None
    pub name: Option<String>,
    pub is_group: bool,
    pub created_at: i64,  // 毫秒时间戳
    pub created_by: u64,
    /// 成员资料快照（含本人）
    #[serde(default)]
    pub members: Vec<Profile>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    /// 排序时间戳：最后一条消息时间与创建时间取较大者
    pub fn sort_timestamp(&self) -> i64 {
        match &self.last_message {
            Some(last) => last.created_at.max(self.created_at),
            None => self.created_at,
        }
    }

    /// 展示名称：群聊用 name（缺省 "Unnamed Group"）；
    /// 单聊用对方用户名（缺省 "Unknown User"）
    pub fn display_name(&self, self_user_id: u64) -> String {
        if self.is_group {
            return match &self.name {
                Some(name) if !name.is_empty() => name.clone(),
                _ => UNNAMED_GROUP.to_string(),
            };
        }
        self.members
            .iter()
            .find(|p| p.id != self_user_id)
            .map(|p| p.username.clone())
            .unwrap_or_else(|| UNKNOWN_USER.to_string())
    }

    /// 查找成员资料
    pub fn member(&self, user_id: u64) -> Option<&Profile> {
        self.members.iter().find(|p| p.id == user_id)
    }
}

/// 输入状态行 - 对应 typing_indicators 表
///
/// 主键 (conversation_id, user_id)，upsert 冲突时覆盖 updated_at。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingRow {
    pub conversation_id: u64,
    pub user_id: u64,
    pub updated_at: i64,  // 毫秒时间戳
}

/// 按字符数截断，超出时以 `…` 结尾
fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}
