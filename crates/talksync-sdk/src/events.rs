//! 事件系统模块 - 状态同步结果的对外出口
//!
//! 归约器应用变更后，由门面层把结果以事件形式广播给 UI/业务层：
//! - 时间线变化（新消息、编辑、删除、重载）
//! - 会话列表变化（排序、未读数）
//! - 输入状态、在线状态变化
//! - 订阅通道状态变化
//! - 滚动请求、瞬时通知、发送失败
//!
//! 支持广播订阅和带过滤器的订阅两种消费方式。

use crate::entities::{Message, PresenceStatus};
use crate::subscription::SubscriptionState;
use crate::utils::time::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SdkEvent {
    /// 新消息已应用到时间线
    MessageReceived { message: Message },
    /// 时间线上的消息被更新（编辑等）
    MessageUpdated {
        conversation_id: u64,
        message_id: u64,
        timestamp: i64,
    },
    /// 时间线上的消息被删除
    MessageDeleted {
        conversation_id: u64,
        message_id: u64,
        timestamp: i64,
    },
    /// 时间线整体重载（切换会话 / 拉取完成）
    TimelineReset {
        conversation_id: u64,
        message_count: usize,
        timestamp: i64,
    },
    /// 会话列表发生变化（新会话、排序、摘要更新）
    ConversationListChanged { timestamp: i64 },
    /// 某会话未读数变更
    UnreadChanged {
        conversation_id: u64,
        unread_count: u32,
        timestamp: i64,
    },
    /// 某会话的"正在输入"集合变更
    TypingChanged {
        conversation_id: u64,
        user_ids: Vec<u64>,
        timestamp: i64,
    },
    /// 用户在线状态变更
    PresenceChanged {
        user_id: u64,
        status: PresenceStatus,
        timestamp: i64,
    },
    /// 推送订阅状态变更
    SubscriptionStateChanged {
        old_state: SubscriptionState,
        new_state: SubscriptionState,
        timestamp: i64,
    },
    /// 视图应滚动到底部（仅当此前就停在底部时发出）
    ScrollToBottom {
        conversation_id: u64,
        timestamp: i64,
    },
    /// 瞬时通知（几秒后自动消失）
    NoticePosted {
        notice_id: u64,
        text: String,
        timestamp: i64,
    },
    /// 乐观发送失败（条目已标记 Failed，等待用户重试或丢弃）
    MessageSendFailed {
        conversation_id: u64,
        provisional_id: u64,
        error: String,
        timestamp: i64,
    },
}

impl SdkEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SdkEvent::MessageReceived { .. } => "message_received",
            SdkEvent::MessageUpdated { .. } => "message_updated",
            SdkEvent::MessageDeleted { .. } => "message_deleted",
            SdkEvent::TimelineReset { .. } => "timeline_reset",
            SdkEvent::ConversationListChanged { .. } => "conversation_list_changed",
            SdkEvent::UnreadChanged { .. } => "unread_changed",
            SdkEvent::TypingChanged { .. } => "typing_changed",
            SdkEvent::PresenceChanged { .. } => "presence_changed",
            SdkEvent::SubscriptionStateChanged { .. } => "subscription_state_changed",
            SdkEvent::ScrollToBottom { .. } => "scroll_to_bottom",
            SdkEvent::NoticePosted { .. } => "notice_posted",
            SdkEvent::MessageSendFailed { .. } => "message_send_failed",
        }
    }

    /// 获取事件关联的会话 ID
    pub fn conversation_id(&self) -> Option<u64> {
        match self {
            SdkEvent::MessageReceived { message } => Some(message.conversation_id),
            SdkEvent::MessageUpdated {
                conversation_id, ..
            } => Some(*conversation_id),
            SdkEvent::MessageDeleted {
                conversation_id, ..
            } => Some(*conversation_id),
            SdkEvent::TimelineReset {
                conversation_id, ..
            } => Some(*conversation_id),
            SdkEvent::UnreadChanged {
                conversation_id, ..
            } => Some(*conversation_id),
            SdkEvent::TypingChanged {
                conversation_id, ..
            } => Some(*conversation_id),
            SdkEvent::ScrollToBottom {
                conversation_id, ..
            } => Some(*conversation_id),
            SdkEvent::MessageSendFailed {
                conversation_id, ..
            } => Some(*conversation_id),
            _ => None,
        }
    }

    /// 获取事件相关的用户 ID
    pub fn user_id(&self) -> Option<u64> {
        match self {
            SdkEvent::MessageReceived { message } => Some(message.sender_id),
            SdkEvent::PresenceChanged { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    /// 获取事件时间戳（毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SdkEvent::MessageReceived { message } => message.created_at,
            SdkEvent::MessageUpdated { timestamp, .. } => *timestamp,
            SdkEvent::MessageDeleted { timestamp, .. } => *timestamp,
            SdkEvent::TimelineReset { timestamp, .. } => *timestamp,
            SdkEvent::ConversationListChanged { timestamp } => *timestamp,
            SdkEvent::UnreadChanged { timestamp, .. } => *timestamp,
            SdkEvent::TypingChanged { timestamp, .. } => *timestamp,
            SdkEvent::PresenceChanged { timestamp, .. } => *timestamp,
            SdkEvent::SubscriptionStateChanged { timestamp, .. } => *timestamp,
            SdkEvent::ScrollToBottom { timestamp, .. } => *timestamp,
            SdkEvent::NoticePosted { timestamp, .. } => *timestamp,
            SdkEvent::MessageSendFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 会话 ID 过滤器
    pub conversation_ids: Option<Vec<u64>>,
    /// 用户 ID 过滤器
    pub user_ids: Option<Vec<u64>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 添加会话 ID 过滤
    pub fn with_conversation_ids(mut self, conversation_ids: Vec<u64>) -> Self {
        self.conversation_ids = Some(conversation_ids);
        self
    }

    /// 添加用户 ID 过滤
    pub fn with_user_ids(mut self, user_ids: Vec<u64>) -> Self {
        self.user_ids = Some(user_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SdkEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref conversation_ids) = self.conversation_ids {
            match event.conversation_id() {
                Some(id) if conversation_ids.contains(&id) => {}
                // 事件没有会话 ID 但过滤器要求有
                _ => return false,
            }
        }

        if let Some(ref user_ids) = self.user_ids {
            match event.user_id() {
                Some(id) if user_ids.contains(&id) => {}
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SdkEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间（毫秒）
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SdkEvent>,
    /// 事件监听器映射（event_type -> listeners，"*" 为通配）
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SdkEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 广播事件（无订阅者时 send 会失败，属正常场景，仅打 debug）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }

    /// 订阅并按过滤器筛选
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器（event_type 传 "*" 表示监听全部）
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SdkEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SdkEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SdkEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SdkEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SdkEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    /// 创建输入状态变更事件
    pub fn typing_changed(conversation_id: u64, user_ids: Vec<u64>) -> SdkEvent {
        SdkEvent::TypingChanged {
            conversation_id,
            user_ids,
            timestamp: now_millis(),
        }
    }

    /// 创建未读数变更事件
    pub fn unread_changed(conversation_id: u64, unread_count: u32) -> SdkEvent {
        SdkEvent::UnreadChanged {
            conversation_id,
            unread_count,
            timestamp: now_millis(),
        }
    }

    /// 创建在线状态变更事件
    pub fn presence_changed(user_id: u64, status: PresenceStatus) -> SdkEvent {
        SdkEvent::PresenceChanged {
            user_id,
            status,
            timestamp: now_millis(),
        }
    }

    /// 创建订阅状态变更事件
    pub fn subscription_state_changed(
        old_state: SubscriptionState,
        new_state: SubscriptionState,
    ) -> SdkEvent {
        SdkEvent::SubscriptionStateChanged {
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }

    /// 创建会话列表变更事件
    pub fn conversation_list_changed() -> SdkEvent {
        SdkEvent::ConversationListChanged {
            timestamp: now_millis(),
        }
    }

    /// 创建发送失败事件
    pub fn message_send_failed(
        conversation_id: u64,
        provisional_id: u64,
        error: String,
    ) -> SdkEvent {
        SdkEvent::MessageSendFailed {
            conversation_id,
            provisional_id,
            error,
            timestamp: now_millis(),
        }
    }
}
