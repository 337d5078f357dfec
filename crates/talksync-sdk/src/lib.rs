//! Talksync SDK - 实时会话状态同步 SDK
//!
//! 把远端权威存储里的聊天数据同步成本地可直接渲染的状态树，包括：
//! - 💬 会话列表与消息时间线的实时调和（去重、排序、摘要）
//! - 🚀 乐观发送：先显示后确认，失败可重试、可丢弃
//! - 📡 推送订阅生命周期：断链自动指数退避重建
//! - ⌨️ 输入状态指示：本端去抖上报、远端过期淘汰、轮询兜底
//! - 🔔 未读计数、草稿、瞬时通知
//! - ⚙️ 统一事件流：界面层只需订阅 `SdkEvent`
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use talksync_sdk::platform::memory::MemoryPlatform;
//! use talksync_sdk::{SortMode, TalksyncConfig, TalksyncSdk};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let platform = MemoryPlatform::new();
//!     let user = platform.register_user("alice", Some("alice@example.com"));
//!     platform.sign_in(user);
//!
//!     let sdk = TalksyncSdk::initialize(Arc::new(platform), TalksyncConfig::default()).await?;
//!     sdk.connect().await?;
//!
//!     // 订阅事件流（消息、未读、输入状态……）
//!     let mut events = sdk.subscribe_events();
//!
//!     // 浏览会话并发送消息
//!     if let Some(conversation) = sdk.conversations(SortMode::Recency).first() {
//!         sdk.select_conversation(Some(conversation.id)).await?;
//!         sdk.send_text(conversation.id, "Hello!").await?;
//!     }
//!
//!     while let Ok(event) = events.try_recv() {
//!         println!("event: {}", event.event_type());
//!     }
//!
//!     sdk.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod dedup;
pub mod entities;
pub mod error;
pub mod events;
pub mod expiring;
pub mod notify;
pub mod platform;
pub mod presence;
pub mod reconcile;
pub mod sdk;
pub mod store;
pub mod subscription;
pub mod typing;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use error::{AttachmentError, Result, TalksyncError};
pub use sdk::{AttachmentLimits, TalksyncConfig, TalksyncConfigBuilder, TalksyncSdk};
pub use entities::{
    Conversation, DeliveryState, LastMessage, Message, MessageContent, MessageKind,
    PresenceStatus, Profile, Reaction, TypingRow,
};
pub use events::{
    event_builders, EventFilter, EventManager, EventStats, FilteredEventReceiver, SdkEvent,
};
pub use platform::{
    AttachmentUpload, AuthSession, ChangeEvent, ChangeFilter, ChangeOp, ChannelStatus,
    MessagePatch, NewConversation, NewMessage, ProfilePatch, PushChannel, RemotePlatform,
    TableRow,
};
pub use dedup::{FingerprintStats, FingerprintStore};
pub use expiring::ExpiringMap;
pub use notify::{Notice, NoticeBoard};
pub use presence::OwnPresence;
pub use reconcile::SortMode;
pub use store::{ChatAction, ChatState, StateEffect, StateStats, StateStore};
pub use subscription::{BackoffPolicy, RoutedEvent, SubscriptionManager, SubscriptionState};
pub use typing::{TypingConfig, TypingTracker};
pub use version::SDK_VERSION;
