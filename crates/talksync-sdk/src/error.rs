//! SDK 错误类型定义
//!
//! 错误处理原则：
//! - 远端调用失败返回 `Err`，本地状态保持上一次一致快照，不会半更新
//! - 数据形状缺损（如发送者资料缺失）降级处理，不作为错误抛出
//! - 输入状态上报失败只记日志（尽力而为），不打断调用方

use thiserror::Error;

/// 附件校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    /// 超出大小上限（字节）
    #[error("attachment too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    /// 扩展名不在白名单内
    #[error("attachment type not allowed: .{extension}")]
    UnsupportedType { extension: String },
}

#[derive(Debug, Error)]
pub enum TalksyncError {
    /// 远端平台调用失败（瞬态，可重试）
    #[error("platform error: {0}")]
    Platform(String),

    /// 推送通道已关闭
    #[error("push channel closed")]
    ChannelClosed,

    /// SDK 尚未连接（无会话）
    #[error("not connected")]
    NotConnected,

    /// 引用了本地未知的会话
    #[error("unknown conversation: {0}")]
    UnknownConversation(u64),

    /// 当前状态下不允许的操作
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// 附件校验失败
    #[error("attachment rejected: {0}")]
    Attachment(#[from] AttachmentError),

    /// 配置错误
    #[error("config error: {0}")]
    Config(String),

    /// 序列化/反序列化失败
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SDK 内部错误
    #[error("internal error: {0}")]
    Internal(String),
}

impl TalksyncError {
    /// 是否为瞬态错误（重试可能成功）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TalksyncError::Platform(_) | TalksyncError::ChannelClosed
        )
    }

    /// 从任意平台侧错误构造 `Platform` 变体
    pub fn platform<E: std::fmt::Display>(e: E) -> Self {
        TalksyncError::Platform(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TalksyncError>;
