//! 瞬时通知板
//!
//! 面向嵌入方的即发即弃通知（发送失败、上传校验不通过等），
//! 张贴后 3 秒自动消失。消失靠过期表的惰性淘汰，无后台任务。

use crate::events::{EventManager, SdkEvent};
use crate::expiring::ExpiringMap;
use crate::utils::time::now_millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

/// 一条瞬时通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: u64,
    pub text: String,
    pub posted_at: i64,
}

/// 通知板
pub struct NoticeBoard {
    notices: Mutex<ExpiringMap<u64, Notice>>,
    next_id: AtomicU64,
    events: Arc<EventManager>,
}

impl NoticeBoard {
    pub fn new(ttl: Duration, events: Arc<EventManager>) -> Self {
        Self {
            notices: Mutex::new(ExpiringMap::new(ttl)),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// 张贴通知，返回通知 ID
    pub async fn post(&self, text: impl Into<String>) -> u64 {
        let text = text.into();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let notice = Notice {
            id,
            text: text.clone(),
            posted_at: now_millis(),
        };
        self.notices.lock().insert(id, notice);
        debug!("notice posted: id={} text={}", id, text);

        self.events
            .emit(SdkEvent::NoticePosted {
                notice_id: id,
                text,
                timestamp: now_millis(),
            })
            .await;
        id
    }

    /// 当前未过期的通知，按张贴顺序
    pub fn active(&self) -> Vec<Notice> {
        let notices = self.notices.lock();
        let mut list: Vec<Notice> = notices.iter_fresh().map(|(_, n)| n.clone()).collect();
        list.sort_by_key(|n| n.id);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn board() -> NoticeBoard {
        NoticeBoard::new(Duration::from_millis(3000), Arc::new(EventManager::new(16)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_notices_expire_after_ttl() {
        let board = board();
        board.post("first").await;
        advance(Duration::from_millis(1000)).await;
        board.post("second").await;

        let texts: Vec<String> = board.active().iter().map(|n| n.text.clone()).collect();
        assert_eq!(texts, vec!["first", "second"]);

        // first 在 3 秒整点过期，second 还剩 1 秒
        advance(Duration::from_millis(2100)).await;
        let texts: Vec<String> = board.active().iter().map(|n| n.text.clone()).collect();
        assert_eq!(texts, vec!["second"]);

        advance(Duration::from_millis(1000)).await;
        assert!(board.active().is_empty());
    }

    #[tokio::test]
    async fn test_post_emits_event() {
        let events = Arc::new(EventManager::new(16));
        let board = NoticeBoard::new(Duration::from_millis(3000), Arc::clone(&events));
        let mut receiver = events.subscribe();

        let id = board.post("hello").await;

        match receiver.try_recv().unwrap() {
            SdkEvent::NoticePosted { notice_id, text, .. } => {
                assert_eq!(notice_id, id);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
