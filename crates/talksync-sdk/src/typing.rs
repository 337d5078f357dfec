//! 输入状态跟踪
//!
//! 跟踪"当前会话里谁正在输入"，三路输入汇到一张过期表：
//! - 本端击键：去抖后写远端 typing 行，静默 3 秒后自清
//! - 远端推送：typing 行的增删改，重置对应用户的 3 秒可见期
//! - 轮询兜底：每 3 秒按 `updated_at` 拉一次活跃行，整体替换可见集
//!
//! 自清与轮询任务都带代数守卫：被会话切换淘汰的定时器一律空转。

use crate::entities::TypingRow as RemoteTypingRow;
use crate::events::{event_builders, EventManager};
use crate::expiring::ExpiringMap;
use crate::platform::{ChangeOp, RemotePlatform};
use crate::utils::time::now_millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant};
use tracing::{debug, warn};

/// 输入状态参数
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TypingConfig {
    /// 本端信号去抖窗口
    pub debounce: Duration,
    /// 可见期与自清静默期
    pub expiry: Duration,
    /// 轮询周期
    pub poll_interval: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            expiry: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(3000),
        }
    }
}

struct Inner {
    platform: Arc<dyn RemotePlatform>,
    events: Arc<EventManager>,
    self_user_id: u64,
    config: TypingConfig,
    /// 当前跟踪的会话
    attached: Mutex<Option<u64>>,
    /// 可见的输入中用户（仅限 attached 会话）
    visible: Mutex<ExpiringMap<u64, ()>>,
    /// conversation_id -> 最近一次远端 upsert 的时刻（去抖）
    last_upsert: Mutex<HashMap<u64, Instant>>,
    /// 自清任务代数，新信号使旧的自清失效
    clear_generation: AtomicU64,
    /// 轮询任务代数，会话切换使后到的轮询结果作废
    poll_generation: AtomicU64,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn visible_snapshot(&self) -> Vec<u64> {
        let visible = self.visible.lock();
        let mut users: Vec<u64> = visible.iter_fresh().map(|(user_id, _)| *user_id).collect();
        users.sort_unstable();
        users
    }
}

/// 输入状态跟踪器
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<Inner>,
}

impl TypingTracker {
    pub fn new(
        platform: Arc<dyn RemotePlatform>,
        events: Arc<EventManager>,
        self_user_id: u64,
        config: TypingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                events,
                self_user_id,
                config,
                attached: Mutex::new(None),
                visible: Mutex::new(ExpiringMap::new(config.expiry)),
                last_upsert: Mutex::new(HashMap::new()),
                clear_generation: AtomicU64::new(0),
                poll_generation: AtomicU64::new(0),
                poll_handle: Mutex::new(None),
            }),
        }
    }

    /// 开始跟踪一个会话：重置可见集并启动轮询
    pub fn attach(&self, conversation_id: u64) {
        self.teardown_tasks();
        *self.inner.attached.lock() = Some(conversation_id);
        self.inner.visible.lock().clear();
        self.spawn_poll(conversation_id);
        debug!("typing tracker attached: conversation_id={}", conversation_id);
    }

    /// 停止跟踪：撤销定时器并尽力清掉自己的远端行
    pub async fn detach(&self) {
        let previous = self.inner.attached.lock().take();
        self.teardown_tasks();
        self.inner.visible.lock().clear();

        if let Some(conversation_id) = previous {
            let signaled = self.inner.last_upsert.lock().remove(&conversation_id).is_some();
            if signaled {
                if let Err(e) = self
                    .inner
                    .platform
                    .clear_typing(conversation_id, self.inner.self_user_id)
                    .await
                {
                    warn!("typing clear on detach failed: {}", e);
                }
            }
            debug!("typing tracker detached: conversation_id={}", conversation_id);
        }
    }

    fn teardown_tasks(&self) {
        self.inner.clear_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.poll_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.inner.poll_handle.lock().take() {
            handle.abort();
        }
    }

    /// 本端击键信号
    ///
    /// 每会话每去抖窗口至多一次远端 upsert；无论是否写远端，
    /// 自清计时总是从最后一次信号重新起算。
    pub async fn signal_local(&self, conversation_id: u64) {
        let should_upsert = {
            let mut last = self.inner.last_upsert.lock();
            match last.get(&conversation_id) {
                Some(at) if at.elapsed() < self.inner.config.debounce => false,
                _ => {
                    last.insert(conversation_id, Instant::now());
                    true
                }
            }
        };

        if should_upsert {
            let row = RemoteTypingRow {
                conversation_id,
                user_id: self.inner.self_user_id,
                updated_at: now_millis(),
            };
            if let Err(e) = self.inner.platform.upsert_typing(row).await {
                warn!("typing upsert failed: {}", e);
            }
        }

        self.schedule_self_clear(conversation_id);
    }

    fn schedule_self_clear(&self, conversation_id: u64) {
        let generation = self.inner.clear_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            sleep(inner.config.expiry).await;
            if inner.clear_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            inner.last_upsert.lock().remove(&conversation_id);
            if let Err(e) = inner
                .platform
                .clear_typing(conversation_id, inner.self_user_id)
                .await
            {
                warn!("typing self-clear failed: {}", e);
            }
        });
    }

    /// 远端 typing 行变更
    ///
    /// 只接受 attached 会话的行；自己的行一律排除。
    /// Insert/Update 重置该用户的完整可见期，Delete 立即移除。
    pub async fn handle_remote_event(&self, op: ChangeOp, row: &RemoteTypingRow) {
        if *self.inner.attached.lock() != Some(row.conversation_id) {
            debug!(
                "typing row for non-active conversation dropped: {}",
                row.conversation_id
            );
            return;
        }
        if row.user_id == self.inner.self_user_id {
            return;
        }

        let (changed, users) = {
            let before = self.inner.visible_snapshot();
            {
                let mut visible = self.inner.visible.lock();
                match op {
                    ChangeOp::Delete => {
                        visible.remove(&row.user_id);
                    }
                    ChangeOp::Insert | ChangeOp::Update => {
                        visible.insert(row.user_id, ());
                    }
                }
            }
            let after = self.inner.visible_snapshot();
            (before != after, after)
        };

        if changed {
            self.inner
                .events
                .emit(event_builders::typing_changed(row.conversation_id, users))
                .await;
        }
    }

    /// 当前会话里正在输入的用户（升序，不含自己，不含已过期）
    pub fn typing_users(&self, conversation_id: u64) -> Vec<u64> {
        if *self.inner.attached.lock() != Some(conversation_id) {
            return Vec::new();
        }
        self.inner.visible_snapshot()
    }

    fn spawn_poll(&self, conversation_id: u64) {
        let generation = self.inner.poll_generation.load(Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(inner.config.poll_interval);
            ticker.tick().await; // interval 的首次 tick 立即完成，轮询从一个周期后开始

            loop {
                ticker.tick().await;
                if inner.poll_generation.load(Ordering::SeqCst) != generation {
                    return;
                }

                let since = now_millis() - inner.config.expiry.as_millis() as i64;
                let rows = match inner
                    .platform
                    .fetch_typing_since(conversation_id, since)
                    .await
                {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!("typing poll failed: {}", e);
                        continue;
                    }
                };
                // 拉取期间可能已切换会话，结果在应用点作废
                if inner.poll_generation.load(Ordering::SeqCst) != generation {
                    return;
                }

                let before = inner.visible_snapshot();
                {
                    let mut visible = inner.visible.lock();
                    visible.replace_all(
                        rows.iter()
                            .filter(|row| row.user_id != inner.self_user_id)
                            .map(|row| (row.user_id, ())),
                    );
                }
                let after = inner.visible_snapshot();
                if before != after {
                    inner
                        .events
                        .emit(event_builders::typing_changed(conversation_id, after))
                        .await;
                }
            }
        });
        *self.inner.poll_handle.lock() = Some(handle);
    }
}
