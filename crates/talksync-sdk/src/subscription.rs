//! 订阅生命周期管理
//!
//! 持有唯一一条活跃推送通道。过滤器变化（登录、切换会话、加入新会话）
//! 触发重建：撤旧通道、起新通道、换泵任务。通道异常断开进入 Error，
//! 按指数退避自动重建（1s 起步、2 倍递增、30s 封顶、成功即复位）。
//!
//! 泵任务把行级变更按 (实体, 操作) 分类成 `RoutedEvent` 交给门面路由；
//! 代数守卫保证被替换的泵、过期的退避定时器全部空转。

use crate::entities::{Message, Profile, TypingRow};
use crate::events::{event_builders, EventManager};
use crate::platform::{ChangeEvent, ChangeFilter, ChangeOp, PushChannel, RemotePlatform, TableRow};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// 订阅状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// 无通道
    Unsubscribed,
    /// 建链中
    Subscribing,
    /// 通道活跃，事件正在流动
    Subscribed,
    /// 通道异常，退避重建排期中
    Error,
}

/// 分类后的推送事件
#[derive(Debug, Clone)]
pub enum RoutedEvent {
    Message { op: ChangeOp, row: Message },
    Typing { op: ChangeOp, row: TypingRow },
    /// 资料只路由 UPDATE；INSERT/DELETE 对状态树无意义
    Profile { row: Profile },
}

/// 按 (实体, 操作) 分类；不可路由的组合返回 None
pub fn classify(event: ChangeEvent) -> Option<RoutedEvent> {
    match event.row {
        TableRow::Message(row) => Some(RoutedEvent::Message { op: event.op, row }),
        TableRow::Typing(row) => Some(RoutedEvent::Typing { op: event.op, row }),
        TableRow::Profile(row) => match event.op {
            ChangeOp::Update => Some(RoutedEvent::Profile { row }),
            op => {
                debug!("unroutable profile event dropped: {:?}", op);
                None
            }
        },
    }
}

/// 指数退避参数
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            factor: 2.0,
            cap: Duration::from_millis(30_000),
        }
    }
}

impl BackoffPolicy {
    /// 第 attempt 次（从 0 起）失败后的等待时长
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.powi(attempt.min(63) as i32);
        let millis = (self.base.as_millis() as f64 * factor).min(self.cap.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

struct LiveChannel {
    channel_id: String,
    pump: JoinHandle<()>,
}

struct SubInner {
    platform: Arc<dyn RemotePlatform>,
    events: Arc<EventManager>,
    routed_tx: mpsc::UnboundedSender<RoutedEvent>,
    state_tx: watch::Sender<SubscriptionState>,
    backoff: BackoffPolicy,
    /// 连续失败次数，成功订阅后复位
    attempt: AtomicU32,
    /// 代数：重建/撤销 +1，旧泵与旧退避看到不一致即退出
    generation: AtomicU64,
    current: Mutex<Option<LiveChannel>>,
    last_filter: Mutex<Option<ChangeFilter>>,
    /// 串行化 rebuild/teardown，避免并发建链
    lifecycle: tokio::sync::Mutex<()>,
}

impl SubInner {
    async fn set_state(&self, new_state: SubscriptionState) {
        let old_state = *self.state_tx.borrow();
        if old_state == new_state {
            return;
        }
        let _ = self.state_tx.send(new_state);
        info!("subscription state: {:?} -> {:?}", old_state, new_state);
        self.events
            .emit(event_builders::subscription_state_changed(
                old_state, new_state,
            ))
            .await;
    }

    async fn drop_current(&self) {
        let live = self.current.lock().take();
        if let Some(live) = live {
            live.pump.abort();
            if let Err(e) = self.platform.unsubscribe(&live.channel_id).await {
                warn!("unsubscribe failed: {}", e);
            }
        }
    }
}

/// 订阅管理器
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<SubInner>,
}

impl SubscriptionManager {
    pub fn new(
        platform: Arc<dyn RemotePlatform>,
        events: Arc<EventManager>,
        routed_tx: mpsc::UnboundedSender<RoutedEvent>,
        backoff: BackoffPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(SubscriptionState::Unsubscribed);
        Self {
            inner: Arc::new(SubInner {
                platform,
                events,
                routed_tx,
                state_tx,
                backoff,
                attempt: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                current: Mutex::new(None),
                last_filter: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.inner.state_tx.borrow()
    }

    /// 状态观察流
    pub fn state_stream(&self) -> watch::Receiver<SubscriptionState> {
        self.inner.state_tx.subscribe()
    }

    /// 以新过滤器重建通道
    ///
    /// 撤销旧通道与未决的退避等待；建链失败进入 Error 并排期自动重试。
    pub async fn rebuild(&self, filter: ChangeFilter) {
        let _guard = self.inner.lifecycle.lock().await;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.last_filter.lock() = Some(filter.clone());
        self.subscribe_once(generation, filter).await;
    }

    /// 撤销通道，状态回到 Unsubscribed
    pub async fn teardown(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_filter.lock() = None;
        self.inner.attempt.store(0, Ordering::SeqCst);
        self.inner.drop_current().await;
        self.inner.set_state(SubscriptionState::Unsubscribed).await;
    }

    async fn subscribe_once(&self, generation: u64, filter: ChangeFilter) {
        self.inner.drop_current().await;
        self.inner.set_state(SubscriptionState::Subscribing).await;

        match self.inner.platform.subscribe(filter).await {
            Ok(channel) => {
                self.inner.attempt.store(0, Ordering::SeqCst);
                let channel_id = channel.channel_id.clone();
                let pump = self.spawn_pump(generation, channel);
                *self.inner.current.lock() = Some(LiveChannel { channel_id, pump });
                self.inner.set_state(SubscriptionState::Subscribed).await;
            }
            Err(e) => {
                warn!("subscribe failed: {}", e);
                self.inner.set_state(SubscriptionState::Error).await;
                self.schedule_retry(generation);
            }
        }
    }

    fn spawn_pump(&self, generation: u64, mut channel: PushChannel) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match channel.recv().await {
                    Some(event) => {
                        if manager.inner.generation.load(Ordering::SeqCst) != generation {
                            return;
                        }
                        if let Some(routed) = classify(event) {
                            if manager.inner.routed_tx.send(routed).is_err() {
                                debug!("router gone, pump exiting");
                                return;
                            }
                        }
                    }
                    None => {
                        // 本端撤销（代数已变）静默退出；否则是通道异常
                        if manager.inner.generation.load(Ordering::SeqCst) != generation {
                            return;
                        }
                        warn!(
                            "push channel lost: channel_id={} status={:?}",
                            channel.channel_id,
                            channel.status()
                        );
                        manager.inner.current.lock().take();
                        manager.inner.set_state(SubscriptionState::Error).await;
                        manager.schedule_retry(generation);
                        return;
                    }
                }
            }
        })
    }

    fn schedule_retry(&self, generation: u64) {
        let attempt = self.inner.attempt.fetch_add(1, Ordering::SeqCst);
        let delay = self.inner.backoff.delay(attempt);
        info!(
            "scheduling resubscribe in {:?} (attempt {})",
            delay,
            attempt + 1
        );

        let manager = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _guard = manager.inner.lifecycle.lock().await;
            // 等待期间发生过显式 rebuild/teardown 则作废
            if manager.inner.generation.load(Ordering::SeqCst) != generation {
                debug!("scheduled resubscribe superseded");
                return;
            }
            let Some(filter) = manager.inner.last_filter.lock().clone() else {
                return;
            };
            let next = manager.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            manager.subscribe_once(next, filter).await;
        });
    }
}
