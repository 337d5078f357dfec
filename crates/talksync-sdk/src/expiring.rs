//! 带过期时间的键值映射
//!
//! 输入状态、瞬时通知等"几秒内自动消失"的状态统一用这一个抽象，
//! 不再各自维护散落的定时器。
//!
//! 语义要点：
//! - `insert` 重置该键的过期时间为完整 TTL（从当前时刻起算），不是累加延长
//! - 读取按惰性过期处理：到期的条目即使尚未清扫也不可见
//! - `purge_expired` 做实际清扫，由持有者的周期任务调用
//!
//! 时间源是 `tokio::time::Instant`，测试中可用暂停时钟推进。

use std::collections::HashMap;
use std::hash::Hash;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct ExpiringEntry<V> {
    value: V,
    deadline: Instant,
}

/// 带 TTL 的键值映射
///
/// 不做内部加锁，由持有者的锁保护。
#[derive(Debug, Clone)]
pub struct ExpiringMap<K, V> {
    entries: HashMap<K, ExpiringEntry<V>>,
    ttl: Duration,
}

impl<K: Eq + Hash, V> ExpiringMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 写入条目，过期时间重置为 now + TTL
    pub fn insert(&mut self, key: K, value: V) {
        let deadline = Instant::now() + self.ttl;
        self.entries.insert(key, ExpiringEntry { value, deadline });
    }

    /// 写入条目并指定本条的 TTL
    pub fn insert_with_ttl(&mut self, key: K, value: V, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        self.entries.insert(key, ExpiringEntry { value, deadline });
    }

    /// 读取未过期的值
    pub fn get(&self, key: &K) -> Option<&V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.deadline > now)
            .map(|entry| &entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// 某个键的剩余到期时刻（测试重置语义用）
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.entries.get(key).map(|entry| entry.deadline)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// 清扫已过期条目，返回移除数量
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.deadline > now);
        before - self.entries.len()
    }

    /// 未过期条目的迭代器
    pub fn iter_fresh(&self) -> impl Iterator<Item = (&K, &V)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(move |(_, entry)| entry.deadline > now)
            .map(|(key, entry)| (key, &entry.value))
    }

    /// 未过期条目数
    pub fn len_fresh(&self) -> usize {
        self.iter_fresh().count()
    }

    pub fn is_empty_fresh(&self) -> bool {
        self.iter_fresh().next().is_none()
    }

    /// 整体替换为给定条目集（轮询兜底用：轮询结果是活性权威）
    pub fn replace_all(&mut self, items: impl IntoIterator<Item = (K, V)>) {
        let deadline = Instant::now() + self.ttl;
        self.entries.clear();
        for (key, value) in items {
            self.entries.insert(key, ExpiringEntry { value, deadline });
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
