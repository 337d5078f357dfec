//! 状态存储
//!
//! `StateStore` 把状态树、动作与归约器拼成一个可并发访问的单元：
//! 写路径全部收口到 `dispatch`（写锁内归约到底，动作之间不交错），
//! 读路径通过 `read` 拿一致性快照。副作用由调用方执行。

pub mod actions;
pub mod reducer;
pub mod state;

pub use actions::{ChatAction, StateEffect};
pub use state::{ChatState, StateStats};

use parking_lot::RwLock;
use std::sync::Arc;

/// 并发安全的状态存储
///
/// 锁内不做 IO 与等待，归约是纯内存操作，持锁时间与动作大小成正比。
#[derive(Clone)]
pub struct StateStore {
    state: Arc<RwLock<ChatState>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ChatState::new())),
        }
    }

    /// 应用动作，返回待执行的副作用
    pub fn dispatch(&self, action: ChatAction) -> Vec<StateEffect> {
        let mut state = self.state.write();
        reducer::reduce(&mut state, action)
    }

    /// 一致性读：在读锁内对状态求值
    pub fn read<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.state.read())
    }

    /// 当前选中的会话
    pub fn active_conversation(&self) -> Option<u64> {
        self.state.read().active_conversation
    }

    /// 状态概览
    pub fn stats(&self) -> StateStats {
        self.state.read().stats()
    }
}
