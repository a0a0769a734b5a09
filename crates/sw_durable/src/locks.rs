//! 执行级互斥锁
//!
//! 同一个执行实例在任意时刻只允许一次重放。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use sw_core::ExecutionId;

/// 执行锁表
#[derive(Debug, Clone, Default)]
pub struct ExecutionLocks {
    locks: Arc<RwLock<HashMap<ExecutionId, Arc<Mutex<()>>>>>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取执行锁，持有守卫期间其它调用方等待
    pub async fn acquire(&self, id: ExecutionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.write().await;
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// 移除锁 (执行被清理后)
    pub async fn remove(&self, id: &ExecutionId) {
        self.locks.write().await.remove(id);
    }

    /// 锁数量
    pub async fn count(&self) -> usize {
        self.locks.read().await.len()
    }
}
