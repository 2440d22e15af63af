//! 浏览器会话池
//!
//! 维护一组可复用的浏览器会话，每个会话同一时刻最多被一个任务独占。
//! 空闲扫描和占用标记在同一把锁内完成，保证并发调用方不会拿到同一个会话。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use webtask_config::SessionPoolConfig;
use webtask_domain::{BrowserHandle, SessionFactory};
use webtask_errors::{WebTaskError, WebTaskResult};

struct SessionSlot {
    id: u64,
    handle: Arc<dyn BrowserHandle>,
    busy: bool,
    last_used: Instant,
}

struct PoolInner {
    sessions: Vec<SessionSlot>,
    /// 正在创建中的会话数，计入容量但尚未入池
    creating: usize,
    next_id: u64,
    created_count: u64,
    reused_count: u64,
}

/// 会话池统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub busy_sessions: usize,
    pub created_count: u64,
    pub reused_count: u64,
}

pub struct SessionPool {
    config: SessionPoolConfig,
    factory: Arc<dyn SessionFactory>,
    inner: Mutex<PoolInner>,
    closed: AtomicBool,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            config,
            factory,
            inner: Mutex::new(PoolInner {
                sessions: Vec::new(),
                creating: 0,
                next_id: 1,
                created_count: 0,
                reused_count: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// 获取一个会话：优先复用空闲会话，容量未满时创建新会话，
    /// 否则轮询等待直到有会话被释放。
    pub async fn acquire(self: &Arc<Self>) -> WebTaskResult<SessionLease> {
        let poll_interval = Duration::from_millis(self.config.acquire_poll_interval_ms);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(WebTaskError::session_unavailable("会话池已关闭"));
            }

            enum Plan {
                Reuse(SessionLease),
                Create,
                Wait,
            }

            let plan = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(slot) = inner.sessions.iter_mut().find(|s| !s.busy) {
                    slot.busy = true;
                    slot.last_used = Instant::now();
                    let lease = SessionLease {
                        pool: Arc::clone(self),
                        session_id: slot.id,
                        handle: Arc::clone(&slot.handle),
                    };
                    inner.reused_count += 1;
                    Plan::Reuse(lease)
                } else if inner.sessions.len() + inner.creating < self.config.max_sessions {
                    inner.creating += 1;
                    Plan::Create
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Reuse(lease) => {
                    debug!("复用空闲会话 {}", lease.session_id);
                    return Ok(lease);
                }
                Plan::Create => return self.create_session().await,
                Plan::Wait => sleep(poll_interval).await,
            }
        }
    }

    async fn create_session(self: &Arc<Self>) -> WebTaskResult<SessionLease> {
        match self.factory.create().await {
            Ok(handle) => {
                let handle: Arc<dyn BrowserHandle> = Arc::from(handle);
                let mut inner = self.inner.lock().unwrap();
                inner.creating -= 1;
                let id = inner.next_id;
                inner.next_id += 1;
                inner.created_count += 1;
                inner.sessions.push(SessionSlot {
                    id,
                    handle: Arc::clone(&handle),
                    busy: true,
                    last_used: Instant::now(),
                });
                info!("创建新会话 {}，当前池大小 {}", id, inner.sessions.len());
                Ok(SessionLease {
                    pool: Arc::clone(self),
                    session_id: id,
                    handle,
                })
            }
            Err(e) => {
                // 失败的创建不占用池容量
                let mut inner = self.inner.lock().unwrap();
                inner.creating -= 1;
                warn!("会话创建失败: {}", e);
                Err(e)
            }
        }
    }

    /// 由 lease drop 调用，将会话标记为空闲
    fn release(&self, session_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.sessions.iter_mut().find(|s| s.id == session_id) {
            slot.busy = false;
            slot.last_used = Instant::now();
            debug!("会话 {} 已释放", session_id);
        }
        // close_all 之后 lease 再 drop 时会话已不在池中，忽略即可
    }

    /// 回收空闲超时的会话，忙碌会话从不回收。返回回收数量。
    pub async fn reclaim_idle(&self) -> usize {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_seconds);
        let expired: Vec<SessionSlot> = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            let mut kept = Vec::with_capacity(inner.sessions.len());
            let mut expired = Vec::new();
            for slot in inner.sessions.drain(..) {
                if !slot.busy && now.duration_since(slot.last_used) > idle_timeout {
                    expired.push(slot);
                } else {
                    kept.push(slot);
                }
            }
            inner.sessions = kept;
            expired
        };

        let count = expired.len();
        for slot in expired {
            debug!("回收空闲会话 {}", slot.id);
            if let Err(e) = slot.handle.close().await {
                warn!("关闭会话 {} 失败: {}", slot.id, e);
            }
        }
        if count > 0 {
            info!("本次回收了 {} 个空闲会话", count);
        }
        count
    }

    /// 关停时排空并关闭所有会话，之后的 acquire 一律失败
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<SessionSlot> = {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.drain(..).collect()
        };
        info!("关闭会话池，共 {} 个会话", drained.len());
        for slot in drained {
            if let Err(e) = slot.handle.close().await {
                warn!("关闭会话 {} 失败: {}", slot.id, e);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            total_sessions: inner.sessions.len(),
            busy_sessions: inner.sessions.iter().filter(|s| s.busy).count(),
            created_count: inner.created_count,
            reused_count: inner.reused_count,
        }
    }
}

/// 会话租约，drop 时自动将会话归还到池中
///
/// 借助 RAII 保证无论执行路径如何（成功、失败、超时、panic 展开），
/// 会话都会被释放。
pub struct SessionLease {
    pool: Arc<SessionPool>,
    session_id: u64,
    handle: Arc<dyn BrowserHandle>,
}

impl SessionLease {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn handle(&self) -> &dyn BrowserHandle {
        self.handle.as_ref()
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.pool.release(self.session_id);
    }
}
