use super::control_channel::GatewaySession;
use crate::error::{ProxyError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// 活动中继会话注册表
///
/// 只有一个槽位。所有读写都在同一把锁内完成，
/// 并发的替换或清除不会交出过期或半清除的引用。
#[derive(Default)]
pub struct GatewaySessionManager {
    active: Mutex<Option<Arc<GatewaySession>>>,
}

impl GatewaySessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 无条件替换当前会话，旧会话被标记为失效并返回
    pub fn set(&self, session: Arc<GatewaySession>) -> Option<Arc<GatewaySession>> {
        let mut active = self.active.lock();
        info!(
            "Registering relay session {} @ {}",
            session.id(),
            session.remote_addr()
        );
        let previous = active.replace(session);
        if let Some(old) = &previous {
            info!(
                "Relay session {} @ {} replaced",
                old.id(),
                old.remote_addr()
            );
            old.invalidate();
        }
        previous
    }

    /// 仅当槽位仍指向该会话时清除
    pub fn clear_if_matches(&self, session: &Arc<GatewaySession>) -> bool {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(current) if Arc::ptr_eq(current, session) => {
                info!(
                    "Clearing relay session {} @ {}",
                    session.id(),
                    session.remote_addr()
                );
                *active = None;
                true
            }
            _ => false,
        }
    }

    /// 当前会话（可能已失效）
    pub fn active(&self) -> Option<Arc<GatewaySession>> {
        self.active.lock().clone()
    }

    /// 获取存活的会话，否则返回 `NoActiveRelay`
    pub fn active_or_fail(&self) -> Result<Arc<GatewaySession>> {
        let active = self.active.lock();
        match active.as_ref() {
            Some(session) if session.is_alive() => Ok(session.clone()),
            _ => Err(ProxyError::NoActiveRelay),
        }
    }

    pub fn has_active(&self) -> bool {
        self.active_or_fail().is_ok()
    }
}
