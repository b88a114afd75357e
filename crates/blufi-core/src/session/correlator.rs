//! 请求/响应关联
//!
//! BluFi 是严格的半双工协议：同一时刻最多只有一个请求在等待响应，
//! 响应与当前等待的请求匹配，而不是按序号匹配。
//!
//! 状态机：
//!
//! ```text
//!            begin()                    通知到达
//!   Idle ─────────────▶ Awaiting ─────────────────▶ Resolved ─┐
//!    ▲                     │                                  │
//!    │                     │ 超时 / PendingResponse 被丢弃      │
//!    │                     ▼                                  │
//!    └─────────────────  TimedOut ◀───────────────────────────┘
//!                    (槽位清空，回到 Idle)
//! ```
//!
//! 每次 `begin()` 分配一个令牌，只有持有当前令牌的 [`PendingResponse`]
//! 能清空槽位，过期的等待者不会误清后来的请求。

use crate::error::BlufiError;
use crate::protocol::Frame;
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// 槽位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Idle,
    Awaiting,
}

struct Slot {
    token: u64,
    tx: oneshot::Sender<Frame>,
}

/// 单槽位响应匹配器
#[derive(Default)]
pub struct ResponseCorrelator {
    slot: Mutex<Option<Slot>>,
    next_token: AtomicU64,
}

impl ResponseCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> CorrelatorState {
        if self.lock().is_some() {
            CorrelatorState::Awaiting
        } else {
            CorrelatorState::Idle
        }
    }

    /// 登记一个等待中的请求
    ///
    /// 已有请求在等待时返回 [`BlufiError::RequestPending`]，原请求不受影响。
    pub fn begin(self: &Arc<Self>) -> Result<PendingResponse, BlufiError> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(BlufiError::RequestPending);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *slot = Some(Slot { token, tx });

        Ok(PendingResponse {
            correlator: Arc::clone(self),
            token,
            rx,
        })
    }

    /// 处理一条 BLE 通知
    ///
    /// 解码失败只记录日志并丢弃，不影响等待中的请求；没有请求在等待时帧被丢弃。
    pub fn on_notification(&self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed notification ({} bytes): {}", bytes.len(), e);
                return;
            }
        };
        trace!("<- {}", frame);

        let Some(slot) = self.lock().take() else {
            debug!("Dropping unsolicited frame: {}", frame);
            return;
        };

        if slot.tx.send(frame).is_err() {
            // 等待者已经放弃，但尚未清空槽位
            debug!("Response arrived after waiter gave up (token {})", slot.token);
        }
    }

    fn release(&self, token: u64) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|s| s.token == token) {
            *slot = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 一个等待中的请求；被丢弃时自动清空槽位
pub struct PendingResponse {
    correlator: Arc<ResponseCorrelator>,
    token: u64,
    rx: oneshot::Receiver<Frame>,
}

impl PendingResponse {
    /// 等待响应，最多 `timeout`
    ///
    /// 响应与超时只有一个会生效；无论哪种结果，返回时槽位都已回到 Idle。
    pub async fn wait(mut self, timeout: Duration) -> Result<Frame, BlufiError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(frame)) => Ok(frame),
            // 发送端被丢弃只会发生在槽位被清空时，等同于没有响应
            Ok(Err(_)) | Err(_) => Err(BlufiError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.correlator.release(self.token);
    }
}
