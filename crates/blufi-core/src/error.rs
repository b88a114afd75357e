//! 会话层错误

use crate::crypto::PeerKeyError;
use crate::protocol::FrameError;
use crate::session::negotiator::NegotiationState;
use crate::transport::TransportError;
use std::time::Duration;

/// 安全协商失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed peer public key: {0}")]
    MalformedPeerKey(#[from] PeerKeyError),

    #[error("negotiation step not allowed in state {0:?}")]
    InvalidState(NegotiationState),
}

#[derive(Debug, thiserror::Error)]
pub enum BlufiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// 等待设备响应超时
    #[error("no response from device within {0:?}")]
    Timeout(Duration),

    /// 单请求协议：上一个请求仍在等待响应
    #[error("a request is already awaiting a response")]
    RequestPending,

    #[error("not connected to a device")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, BlufiError>;
