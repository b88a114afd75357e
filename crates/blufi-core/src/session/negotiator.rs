//! 安全协商状态机
//!
//! ```text
//! Idle → KeysGenerated → LengthSent → ParamsSent → AwaitingPeerKey → Established
//!                     (任一步失败 / 超时) ─────────────────────────────▶ Failed
//! ```
//!
//! 状态机本身不做 I/O：它产出要发送的载荷、消费设备的响应，
//! 由 [`BluFiSession::negotiate`](crate::session::BluFiSession::negotiate) 负责收发。

use crate::crypto::{BleSecurity, DH_G, DH_KEY_LEN, DH_P, SessionCipher};
use crate::error::HandshakeError;
use log::debug;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};

/// 协商数据的类型字节：参数长度声明
pub const NEG_PARAM_LEN: u8 = 0x00;
/// 协商数据的类型字节：DH 参数
pub const NEG_PARAM_DATA: u8 = 0x01;

/// 参数块长度 (不含类型字节)：P_len(2) + P + G_len(2) + G + Pub_len(2) + Pub
pub const PARAM_BLOCK_LEN: usize = 2 + DH_KEY_LEN + 2 + 1 + 2 + DH_KEY_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    KeysGenerated,
    LengthSent,
    ParamsSent,
    AwaitingPeerKey,
    Established,
    Failed,
}

pub struct SecurityNegotiator {
    state: NegotiationState,
    security: Option<BleSecurity>,
}

impl SecurityNegotiator {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Idle,
            security: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Idle → KeysGenerated
    pub fn generate_keys(&mut self) -> Result<(), HandshakeError> {
        self.generate_keys_with(&mut OsRng)
    }

    pub fn generate_keys_with<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<(), HandshakeError> {
        self.require_state(NegotiationState::Idle)?;
        self.security = Some(BleSecurity::generate(rng));
        self.state = NegotiationState::KeysGenerated;
        debug!("DH key pair generated");
        Ok(())
    }

    /// KeysGenerated → LengthSent，返回长度声明载荷 `[0x00, len_hi, len_lo]`
    pub fn length_announcement(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.require_state(NegotiationState::KeysGenerated)?;
        let len = (PARAM_BLOCK_LEN as u16).to_be_bytes();
        self.state = NegotiationState::LengthSent;
        Ok(vec![NEG_PARAM_LEN, len[0], len[1]])
    }

    /// LengthSent → ParamsSent，返回需要分片发送的参数块
    pub fn parameter_block(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.require_state(NegotiationState::LengthSent)?;
        let public_key = self
            .security
            .as_ref()
            .ok_or(HandshakeError::InvalidState(self.state))?
            .public_key_bytes();

        let mut block = Vec::with_capacity(1 + PARAM_BLOCK_LEN);
        block.push(NEG_PARAM_DATA);
        block.extend_from_slice(&(DH_KEY_LEN as u16).to_be_bytes());
        block.extend_from_slice(&DH_P);
        block.extend_from_slice(&1u16.to_be_bytes());
        block.push(DH_G);
        block.extend_from_slice(&(DH_KEY_LEN as u16).to_be_bytes());
        block.extend_from_slice(&public_key);

        self.state = NegotiationState::ParamsSent;
        Ok(block)
    }

    /// ParamsSent → AwaitingPeerKey
    pub fn await_peer_key(&mut self) -> Result<(), HandshakeError> {
        self.require_state(NegotiationState::ParamsSent)?;
        self.state = NegotiationState::AwaitingPeerKey;
        Ok(())
    }

    /// AwaitingPeerKey → Established / Failed
    ///
    /// 响应的整个载荷就是设备的大端公钥。
    pub fn complete(&mut self, peer_payload: &[u8]) -> Result<SessionCipher, HandshakeError> {
        self.require_state(NegotiationState::AwaitingPeerKey)?;
        let security = self
            .security
            .take()
            .ok_or(HandshakeError::InvalidState(self.state))?;

        match security.derive_session_key(peer_payload) {
            Ok(cipher) => {
                self.state = NegotiationState::Established;
                Ok(cipher)
            }
            Err(e) => {
                self.state = NegotiationState::Failed;
                Err(e.into())
            }
        }
    }

    /// 任意状态 → Failed，丢弃私钥
    pub fn fail(&mut self) {
        self.security = None;
        self.state = NegotiationState::Failed;
    }

    fn require_state(&mut self, state: NegotiationState) -> Result<(), HandshakeError> {
        if self.state == state {
            Ok(())
        } else {
            let actual = self.state;
            self.fail();
            Err(HandshakeError::InvalidState(actual))
        }
    }
}

impl Default for SecurityNegotiator {
    fn default() -> Self {
        Self::new()
    }
}
