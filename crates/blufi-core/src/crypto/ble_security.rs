//! BluFi 安全协商的密码学部分
//!
//! 与设备固件 (mbedtls `dhm`) 保持一致：
//! - 1024 位 MODP 素数 (RFC 2409 Oakley Group 2)，生成元 G = 2
//! - 私钥为 128 个随机字节，按大端解释为大整数
//! - 会话密钥 = MD5(共享密钥按大端补齐到 128 字节)
//! - 会话加密为 AES-128-CFB，IV 为 16 个零字节且第 0 字节为帧序号
//!
//! 安全说明：模幂运算不是常数时间实现，与固件侧协议的安全强度相当，
//! 仅适用于配网这类短时、近场场景。

use crate::crypto::aes::{Aes128, BLOCK_SIZE};
use crate::crypto::cfb::cfb_encrypt;
use crate::crypto::md5::md5;
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};

/// DH 参数和公钥的字节长度
pub const DH_KEY_LEN: usize = 128;

/// DH 生成元
pub const DH_G: u8 = 2;

/// RFC 2409 第 6.2 节 1024 位 MODP 素数
#[rustfmt::skip]
pub const DH_P: [u8; DH_KEY_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11, 0x7c, 0x4b, 0x1f, 0xe6,
    0x49, 0x28, 0x66, 0x51, 0xec, 0xe6, 0x53, 0x81, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// 平方-乘法模幂
///
/// 从最低位开始扫描指数；对任意位宽的操作数都成立。
pub fn modpow(base: &BigUint, exponent: &BigUint, modulus: &BigUint) -> BigUint {
    let one = BigUint::from(1u8);
    if *modulus == one {
        return BigUint::default();
    }

    let mut result = one;
    let mut base = base % modulus;

    for bit in 0..exponent.bits() {
        if exponent.bit(bit) {
            result = (&result * &base) % modulus;
        }
        base = (&base * &base) % modulus;
    }

    result
}

/// 把大整数编码为定长大端字节，高位补零
///
/// 超出 `len` 的高位被截掉，与固件读取定长字段的方式一致。
pub fn to_fixed_be(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; len];
    if bytes.len() >= len {
        out.copy_from_slice(&bytes[bytes.len() - len..]);
    } else {
        out[len - bytes.len()..].copy_from_slice(&bytes);
    }
    out
}

/// 对端公钥校验失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerKeyError {
    #[error("peer public key must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("peer public key is outside [2, P-2]")]
    OutOfRange,
}

/// 本地 DH 密钥对
pub struct BleSecurity {
    private_key: BigUint,
    public_key: BigUint,
    prime: BigUint,
}

impl BleSecurity {
    /// 使用系统随机源生成 128 字节私钥
    pub fn new() -> Self {
        Self::generate(&mut OsRng)
    }

    /// 使用指定随机源生成密钥对
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut private_bytes = [0u8; DH_KEY_LEN];
        rng.fill_bytes(&mut private_bytes);

        let prime = BigUint::from_bytes_be(&DH_P);
        let private_key = BigUint::from_bytes_be(&private_bytes);
        let public_key = modpow(&BigUint::from(DH_G), &private_key, &prime);

        Self {
            private_key,
            public_key,
            prime,
        }
    }

    /// 128 字节大端公钥
    pub fn public_key_bytes(&self) -> Vec<u8> {
        to_fixed_be(&self.public_key, DH_KEY_LEN)
    }

    /// 计算共享密钥 (peer ^ private mod P)，返回 128 字节大端编码
    pub fn shared_secret(&self, peer_public_key: &[u8]) -> Result<Vec<u8>, PeerKeyError> {
        if peer_public_key.len() != DH_KEY_LEN {
            return Err(PeerKeyError::InvalidLength {
                expected: DH_KEY_LEN,
                actual: peer_public_key.len(),
            });
        }

        let peer = BigUint::from_bytes_be(peer_public_key);
        let upper = &self.prime - BigUint::from(1u8);
        if peer < BigUint::from(2u8) || peer >= upper {
            return Err(PeerKeyError::OutOfRange);
        }

        let secret = modpow(&peer, &self.private_key, &self.prime);
        Ok(to_fixed_be(&secret, DH_KEY_LEN))
    }

    /// 使用对方公钥派生会话密钥
    pub fn derive_session_key(self, peer_public_key: &[u8]) -> Result<SessionCipher, PeerKeyError> {
        let secret = self.shared_secret(peer_public_key)?;
        Ok(SessionCipher::new(md5(&secret)))
    }
}

impl Default for BleSecurity {
    fn default() -> Self {
        Self::new()
    }
}

/// 协商完成后的会话加密器；建立后不可变
#[derive(Clone)]
pub struct SessionCipher {
    key: [u8; 16],
    aes: Aes128,
}

impl SessionCipher {
    pub fn new(key: [u8; 16]) -> Self {
        Self {
            aes: Aes128::new(&key),
            key,
        }
    }

    /// 会话密钥 (MD5 输出)
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// 设备固件约定的 IV: 全零，第 0 字节为帧序号
    pub fn iv_for_sequence(sequence: u8) -> [u8; BLOCK_SIZE] {
        let mut iv = [0u8; BLOCK_SIZE];
        iv[0] = sequence;
        iv
    }

    /// 加密一帧载荷
    pub fn encrypt(&self, payload: &[u8], sequence: u8) -> Vec<u8> {
        cfb_encrypt(&self.aes, payload, &Self::iv_for_sequence(sequence))
    }

    pub fn block_cipher(&self) -> &Aes128 {
        &self.aes
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}
