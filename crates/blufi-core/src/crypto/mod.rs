//! BluFi 密码学原语
//!
//! MD5、AES-128 和 CFB 均为自行实现，只覆盖设备固件实际使用的单一套件：
//! 1024 位 DH + MD5 派生的 128 位密钥 + AES-128-CFB。

pub mod aes;
pub mod ble_security;
pub mod cfb;
pub mod md5;

pub use ble_security::{BleSecurity, DH_G, DH_KEY_LEN, DH_P, PeerKeyError, SessionCipher, modpow};
pub use cfb::cfb_encrypt;
pub use md5::md5;
