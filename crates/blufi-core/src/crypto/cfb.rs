//! AES-128-CFB (128 位反馈) 加密
//!
//! 设备端固件只要求手机 → 设备方向加密，因此这里只有加密方向。
//! 最后不足 16 字节的分组只异或实际长度，多余的密钥流直接丢弃。

use crate::crypto::aes::{Aes128, BLOCK_SIZE};

/// 使用 CFB 模式加密 `data`
pub fn cfb_encrypt(cipher: &Aes128, data: &[u8], iv: &[u8; BLOCK_SIZE]) -> Vec<u8> {
    let mut output = Vec::with_capacity(data.len());
    let mut feedback = *iv;

    for chunk in data.chunks(BLOCK_SIZE) {
        let keystream = cipher.encrypt_block(&feedback);
        let start = output.len();
        output.extend(chunk.iter().zip(keystream).map(|(p, k)| p ^ k));

        // 完整分组的密文成为下一次的反馈；不完整分组意味着已到末尾
        if chunk.len() == BLOCK_SIZE {
            feedback.copy_from_slice(&output[start..]);
        }
    }

    output
}
