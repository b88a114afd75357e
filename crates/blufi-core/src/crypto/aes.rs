//! AES-128 分组加密 (FIPS-197)
//!
//! 只实现加密方向: CFB 模式下加解密都只需要分组加密。

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;

const ROUNDS: usize = 10;
/// 扩展密钥: 11 个轮密钥 x 16 字节 = 176 字节
const SCHEDULE_SIZE: usize = BLOCK_SIZE * (ROUNDS + 1);

const RCON: [u8; ROUNDS] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36];

#[rustfmt::skip]
const SBOX: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

/// 已展开密钥的 AES-128 加密器
#[derive(Clone)]
pub struct Aes128 {
    round_keys: [u8; SCHEDULE_SIZE],
}

impl Aes128 {
    /// 从 16 字节密钥展开 176 字节轮密钥
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        let mut round_keys = [0u8; SCHEDULE_SIZE];
        round_keys[..KEY_SIZE].copy_from_slice(key);

        for i in (KEY_SIZE..SCHEDULE_SIZE).step_by(4) {
            let mut word = [
                round_keys[i - 4],
                round_keys[i - 3],
                round_keys[i - 2],
                round_keys[i - 1],
            ];

            if i % KEY_SIZE == 0 {
                // RotWord + SubWord + Rcon
                word.rotate_left(1);
                for b in &mut word {
                    *b = SBOX[*b as usize];
                }
                word[0] ^= RCON[i / KEY_SIZE - 1];
            }

            for (j, b) in word.iter().enumerate() {
                round_keys[i + j] = round_keys[i - KEY_SIZE + j] ^ b;
            }
        }

        Self { round_keys }
    }

    /// 加密单个 16 字节分组
    pub fn encrypt_block(&self, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut state = *block;

        self.add_round_key(&mut state, 0);
        for round in 1..=ROUNDS {
            sub_bytes(&mut state);
            shift_rows(&mut state);
            // 最后一轮没有 MixColumns
            if round < ROUNDS {
                mix_columns(&mut state);
            }
            self.add_round_key(&mut state, round);
        }

        state
    }

    fn add_round_key(&self, state: &mut [u8; BLOCK_SIZE], round: usize) {
        let key = &self.round_keys[round * BLOCK_SIZE..(round + 1) * BLOCK_SIZE];
        for (s, k) in state.iter_mut().zip(key) {
            *s ^= k;
        }
    }
}

impl std::fmt::Debug for Aes128 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 不输出密钥材料
        f.debug_struct("Aes128").finish_non_exhaustive()
    }
}

fn sub_bytes(state: &mut [u8; BLOCK_SIZE]) {
    for b in state.iter_mut() {
        *b = SBOX[*b as usize];
    }
}

/// 状态按列存储: state[col * 4 + row]，第 r 行循环左移 r 位
fn shift_rows(state: &mut [u8; BLOCK_SIZE]) {
    let original = *state;
    for row in 1..4 {
        for col in 0..4 {
            state[col * 4 + row] = original[((col + row) % 4) * 4 + row];
        }
    }
}

fn xtime(x: u8) -> u8 {
    (x << 1) ^ if x & 0x80 != 0 { 0x1b } else { 0x00 }
}

fn mix_columns(state: &mut [u8; BLOCK_SIZE]) {
    for column in state.chunks_exact_mut(4) {
        let [s0, s1, s2, s3] = [column[0], column[1], column[2], column[3]];
        let all = s0 ^ s1 ^ s2 ^ s3;
        column[0] = s0 ^ all ^ xtime(s0 ^ s1);
        column[1] = s1 ^ all ^ xtime(s1 ^ s2);
        column[2] = s2 ^ all ^ xtime(s2 ^ s3);
        column[3] = s3 ^ all ^ xtime(s3 ^ s0);
    }
}
