//! 长消息分片与重组
//!
//! 分片规则 (与设备固件的读取方式一致)：
//! - 第一片最多 14 字节数据，后续每片最多 16 字节
//! - 非最后一片设置 FRAGMENT 标志，载荷前加 2 字节小端的消息总长度
//! - 最后一片清除 FRAGMENT 标志，原样携带剩余字节，不加长度前缀
//!
//! 所有分片都是子类型 0 (协商数据) 的数据帧。

use crate::protocol::frame::{Frame, FrameControl, FrameError, FrameType, subtype};

/// 第一片的最大数据字节数
pub const FIRST_CHUNK_SIZE: usize = 14;
/// 后续分片的最大数据字节数
pub const CHUNK_SIZE: usize = 16;
/// 分片内总长度前缀的字节数
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// 一个待发送的分片；序号在发送时分配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub payload: Vec<u8>,
    pub more: bool,
}

impl Fragment {
    pub fn into_frame(self, sequence: u8) -> Frame {
        Frame::new(FrameType::Data, subtype::DATA_NEGOTIATE, sequence, self.payload)
            .with_control(FrameControl::default().with_fragment(self.more))
    }
}

/// 把 `data` 切成分片序列
///
/// 空消息产生一个空的最后分片，保证每条消息至少占一帧。
/// 总长度超过 2 字节前缀的表示范围时返回 [`FrameError::MessageTooLong`]。
pub fn fragment(data: &[u8]) -> Result<Vec<Fragment>, FrameError> {
    let total = u16::try_from(data.len())
        .map_err(|_| FrameError::MessageTooLong(data.len()))?
        .to_le_bytes();
    let mut fragments = Vec::new();
    let mut offset = 0;

    loop {
        let max = if offset == 0 {
            FIRST_CHUNK_SIZE
        } else {
            CHUNK_SIZE
        };
        let end = (offset + max).min(data.len());
        let chunk = &data[offset..end];
        let more = end < data.len();

        let payload = if more {
            let mut payload = Vec::with_capacity(LENGTH_PREFIX_SIZE + chunk.len());
            payload.extend_from_slice(&total);
            payload.extend_from_slice(chunk);
            payload
        } else {
            chunk.to_vec()
        };

        fragments.push(Fragment { payload, more });
        offset = end;
        if !more {
            return Ok(fragments);
        }
    }
}

/// 分片重组器
///
/// 会话本身不重组设备发来的帧；重组器用于校验分片器输出以及模拟设备端。
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    expected_total: Option<usize>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否正在等待后续分片
    pub fn in_progress(&self) -> bool {
        self.expected_total.is_some()
    }

    /// 喂入一帧；消息完整时返回其内容
    pub fn push(&mut self, frame: &Frame) -> Result<Option<Vec<u8>>, FrameError> {
        if frame.control.has_more_fragments() {
            if frame.payload.len() < LENGTH_PREFIX_SIZE {
                self.reset();
                return Err(FrameError::MissingLengthPrefix);
            }
            let total = u16::from_le_bytes([frame.payload[0], frame.payload[1]]) as usize;
            if let Some(expected) = self.expected_total {
                if expected != total {
                    self.reset();
                    return Err(FrameError::LengthMismatch {
                        expected,
                        actual: total,
                    });
                }
            }
            self.expected_total = Some(total);
            self.buffer
                .extend_from_slice(&frame.payload[LENGTH_PREFIX_SIZE..]);
            return Ok(None);
        }

        self.buffer.extend_from_slice(&frame.payload);
        let message = std::mem::take(&mut self.buffer);
        let expected = self.expected_total.take();

        match expected {
            Some(expected) if expected != message.len() => Err(FrameError::LengthMismatch {
                expected,
                actual: message.len(),
            }),
            _ => Ok(Some(message)),
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.expected_total = None;
    }
}
