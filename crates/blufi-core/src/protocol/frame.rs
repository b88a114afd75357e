//! BluFi 帧格式
//!
//! ```text
//! ┌──────────────────────┬──────────────┬──────────┬─────────┬──────────────┐
//! │ subtype(6) | type(2) │ frame control│ sequence │ length  │ payload      │
//! │ 1 byte               │ 1 byte       │ 1 byte   │ 1 byte  │ 0..=255 bytes│
//! └──────────────────────┴──────────────┴──────────┴─────────┴──────────────┘
//! ```
//!
//! 第一个字节: bit0..1 = 帧类型 (0 = 控制帧, 1 = 数据帧)，bit2..7 = 子类型。
//! 控制帧和数据帧的子类型是两套独立编号。
//!
//! frame control 字节:
//!
//! | bit | 含义 |
//! |-----|------|
//! | 0   | 载荷已加密 |
//! | 4   | 分片，后面还有分片 |
//! | 其他 | 保留 |
//!
//! 不支持 2 字节长度的扩展格式。

use std::fmt;

/// 帧头长度
pub const HEADER_SIZE: usize = 4;

/// 单帧载荷上限 (长度字段为 1 字节)
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// 子类型上限 (6 位)
pub const MAX_SUBTYPE: u8 = 0x3f;

/// 本实现用到的子类型
pub mod subtype {
    /// 控制帧: 让设备连接到已配置的 AP
    pub const CTRL_CONNECT_WIFI: u8 = 0x03;
    /// 控制帧: 请求设备扫描 WiFi
    pub const CTRL_GET_WIFI_LIST: u8 = 0x09;

    /// 数据帧: 安全协商 (长度声明和 DH 参数)
    pub const DATA_NEGOTIATE: u8 = 0x00;
    /// 数据帧: STA SSID
    pub const DATA_STA_SSID: u8 = 0x02;
    /// 数据帧: STA 密码
    pub const DATA_STA_PASSWORD: u8 = 0x03;
    /// 数据帧: WiFi 连接状态报告，payload[1] == 0 表示成功
    pub const DATA_WIFI_STATUS: u8 = 0x0f;
    /// 数据帧: WiFi 扫描列表
    pub const DATA_WIFI_LIST: u8 = 0x11;
}

/// 帧解析/编码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame header needs {HEADER_SIZE} bytes, got {0}")]
    HeaderTooShort(usize),

    #[error("frame declares {declared} payload bytes but only {available} present")]
    Truncated { declared: usize, available: usize },

    #[error("payload of {0} bytes exceeds the 255 byte frame limit")]
    PayloadTooLarge(usize),

    #[error("subtype {0:#04x} does not fit in 6 bits")]
    SubtypeOutOfRange(u8),

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("fragment is missing its 2-byte length prefix")]
    MissingLengthPrefix,

    #[error("fragment length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("message of {0} bytes exceeds the 65535 byte fragmentation limit")]
    MessageTooLong(usize),
}

/// 帧类型 (2 位)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Control = 0,
    Data = 1,
}

impl FrameType {
    pub fn from_bits(bits: u8) -> Result<Self, FrameError> {
        match bits {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Data),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// frame control 标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FrameControl(u8);

impl FrameControl {
    pub const ENCRYPTED: u8 = 0x01;
    pub const FRAGMENT: u8 = 0x10;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// 后面还有分片
    pub fn has_more_fragments(self) -> bool {
        self.0 & Self::FRAGMENT != 0
    }

    #[must_use]
    pub fn with_encrypted(self, on: bool) -> Self {
        self.set(Self::ENCRYPTED, on)
    }

    #[must_use]
    pub fn with_fragment(self, on: bool) -> Self {
        self.set(Self::FRAGMENT, on)
    }

    fn set(self, flag: u8, on: bool) -> Self {
        if on {
            Self(self.0 | flag)
        } else {
            Self(self.0 & !flag)
        }
    }
}

/// 帧头第一个字节: `(subtype << 2) | type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameKind {
    pub frame_type: FrameType,
    pub subtype: u8,
}

impl FrameKind {
    pub fn new(frame_type: FrameType, subtype: u8) -> Result<Self, FrameError> {
        if subtype > MAX_SUBTYPE {
            return Err(FrameError::SubtypeOutOfRange(subtype));
        }
        Ok(Self {
            frame_type,
            subtype,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.subtype << 2) | self.frame_type.bits()
    }

    pub fn from_byte(byte: u8) -> Result<Self, FrameError> {
        Ok(Self {
            frame_type: FrameType::from_bits(byte & 0x03)?,
            subtype: (byte >> 2) & MAX_SUBTYPE,
        })
    }
}

/// 一个 BluFi 帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub subtype: u8,
    pub control: FrameControl,
    pub sequence: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, subtype: u8, sequence: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            subtype,
            control: FrameControl::default(),
            sequence,
            payload,
        }
    }

    pub fn control(subtype: u8, sequence: u8, payload: Vec<u8>) -> Self {
        Self::new(FrameType::Control, subtype, sequence, payload)
    }

    pub fn data(subtype: u8, sequence: u8, payload: Vec<u8>) -> Self {
        Self::new(FrameType::Data, subtype, sequence, payload)
    }

    #[must_use]
    pub fn with_control(mut self, control: FrameControl) -> Self {
        self.control = control;
        self
    }

    pub fn is(&self, frame_type: FrameType, subtype: u8) -> bool {
        self.frame_type == frame_type && self.subtype == subtype
    }

    /// 编码为线上字节
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let kind = FrameKind::new(self.frame_type, self.subtype)?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(kind.to_byte());
        buf.push(self.control.bits());
        buf.push(self.sequence);
        buf.push(self.payload.len() as u8);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// 从线上字节解码，忽略声明长度之后的多余字节
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::HeaderTooShort(buf.len()));
        }

        let kind = FrameKind::from_byte(buf[0])?;
        let declared = buf[3] as usize;
        let available = buf.len() - HEADER_SIZE;
        if declared > available {
            return Err(FrameError::Truncated {
                declared,
                available,
            });
        }

        Ok(Self {
            frame_type: kind.frame_type,
            subtype: kind.subtype,
            control: FrameControl::from_bits(buf[1]),
            sequence: buf[2],
            payload: buf[HEADER_SIZE..HEADER_SIZE + declared].to_vec(),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:#04x} seq={} ctrl={:#04x} len={}",
            self.frame_type,
            self.subtype,
            self.sequence,
            self.control.bits(),
            self.payload.len()
        )
    }
}
