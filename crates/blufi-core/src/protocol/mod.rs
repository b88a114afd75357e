//! BluFi 线上协议: 帧、分片、设备报告

pub mod fragment;
pub mod frame;
pub mod wifi_list;

pub use fragment::{Fragment, Reassembler, fragment};
pub use frame::{Frame, FrameControl, FrameError, FrameKind, FrameType, subtype};
pub use wifi_list::{WifiEntry, parse_wifi_list};
