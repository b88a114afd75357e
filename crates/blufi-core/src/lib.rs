//! BluFi Core Library
//!
//! 通过 BLE 向设备下发 WiFi 凭据的 BluFi 协议引擎
//!
//! # 模块
//!
//! - **protocol**: 帧编解码、分片、WiFi 列表解析
//! - **crypto**: MD5 / AES-128-CFB 和 1024 位 DH 密钥交换
//! - **session**: 安全协商、请求/响应匹配和配网流程
//! - **transport**: BLE 传输抽象，`ble` 提供 btleplug 实现
//! - **config**: 配置持久化
//!
//! # 使用示例
//!
//! ```ignore
//! use blufi_core::{BluFiSession, BtleplugTransport};
//!
//! let mut session = BluFiSession::new(BtleplugTransport::new());
//! session.init().await?;
//!
//! // 1. 扫描设备
//! let devices = session.scan(Duration::from_secs(5)).await?;
//!
//! // 2. 连接并协商会话密钥
//! session.connect(&devices[0].id).await?;
//! session.negotiate().await?;
//!
//! // 3. 下发 WiFi 凭据
//! let result = session.configure_wifi("MyNetwork", "password").await?;
//!
//! session.disconnect().await;
//! ```

pub mod ble;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

// BLE re-exports
pub use ble::{BLUFI_NOTIFY_CHAR_UUID, BLUFI_SERVICE_UUID, BLUFI_WRITE_CHAR_UUID, BtleplugTransport};

// Session re-exports
pub use session::{BluFiSession, SimpleStatusCallback, StatusCallback, WifiConfigResult};

pub use config::{ProvisionerSettings, SessionTimings};
pub use crypto::{BleSecurity, SessionCipher};
pub use error::{BlufiError, HandshakeError, Result};
pub use protocol::{Frame, FrameControl, FrameError, FrameType, WifiEntry};
pub use transport::{DiscoveredDevice, NotifyHandler, Transport, TransportError};
