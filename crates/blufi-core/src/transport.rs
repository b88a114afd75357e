//! BLE 传输抽象
//!
//! 会话层只通过 [`Transport`] 使用无线电：适配器初始化、扫描、GATT 连接、
//! 特征读写和通知订阅都由实现方负责。真实实现见 [`crate::ble::BtleplugTransport`]，
//! 测试中使用内存模拟设备。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 传输层错误，原样上抛给调用方
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("BluFi service not found on {0}")]
    ServiceNotFound(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Device {0} is not connected")]
    NotConnected(String),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// 扫描到的设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// 传输层使用的设备标识
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

/// 通知回调；在传输层的任务中同步调用，不允许失败
pub type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// 扫描过滤条件
pub type DeviceFilter = dyn Fn(&DiscoveredDevice) -> bool + Send + Sync;

#[async_trait]
pub trait Transport: Send + Sync {
    /// 打开并上电蓝牙适配器
    async fn open_adapter(&self) -> Result<(), TransportError>;

    /// 扫描 `duration` 时长，返回满足 `filter` 的设备
    async fn discover(
        &self,
        filter: &DeviceFilter,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError>;

    async fn connect(&self, id: &str, timeout: Duration) -> Result<(), TransportError>;

    async fn set_mtu(&self, id: &str, mtu: u16) -> Result<(), TransportError>;

    async fn list_services(&self, id: &str) -> Result<Vec<Uuid>, TransportError>;

    async fn list_characteristics(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Vec<Uuid>, TransportError>;

    async fn write_characteristic(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn subscribe_notifications(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        on_data: NotifyHandler,
    ) -> Result<(), TransportError>;

    /// 断开连接；断开失败只记录日志
    async fn disconnect(&self, id: &str);
}
