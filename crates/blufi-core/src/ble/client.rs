//! btleplug 实现的 BLE 传输
//!
//! 设备以蓝牙地址字符串标识。每个已连接设备最多有一个通知转发任务，
//! 断开连接时终止。

use crate::transport::{DeviceFilter, DiscoveredDevice, NotifyHandler, Transport, TransportError};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

struct Connection {
    peripheral: Peripheral,
    notify_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct BtleplugTransport {
    adapter: Mutex<Option<Adapter>>,
    connections: Mutex<HashMap<String, Connection>>,
}

impl BtleplugTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn adapter(&self) -> Result<Adapter, TransportError> {
        lock(&self.adapter).clone().ok_or(TransportError::NoAdapter)
    }

    fn connected(&self, id: &str) -> Result<Peripheral, TransportError> {
        lock(&self.connections)
            .get(id)
            .map(|c| c.peripheral.clone())
            .ok_or_else(|| TransportError::NotConnected(id.to_string()))
    }

    async fn find_device(&self, address: &str) -> Result<Peripheral, TransportError> {
        let peripherals = self.adapter()?.peripherals().await.map_err(map_ble_error)?;

        for peripheral in peripherals {
            if let Some(props) = peripheral.properties().await.map_err(map_ble_error)? {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Ok(peripheral);
                }
            }
        }

        Err(TransportError::DeviceNotFound(address.to_string()))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics)
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn open_adapter(&self) -> Result<(), TransportError> {
        let manager = Manager::new().await.map_err(map_ble_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_ble_error)?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        match adapter.adapter_info().await {
            Ok(info) => debug!("Using adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        *lock(&self.adapter) = Some(adapter);
        Ok(())
    }

    async fn discover(
        &self,
        filter: &DeviceFilter,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let adapter = self.adapter()?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(map_ble_error)?;
        time::sleep(duration).await;
        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let mut devices = Vec::new();
        for peripheral in adapter.peripherals().await.map_err(map_ble_error)? {
            let Some(props) = peripheral.properties().await.map_err(map_ble_error)? else {
                continue;
            };
            let device = DiscoveredDevice {
                id: props.address.to_string(),
                name: props.local_name.unwrap_or_default(),
                rssi: props.rssi,
            };
            if filter(&device) {
                debug!(
                    "BluFi device found: addr={}, name='{}', rssi={:?}",
                    device.id, device.name, device.rssi
                );
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn connect(&self, id: &str, timeout: Duration) -> Result<(), TransportError> {
        let peripheral = self.find_device(id).await?;

        info!("Connecting to {}", id);
        time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| TransportError::ConnectTimeout(timeout))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let previous = lock(&self.connections).insert(
            id.to_string(),
            Connection {
                peripheral,
                notify_task: None,
            },
        );
        if let Some(task) = previous.and_then(|c| c.notify_task) {
            task.abort();
        }
        Ok(())
    }

    async fn set_mtu(&self, id: &str, mtu: u16) -> Result<(), TransportError> {
        self.connected(id)?;
        // btleplug 不支持主动请求 MTU，由系统协商
        debug!("MTU {} requested for {}, left to the platform", mtu, id);
        Ok(())
    }

    async fn list_services(&self, id: &str) -> Result<Vec<Uuid>, TransportError> {
        let peripheral = self.connected(id)?;
        peripheral.discover_services().await.map_err(map_ble_error)?;
        Ok(peripheral.services().into_iter().map(|s| s.uuid).collect())
    }

    async fn list_characteristics(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Vec<Uuid>, TransportError> {
        let peripheral = self.connected(id)?;
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| TransportError::ServiceNotFound(id.to_string()))?;
        Ok(service.characteristics.into_iter().map(|c| c.uuid).collect())
    }

    async fn write_characteristic(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.connected(id)?;
        let characteristic = Self::find_characteristic(&peripheral, service, characteristic)?;
        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn subscribe_notifications(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        on_data: NotifyHandler,
    ) -> Result<(), TransportError> {
        let peripheral = self.connected(id)?;
        let target = Self::find_characteristic(&peripheral, service, characteristic)?;

        let mut stream = peripheral.notifications().await.map_err(map_ble_error)?;
        peripheral.subscribe(&target).await.map_err(map_ble_error)?;

        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == characteristic {
                    on_data(&notification.value);
                }
            }
            debug!("Notification stream closed");
        });

        match lock(&self.connections).get_mut(id) {
            Some(conn) => {
                if let Some(old) = conn.notify_task.replace(task) {
                    old.abort();
                }
            }
            None => task.abort(),
        }
        Ok(())
    }

    async fn disconnect(&self, id: &str) {
        let removed = lock(&self.connections).remove(id);
        let Some(conn) = removed else {
            debug!("Disconnect requested for unknown device {}", id);
            return;
        };
        if let Some(task) = conn.notify_task {
            task.abort();
        }
        if let Err(e) = conn.peripheral.disconnect().await {
            warn!("Failed to disconnect {}: {}", id, e);
        }
    }
}

fn map_ble_error(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::PermissionDenied => {
            TransportError::PermissionDenied("Bluetooth access was refused".to_string())
        }
        other => TransportError::Ble(other),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
