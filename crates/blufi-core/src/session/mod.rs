//! BluFi 会话
//!
//! 一个 [`BluFiSession`] 对应一条设备连接，封装完整的配网流程:
//! 1. 连接设备并订阅通知
//! 2. DH 安全协商，得到会话密钥
//! 3. 发送 SSID / 密码并等待设备上报连接结果
//! 4. 断开连接
//!
//! 会话持有序号计数器、会话密钥和等待槽位，不依赖任何全局状态。

pub mod correlator;
pub mod negotiator;

pub use correlator::{CorrelatorState, PendingResponse, ResponseCorrelator};
pub use negotiator::{NegotiationState, SecurityNegotiator};

use crate::ble::{BLUFI_NOTIFY_CHAR_UUID, BLUFI_SERVICE_UUID, BLUFI_WRITE_CHAR_UUID, same_alias};
use crate::config::ProvisionerSettings;
use crate::crypto::SessionCipher;
use crate::error::{BlufiError, HandshakeError, Result};
use crate::protocol::{
    Frame, FrameControl, FrameType, WifiEntry, fragment, parse_wifi_list, subtype,
};
use crate::transport::{DiscoveredDevice, Transport, TransportError};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use uuid::Uuid;

/// 状态回调，每个阶段切换时调用一次
pub trait StatusCallback: Send + Sync {
    fn on_status(&self, status: &str);
}

impl<F> StatusCallback for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_status(&self, status: &str) {
        self(status);
    }
}

/// 把状态转发到 channel 的回调实现
pub struct SimpleStatusCallback {
    tx: mpsc::Sender<String>,
}

impl SimpleStatusCallback {
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl StatusCallback for SimpleStatusCallback {
    fn on_status(&self, status: &str) {
        let _ = self.tx.try_send(status.to_string());
    }
}

/// 配网结果；超时没有收到成功状态属于正常结果，不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfigResult {
    pub success: bool,
}

/// 已解析出的 BluFi GATT 通道
#[derive(Debug, Clone, Copy)]
struct Link {
    service: Uuid,
    write_char: Uuid,
}

pub struct BluFiSession<T: Transport> {
    transport: T,
    settings: ProvisionerSettings,
    device_id: Option<String>,
    link: Option<Link>,
    sequence: u8,
    cipher: Option<SessionCipher>,
    /// 本次连接的协商已失败，需重新连接
    handshake_failed: bool,
    correlator: Arc<ResponseCorrelator>,
    status: Option<Arc<dyn StatusCallback>>,
}

impl<T: Transport> BluFiSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_settings(transport, ProvisionerSettings::default())
    }

    pub fn with_settings(transport: T, settings: ProvisionerSettings) -> Self {
        Self {
            transport,
            settings,
            device_id: None,
            link: None,
            sequence: 0,
            cipher: None,
            handshake_failed: false,
            correlator: ResponseCorrelator::new(),
            status: None,
        }
    }

    pub fn set_status_callback(&mut self, callback: Arc<dyn StatusCallback>) {
        self.status = Some(callback);
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    /// 下一帧将使用的序号
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_negotiated(&self) -> bool {
        self.cipher.is_some()
    }

    /// 初始化蓝牙适配器
    pub async fn init(&self) -> Result<()> {
        self.transport.open_adapter().await?;
        info!("Bluetooth adapter ready");
        Ok(())
    }

    /// 扫描名称匹配的 BluFi 设备
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        let settings = self.settings.clone();
        let filter = move |device: &DiscoveredDevice| settings.matches_name(&device.name);

        info!("Scanning for BluFi devices for {:?}", timeout);
        let found = self.transport.discover(&filter, timeout).await?;

        let mut seen = HashSet::new();
        let devices: Vec<_> = found
            .into_iter()
            .filter(|d| seen.insert(d.id.clone()))
            .collect();
        info!("Scan complete: found {} BluFi device(s)", devices.len());
        Ok(devices)
    }

    /// 连接设备并订阅通知
    ///
    /// 序号归零，之前的会话密钥作废。设备 ID 在连接前记录，
    /// 中途失败后仍可调用 [`disconnect`](Self::disconnect) 释放连接。
    pub async fn connect(&mut self, device_id: &str) -> Result<()> {
        self.emit_status("连接中...");
        self.device_id = Some(device_id.to_string());
        self.link = None;
        self.sequence = 0;
        self.cipher = None;
        self.handshake_failed = false;

        self.transport
            .connect(device_id, self.settings.connect_timeout())
            .await?;

        if let Err(e) = self.transport.set_mtu(device_id, self.settings.mtu).await {
            warn!("Failed to set MTU {}: {}", self.settings.mtu, e);
        }

        time::sleep(self.settings.timings.connect_settle()).await;

        let service = self
            .transport
            .list_services(device_id)
            .await?
            .into_iter()
            .find(|uuid| same_alias(uuid, &BLUFI_SERVICE_UUID))
            .ok_or_else(|| TransportError::ServiceNotFound(device_id.to_string()))?;

        let characteristics = self
            .transport
            .list_characteristics(device_id, service)
            .await?;
        let find_char = |wanted: Uuid| {
            characteristics
                .iter()
                .copied()
                .find(|uuid| same_alias(uuid, &wanted))
                .ok_or(TransportError::CharacteristicNotFound(wanted))
        };
        let write_char = find_char(BLUFI_WRITE_CHAR_UUID)?;
        let notify_char = find_char(BLUFI_NOTIFY_CHAR_UUID)?;
        debug!(
            "BluFi channel: service={} write={} notify={}",
            service, write_char, notify_char
        );

        let correlator = Arc::clone(&self.correlator);
        self.transport
            .subscribe_notifications(
                device_id,
                service,
                notify_char,
                Arc::new(move |bytes: &[u8]| correlator.on_notification(bytes)),
            )
            .await?;

        self.link = Some(Link {
            service,
            write_char,
        });

        // 固件订阅后需要一段时间才能处理协商数据
        time::sleep(self.settings.timings.subscribe_settle()).await;

        self.emit_status("已连接");
        Ok(())
    }

    /// DH 安全协商
    ///
    /// 失败 (包括超时) 对本次连接是致命的，调用方需要断开后重新连接。
    pub async fn negotiate(&mut self) -> Result<()> {
        self.usable_link()?;
        if self.cipher.is_some() {
            return Err(HandshakeError::InvalidState(NegotiationState::Established).into());
        }

        self.emit_status("安全协商...");
        let mut negotiator = SecurityNegotiator::new();
        match self.run_negotiation(&mut negotiator).await {
            Ok(cipher) => {
                self.cipher = Some(cipher);
                self.emit_status("协商完成");
                Ok(())
            }
            Err(e) => {
                self.handshake_failed = true;
                warn!("Security negotiation failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_negotiation(
        &mut self,
        negotiator: &mut SecurityNegotiator,
    ) -> Result<SessionCipher> {
        negotiator.generate_keys()?;

        let announcement = negotiator.length_announcement()?;
        self.send_frame(
            FrameType::Data,
            subtype::DATA_NEGOTIATE,
            FrameControl::default(),
            &announcement,
        )
        .await?;

        let block = negotiator.parameter_block()?;

        // 先登记等待，设备可能在最后一个分片写入后立即回应
        let pending = self.correlator.begin()?;
        self.send_fragmented(&block).await?;
        negotiator.await_peer_key()?;

        let response = pending
            .wait(self.settings.timings.negotiation_timeout())
            .await?;
        debug!("Received peer public key ({} bytes)", response.payload.len());

        Ok(negotiator.complete(&response.payload)?)
    }

    /// 发送 WiFi 凭据并等待设备上报连接结果
    ///
    /// 协商完成后 SSID / 密码加密发送；从未协商过的连接以明文发送。
    /// 协商失败后的连接不会发送任何凭据。
    pub async fn configure_wifi(&mut self, ssid: &str, password: &str) -> Result<WifiConfigResult> {
        self.usable_link()?;
        self.emit_status("配网中...");

        if self.cipher.is_none() {
            warn!("Session not negotiated, sending WiFi credentials unencrypted");
        }
        let field_control = FrameControl::default().with_encrypted(self.cipher.is_some());
        let field_interval = self.settings.timings.field_interval();

        self.send_frame(
            FrameType::Data,
            subtype::DATA_STA_SSID,
            field_control,
            ssid.as_bytes(),
        )
        .await?;
        time::sleep(field_interval).await;

        self.send_frame(
            FrameType::Data,
            subtype::DATA_STA_PASSWORD,
            field_control,
            password.as_bytes(),
        )
        .await?;
        time::sleep(field_interval).await;

        self.emit_status("等待结果...");
        let timings = &self.settings.timings;
        let (window, poll) = (timings.configure_window(), timings.configure_poll());

        let pending = self.correlator.begin()?;
        self.send_frame(
            FrameType::Control,
            subtype::CTRL_CONNECT_WIFI,
            FrameControl::default(),
            &[],
        )
        .await?;

        let report = self
            .poll_for(pending, window, poll, |frame| {
                frame.is(FrameType::Data, subtype::DATA_WIFI_STATUS)
                    && frame.payload.get(1) == Some(&0)
            })
            .await?;

        let success = report.is_some();
        if success {
            info!("Device reported WiFi connected");
        } else {
            warn!("No successful WiFi status within {:?}", window);
        }
        Ok(WifiConfigResult { success })
    }

    /// 请求设备扫描周围的 WiFi
    ///
    /// 返回按信号强度降序排列的列表；窗口内没有收到报告时返回空列表。
    pub async fn get_wifi_list(&mut self, timeout: Duration) -> Result<Vec<WifiEntry>> {
        self.usable_link()?;
        self.emit_status("扫描WiFi中...");

        let poll = self.settings.timings.wifi_list_poll();
        let pending = self.correlator.begin()?;
        self.send_frame(
            FrameType::Control,
            subtype::CTRL_GET_WIFI_LIST,
            FrameControl::default(),
            &[],
        )
        .await?;

        let entries = self
            .poll_for(pending, timeout, poll, |frame| {
                frame.is(FrameType::Data, subtype::DATA_WIFI_LIST)
            })
            .await?
            .map(|frame| parse_wifi_list(&frame.payload))
            .unwrap_or_default();

        self.emit_status(&format!("发现 {} 个WiFi", entries.len()));
        Ok(entries)
    }

    /// 断开连接并丢弃会话密钥
    ///
    /// 不会取消正在进行的等待，等待会按自己的期限结束。
    pub async fn disconnect(&mut self) {
        self.link = None;
        self.cipher = None;
        self.handshake_failed = false;
        if let Some(device_id) = self.device_id.take() {
            self.transport.disconnect(&device_id).await;
            info!("Disconnected from {}", device_id);
        }
    }

    /// 在 `window` 内以 `poll` 为单次期限反复等待，直到收到满足 `accept` 的帧
    ///
    /// 单次超时被吞掉并继续等待；每次等待都被截断到剩余窗口内。
    async fn poll_for<F>(
        &self,
        first: PendingResponse,
        window: Duration,
        poll: Duration,
        accept: F,
    ) -> Result<Option<Frame>>
    where
        F: Fn(&Frame) -> bool,
    {
        let deadline = Instant::now() + window;
        let mut pending = Some(first);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let waiter = match pending.take() {
                Some(p) => p,
                None => self.correlator.begin()?,
            };

            match waiter.wait(remaining.min(poll)).await {
                Ok(frame) if accept(&frame) => return Ok(Some(frame)),
                Ok(frame) => debug!("Ignoring frame while polling: {}", frame),
                Err(BlufiError::Timeout(d)) => debug!("No frame within {:?}, still polling", d),
                Err(e) => return Err(e),
            }
        }
    }

    /// 分片发送协商数据
    async fn send_fragmented(&mut self, data: &[u8]) -> Result<()> {
        let fragments = fragment(data)?;
        debug!(
            "Sending {} bytes in {} fragment(s)",
            data.len(),
            fragments.len()
        );

        let interval = self.settings.timings.fragment_interval();
        for frag in fragments {
            let control = FrameControl::default().with_fragment(frag.more);
            self.send_frame(
                FrameType::Data,
                subtype::DATA_NEGOTIATE,
                control,
                &frag.payload,
            )
            .await?;
            time::sleep(interval).await;
        }
        Ok(())
    }

    /// 分配序号、按需加密并写入设备
    ///
    /// 序号在编码成功后递增 (mod 256)，写入失败也不会回退。
    async fn send_frame(
        &mut self,
        frame_type: FrameType,
        subtype: u8,
        control: FrameControl,
        payload: &[u8],
    ) -> Result<()> {
        let (device_id, link) = self.link()?;
        let sequence = self.sequence;

        let (control, payload) = match (&self.cipher, control.is_encrypted()) {
            (Some(cipher), true) => (control, cipher.encrypt(payload, sequence)),
            _ => (control.with_encrypted(false), payload.to_vec()),
        };

        let frame = Frame::new(frame_type, subtype, sequence, payload).with_control(control);
        let bytes = frame.encode()?;
        self.sequence = sequence.wrapping_add(1);

        trace!("-> {}", frame);
        self.transport
            .write_characteristic(&device_id, link.service, link.write_char, &bytes)
            .await?;
        Ok(())
    }

    fn link(&self) -> Result<(String, Link)> {
        match (&self.device_id, self.link) {
            (Some(id), Some(link)) => Ok((id.clone(), link)),
            _ => Err(BlufiError::NotConnected),
        }
    }

    /// 已连接且协商没有失败
    fn usable_link(&self) -> Result<(String, Link)> {
        let link = self.link()?;
        if self.handshake_failed {
            return Err(HandshakeError::InvalidState(NegotiationState::Failed).into());
        }
        Ok(link)
    }

    fn emit_status(&self, status: &str) {
        info!("{}", status);
        if let Some(cb) = &self.status {
            cb.on_status(status);
        }
    }
}
