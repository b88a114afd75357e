//! 集成测试 - 模拟设备上的完整配网流程
//!
//! 模拟设备实现 `Transport`：重组协商分片、诚实地完成 DH 交换、
//! 用协商出的密钥解密 SSID / 密码，并按配置回复状态帧或 WiFi 列表。
//! 所有测试使用 tokio 的暂停时钟，10 秒 / 15 秒的期限瞬间完成。

use async_trait::async_trait;
use blufi_core::crypto::aes::Aes128;
use blufi_core::crypto::{BleSecurity, SessionCipher};
use blufi_core::protocol::{Frame, FrameType, Reassembler, subtype};
use blufi_core::session::negotiator::{NEG_PARAM_DATA, NegotiationState};
use blufi_core::transport::DeviceFilter;
use blufi_core::{
    BLUFI_NOTIFY_CHAR_UUID, BLUFI_SERVICE_UUID, BLUFI_WRITE_CHAR_UUID, BluFiSession, BlufiError,
    DiscoveredDevice, HandshakeError, NotifyHandler, Transport, TransportError, WifiEntry,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const DEVICE: &str = "24:0A:C4:00:00:01";

#[derive(Clone)]
enum KeyReply {
    Honest,
    Silent,
    Raw(Vec<u8>),
}

#[derive(Clone)]
struct Behavior {
    key_reply: KeyReply,
    /// 收到连接命令后回复的状态码 (payload[1])
    status_code: Option<u8>,
    wifi_report: Option<Vec<u8>>,
    /// 每次回复前先发送几条损坏的通知
    garbage: bool,
    /// 收到请求到发出回复的间隔
    reply_delay: Duration,
    services: Vec<Uuid>,
    nearby: Vec<DiscoveredDevice>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            key_reply: KeyReply::Honest,
            status_code: Some(0),
            wifi_report: None,
            garbage: false,
            reply_delay: Duration::from_millis(50),
            services: vec![
                Uuid::from_u128(0x00001801_0000_1000_8000_00805f9b34fb),
                BLUFI_SERVICE_UUID,
            ],
            nearby: vec![],
        }
    }
}

#[derive(Default)]
struct PeerState {
    frames: Vec<Frame>,
    ssid: Option<Vec<u8>>,
    password: Option<Vec<u8>>,
    disconnects: Vec<String>,
    handler: Option<NotifyHandler>,
    reassembler: Reassembler,
    cipher: Option<SessionCipher>,
}

impl PeerState {
    fn open(&self, frame: &Frame) -> Vec<u8> {
        if !frame.control.is_encrypted() {
            return frame.payload.clone();
        }
        let cipher = self.cipher.as_ref().expect("encrypted frame before key exchange");
        cfb_decrypt(
            cipher.block_cipher(),
            &frame.payload,
            SessionCipher::iv_for_sequence(frame.sequence),
        )
    }
}

#[derive(Clone)]
struct SimulatedDevice {
    behavior: Behavior,
    state: Arc<Mutex<PeerState>>,
}

impl SimulatedDevice {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            state: Arc::default(),
        }
    }

    fn frames(&self) -> Vec<Frame> {
        self.state.lock().unwrap().frames.clone()
    }

    fn ssid(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().ssid.clone()
    }

    fn password(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().password.clone()
    }

    fn disconnects(&self) -> Vec<String> {
        self.state.lock().unwrap().disconnects.clone()
    }

    fn handle(&self, frame: Frame) -> Option<Frame> {
        let mut state = self.state.lock().unwrap();
        state.frames.push(frame.clone());

        match (frame.frame_type, frame.subtype) {
            (FrameType::Data, subtype::DATA_NEGOTIATE) => {
                let message = state.reassembler.push(&frame).expect("bad fragment chain")?;
                if message.first() != Some(&NEG_PARAM_DATA) {
                    return None;
                }
                match &self.behavior.key_reply {
                    KeyReply::Silent => None,
                    KeyReply::Raw(bytes) => {
                        Some(Frame::data(subtype::DATA_NEGOTIATE, 0, bytes.clone()))
                    }
                    KeyReply::Honest => {
                        let peer = BleSecurity::generate(&mut StdRng::seed_from_u64(42));
                        let public = peer.public_key_bytes();
                        state.cipher = Some(peer.derive_session_key(&message[136..264]).unwrap());
                        Some(Frame::data(subtype::DATA_NEGOTIATE, 0, public))
                    }
                }
            }
            (FrameType::Data, subtype::DATA_STA_SSID) => {
                let ssid = state.open(&frame);
                state.ssid = Some(ssid);
                None
            }
            (FrameType::Data, subtype::DATA_STA_PASSWORD) => {
                let password = state.open(&frame);
                state.password = Some(password);
                None
            }
            (FrameType::Control, subtype::CTRL_CONNECT_WIFI) => self
                .behavior
                .status_code
                .map(|code| Frame::data(subtype::DATA_WIFI_STATUS, 0, vec![0x01, code, 0x00])),
            (FrameType::Control, subtype::CTRL_GET_WIFI_LIST) => self
                .behavior
                .wifi_report
                .clone()
                .map(|report| Frame::data(subtype::DATA_WIFI_LIST, 0, report)),
            _ => None,
        }
    }

    fn notify_later(&self, reply: Frame) {
        let handler = self
            .state
            .lock()
            .unwrap()
            .handler
            .clone()
            .expect("notifications not subscribed");
        let garbage = self.behavior.garbage;
        let delay = self.behavior.reply_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if garbage {
                handler(&[0xff]);
                handler(&[0x01, 0x00, 0x00, 0x40, 0x01]);
                handler(&[0xfe, 0x00, 0x00, 0x00]);
            }
            handler(&reply.encode().unwrap());
        });
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn open_adapter(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn discover(
        &self,
        filter: &DeviceFilter,
        _duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        Ok(self
            .behavior
            .nearby
            .iter()
            .filter(|d| filter(d))
            .cloned()
            .collect())
    }

    async fn connect(&self, id: &str, _timeout: Duration) -> Result<(), TransportError> {
        if id == DEVICE {
            Ok(())
        } else {
            Err(TransportError::DeviceNotFound(id.to_string()))
        }
    }

    async fn set_mtu(&self, _id: &str, _mtu: u16) -> Result<(), TransportError> {
        Err(TransportError::ConnectionFailed("MTU request rejected".to_string()))
    }

    async fn list_services(&self, _id: &str) -> Result<Vec<Uuid>, TransportError> {
        Ok(self.behavior.services.clone())
    }

    async fn list_characteristics(
        &self,
        _id: &str,
        _service: Uuid,
    ) -> Result<Vec<Uuid>, TransportError> {
        Ok(vec![BLUFI_WRITE_CHAR_UUID, BLUFI_NOTIFY_CHAR_UUID])
    }

    async fn write_characteristic(
        &self,
        _id: &str,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        assert_eq!(characteristic, BLUFI_WRITE_CHAR_UUID);
        let frame = Frame::decode(data).expect("session wrote a malformed frame");
        if let Some(reply) = self.handle(frame) {
            self.notify_later(reply);
        }
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        _id: &str,
        service: Uuid,
        characteristic: Uuid,
        on_data: NotifyHandler,
    ) -> Result<(), TransportError> {
        assert_eq!(service, BLUFI_SERVICE_UUID);
        assert_eq!(characteristic, BLUFI_NOTIFY_CHAR_UUID);
        self.state.lock().unwrap().handler = Some(on_data);
        Ok(())
    }

    async fn disconnect(&self, id: &str) {
        self.state.lock().unwrap().disconnects.push(id.to_string());
    }
}

fn cfb_decrypt(aes: &Aes128, data: &[u8], iv: [u8; 16]) -> Vec<u8> {
    let mut feedback = iv;
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(16) {
        let keystream = aes.encrypt_block(&feedback);
        out.extend(chunk.iter().zip(keystream).map(|(c, k)| c ^ k));
        if chunk.len() == 16 {
            feedback.copy_from_slice(chunk);
        }
    }
    out
}

fn session_with(behavior: Behavior) -> (BluFiSession<SimulatedDevice>, Arc<Mutex<Vec<String>>>) {
    let mut session = BluFiSession::new(SimulatedDevice::new(behavior));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    session.set_status_callback(Arc::new(move |s: &str| {
        sink.lock().unwrap().push(s.to_string());
    }));
    (session, statuses)
}

#[tokio::test(start_paused = true)]
async fn test_provision_end_to_end() {
    let (mut session, statuses) = session_with(Behavior::default());

    session.init().await.unwrap();
    session.connect(DEVICE).await.unwrap();
    assert_eq!(session.sequence(), 0);

    session.negotiate().await.unwrap();
    assert!(session.is_negotiated());

    let result = session.configure_wifi("TestNet", "pass1234").await.unwrap();
    assert!(result.success);

    let device = session.transport();
    assert_eq!(device.ssid().as_deref(), Some(&b"TestNet"[..]));
    assert_eq!(device.password().as_deref(), Some(&b"pass1234"[..]));

    session.disconnect().await;
    assert!(!session.is_connected());
    assert_eq!(session.transport().disconnects(), vec![DEVICE]);

    assert_eq!(
        *statuses.lock().unwrap(),
        vec!["连接中...", "已连接", "安全协商...", "协商完成", "配网中...", "等待结果..."]
    );
}

#[tokio::test(start_paused = true)]
async fn test_wire_traffic_layout() {
    let (mut session, _) = session_with(Behavior::default());
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap();
    session.configure_wifi("TestNet", "pass1234").await.unwrap();

    let frames = session.transport().frames();
    // 长度声明 + 17 个参数分片 + SSID + 密码 + 连接命令
    assert_eq!(frames.len(), 21);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.sequence as usize, i);
    }

    assert!(frames[0].is(FrameType::Data, subtype::DATA_NEGOTIATE));
    assert_eq!(frames[0].payload, vec![0x00, 0x01, 0x07]);
    assert!(!frames[0].control.has_more_fragments());

    let params = &frames[1..18];
    assert!(params[..16].iter().all(|f| f.control.has_more_fragments()));
    assert!(!params[16].control.has_more_fragments());
    assert!(params.iter().all(|f| !f.control.is_encrypted()));
    // 第一片: 2 字节总长度 + 14 字节数据
    assert_eq!(params[0].payload.len(), 16);
    assert_eq!(&params[0].payload[..2], &264u16.to_le_bytes());

    let ssid = &frames[18];
    assert!(ssid.is(FrameType::Data, subtype::DATA_STA_SSID));
    assert!(ssid.control.is_encrypted());
    assert_ne!(ssid.payload, b"TestNet".to_vec());
    assert!(frames[19].is(FrameType::Data, subtype::DATA_STA_PASSWORD));
    assert!(frames[19].control.is_encrypted());

    let apply = &frames[20];
    assert!(apply.is(FrameType::Control, subtype::CTRL_CONNECT_WIFI));
    assert!(apply.payload.is_empty());
    assert!(!apply.control.is_encrypted());
}

#[tokio::test(start_paused = true)]
async fn test_configure_without_negotiation_sends_plaintext() {
    let (mut session, _) = session_with(Behavior::default());
    session.connect(DEVICE).await.unwrap();

    let result = session.configure_wifi("Cafe", "latte").await.unwrap();
    assert!(result.success);

    let device = session.transport();
    assert_eq!(device.ssid().as_deref(), Some(&b"Cafe"[..]));
    assert_eq!(device.password().as_deref(), Some(&b"latte"[..]));
    let frames = device.frames();
    assert_eq!(frames[0].payload, b"Cafe".to_vec());
    assert!(!frames[0].control.is_encrypted());
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_reports_failure_after_window() {
    let (mut session, _) = session_with(Behavior {
        status_code: None,
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap();

    let start = Instant::now();
    let result = session.configure_wifi("TestNet", "pass1234").await.unwrap();
    let elapsed = start.elapsed();

    assert!(!result.success);
    assert!(elapsed >= Duration::from_secs(15), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(16), "returned after {:?}", elapsed);

    // 等待结束后槽位已释放
    assert!(session.get_wifi_list(Duration::from_secs(1)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_late_status_is_accepted_within_window() {
    let (mut session, _) = session_with(Behavior {
        reply_delay: Duration::from_millis(7_500),
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap();

    let start = Instant::now();
    let result = session.configure_wifi("TestNet", "pass1234").await.unwrap();
    let elapsed = start.elapsed();

    // 状态在第四个 2 秒轮询期限内到达
    assert!(result.success);
    assert!(elapsed >= Duration::from_millis(7_500), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(8), "returned after {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_failure_status_is_not_success() {
    let (mut session, _) = session_with(Behavior {
        status_code: Some(2),
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap();

    let result = session.configure_wifi("TestNet", "wrong").await.unwrap();
    assert!(!result.success);
}

#[tokio::test(start_paused = true)]
async fn test_wifi_list_report() {
    let report = vec![
        6, 0xCE, b'A', b'B', b'C', b'D', b'E', 4, 0xF6, b'X', b'Y', b'Z',
    ];
    let (mut session, statuses) = session_with(Behavior {
        wifi_report: Some(report),
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();

    let list = session.get_wifi_list(Duration::from_secs(10)).await.unwrap();
    assert_eq!(
        list,
        vec![
            WifiEntry {
                ssid: "XYZ".to_string(),
                signal_strength: -10
            },
            WifiEntry {
                ssid: "ABCDE".to_string(),
                signal_strength: -50
            },
        ]
    );

    let frames = session.transport().frames();
    assert!(frames[0].is(FrameType::Control, subtype::CTRL_GET_WIFI_LIST));
    assert_eq!(statuses.lock().unwrap().last().unwrap(), "发现 2 个WiFi");
}

#[tokio::test(start_paused = true)]
async fn test_wifi_list_without_report_is_empty() {
    let (mut session, _) = session_with(Behavior::default());
    session.connect(DEVICE).await.unwrap();

    let start = Instant::now();
    let list = session.get_wifi_list(Duration::from_secs(7)).await.unwrap();
    assert!(list.is_empty());
    assert!(start.elapsed() >= Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn test_garbage_notifications_are_ignored() {
    let (mut session, _) = session_with(Behavior {
        garbage: true,
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap();

    let result = session.configure_wifi("TestNet", "pass1234").await.unwrap();
    assert!(result.success);
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_times_out() {
    let (mut session, _) = session_with(Behavior {
        key_reply: KeyReply::Silent,
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();

    let err = session.negotiate().await.unwrap_err();
    assert!(matches!(err, BlufiError::Timeout(d) if d == Duration::from_secs(10)));
    assert!(!session.is_negotiated());
}

#[tokio::test(start_paused = true)]
async fn test_failed_handshake_blocks_credentials() {
    let (mut session, _) = session_with(Behavior {
        key_reply: KeyReply::Silent,
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap_err();
    let sent = session.transport().frames().len();

    let failed = |r: &Result<_, BlufiError>| {
        matches!(
            r,
            Err(BlufiError::Handshake(HandshakeError::InvalidState(
                NegotiationState::Failed
            )))
        )
    };
    assert!(failed(&session.configure_wifi("TestNet", "pass1234").await.map(|_| ())));
    assert!(failed(&session.get_wifi_list(Duration::from_secs(1)).await.map(|_| ())));
    assert!(failed(&session.negotiate().await));

    let device = session.transport();
    assert_eq!(device.frames().len(), sent);
    assert!(device.ssid().is_none());
    assert!(device.password().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_clears_failed_handshake() {
    let (mut session, _) = session_with(Behavior {
        key_reply: KeyReply::Raw(vec![0x5a; 16]),
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap_err();

    session.connect(DEVICE).await.unwrap();
    let result = session.configure_wifi("Cafe", "latte").await.unwrap();
    assert!(result.success);
}

#[tokio::test(start_paused = true)]
async fn test_undersized_peer_key_fails_handshake() {
    let (mut session, _) = session_with(Behavior {
        key_reply: KeyReply::Raw(vec![0x5a; 16]),
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();

    let err = session.negotiate().await.unwrap_err();
    assert!(matches!(
        err,
        BlufiError::Handshake(HandshakeError::MalformedPeerKey(_))
    ));
    assert!(!session.is_negotiated());
}

#[tokio::test(start_paused = true)]
async fn test_renegotiation_is_rejected() {
    let (mut session, _) = session_with(Behavior::default());
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap();

    let err = session.negotiate().await.unwrap_err();
    assert!(matches!(
        err,
        BlufiError::Handshake(HandshakeError::InvalidState(_))
    ));
    assert!(session.is_negotiated());
}

#[tokio::test(start_paused = true)]
async fn test_sequence_wraps_after_256_frames() {
    let (mut session, _) = session_with(Behavior {
        wifi_report: Some(vec![3, 0xC0, b'a', b'b']),
        ..Default::default()
    });
    session.connect(DEVICE).await.unwrap();

    for _ in 0..257 {
        session.get_wifi_list(Duration::from_secs(1)).await.unwrap();
    }

    let frames = session.transport().frames();
    assert_eq!(frames.len(), 257);
    assert_eq!(frames[255].sequence, 255);
    assert_eq!(frames[256].sequence, frames[0].sequence);
    assert_eq!(session.sequence(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resets_session() {
    let (mut session, _) = session_with(Behavior::default());
    session.connect(DEVICE).await.unwrap();
    session.negotiate().await.unwrap();
    assert!(session.sequence() > 0);

    session.connect(DEVICE).await.unwrap();
    assert_eq!(session.sequence(), 0);
    assert!(!session.is_negotiated());
}

#[tokio::test]
async fn test_operations_require_connection() {
    let (mut session, _) = session_with(Behavior::default());

    assert!(matches!(
        session.negotiate().await,
        Err(BlufiError::NotConnected)
    ));
    assert!(matches!(
        session.configure_wifi("a", "b").await,
        Err(BlufiError::NotConnected)
    ));
    assert!(session.transport().frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_service_still_allows_disconnect() {
    let (mut session, _) = session_with(Behavior {
        services: vec![Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb)],
        ..Default::default()
    });

    let err = session.connect(DEVICE).await.unwrap_err();
    assert!(matches!(
        err,
        BlufiError::Transport(TransportError::ServiceNotFound(_))
    ));
    assert!(!session.is_connected());

    session.disconnect().await;
    assert_eq!(session.transport().disconnects(), vec![DEVICE]);
}

#[tokio::test]
async fn test_scan_filters_by_name_and_dedupes() {
    let device = |id: &str, name: &str| DiscoveredDevice {
        id: id.to_string(),
        name: name.to_string(),
        rssi: Some(-60),
    };
    let (session, _) = session_with(Behavior {
        nearby: vec![
            device("AA", "BLUFI_DEVICE"),
            device("BB", "Headphones"),
            device("CC", "Voxia-01"),
            device("AA", "BLUFI_DEVICE"),
        ],
        ..Default::default()
    });

    let found = session.scan(Duration::from_secs(5)).await.unwrap();
    let ids: Vec<_> = found.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["AA", "CC"]);
}
