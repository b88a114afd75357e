//! 配网工具配置和持久化
//!
//! 提供设备名过滤、扫描时长、各阶段超时等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// 会话各阶段的时间参数 (毫秒)
///
/// 默认值与设备固件的节奏匹配，不建议调小。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimings {
    /// 连接后到发现服务前的等待
    pub connect_settle_ms: u64,
    /// 订阅通知后到开始协商前的等待 (固件稳定)
    pub subscribe_settle_ms: u64,
    /// 分片之间的间隔
    pub fragment_interval_ms: u64,
    /// SSID / 密码帧之间的间隔
    pub field_interval_ms: u64,
    /// 等待设备公钥的期限
    pub negotiation_timeout_ms: u64,
    /// 等待配网结果的总窗口
    pub configure_window_ms: u64,
    /// 配网结果的单次轮询期限
    pub configure_poll_ms: u64,
    /// WiFi 列表的单次轮询期限
    pub wifi_list_poll_ms: u64,
    /// WiFi 列表的默认总窗口
    pub wifi_list_window_ms: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            connect_settle_ms: 500,
            subscribe_settle_ms: 2000,
            fragment_interval_ms: 100,
            field_interval_ms: 100,
            negotiation_timeout_ms: 10_000,
            configure_window_ms: 15_000,
            configure_poll_ms: 2000,
            wifi_list_poll_ms: 5000,
            wifi_list_window_ms: 10_000,
        }
    }
}

impl SessionTimings {
    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }

    pub fn subscribe_settle(&self) -> Duration {
        Duration::from_millis(self.subscribe_settle_ms)
    }

    pub fn fragment_interval(&self) -> Duration {
        Duration::from_millis(self.fragment_interval_ms)
    }

    pub fn field_interval(&self) -> Duration {
        Duration::from_millis(self.field_interval_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn configure_window(&self) -> Duration {
        Duration::from_millis(self.configure_window_ms)
    }

    pub fn configure_poll(&self) -> Duration {
        Duration::from_millis(self.configure_poll_ms)
    }

    pub fn wifi_list_poll(&self) -> Duration {
        Duration::from_millis(self.wifi_list_poll_ms)
    }

    pub fn wifi_list_window(&self) -> Duration {
        Duration::from_millis(self.wifi_list_window_ms)
    }
}

/// 配网工具设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerSettings {
    /// 设备名包含任一关键字即视为 BluFi 设备
    pub name_filters: Vec<String>,
    /// BLE 扫描时长
    pub scan_duration_ms: u64,
    /// 请求的 MTU
    pub mtu: u16,
    /// GATT 连接超时
    pub connect_timeout_ms: u64,
    /// 详细日志模式
    pub verbose: bool,
    pub timings: SessionTimings,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            name_filters: vec!["BLUFI".to_string(), "Voxia".to_string()],
            scan_duration_ms: 5000,
            mtu: 512,
            connect_timeout_ms: 10_000,
            verbose: false,
            timings: SessionTimings::default(),
        }
    }
}

impl ProvisionerSettings {
    /// 获取配置文件路径
    fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blufi");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在或损坏则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// 设备名是否匹配任一过滤关键字；没有关键字时全部匹配
    pub fn matches_name(&self, name: &str) -> bool {
        self.name_filters.is_empty() || self.name_filters.iter().any(|f| name.contains(f.as_str()))
    }
}
