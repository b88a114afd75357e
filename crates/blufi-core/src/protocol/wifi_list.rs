//! 设备 WiFi 扫描结果解析
//!
//! 载荷格式 (ESP-IDF): 重复的 `[len(1), rssi(1, 有符号), ssid(len - 1)]`，
//! 其中 `len` 包含 rssi 字节。

use serde::{Deserialize, Serialize};

/// 设备扫描到的一个 WiFi
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiEntry {
    pub ssid: String,
    /// 信号强度 (dBm)
    pub signal_strength: i8,
}

/// 解析 WiFi 列表载荷
///
/// 遇到 `len <= 1` 或越界的条目即停止；空 SSID 跳过；按 SSID 去重 (保留首个)；
/// 结果按信号强度从强到弱排序。
pub fn parse_wifi_list(payload: &[u8]) -> Vec<WifiEntry> {
    let mut entries: Vec<WifiEntry> = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let entry_len = payload[offset] as usize;
        if entry_len <= 1 || offset + 1 + entry_len > payload.len() {
            break;
        }

        let rssi = payload[offset + 1] as i8;
        let ssid_bytes = &payload[offset + 2..offset + 1 + entry_len];
        let ssid = String::from_utf8_lossy(ssid_bytes).into_owned();

        if !ssid.is_empty() && !entries.iter().any(|e| e.ssid == ssid) {
            entries.push(WifiEntry {
                ssid,
                signal_strength: rssi,
            });
        }

        offset += 1 + entry_len;
    }

    // 稳定排序：信号相同保持设备给出的顺序
    entries.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
    entries
}
