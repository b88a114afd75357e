pub mod client;

pub use client::BtleplugTransport;

use uuid::Uuid;

pub const BLUFI_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffff_0000_1000_8000_00805f9b34fb);
/// 手机 → 设备
pub const BLUFI_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);
/// 设备 → 手机
pub const BLUFI_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

/// 取 UUID 的 16 位短别名 (`0000xxxx-...` 中的 `xxxx`)
pub fn short_alias(uuid: &Uuid) -> u16 {
    (uuid.as_u128() >> 96) as u16
}

/// 两个 UUID 的 16 位短别名是否相同
///
/// 部分固件上报的服务 UUID 不使用蓝牙基础 UUID，只比较短别名。
pub fn same_alias(a: &Uuid, b: &Uuid) -> bool {
    short_alias(a) == short_alias(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_alias() {
        assert_eq!(short_alias(&BLUFI_SERVICE_UUID), 0xffff);
        assert_eq!(short_alias(&BLUFI_WRITE_CHAR_UUID), 0xff01);
        assert_eq!(short_alias(&BLUFI_NOTIFY_CHAR_UUID), 0xff02);
    }

    #[test]
    fn test_same_alias_ignores_base() {
        let vendor = Uuid::from_u128(0x0000ff01_1234_5678_9abc_def012345678);
        assert!(same_alias(&vendor, &BLUFI_WRITE_CHAR_UUID));
        assert!(!same_alias(&vendor, &BLUFI_NOTIFY_CHAR_UUID));
    }
}
