//! USB/IP wire structures (C12): header codes and the fixed-size records the
//! server sends back for `OP_REQ/RET_DEVLIST`. All multi-byte fields are
//! network byte order; string fields are fixed-width and NUL-padded.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Protocol version used by this client, matching the reference server.
pub const USBIP_VERSION: u16 = 0x0111;

/// Request-indicator bit set in the command code of every client request.
const USBIP_INDICATOR_REQ: u16 = 0x8000;

/// Command/reply code for the device-list request/reply pair.
const USBIP_CODE_DEVLIST: u16 = 0x0005;

/// Full command code sent by the client (`0x8000 | 0x0005`).
pub const CMD_REQ_DEVLIST: u16 = USBIP_INDICATOR_REQ | USBIP_CODE_DEVLIST;

/// Sanity cap on `n_devices` in a reply header: a real server reports at
/// most a few dozen exported devices, so three orders of magnitude more
/// than that is always a malformed or hostile reply, not a real one.
const MAX_SANE_DEVICES: u32 = 4096;

pub const REQ_DEVLIST_LEN: usize = 8;
pub const RET_DEVLIST_HDR_LEN: usize = 12;
pub const EXPORTED_DEVICE_LEN: usize = 312;
pub const DEVICE_INTERFACE_LEN: usize = 4;

/// Serializes the `OP_REQ_DEVLIST` request: `{ ver, cmd, status=0 }`.
pub fn encode_req_devlist() -> [u8; REQ_DEVLIST_LEN] {
    let mut buf = [0u8; REQ_DEVLIST_LEN];
    buf[0..2].copy_from_slice(&USBIP_VERSION.to_be_bytes());
    buf[2..4].copy_from_slice(&CMD_REQ_DEVLIST.to_be_bytes());
    buf[4..8].copy_from_slice(&0i32.to_be_bytes());
    buf
}

/// Decoded `OP_RET_DEVLIST` header, minus the device records that follow it.
#[derive(Debug, Clone, Copy)]
pub struct RetDevListHeader {
    pub n_devices: u32,
}

/// Validates and decodes the 12-byte reply header. Rejects anything that
/// doesn't echo our version, doesn't carry the devlist reply code, reports a
/// non-zero status, or claims an implausible device count.
pub fn decode_ret_devlist_header(buf: &[u8; RET_DEVLIST_HDR_LEN]) -> Result<RetDevListHeader, WireError> {
    let version = u16::from_be_bytes(buf[0..2].try_into().unwrap());
    let cmd = u16::from_be_bytes(buf[2..4].try_into().unwrap());
    let status = i32::from_be_bytes(buf[4..8].try_into().unwrap());
    if version != USBIP_VERSION {
        return Err(WireError::BadVersion(version));
    }
    if cmd != USBIP_CODE_DEVLIST {
        return Err(WireError::UnexpectedCode(cmd));
    }
    if status != 0 {
        return Err(WireError::UnexpectedCode(status as u16));
    }
    let n_devices = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    if n_devices > MAX_SANE_DEVICES {
        return Err(WireError::TooManyDevices(n_devices));
    }
    Ok(RetDevListHeader { n_devices })
}

/// Speed indicator carried in `ExportedDevice.speed`, mapped to the USB
/// bus-speed vocabulary the embedder's VUSB layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsbIpSpeed {
    Unknown,
    Low,
    Full,
    High,
    Wireless,
    Super,
}

impl UsbIpSpeed {
    fn from_wire(v: u32) -> Self {
        match v {
            1 => UsbIpSpeed::Low,
            2 => UsbIpSpeed::Full,
            3 => UsbIpSpeed::High,
            4 => UsbIpSpeed::Wireless,
            5 => UsbIpSpeed::Super,
            _ => UsbIpSpeed::Unknown,
        }
    }
}

/// One `DeviceInterface` record trailing an `ExportedDevice` in the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInterfaceRecord {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

pub fn decode_device_interface(buf: &[u8; DEVICE_INTERFACE_LEN]) -> DeviceInterfaceRecord {
    DeviceInterfaceRecord {
        interface_class: buf[0],
        interface_subclass: buf[1],
        interface_protocol: buf[2],
        // buf[3] is a padding byte.
    }
}

/// One exported-device record, decoded from the 312-byte wire layout.
/// `path`/`busid` are NUL-padded fixed-width ASCII fields on the wire;
/// decoded here as `String`s trimmed at the first NUL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDeviceRecord {
    pub path: String,
    pub busid: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: UsbIpSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn decode_exported_device(buf: &[u8; EXPORTED_DEVICE_LEN]) -> ExportedDeviceRecord {
    let path = nul_terminated(&buf[0..256]);
    let busid = nul_terminated(&buf[256..288]);
    let bus_num = u32::from_be_bytes(buf[288..292].try_into().unwrap());
    let dev_num = u32::from_be_bytes(buf[292..296].try_into().unwrap());
    let speed = UsbIpSpeed::from_wire(u32::from_be_bytes(buf[296..300].try_into().unwrap()));
    let vendor_id = u16::from_be_bytes(buf[300..302].try_into().unwrap());
    let product_id = u16::from_be_bytes(buf[302..304].try_into().unwrap());
    let bcd_device = u16::from_be_bytes(buf[304..306].try_into().unwrap());
    ExportedDeviceRecord {
        path,
        busid,
        bus_num,
        dev_num,
        speed,
        vendor_id,
        product_id,
        bcd_device,
        device_class: buf[306],
        device_subclass: buf[307],
        device_protocol: buf[308],
        configuration_value: buf[309],
        num_configurations: buf[310],
        num_interfaces: buf[311],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_exported_device(busid: &str, n_if: u8) -> [u8; EXPORTED_DEVICE_LEN] {
        let mut buf = [0u8; EXPORTED_DEVICE_LEN];
        buf[256..256 + busid.len()].copy_from_slice(busid.as_bytes());
        buf[288..292].copy_from_slice(&1u32.to_be_bytes()); // bus_num
        buf[292..296].copy_from_slice(&2u32.to_be_bytes()); // dev_num
        buf[296..300].copy_from_slice(&3u32.to_be_bytes()); // speed = High
        buf[300..302].copy_from_slice(&0x1234u16.to_be_bytes());
        buf[302..304].copy_from_slice(&0x5678u16.to_be_bytes());
        buf[311] = n_if;
        buf
    }

    #[test]
    fn decode_exported_device_trims_busid_at_nul() {
        let buf = sample_exported_device("1-1", 1);
        let dev = decode_exported_device(&buf);
        assert_eq!(dev.busid, "1-1");
        assert_eq!(dev.bus_num, 1);
        assert_eq!(dev.dev_num, 2);
        assert_eq!(dev.speed, UsbIpSpeed::High);
        assert_eq!(dev.vendor_id, 0x1234);
        assert_eq!(dev.product_id, 0x5678);
        assert_eq!(dev.num_interfaces, 1);
    }

    #[test]
    fn req_devlist_encodes_expected_bytes() {
        let buf = encode_req_devlist();
        assert_eq!(&buf[0..2], &USBIP_VERSION.to_be_bytes());
        assert_eq!(&buf[2..4], &CMD_REQ_DEVLIST.to_be_bytes());
        assert_eq!(&buf[4..8], &0i32.to_be_bytes());
    }

    #[test]
    fn ret_devlist_header_rejects_bad_version() {
        let mut buf = [0u8; RET_DEVLIST_HDR_LEN];
        buf[0..2].copy_from_slice(&0x9999u16.to_be_bytes());
        buf[2..4].copy_from_slice(&USBIP_CODE_DEVLIST.to_be_bytes());
        assert!(matches!(
            decode_ret_devlist_header(&buf),
            Err(WireError::BadVersion(0x9999))
        ));
    }

    #[test]
    fn ret_devlist_header_rejects_implausible_device_count() {
        let mut buf = [0u8; RET_DEVLIST_HDR_LEN];
        buf[0..2].copy_from_slice(&USBIP_VERSION.to_be_bytes());
        buf[2..4].copy_from_slice(&USBIP_CODE_DEVLIST.to_be_bytes());
        buf[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_ret_devlist_header(&buf),
            Err(WireError::TooManyDevices(_))
        ));
    }

    #[test]
    fn device_interface_decodes_three_fields_ignoring_padding() {
        let buf = [1u8, 2, 3, 0xFF];
        let rec = decode_device_interface(&buf);
        assert_eq!(rec.interface_class, 1);
        assert_eq!(rec.interface_subclass, 2);
        assert_eq!(rec.interface_protocol, 3);
    }
}
