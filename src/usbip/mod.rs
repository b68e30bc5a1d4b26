//! USB/IP client (C12): discovers devices exported by a remote USB/IP
//! server over TCP and republishes them as [`UsbIpDevice`] records for the
//! embedder's proxy layer. Independent of the OHCI/EHCI cores; nothing here
//! touches guest memory or the VUSB connector trait.

mod client;
mod wire;

pub use client::{UsbIpClient, UsbIpConfig, UsbIpDevice, UsbIpInterface};
pub use wire::{DeviceInterfaceRecord, ExportedDeviceRecord, UsbIpSpeed};
