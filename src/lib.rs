//! OHCI (USB 1.1) and EHCI (USB 2.0) host-controller emulation core, plus a
//! USB/IP client backend for remote device discovery.
//!
//! This crate implements the guest-facing half of a virtual USB host
//! controller: register files, guest-memory descriptor walkers, URB
//! assembly, and completion retirement. It does not implement an actual USB
//! device; callers provide a [`vusb::VusbConnector`] that accepts
//! assembled URBs and completes them, and a [`mem::GuestMemory`] that backs
//! guest-physical reads/writes.

pub mod error;
pub mod inflight;
pub mod mem;
pub mod mmio;
pub mod pages;
pub mod urb;
pub mod vusb;

pub mod ehci;
pub mod ohci;
pub mod usbip;

pub use error::{MemError, RateLimiter, SubmitError, WireError};
pub use mem::{GuestMemory, MemAccessor};
pub use mmio::MmioResult;
pub use urb::{Direction, TransferType, Urb, UrbCompletion, UrbRef, VusbStatus};
pub use vusb::{InterruptLine, VusbConnector};
