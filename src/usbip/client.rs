//! USB/IP client (C12): a background thread that periodically queries a
//! remote USB/IP server's exported device list and publishes the decoded
//! result for the proxy layer to poll.
//!
//! The source's self-pipe-plus-pollset wakeup has no direct std analogue
//! (std offers no portable pollable-pipe primitive); `interrupt_wait` is
//! instead a condvar signal, which gives the same externally observable
//! behavior (unblock the waiting thread immediately) without reaching for a
//! platform-specific poll API.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::RateLimiter;

use super::wire::{self, DeviceInterfaceRecord, ExportedDeviceRecord};

/// `Address` configuration for the client (§6.4): `host[:port]`, default
/// port 3240.
#[derive(Debug, Clone)]
pub struct UsbIpConfig {
    pub host: String,
    pub port: u16,
}

const USBIP_PORT_DEFAULT: u16 = 3240;

impl UsbIpConfig {
    /// Parses `host[:port]` as accepted by the embedder's `Address` key.
    pub fn parse(address: &str) -> Option<Self> {
        let mut parts = address.splitn(2, ':');
        let host = parts.next()?.to_string();
        if host.is_empty() {
            return None;
        }
        let port = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => USBIP_PORT_DEFAULT,
        };
        Some(Self { host, port })
    }
}

/// One USB interface on an exported device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbIpInterface {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

impl From<DeviceInterfaceRecord> for UsbIpInterface {
    fn from(r: DeviceInterfaceRecord) -> Self {
        Self {
            interface_class: r.interface_class,
            interface_subclass: r.interface_subclass,
            interface_protocol: r.interface_protocol,
        }
    }
}

/// A device exported by the remote USB/IP server, translated into the form
/// the proxy layer consumes. `address` is the VUSB address the proxy uses to
/// refer to this device: `usbip://host:port:busid` (§6.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbIpDevice {
    pub address: String,
    pub busid: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: wire::UsbIpSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<UsbIpInterface>,
}

fn build_device(rec: ExportedDeviceRecord, interfaces: Vec<UsbIpInterface>, config: &UsbIpConfig) -> UsbIpDevice {
    UsbIpDevice {
        address: format!("usbip://{}:{}:{}", config.host, config.port, rec.busid),
        busid: rec.busid,
        bus_num: rec.bus_num,
        dev_num: rec.dev_num,
        speed: rec.speed,
        vendor_id: rec.vendor_id,
        product_id: rec.product_id,
        bcd_device: rec.bcd_device,
        device_class: rec.device_class,
        device_subclass: rec.device_subclass,
        device_protocol: rec.device_protocol,
        configuration_value: rec.configuration_value,
        num_configurations: rec.num_configurations,
        interfaces,
    }
}

/// Receive state machine (§4.10): a fixed scratch buffer accumulates bytes
/// until the current state's expected size is reached, then the buffer's
/// contents are interpreted and the state advances.
#[derive(Clone, Copy)]
enum RecvState {
    /// No request outstanding; the next iteration issues a fresh
    /// `REQ_DEVLIST` and advances to `Hdr`.
    None,
    Hdr,
    ExportedDevice { devices_left: u32 },
    DeviceInterface { devices_left: u32, interfaces_left: u32 },
}

struct InProgress {
    state: RecvState,
    scratch: Vec<u8>,
    filled: usize,
    devices: Vec<UsbIpDevice>,
    current_interfaces: Vec<UsbIpInterface>,
}

impl InProgress {
    fn idle() -> Self {
        Self {
            state: RecvState::None,
            scratch: Vec::new(),
            filled: 0,
            devices: Vec::new(),
            current_interfaces: Vec::new(),
        }
    }

    fn advance(&mut self, state: RecvState, expect_len: usize) {
        self.scratch = vec![0u8; expect_len];
        self.filled = 0;
        self.state = state;
    }
}

/// Wake primitive for `interrupt_wait`/reconnect-cadence waits, matching the
/// frame clock's condvar pattern (see `ohci::frame_clock`).
struct Wake {
    mutex: Mutex<bool>,
    cv: Condvar,
}

impl Wake {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait_timeout(&self, dur: Duration) {
        let guard = self.mutex.lock().unwrap();
        let _ = self.cv.wait_timeout_while(guard, dur, |&mut woken| !woken).unwrap();
    }

    fn signal(&self) {
        *self.mutex.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.mutex.lock().unwrap() = false;
    }
}

/// Poll cadence between one completed device-list fetch and the next
/// request, once connected and idle.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Socket read-timeout granularity; bounds how quickly `stop`/wakeup are
/// noticed while a receive is in progress.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// How long a connection attempt may block before being treated as a
/// failure for this cycle.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// §5: "if no successful connection for 10s, clear the current device list."
const CLEAR_AFTER: Duration = Duration::from_secs(10);

struct Shared {
    config: UsbIpConfig,
    devices: Mutex<Vec<UsbIpDevice>>,
    version: AtomicU64,
    changed: Condvar,
    changed_mutex: Mutex<()>,
    wake: Wake,
    stop: AtomicBool,
}

/// The USB/IP client: owns a background thread that maintains the TCP
/// connection and the decoded device list.
pub struct UsbIpClient {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl UsbIpClient {
    pub fn start(config: UsbIpConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            devices: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            changed: Condvar::new(),
            changed_mutex: Mutex::new(()),
            wake: Wake::new(),
            stop: AtomicBool::new(false),
        });
        let worker = shared.clone();
        let join = std::thread::Builder::new()
            .name("usbip-client".into())
            .spawn(move || run(worker))
            .expect("spawn usbip client thread");
        Self {
            shared,
            join: Mutex::new(Some(join)),
        }
    }

    /// A deep copy of the current device list (§5: "caller receives a deep
    /// copy").
    pub fn devices(&self) -> Vec<UsbIpDevice> {
        self.shared.devices.lock().unwrap().clone()
    }

    /// Unblocks the client's internal wait immediately instead of waiting
    /// out the current poll interval.
    pub fn interrupt_wait(&self) {
        self.shared.wake.signal();
    }

    /// Blocks until the device list changes (or `timeout` elapses),
    /// returning whether a change was observed. Used by callers that want
    /// to react to churn rather than poll `devices()` themselves.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        let start_version = self.shared.version.load(Ordering::Acquire);
        let guard = self.shared.changed_mutex.lock().unwrap();
        let (_guard, result) = self
            .shared
            .changed
            .wait_timeout_while(guard, timeout, |_| {
                self.shared.version.load(Ordering::Acquire) == start_version
            })
            .unwrap();
        !result.timed_out()
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.signal();
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

impl Drop for UsbIpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish(shared: &Shared, devices: Vec<UsbIpDevice>) {
    let changed = {
        let mut cur = shared.devices.lock().unwrap();
        if *cur != devices {
            *cur = devices;
            true
        } else {
            false
        }
    };
    if changed {
        let _guard = shared.changed_mutex.lock().unwrap();
        shared.version.fetch_add(1, Ordering::AcqRel);
        shared.changed.notify_all();
    }
}

fn clear_devices(shared: &Shared) {
    let had_any = !shared.devices.lock().unwrap().is_empty();
    if had_any {
        publish(shared, Vec::new());
    }
}

/// Establishes a fresh connection, bounded by `CONNECT_TIMEOUT`.
fn connect(config: &UsbIpConfig) -> io::Result<TcpStream> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"))?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(SOCKET_POLL_INTERVAL))?;
    Ok(stream)
}

fn send_req_devlist(stream: &mut TcpStream) -> io::Result<()> {
    stream.write_all(&wire::encode_req_devlist())
}

/// Reads into `progress.scratch[progress.filled..]`, tolerating read
/// timeouts (treated as "no data yet, try again"). Returns `Ok(true)` once
/// the scratch buffer is completely filled.
fn fill_scratch(stream: &mut TcpStream, progress: &mut InProgress) -> io::Result<bool> {
    while progress.filled < progress.scratch.len() {
        match stream.read(&mut progress.scratch[progress.filled..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection")),
            Ok(n) => progress.filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Interprets a completed scratch buffer and advances the state machine.
/// Returns `Ok(Some(devices))` once the whole device list has been
/// received, `Ok(None)` if more records remain.
fn process_completed_state(
    progress: &mut InProgress,
    config: &UsbIpConfig,
) -> Result<Option<Vec<UsbIpDevice>>, crate::error::WireError> {
    match progress.state {
        RecvState::Hdr => {
            let buf: [u8; wire::RET_DEVLIST_HDR_LEN] = progress.scratch.as_slice().try_into().unwrap();
            let hdr = wire::decode_ret_devlist_header(&buf)?;
            if hdr.n_devices == 0 {
                return Ok(Some(std::mem::take(&mut progress.devices)));
            }
            progress.advance(
                RecvState::ExportedDevice { devices_left: hdr.n_devices },
                wire::EXPORTED_DEVICE_LEN,
            );
            Ok(None)
        }
        RecvState::ExportedDevice { devices_left } => {
            let buf: [u8; wire::EXPORTED_DEVICE_LEN] = progress.scratch.as_slice().try_into().unwrap();
            let rec = wire::decode_exported_device(&buf);
            let n_if = rec.num_interfaces as u32;
            progress.current_interfaces = Vec::with_capacity(n_if as usize);
            let built = build_device(rec, Vec::new(), config);
            progress.devices.push(built);
            if n_if > 0 {
                progress.advance(
                    RecvState::DeviceInterface {
                        devices_left,
                        interfaces_left: n_if,
                    },
                    wire::DEVICE_INTERFACE_LEN,
                );
                Ok(None)
            } else {
                advance_after_device(progress, devices_left)
            }
        }
        RecvState::DeviceInterface { devices_left, interfaces_left } => {
            let buf: [u8; wire::DEVICE_INTERFACE_LEN] = progress.scratch.as_slice().try_into().unwrap();
            let iface = wire::decode_device_interface(&buf);
            progress.current_interfaces.push(iface.into());
            let remaining = interfaces_left - 1;
            if remaining > 0 {
                progress.advance(
                    RecvState::DeviceInterface {
                        devices_left,
                        interfaces_left: remaining,
                    },
                    wire::DEVICE_INTERFACE_LEN,
                );
                Ok(None)
            } else {
                if let Some(last) = progress.devices.last_mut() {
                    last.interfaces = std::mem::take(&mut progress.current_interfaces);
                }
                advance_after_device(progress, devices_left)
            }
        }
        RecvState::None => unreachable!("process_completed_state called with no request outstanding"),
    }
}

fn advance_after_device(
    progress: &mut InProgress,
    devices_left: u32,
) -> Result<Option<Vec<UsbIpDevice>>, crate::error::WireError> {
    let remaining = devices_left - 1;
    if remaining > 0 {
        progress.advance(RecvState::ExportedDevice { devices_left: remaining }, wire::EXPORTED_DEVICE_LEN);
        Ok(None)
    } else {
        Ok(Some(std::mem::take(&mut progress.devices)))
    }
}

/// One full request/response cycle: send `REQ_DEVLIST`, pump reads until
/// the whole reply is decoded or the socket errors out / `stop` fires.
fn run_one_request(stream: &mut TcpStream, shared: &Shared, config: &UsbIpConfig) -> io::Result<Vec<UsbIpDevice>> {
    send_req_devlist(stream)?;
    let mut progress = InProgress::idle();
    progress.advance(RecvState::Hdr, wire::RET_DEVLIST_HDR_LEN);
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "stopping"));
        }
        if fill_scratch(stream, &mut progress)? {
            match process_completed_state(&mut progress, config) {
                Ok(Some(devices)) => return Ok(devices),
                Ok(None) => continue,
                Err(e) => {
                    warn!("usbip: malformed devlist reply: {e}");
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                }
            }
        }
    }
}

fn run(shared: Arc<Shared>) {
    let mut stream: Option<TcpStream> = None;
    let mut last_success: Option<Instant> = None;
    let mut rate_limiter = RateLimiter::new(Duration::from_secs(30));

    while !shared.stop.load(Ordering::Acquire) {
        if stream.is_none() {
            match connect(&shared.config) {
                Ok(s) => {
                    debug!("usbip: connected to {}:{}", shared.config.host, shared.config.port);
                    last_success = Some(Instant::now());
                    stream = Some(s);
                }
                Err(e) => {
                    if rate_limiter.allow() {
                        warn!(
                            "usbip: failed to connect to {}:{}: {e}",
                            shared.config.host, shared.config.port
                        );
                    }
                    let stale = last_success.map(|t| t.elapsed() >= CLEAR_AFTER).unwrap_or(true);
                    if stale {
                        clear_devices(&shared);
                    }
                    shared.wake.reset();
                    shared.wake.wait_timeout(Duration::from_secs(3));
                    continue;
                }
            }
        }

        let s = stream.as_mut().unwrap();
        match run_one_request(s, &shared, &shared.config) {
            Ok(devices) => {
                publish(&shared, devices);
                last_success = Some(Instant::now());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                // stop() was requested mid-receive.
                break;
            }
            Err(e) => {
                if rate_limiter.allow() {
                    warn!("usbip: connection to {}:{} lost: {e}", shared.config.host, shared.config.port);
                }
                stream = None;
                continue;
            }
        }

        shared.wake.reset();
        shared.wake.wait_timeout(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn config_parse_defaults_port() {
        let cfg = UsbIpConfig::parse("example.org").unwrap();
        assert_eq!(cfg.host, "example.org");
        assert_eq!(cfg.port, USBIP_PORT_DEFAULT);
    }

    #[test]
    fn config_parse_explicit_port() {
        let cfg = UsbIpConfig::parse("127.0.0.1:3241").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 3241);
    }

    #[test]
    fn config_parse_rejects_empty_host() {
        assert!(UsbIpConfig::parse("").is_none());
        assert!(UsbIpConfig::parse(":3240").is_none());
    }

    fn exported_device_bytes(busid: &str, vendor: u16, product: u16, n_if: u8) -> [u8; wire::EXPORTED_DEVICE_LEN] {
        let mut buf = [0u8; wire::EXPORTED_DEVICE_LEN];
        buf[256..256 + busid.len()].copy_from_slice(busid.as_bytes());
        buf[296..300].copy_from_slice(&3u32.to_be_bytes()); // High speed
        buf[300..302].copy_from_slice(&vendor.to_be_bytes());
        buf[302..304].copy_from_slice(&product.to_be_bytes());
        buf[311] = n_if;
        buf
    }

    /// End-to-end: a tiny in-process server speaks one `REQ/RET_DEVLIST`
    /// exchange for two devices (one with one interface, one with two),
    /// matching the churn scenario in spec.md §8 scenario 6.
    #[test]
    fn fetches_and_decodes_two_devices_with_interfaces() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut req = [0u8; wire::REQ_DEVLIST_LEN];
            sock.read_exact(&mut req).unwrap();

            let mut reply = Vec::new();
            reply.extend_from_slice(&wire::USBIP_VERSION.to_be_bytes());
            reply.extend_from_slice(&0x0005u16.to_be_bytes());
            reply.extend_from_slice(&0i32.to_be_bytes());
            reply.extend_from_slice(&2u32.to_be_bytes());
            reply.extend_from_slice(&exported_device_bytes("1-1", 0x1234, 0x5678, 1));
            reply.extend_from_slice(&[1, 1, 1, 0]); // one interface
            reply.extend_from_slice(&exported_device_bytes("1-2", 0xABCD, 0xEF01, 2));
            reply.extend_from_slice(&[8, 6, 0x50, 0]);
            reply.extend_from_slice(&[8, 6, 0x62, 0]);
            sock.write_all(&reply).unwrap();
        });

        let mut client = connect(&UsbIpConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
        })
        .unwrap();
        let shared = Arc::new(Shared {
            config: UsbIpConfig { host: addr.ip().to_string(), port: addr.port() },
            devices: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            changed: Condvar::new(),
            changed_mutex: Mutex::new(()),
            wake: Wake::new(),
            stop: AtomicBool::new(false),
        });
        let devices = run_one_request(&mut client, &shared, &shared.config.clone()).unwrap();
        server.join().unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].busid, "1-1");
        assert_eq!(devices[0].vendor_id, 0x1234);
        assert_eq!(devices[0].interfaces.len(), 1);
        assert_eq!(devices[0].address, format!("usbip://{}:{}:1-1", addr.ip(), addr.port()));
        assert_eq!(devices[1].busid, "1-2");
        assert_eq!(devices[1].interfaces.len(), 2);
    }

    #[test]
    fn publish_is_a_noop_for_identical_lists() {
        let shared = Arc::new(Shared {
            config: UsbIpConfig { host: "h".into(), port: 1 },
            devices: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            changed: Condvar::new(),
            changed_mutex: Mutex::new(()),
            wake: Wake::new(),
            stop: AtomicBool::new(false),
        });
        let dev = UsbIpDevice {
            address: "usbip://h:1:1-1".into(),
            busid: "1-1".into(),
            bus_num: 1,
            dev_num: 1,
            speed: wire::UsbIpSpeed::High,
            vendor_id: 1,
            product_id: 2,
            bcd_device: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: Vec::new(),
        };
        publish(&shared, vec![dev.clone()]);
        let v1 = shared.version.load(Ordering::Acquire);
        publish(&shared, vec![dev]);
        let v2 = shared.version.load(Ordering::Acquire);
        assert_eq!(v1, v2, "identical device list must not bump the change version");
    }
}
