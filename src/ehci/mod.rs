//! EHCI (USB 2.0) host-controller core: capability/operational register
//! file, async-ring and periodic-list walkers, qTD assembler/submitter,
//! completion retirer, root hub, frame clock, and saved-state codec. Mirrors
//! the OHCI module's shape (`Shared<M,V>`/`State`/`Config`/controller
//! handle), generalized to EHCI's queue-head/qTD overlay model.

pub mod completion;
pub mod descriptors;
pub mod frame_clock;
pub mod regs;
pub mod roothub;
pub mod schedule;
pub mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::inflight::InFlightTable;
use crate::mem::{GuestMemory, MemAccessor};
use crate::mmio::MmioResult;
use crate::vusb::{InterruptLine, VusbConnector};

use regs::*;

/// Per-controller configuration (§6.3). `default_frame_rate_khz` accepts
/// 1..8 for EHCI (micro-frame emulation), unlike OHCI's fixed 1 kHz.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub ports: u8,
    pub default_frame_rate_khz: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: 12,
            default_frame_rate_khz: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PortState {
    pub status: u32,
    pub attached: bool,
}

pub(crate) struct State {
    pub usbcmd: u32,
    pub periodic_list_base: u64,
    pub async_list_addr: u64,
    pub config_flag: bool,
    pub ports: Vec<PortState>,
    pub frame_index: u32, // micro-frame granularity, 14 bits exposed
    pub running: bool,
    pub idle_ticks: u32,
    pub frame_rate_hz: u32,
    pub inflight: InFlightTable,
    pub stat_dropped_urbs: u64,
    /// Tracks whether the reclamation-head QH did any work since it was
    /// last reached, for the empty-async-schedule detector (§4.3.2).
    pub async_did_work_since_reclaim: bool,
}

impl State {
    fn new(ports: usize, frame_rate_khz: u32) -> Self {
        State {
            usbcmd: UsbCmd::ASYNC_PARK_EN.bits() | (4 << 16), // ITC default of 4 micro-frames
            periodic_list_base: 0,
            async_list_addr: 0,
            config_flag: false,
            ports: vec![PortState::default(); ports],
            frame_index: 0,
            running: false,
            idle_ticks: 0,
            frame_rate_hz: frame_rate_khz.clamp(1, 8) * 1000,
            inflight: InFlightTable::default(),
            stat_dropped_urbs: 0,
            async_did_work_since_reclaim: false,
        }
    }
}

pub(crate) struct IrqState {
    pub status: u32,
    pub enable: u32,
}

impl IrqState {
    fn line_asserted(&self) -> bool {
        self.status & self.enable & USBSTS_INTR_MASK != 0
    }
}

pub(crate) struct Shared<M: GuestMemory, V: VusbConnector> {
    pub mem: MemAccessor<M>,
    pub vusb: Arc<V>,
    pub irq_line: Arc<dyn InterruptLine>,
    pub state: Mutex<State>,
    pub irq: Mutex<IrqState>,
    pub config: Config,
    pub line_level: AtomicBool,
}

/// An emulated EHCI host controller. Cheaply cloneable; every clone refers
/// to the same underlying device.
pub struct Ehci<M: GuestMemory + 'static, V: VusbConnector + 'static> {
    pub(crate) shared: Arc<Shared<M, V>>,
}

impl<M: GuestMemory, V: VusbConnector> Clone for Ehci<M, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: GuestMemory, V: VusbConnector> Ehci<M, V> {
    pub fn new(mem: M, vusb: Arc<V>, irq_line: Arc<dyn InterruptLine>, config: Config) -> Self {
        let ports = (config.ports as usize).clamp(1, MAX_PORTS);
        let shared = Shared {
            mem: MemAccessor::new(mem),
            vusb,
            irq_line,
            state: Mutex::new(State::new(ports, config.default_frame_rate_khz)),
            irq: Mutex::new(IrqState { status: 0, enable: 0 }),
            config,
            line_level: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn port_count(&self) -> usize {
        self.shared.state.lock().unwrap().ports.len()
    }

    pub(crate) fn reevaluate_interrupt_line(&self) {
        let asserted = self.shared.irq.lock().unwrap().line_asserted();
        let changed = self.shared.line_level.swap(asserted, Ordering::AcqRel) != asserted;
        if changed {
            self.shared.irq_line.set_level(asserted);
        }
    }

    pub(crate) fn raise_interrupt(&self, bits: u32) {
        {
            let mut irq = self.shared.irq.lock().unwrap();
            irq.status |= bits;
        }
        self.reevaluate_interrupt_line();
    }

    pub fn mmio_read(&self, offset: u32) -> MmioResult<u32> {
        if let Some(port) = port_from_offset(offset) {
            return MmioResult::Done(self.roothub_read_port(port));
        }
        let value = match offset {
            REG_CAPLENGTH => CAP_LENGTH | ((HCIVERSION) << 16),
            REG_HCIVERSION => HCIVERSION,
            REG_HCSPARAMS => {
                let ports = self.shared.state.lock().unwrap().ports.len() as u32;
                ports & HcsParams::N_PORTS_MASK.bits()
            }
            REG_HCCPARAMS => 0, // no 64-bit addressing, no programmable frame list
            REG_USBCMD => self.shared.state.lock().unwrap().usbcmd,
            REG_USBSTS => {
                let mut v = self.shared.irq.lock().unwrap().status;
                if !self.shared.state.lock().unwrap().running {
                    v |= UsbSts::HCHALTED.bits();
                }
                v
            }
            REG_USBINTR => self.shared.irq.lock().unwrap().enable,
            REG_FRINDEX => self.shared.state.lock().unwrap().frame_index & 0x3FFF,
            REG_CTRLDSSEGMENT => 0,
            REG_PERIODICLISTBASE => self.shared.state.lock().unwrap().periodic_list_base as u32,
            REG_ASYNCLISTADDR => self.shared.state.lock().unwrap().async_list_addr as u32,
            REG_CONFIGFLAG => self.shared.state.lock().unwrap().config_flag as u32,
            _ => 0xFFFF_FFFF,
        };
        MmioResult::Done(value)
    }

    pub fn mmio_write(&self, offset: u32, value: u32) -> MmioResult<()> {
        if offset % 4 != 0 {
            return MmioResult::Done(());
        }
        if let Some(port) = port_from_offset(offset) {
            self.roothub_write_port(port, value);
            return MmioResult::Done(());
        }
        match offset {
            REG_USBCMD => self.write_usbcmd(value),
            REG_USBSTS => {
                let mut irq = self.shared.irq.lock().unwrap();
                irq.status &= !(value & USBSTS_INTR_MASK);
                drop(irq);
                self.reevaluate_interrupt_line();
            }
            REG_USBINTR => {
                self.shared.irq.lock().unwrap().enable = value & USBSTS_INTR_MASK;
                self.reevaluate_interrupt_line();
            }
            REG_FRINDEX => {
                self.shared.state.lock().unwrap().frame_index = value & 0x3FFF;
            }
            REG_CTRLDSSEGMENT => { /* no 64-bit addressing support */ }
            REG_PERIODICLISTBASE => {
                self.shared.state.lock().unwrap().periodic_list_base = (value & 0xFFFF_F000) as u64;
            }
            REG_ASYNCLISTADDR => {
                self.shared.state.lock().unwrap().async_list_addr = (value & 0xFFFF_FFE0) as u64;
            }
            REG_CONFIGFLAG => {
                self.shared.state.lock().unwrap().config_flag = value & 1 != 0;
            }
            _ => {}
        }
        MmioResult::Done(())
    }

    fn write_usbcmd(&self, value: u32) {
        let mut st = self.shared.state.lock().unwrap();
        let was_running = st.running;
        if value & UsbCmd::HCRESET.bits() != 0 {
            let ports = st.ports.len();
            let rate = self.shared.config.default_frame_rate_khz;
            *st = State::new(ports, rate);
            return;
        }
        st.usbcmd = value & !UsbCmd::HCRESET.bits();
        st.running = value & UsbCmd::RS.bits() != 0;
        if was_running && !st.running {
            drop(st);
            self.raise_interrupt(0); // re-evaluate HCHALTED visibility
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vusb::test_support::{RecordingConnector, RecordingInterruptLine};
    use std::sync::Mutex as StdMutex;

    struct VecMemory(StdMutex<Vec<u8>>);
    impl GuestMemory for VecMemory {
        fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), crate::error::MemError> {
            let mem = self.0.lock().unwrap();
            buf.copy_from_slice(&mem[gpa as usize..gpa as usize + buf.len()]);
            Ok(())
        }
        fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), crate::error::MemError> {
            let mut mem = self.0.lock().unwrap();
            mem[gpa as usize..gpa as usize + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    fn test_controller() -> Ehci<VecMemory, RecordingConnector> {
        Ehci::new(
            VecMemory(StdMutex::new(vec![0u8; 1 << 20])),
            Arc::new(RecordingConnector::default()),
            Arc::new(RecordingInterruptLine::default()),
            Config::default(),
        )
    }

    #[test]
    fn caplength_reads_fixed_constant() {
        let hc = test_controller();
        assert_eq!(hc.mmio_read(REG_CAPLENGTH), MmioResult::Done(CAP_LENGTH | (HCIVERSION << 16)));
    }

    #[test]
    fn run_stop_bit_toggles_running_and_hchalted() {
        let hc = test_controller();
        assert_ne!(hc.mmio_read(REG_USBSTS).map(|v| v & UsbSts::HCHALTED.bits()), MmioResult::Done(0));
        hc.mmio_write(REG_USBCMD, UsbCmd::RS.bits());
        assert_eq!(hc.mmio_read(REG_USBSTS).map(|v| v & UsbSts::HCHALTED.bits()), MmioResult::Done(0));
    }

    #[test]
    fn asynclistaddr_write_masks_low_bits() {
        let hc = test_controller();
        hc.mmio_write(REG_ASYNCLISTADDR, 0x1234_5678);
        assert_eq!(hc.mmio_read(REG_ASYNCLISTADDR), MmioResult::Done(0x1234_5660));
    }

    #[test]
    fn interrupt_status_write_one_to_clear() {
        let hc = test_controller();
        hc.mmio_write(REG_USBINTR, UsbSts::USBINT.bits());
        hc.raise_interrupt(UsbSts::USBINT.bits());
        hc.mmio_write(REG_USBSTS, UsbSts::USBINT.bits());
        assert_eq!(
            hc.mmio_read(REG_USBSTS).map(|v| v & UsbSts::USBINT.bits()),
            MmioResult::Done(0)
        );
    }
}
