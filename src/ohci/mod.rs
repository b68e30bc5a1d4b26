//! OHCI (USB 1.1) host-controller core: register file, schedule walker,
//! URB assembler/submitter, completion retirer, root hub, frame clock, and
//! saved-state codec, wired together behind one controller type.

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

/// Downstream port speed, as reported by the embedder on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpeed {
    Low,
    Full,
}

/// Per-controller configuration (§6.3).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub ports: u8,
    pub default_frame_rate_khz: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: 12,
            default_frame_rate_khz: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PortState {
    pub status: u32, // PortStatus bits, including the write-one-to-clear change bits
    pub attached: bool,
}

/// Device-lock-guarded state: everything the frame clock, MMIO writers, and
/// completion callbacks all touch.
pub(crate) struct State {
    pub control: u32,
    pub hcca_addr: u64,
    pub control_head_ed: u64,
    pub control_current_ed: u64,
    pub bulk_head_ed: u64,
    pub bulk_current_ed: u64,
    pub periodic_current_ed: u64,
    pub fm_interval: u32,
    pub fm_last_fit: bool,
    pub periodic_start: u32,
    pub ls_threshold: u32,
    pub rh_descriptor_a: u32,
    pub rh_descriptor_b: u32,
    pub rh_status: u32,
    pub ports: Vec<PortState>,
    pub frame_number: u32,
    pub dqic: u8,
    pub done_head: u64,
    pub done_pending_wdh: bool,
    pub control_list_filled: bool,
    pub bulk_list_filled: bool,
    pub running: bool,
    pub idle_ticks: u32,
    pub frame_rate_hz: u32,
    pub inflight: InFlightTable,
    pub stat_dropped_urbs: u64,
    /// Frame in which the reclamation-head QH-equivalent (async ring's
    /// designated head ED) was last found to do real work; used by the
    /// empty-schedule detector.
    pub recl_status: bool,
}

impl State {
    fn new(ports: usize, frame_rate_khz: u32) -> Self {
        State {
            control: HcfsState::Reset.to_bits(),
            hcca_addr: 0,
            control_head_ed: 0,
            control_current_ed: 0,
            bulk_head_ed: 0,
            bulk_current_ed: 0,
            periodic_current_ed: 0,
            fm_interval: 0x2EDF, // 11,999 bit times, the USB-standard default
            fm_last_fit: false,
            periodic_start: 0,
            ls_threshold: 0x628,
            rh_descriptor_a: ports as u32 & RhDescriptorA::NDP_MASK.bits(),
            rh_descriptor_b: 0,
            rh_status: 0,
            ports: vec![PortState::default(); ports],
            frame_number: 0,
            dqic: 7,
            done_head: 0,
            done_pending_wdh: false,
            control_list_filled: false,
            bulk_list_filled: false,
            running: false,
            idle_ticks: 0,
            frame_rate_hz: frame_rate_khz * 1000,
            inflight: InFlightTable::default(),
            stat_dropped_urbs: 0,
            recl_status: false,
        }
    }
}

pub(crate) struct IrqState {
    pub status: u32,
    pub enable: u32, // includes MIE at bit 31
}

impl IrqState {
    fn line_asserted(&self, control: u32) -> bool {
        let mie = self.enable & HcInterrupt::MIE.bits() != 0;
        let ir = control & HcControl::IR.bits() != 0;
        let pending = self.status & self.enable & !HcInterrupt::MIE.bits() != 0;
        mie && !ir && pending
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

/// An emulated OHCI host controller. Cheaply cloneable; every clone refers
/// to the same underlying device (clone to hand a copy to the frame-clock
/// thread and to completion callbacks).
pub struct Ohci<M: GuestMemory + 'static, V: VusbConnector + 'static> {
    pub(crate) shared: Arc<Shared<M, V>>,
}

impl<M: GuestMemory, V: VusbConnector> Clone for Ohci<M, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: GuestMemory, V: VusbConnector> Ohci<M, V> {
    pub fn new(mem: M, vusb: Arc<V>, irq_line: Arc<dyn InterruptLine>, config: Config) -> Self {
        let ports = config.ports.clamp(1, MAX_PORTS as u8) as usize;
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

    /// Re-evaluates the interrupt line against the current status/enable
    /// bits and HcControl.IR, invoking the embedder's primitive only on an
    /// actual transition.
    pub(crate) fn reevaluate_interrupt_line(&self) {
        let control = self.shared.state.lock().unwrap().control;
        let asserted = self.shared.irq.lock().unwrap().line_asserted(control);
        let changed = self.shared.line_level.swap(asserted, Ordering::AcqRel) != asserted;
        if changed {
            self.shared.irq_line.set_level(asserted);
        }
    }

    /// Sets bits in `HcInterruptStatus` and re-evaluates the line. Per
    /// ordering guarantee: callers must have already made the corresponding
    /// guest-memory writes visible before calling this.
    pub(crate) fn raise_interrupt(&self, bits: u32) {
        {
            let mut irq = self.shared.irq.lock().unwrap();
            irq.status |= bits;
        }
        self.reevaluate_interrupt_line();
    }

    pub fn mmio_read(&self, offset: u32) -> MmioResult<u32> {
        if offset % 4 != 0 {
            return MmioResult::Done(0xFFFF_FFFF);
        }
        if let Some(port) = port_from_offset(offset) {
            return MmioResult::Done(self.roothub_read_port(port));
        }
        let value = match offset {
            REG_HC_REVISION => HC_REVISION,
            REG_HC_CONTROL => self.shared.state.lock().unwrap().control,
            REG_HC_COMMAND_STATUS => {
                let st = self.shared.state.lock().unwrap();
                (st.control_list_filled as u32) << 1 | (st.bulk_list_filled as u32) << 2
            }
            REG_HC_INTERRUPT_STATUS => self.shared.irq.lock().unwrap().status,
            REG_HC_INTERRUPT_ENABLE | REG_HC_INTERRUPT_DISABLE => {
                self.shared.irq.lock().unwrap().enable
            }
            REG_HC_HCCA => self.shared.state.lock().unwrap().hcca_addr as u32,
            REG_HC_PERIOD_CURRENT_ED => self.shared.state.lock().unwrap().periodic_current_ed as u32,
            REG_HC_CONTROL_HEAD_ED => self.shared.state.lock().unwrap().control_head_ed as u32,
            REG_HC_CONTROL_CURRENT_ED => self.shared.state.lock().unwrap().control_current_ed as u32,
            REG_HC_BULK_HEAD_ED => self.shared.state.lock().unwrap().bulk_head_ed as u32,
            REG_HC_BULK_CURRENT_ED => self.shared.state.lock().unwrap().bulk_current_ed as u32,
            REG_HC_DONE_HEAD => self.shared.state.lock().unwrap().done_head as u32,
            REG_HC_FM_INTERVAL => self.shared.state.lock().unwrap().fm_interval,
            REG_HC_FM_REMAINING => self.read_fm_remaining(),
            REG_HC_FM_NUMBER => (self.shared.state.lock().unwrap().frame_number & 0xFFFF),
            REG_HC_PERIODIC_START => self.shared.state.lock().unwrap().periodic_start,
            REG_HC_LS_THRESHOLD => self.shared.state.lock().unwrap().ls_threshold,
            REG_HC_RH_DESCRIPTOR_A => self.shared.state.lock().unwrap().rh_descriptor_a,
            REG_HC_RH_DESCRIPTOR_B => self.shared.state.lock().unwrap().rh_descriptor_b,
            REG_HC_RH_STATUS => self.shared.state.lock().unwrap().rh_status,
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
            REG_HC_CONTROL => self.write_control(value),
            REG_HC_COMMAND_STATUS => self.write_command_status(value),
            REG_HC_INTERRUPT_STATUS => {
                let mut irq = self.shared.irq.lock().unwrap();
                irq.status &= !(value & !HcInterrupt::MIE.bits());
                drop(irq);
                if value & HcInterrupt::WDH.bits() != 0 {
                    self.shared.state.lock().unwrap().done_pending_wdh = false;
                }
                self.reevaluate_interrupt_line();
            }
            REG_HC_INTERRUPT_ENABLE => {
                self.shared.irq.lock().unwrap().enable |= value;
                self.reevaluate_interrupt_line();
            }
            REG_HC_INTERRUPT_DISABLE => {
                self.shared.irq.lock().unwrap().enable &= !value;
                self.reevaluate_interrupt_line();
            }
            REG_HC_HCCA => {
                self.shared.state.lock().unwrap().hcca_addr = (value & 0xFFFF_FF00) as u64;
            }
            REG_HC_PERIOD_CURRENT_ED => {
                // Documented read-only, but real HCDs (Linux) write it; allow with
                // the low 3 bits forced to zero (open question, §9).
                self.shared.state.lock().unwrap().periodic_current_ed = (value & !0x7) as u64;
            }
            REG_HC_CONTROL_HEAD_ED => {
                self.shared.state.lock().unwrap().control_head_ed = (value & PTR_MASK32) as u64;
            }
            REG_HC_CONTROL_CURRENT_ED => {
                self.shared.state.lock().unwrap().control_current_ed = (value & PTR_MASK32) as u64;
            }
            REG_HC_BULK_HEAD_ED => {
                self.shared.state.lock().unwrap().bulk_head_ed = (value & PTR_MASK32) as u64;
            }
            REG_HC_BULK_CURRENT_ED => {
                self.shared.state.lock().unwrap().bulk_current_ed = (value & PTR_MASK32) as u64;
            }
            REG_HC_DONE_HEAD => { /* read-only */ }
            REG_HC_FM_INTERVAL => {
                let mut st = self.shared.state.lock().unwrap();
                let fit = (value & (1 << 31)) != 0;
                st.fm_last_fit = fit;
                st.fm_interval = value & 0xFFFF_3FFF | (fit as u32) << 31;
            }
            REG_HC_FM_REMAINING => { /* read-only */ }
            REG_HC_FM_NUMBER => { /* read-only */ }
            REG_HC_PERIODIC_START => {
                self.shared.state.lock().unwrap().periodic_start = value & 0x3FFF;
            }
            REG_HC_LS_THRESHOLD => {
                self.shared.state.lock().unwrap().ls_threshold = value & 0xFFF;
            }
            REG_HC_RH_DESCRIPTOR_A => {
                self.shared.state.lock().unwrap().rh_descriptor_a = value & 0xFFFF_01FF;
            }
            REG_HC_RH_DESCRIPTOR_B => {
                self.shared.state.lock().unwrap().rh_descriptor_b = value;
            }
            REG_HC_RH_STATUS => self.write_rh_status(value),
            _ => {}
        }
        MmioResult::Done(())
    }

    fn read_fm_remaining(&self) -> u32 {
        // Approximated from ticks-per-frame rather than sub-frame timing
        // (micro-frame granularity is a non-goal): always reports a full
        // frame interval remaining between ticks.
        let st = self.shared.state.lock().unwrap();
        st.fm_interval & 0x3FFF
    }

    fn write_control(&self, value: u32) {
        let mut st = self.shared.state.lock().unwrap();
        let was_operational = HcfsState::from_bits(st.control) == HcfsState::Operational;
        st.control = value & 0x0000_07FF;
        let now_operational = HcfsState::from_bits(st.control) == HcfsState::Operational;
        if now_operational && !was_operational {
            st.running = true;
        } else if !now_operational {
            st.running = false;
        }
    }

    fn write_command_status(&self, value: u32) {
        let mut st = self.shared.state.lock().unwrap();
        if value & HcCommandStatus::HCR.bits() != 0 {
            // Software reset preserves IR (interrupt routing) and RWC
            // (remote-wakeup connected) and leaves HCFS in Suspend, not
            // Reset (spec.md: "software reset preserves IR and RWC").
            let ports = st.ports.len();
            let rate = self.shared.config.default_frame_rate_khz;
            let preserved = st.control & (HcControl::IR.bits() | HcControl::RWC.bits());
            *st = State::new(ports, rate);
            st.control = preserved | HcfsState::Suspend.to_bits();
        }
        if value & HcCommandStatus::CLF.bits() != 0 {
            st.control_list_filled = true;
        }
        if value & HcCommandStatus::BLF.bits() != 0 {
            st.bulk_list_filled = true;
        }
    }

    fn write_rh_status(&self, value: u32) {
        let mut st = self.shared.state.lock().unwrap();
        if value & RhStatus::LPSC.bits() != 0 {
            st.rh_status |= RhStatus::LPS.bits();
            for p in 0..st.ports.len() {
                self.shared.vusb.port_power(p as u8, true);
            }
        }
        if value & RhStatus::LPS.bits() != 0 {
            st.rh_status &= !RhStatus::LPS.bits();
            for p in 0..st.ports.len() {
                self.shared.vusb.port_power(p as u8, false);
            }
        }
        if value & RhStatus::OCIC.bits() != 0 {
            st.rh_status &= !RhStatus::OCIC.bits();
        }
    }
}

const PTR_MASK32: u32 = 0xFFFF_FFF0;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vusb::test_support::{RecordingConnector, RecordingInterruptLine};
    use std::sync::Mutex as StdMutex;

    struct VecMemory(StdMutex<Vec<u8>>);

    impl GuestMemory for VecMemory {
        fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), crate::error::MemError> {
            let mem = self.0.lock().unwrap();
            let start = gpa as usize;
            buf.copy_from_slice(&mem[start..start + buf.len()]);
            Ok(())
        }
        fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), crate::error::MemError> {
            let mut mem = self.0.lock().unwrap();
            let start = gpa as usize;
            mem[start..start + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    fn test_controller() -> Ohci<VecMemory, RecordingConnector> {
        Ohci::new(
            VecMemory(StdMutex::new(vec![0u8; 1 << 20])),
            Arc::new(RecordingConnector::default()),
            Arc::new(RecordingInterruptLine::default()),
            Config::default(),
        )
    }

    #[test]
    fn revision_register_reads_as_constant() {
        let hc = test_controller();
        assert_eq!(hc.mmio_read(REG_HC_REVISION), MmioResult::Done(HC_REVISION));
    }

    #[test]
    fn misaligned_access_reads_all_ones() {
        let hc = test_controller();
        assert_eq!(hc.mmio_read(0x02), MmioResult::Done(0xFFFF_FFFF));
    }

    #[test]
    fn hcca_write_masks_low_byte() {
        let hc = test_controller();
        hc.mmio_write(REG_HC_HCCA, 0x1234_5678);
        assert_eq!(hc.mmio_read(REG_HC_HCCA), MmioResult::Done(0x1234_5600));
    }

    #[test]
    fn interrupt_enable_then_status_asserts_line() {
        let hc = test_controller();
        hc.mmio_write(REG_HC_INTERRUPT_ENABLE, HcInterrupt::MIE.bits() | HcInterrupt::WDH.bits());
        hc.raise_interrupt(HcInterrupt::WDH.bits());
        assert!(hc.shared.line_level.load(Ordering::Acquire));
    }

    #[test]
    fn interrupt_status_write_one_to_clear() {
        let hc = test_controller();
        hc.mmio_write(REG_HC_INTERRUPT_ENABLE, HcInterrupt::MIE.bits() | HcInterrupt::WDH.bits());
        hc.raise_interrupt(HcInterrupt::WDH.bits());
        hc.mmio_write(REG_HC_INTERRUPT_STATUS, HcInterrupt::WDH.bits());
        assert_eq!(
            hc.mmio_read(REG_HC_INTERRUPT_STATUS),
            MmioResult::Done(0)
        );
        assert!(!hc.shared.line_level.load(Ordering::Acquire));
    }
}
