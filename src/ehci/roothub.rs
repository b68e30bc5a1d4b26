//! Root-hub per-port state machine (C8), generalized from OHCI's port bits
//! to EHCI's `PORTSC` layout. The change bits (CSC/PEDC/OCC) are
//! write-one-to-clear; `PED` cannot be *set* by software, only cleared.

use crate::mem::GuestMemory;
use crate::vusb::VusbConnector;

use super::regs::{PortSc, PORTSC_CHANGE_MASK};
use super::Ehci;

impl<M: GuestMemory, V: VusbConnector> Ehci<M, V> {
    pub(crate) fn roothub_read_port(&self, port: usize) -> u32 {
        let st = self.shared.state.lock().unwrap();
        st.ports.get(port).map(|p| p.status).unwrap_or(0xFFFF_FFFF)
    }

    pub(crate) fn roothub_write_port(&self, port: usize, value: u32) {
        let mut st = self.shared.state.lock().unwrap();
        if port >= st.ports.len() {
            return;
        }
        let mut request_reset = false;
        let mut changed = false;
        {
            let p = &mut st.ports[port];
            let before = p.status;
            p.status &= !(value & PORTSC_CHANGE_MASK);

            // Software cannot set PED; writing 0 disables the port.
            if value & PortSc::PED.bits() == 0 {
                p.status &= !PortSc::PED.bits();
            }

            if value & PortSc::PR.bits() != 0 && p.attached {
                p.status |= PortSc::PR.bits();
                request_reset = true;
            } else if value & PortSc::PR.bits() == 0 {
                p.status &= !PortSc::PR.bits();
            }

            if value & PortSc::SUSP.bits() != 0 && p.status & PortSc::PED.bits() != 0 {
                p.status |= PortSc::SUSP.bits();
            }
            if value & PortSc::FPR.bits() != 0 {
                p.status |= PortSc::FPR.bits();
            } else {
                p.status &= !(PortSc::FPR.bits() | PortSc::SUSP.bits());
            }

            if value & PortSc::PP.bits() != 0 {
                p.status |= PortSc::PP.bits();
            } else {
                p.status &= !(PortSc::PP.bits() | PortSc::PED.bits());
            }
            changed = p.status != before;
        }
        drop(st);
        if request_reset {
            self.shared.vusb.request_port_reset(port as u8);
        }
        if changed {
            self.raise_interrupt(super::regs::UsbSts::PORT_CHANGE.bits());
        }
    }

    pub fn attach(&self, port: usize) {
        let mut st = self.shared.state.lock().unwrap();
        if port >= st.ports.len() {
            return;
        }
        {
            let p = &mut st.ports[port];
            p.attached = true;
            p.status |= PortSc::CCS.bits() | PortSc::CSC.bits();
        }
        drop(st);
        self.raise_interrupt(super::regs::UsbSts::PORT_CHANGE.bits());
    }

    pub fn detach(&self, port: usize) {
        let mut st = self.shared.state.lock().unwrap();
        if port >= st.ports.len() {
            return;
        }
        {
            let p = &mut st.ports[port];
            p.attached = false;
            p.status &= !PortSc::CCS.bits();
            p.status |= PortSc::CSC.bits();
            if p.status & PortSc::PED.bits() != 0 {
                p.status &= !PortSc::PED.bits();
                p.status |= PortSc::PEDC.bits();
            }
        }
        drop(st);
        self.raise_interrupt(super::regs::UsbSts::PORT_CHANGE.bits());
    }

    /// External event: the VUSB backend finished the reset it was asked to
    /// perform via `request_port_reset`.
    pub fn notify_reset_complete(&self, port: usize) {
        let mut st = self.shared.state.lock().unwrap();
        if port >= st.ports.len() {
            return;
        }
        {
            let p = &mut st.ports[port];
            p.status &= !PortSc::PR.bits();
            if p.attached {
                p.status |= PortSc::PED.bits();
            }
        }
        drop(st);
        self.raise_interrupt(super::regs::UsbSts::PORT_CHANGE.bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ehci::Config;
    use crate::vusb::test_support::{RecordingConnector, RecordingInterruptLine};
    use std::sync::{Arc, Mutex};

    struct VecMemory(Mutex<Vec<u8>>);
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

    fn controller() -> Ehci<VecMemory, RecordingConnector> {
        Ehci::new(
            VecMemory(Mutex::new(vec![0u8; 4096])),
            Arc::new(RecordingConnector::default()),
            Arc::new(RecordingInterruptLine::default()),
            Config::default(),
        )
    }

    #[test]
    fn attach_sets_ccs_and_csc() {
        let hc = controller();
        hc.attach(0);
        let status = hc.roothub_read_port(0);
        assert_ne!(status & PortSc::CCS.bits(), 0);
        assert_ne!(status & PortSc::CSC.bits(), 0);
    }

    #[test]
    fn reset_then_completion_enables_port() {
        let hc = controller();
        hc.attach(0);
        hc.roothub_write_port(0, PortSc::PR.bits());
        hc.notify_reset_complete(0);
        let status = hc.roothub_read_port(0);
        assert_ne!(status & PortSc::PED.bits(), 0);
        assert_eq!(status & PortSc::PR.bits(), 0);
    }

    #[test]
    fn software_cannot_set_ped_directly() {
        let hc = controller();
        hc.attach(0);
        hc.roothub_write_port(0, PortSc::PED.bits());
        assert_eq!(hc.roothub_read_port(0) & PortSc::PED.bits(), 0);
    }
}
