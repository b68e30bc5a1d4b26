//! Root-hub per-port state machine (C8). Register bit positions are
//! reused between the read and write views exactly as real OHCI silicon
//! does: e.g. bit 0 reads as CCS but a write to bit 0 means "clear port
//! enable", not "set connect status".

use crate::mem::GuestMemory;
use crate::vusb::VusbConnector;

use super::regs::{HcInterrupt, PortStatus, PORT_CHANGE_MASK};
use super::{Ohci, PortSpeed};

impl<M: GuestMemory, V: VusbConnector> Ohci<M, V> {
    pub(crate) fn roothub_read_port(&self, port: usize) -> u32 {
        let st = self.shared.state.lock().unwrap();
        st.ports.get(port).map(|p| p.status).unwrap_or(0)
    }

    pub(crate) fn roothub_write_port(&self, port: usize, value: u32) {
        let mut st = self.shared.state.lock().unwrap();
        if port >= st.ports.len() {
            return;
        }
        let mut request_reset = false;
        let mut power_on = false;
        let mut power_off = false;
        let mut raise_rhsc = false;

        {
            let p = &mut st.ports[port];
            p.status &= !(value & PORT_CHANGE_MASK);

            if value & PortStatus::CCS.bits() != 0 && p.status & PortStatus::PES.bits() != 0 {
                // CLRPE: silently clears PES, no PESC.
                p.status &= !PortStatus::PES.bits();
            }

            if p.attached {
                if value & PortStatus::PES.bits() != 0 {
                    p.status |= PortStatus::PES.bits();
                }
                if value & PortStatus::PSS.bits() != 0 {
                    p.status |= PortStatus::PSS.bits();
                }
                if value & PortStatus::PRS.bits() != 0 {
                    p.status |= PortStatus::PRS.bits();
                    request_reset = true;
                }
            } else if value
                & (PortStatus::PES.bits() | PortStatus::PSS.bits() | PortStatus::PRS.bits())
                != 0
            {
                p.status |= PortStatus::CSC.bits();
                raise_rhsc = true;
            }

            if value & PortStatus::POCI.bits() != 0 && p.status & PortStatus::PSS.bits() != 0 {
                p.status &= !PortStatus::PSS.bits();
                p.status |= PortStatus::PSSC.bits();
                raise_rhsc = true;
            }

            if value & PortStatus::PPS.bits() != 0 {
                let was_off = p.status & PortStatus::PPS.bits() == 0;
                p.status |= PortStatus::PPS.bits();
                if was_off && p.attached {
                    power_on = true;
                }
            }

            if value & PortStatus::LSDA.bits() != 0 {
                p.status &= !(PortStatus::PPS.bits()
                    | PortStatus::PES.bits()
                    | PortStatus::PSS.bits()
                    | PortStatus::PRS.bits());
                power_off = true;
            }
        }
        drop(st);

        if request_reset {
            self.shared.vusb.request_port_reset(port as u8);
        }
        if power_on {
            self.shared.vusb.port_power(port as u8, true);
        }
        if power_off {
            self.shared.vusb.port_power(port as u8, false);
        }
        if raise_rhsc {
            self.raise_interrupt(HcInterrupt::RHSC.bits());
        }
    }

    /// External event: a device was plugged into `port`. Call-in from the
    /// embedder, not a VUSB callback.
    pub fn attach(&self, port: usize, speed: PortSpeed) {
        let mut st = self.shared.state.lock().unwrap();
        if port >= st.ports.len() {
            return;
        }
        let already_powered;
        {
            let p = &mut st.ports[port];
            p.attached = true;
            p.status |= PortStatus::CCS.bits() | PortStatus::CSC.bits();
            if speed == PortSpeed::Low {
                p.status |= PortStatus::LSDA.bits();
            } else {
                p.status &= !PortStatus::LSDA.bits();
            }
            already_powered = p.status & PortStatus::PPS.bits() != 0;
        }
        drop(st);
        if already_powered {
            self.shared.vusb.port_power(port as u8, true);
        }
        self.raise_interrupt(HcInterrupt::RHSC.bits());
    }

    /// External event: the device on `port` was unplugged.
    pub fn detach(&self, port: usize) {
        let mut st = self.shared.state.lock().unwrap();
        if port >= st.ports.len() {
            return;
        }
        {
            let p = &mut st.ports[port];
            p.attached = false;
            p.status &= !PortStatus::CCS.bits();
            p.status |= PortStatus::CSC.bits();
            if p.status & PortStatus::PES.bits() != 0 {
                p.status &= !PortStatus::PES.bits();
                p.status |= PortStatus::PESC.bits();
            }
        }
        drop(st);
        self.raise_interrupt(HcInterrupt::RHSC.bits());
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
            p.status &= !(PortStatus::PRS.bits() | PortStatus::PSS.bits());
            p.status |= PortStatus::PES.bits() | PortStatus::PRSC.bits();
        }
        drop(st);
        self.raise_interrupt(HcInterrupt::RHSC.bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ohci::{regs::REG_HC_RH_PORT_STATUS_BASE, Config};
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

    fn controller() -> Ohci<VecMemory, RecordingConnector> {
        Ohci::new(
            VecMemory(Mutex::new(vec![0u8; 4096])),
            Arc::new(RecordingConnector::default()),
            Arc::new(RecordingInterruptLine::default()),
            Config::default(),
        )
    }

    #[test]
    fn attach_sets_ccs_and_csc() {
        let hc = controller();
        hc.attach(0, PortSpeed::Full);
        let status = hc.roothub_read_port(0);
        assert_ne!(status & PortStatus::CCS.bits(), 0);
        assert_ne!(status & PortStatus::CSC.bits(), 0);
    }

    #[test]
    fn clearing_csc_with_ccs_already_zero_leaves_both_clear() {
        let hc = controller();
        hc.attach(0, PortSpeed::Full);
        hc.detach(0);
        hc.roothub_write_port(0, PortStatus::CSC.bits());
        let status = hc.roothub_read_port(0);
        assert_eq!(status & PortStatus::CCS.bits(), 0);
        assert_eq!(status & PortStatus::CSC.bits(), 0);
    }

    #[test]
    fn set_port_enable_without_connect_sets_csc_instead() {
        let hc = controller();
        hc.roothub_write_port(0, PortStatus::PES.bits());
        let status = hc.roothub_read_port(0);
        assert_eq!(status & PortStatus::PES.bits(), 0);
        assert_ne!(status & PortStatus::CSC.bits(), 0);
    }

    #[test]
    fn reset_requests_vusb_then_completion_sets_pes() {
        let hc = controller();
        hc.attach(0, PortSpeed::Full);
        hc.mmio_write(REG_HC_RH_PORT_STATUS_BASE, PortStatus::PRS.bits());
        hc.notify_reset_complete(0);
        let status = hc.roothub_read_port(0);
        assert_ne!(status & PortStatus::PES.bits(), 0);
        assert_eq!(status & PortStatus::PRS.bits(), 0);
        assert_ne!(status & PortStatus::PRSC.bits(), 0);
    }
}
