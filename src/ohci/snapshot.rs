//! Saved-state codec (C11): serializes the operational registers, not the
//! typed accessors' derived views, plus root-hub descriptor A/B, every
//! port's register, and the "was running" flag so the frame clock can be
//! rearmed on restore.

use serde::{Deserialize, Serialize};

use crate::mem::GuestMemory;
use crate::vusb::VusbConnector;

use super::{Ohci, PortState};

/// Current on-disk version. `V1` snapshots carry only 8 ports (an older
/// embedder generation); loading one zero-fills the remaining ports rather
/// than failing.
pub const SNAPSHOT_VERSION: u32 = 2;
const V1_PORT_COUNT: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSnapshot {
    pub status: u32,
    pub attached: bool,
}

impl From<&PortState> for PortSnapshot {
    fn from(p: &PortState) -> Self {
        PortSnapshot {
            status: p.status,
            attached: p.attached,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhciSnapshot {
    pub version: u32,
    pub control: u32,
    pub hcca_addr: u64,
    pub control_head_ed: u64,
    pub control_current_ed: u64,
    pub bulk_head_ed: u64,
    pub bulk_current_ed: u64,
    pub periodic_current_ed: u64,
    pub fm_interval: u32,
    pub periodic_start: u32,
    pub ls_threshold: u32,
    pub rh_descriptor_a: u32,
    pub rh_descriptor_b: u32,
    pub rh_status: u32,
    pub frame_number: u32,
    pub dqic: u8,
    pub done_head: u64,
    pub control_list_filled: bool,
    pub bulk_list_filled: bool,
    pub interrupt_status: u32,
    pub interrupt_enable: u32,
    pub ports: Vec<PortSnapshot>,
    /// Derived from `HCFS == OPERATIONAL` at save time (older-version
    /// field name kept for the §6.2 compatibility note).
    pub was_running: bool,
}

impl<M: GuestMemory, V: VusbConnector> Ohci<M, V> {
    pub fn save_state(&self) -> OhciSnapshot {
        let st = self.shared.state.lock().unwrap();
        let irq = self.shared.irq.lock().unwrap();
        OhciSnapshot {
            version: SNAPSHOT_VERSION,
            control: st.control,
            hcca_addr: st.hcca_addr,
            control_head_ed: st.control_head_ed,
            control_current_ed: st.control_current_ed,
            bulk_head_ed: st.bulk_head_ed,
            bulk_current_ed: st.bulk_current_ed,
            periodic_current_ed: st.periodic_current_ed,
            fm_interval: st.fm_interval,
            periodic_start: st.periodic_start,
            ls_threshold: st.ls_threshold,
            rh_descriptor_a: st.rh_descriptor_a,
            rh_descriptor_b: st.rh_descriptor_b,
            rh_status: st.rh_status,
            frame_number: st.frame_number,
            dqic: st.dqic,
            done_head: st.done_head,
            control_list_filled: st.control_list_filled,
            bulk_list_filled: st.bulk_list_filled,
            interrupt_status: irq.status,
            interrupt_enable: irq.enable,
            ports: st.ports.iter().map(PortSnapshot::from).collect(),
            was_running: st.running,
        }
    }

    /// Restores operational state from a snapshot. Per §6.2, the frame
    /// clock is *not* rearmed here even if `was_running` is set — the
    /// embedder calls `start_frame_clock` itself once restore is complete,
    /// using `was_running` to decide whether to.
    pub fn load_state(&self, snap: &OhciSnapshot) {
        let mut st = self.shared.state.lock().unwrap();
        st.control = snap.control;
        st.hcca_addr = snap.hcca_addr;
        st.control_head_ed = snap.control_head_ed;
        st.control_current_ed = snap.control_current_ed;
        st.bulk_head_ed = snap.bulk_head_ed;
        st.bulk_current_ed = snap.bulk_current_ed;
        st.periodic_current_ed = snap.periodic_current_ed;
        st.fm_interval = snap.fm_interval;
        st.periodic_start = snap.periodic_start;
        st.ls_threshold = snap.ls_threshold;
        st.rh_descriptor_a = snap.rh_descriptor_a;
        st.rh_descriptor_b = snap.rh_descriptor_b;
        st.rh_status = snap.rh_status;
        st.frame_number = snap.frame_number;
        st.dqic = snap.dqic;
        st.done_head = snap.done_head;
        st.control_list_filled = snap.control_list_filled;
        st.bulk_list_filled = snap.bulk_list_filled;
        st.running = false; // embedder rearms explicitly per `was_running`

        let target_ports = st.ports.len();
        for (i, p) in st.ports.iter_mut().enumerate() {
            if let Some(saved) = snap.ports.get(i) {
                p.status = saved.status;
                p.attached = saved.attached;
            } else {
                *p = PortState::default();
            }
        }
        let _ = target_ports;
        drop(st);

        let mut irq = self.shared.irq.lock().unwrap();
        irq.status = snap.interrupt_status;
        irq.enable = snap.interrupt_enable;
        drop(irq);
        self.reevaluate_interrupt_line();
    }

    pub fn was_running(snap: &OhciSnapshot) -> bool {
        snap.was_running
    }
}

/// Accepts a `V1` (8-port) layout by zero-filling any ports beyond what the
/// old snapshot carried; used by embedders migrating an older saved state
/// before calling `load_state`.
pub fn upgrade_v1_ports(mut snap: OhciSnapshot, target_ports: usize) -> OhciSnapshot {
    if snap.ports.len() < target_ports {
        snap.ports.resize(
            target_ports,
            PortSnapshot {
                status: 0,
                attached: false,
            },
        );
    }
    snap
}

#[allow(dead_code)]
const _: usize = V1_PORT_COUNT;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ohci::Config;
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
    fn save_then_load_reproduces_operational_registers() {
        let hc = controller();
        hc.mmio_write(super::super::regs::REG_HC_HCCA, 0xABCD_0000);
        hc.mmio_write(super::super::regs::REG_HC_PERIODIC_START, 0x1234);
        let snap = hc.save_state();

        let hc2 = controller();
        hc2.load_state(&snap);
        let snap2 = hc2.save_state();
        assert_eq!(snap.hcca_addr, snap2.hcca_addr);
        assert_eq!(snap.periodic_start, snap2.periodic_start);
    }

    #[test]
    fn json_round_trip_preserves_all_fields() {
        let hc = controller();
        hc.mmio_write(super::super::regs::REG_HC_HCCA, 0x9000);
        let snap = hc.save_state();
        let json = serde_json::to_string(&snap).unwrap();
        let back: OhciSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hcca_addr, snap.hcca_addr);
        assert_eq!(back.ports.len(), snap.ports.len());
    }

    #[test]
    fn upgrading_v1_snapshot_zero_fills_new_ports() {
        let mut snap = OhciSnapshot {
            version: 1,
            control: 0,
            hcca_addr: 0,
            control_head_ed: 0,
            control_current_ed: 0,
            bulk_head_ed: 0,
            bulk_current_ed: 0,
            periodic_current_ed: 0,
            fm_interval: 0,
            periodic_start: 0,
            ls_threshold: 0,
            rh_descriptor_a: 0,
            rh_descriptor_b: 0,
            rh_status: 0,
            frame_number: 0,
            dqic: 7,
            done_head: 0,
            control_list_filled: false,
            bulk_list_filled: false,
            interrupt_status: 0,
            interrupt_enable: 0,
            ports: vec![PortSnapshot { status: 1, attached: true }; V1_PORT_COUNT],
            was_running: false,
        };
        snap = upgrade_v1_ports(snap, 12);
        assert_eq!(snap.ports.len(), 12);
        assert_eq!(snap.ports[11].status, 0);
    }
}
