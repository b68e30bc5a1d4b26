//! Descriptor walkers (C3) and URB assembler/submitter (C4, C5) for EHCI.

use crate::error::SubmitError;
use crate::mem::GuestMemory;
use crate::urb::{Direction, TdKind, TdRef, TransferType, UrbBuilder, UrbRef};
use crate::vusb::VusbConnector;

use super::descriptors::{Itd, LinkKind, Qh, Qtd, QtdPid, Sitd, TaggedPointer, ITD_SIZE, QTD_SIZE};
use super::regs::QtdStatus;
use super::Ehci;

const ASYNC_BUDGET: usize = 128;
const PERIODIC_BUDGET: usize = 2048;
const FRAME_LIST_ENTRIES: u64 = 1024;

impl<M: GuestMemory, V: VusbConnector> Ehci<M, V> {
    pub(crate) fn service_schedules(&self) {
        self.walk_periodic_list();
        self.walk_async_list();
    }

    /// Async ring walk (§4.3.2): stop on cycle, on a second visit to the
    /// reclamation-head QH with no intervening work, or on budget exhaustion.
    pub(crate) fn walk_async_list(&self) {
        let (enabled, head) = {
            let st = self.shared.state.lock().unwrap();
            (
                st.usbcmd & super::regs::UsbCmd::ASE.bits() != 0,
                st.async_list_addr,
            )
        };
        if !enabled || head == 0 {
            return;
        }
        let mut addr = head;
        let mut budget = ASYNC_BUDGET;
        let mut did_work = false;
        let mut reached_reclaim_twice = false;
        loop {
            if budget == 0 {
                break;
            }
            budget -= 1;
            let qh = match Qh::read(&self.shared.mem, addr) {
                Ok(q) => q,
                Err(_) => break,
            };
            if qh.head_of_reclamation {
                if reached_reclaim_twice {
                    break;
                }
                reached_reclaim_twice = true;
            }
            if qh.is_ready() {
                let park_count = self.async_park_count(&qh);
                for _ in 0..park_count {
                    if self.service_qtd(addr, &qh, TransferType::Bulk) {
                        did_work = true;
                    } else {
                        break;
                    }
                }
            }
            let next = qh.horizontal_link;
            if next.terminate || next.addr == 0 {
                break;
            }
            if next.addr == head {
                break;
            }
            addr = next.addr;
        }
        let mut st = self.shared.state.lock().unwrap();
        if did_work {
            st.async_did_work_since_reclaim = true;
        }
    }

    /// Async-park count (§4.3.2): 1 for non-HS devices, else the
    /// USBCMD-configured count (1..16) when park mode is enabled.
    fn async_park_count(&self, qh: &Qh) -> u32 {
        use super::descriptors::EndpointSpeed;
        if qh.endpoint_speed != EndpointSpeed::High {
            return 1;
        }
        let cmd = self.shared.state.lock().unwrap().usbcmd;
        if cmd & super::regs::UsbCmd::ASYNC_PARK_EN.bits() == 0 {
            return 1;
        }
        (((cmd & super::regs::UsbCmd::ASYNC_PARK_MASK.bits()) >> 8) + 1).min(16)
    }

    /// Periodic list walk (§4.3.2): tagged-pointer dispatch, no v-table.
    pub(crate) fn walk_periodic_list(&self) {
        let (enabled, base, frame_index) = {
            let st = self.shared.state.lock().unwrap();
            (
                st.usbcmd & super::regs::UsbCmd::PSE.bits() != 0,
                st.periodic_list_base,
                st.frame_index,
            )
        };
        if !enabled || base == 0 {
            return;
        }
        let microframe = (frame_index / 8) % FRAME_LIST_ENTRIES as u32;
        let entry_addr = base + (microframe as u64) * 4;
        let raw = match self.shared.mem.read_u32(entry_addr) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut ptr = TaggedPointer::from_raw(raw);
        let mut budget = PERIODIC_BUDGET;
        loop {
            if ptr.terminate || budget == 0 {
                break;
            }
            budget -= 1;
            ptr = match ptr.kind {
                LinkKind::Qh => match self.service_periodic_qh(ptr.addr) {
                    Some(next) => next,
                    None => break,
                },
                LinkKind::Itd => match self.service_itd(ptr.addr) {
                    Some(next) => next,
                    None => break,
                },
                LinkKind::Sitd => match Sitd::read(&self.shared.mem, ptr.addr) {
                    Ok(s) => {
                        if s.active {
                            log::warn!("sITD at {:#x} active: split transactions unsupported", ptr.addr);
                        }
                        s.next_link
                    }
                    Err(_) => break,
                },
                LinkKind::Fstn => match super::descriptors::Fstn::read(&self.shared.mem, ptr.addr) {
                    Ok(f) => f.normal_link,
                    Err(_) => break,
                },
            };
        }
    }

    fn service_periodic_qh(&self, addr: u64) -> Option<TaggedPointer> {
        let qh = Qh::read(&self.shared.mem, addr).ok()?;
        if qh.smask != 0 && qh.is_ready() {
            self.service_qtd(addr, &qh, Self::infer_transfer_type(&qh));
        }
        Some(qh.horizontal_link)
    }

    /// Transfer-type inference (§4.4.3) for QHs with no explicit marker.
    pub(crate) fn infer_transfer_type(qh: &Qh) -> TransferType {
        if qh.endpoint_number == 0 {
            return TransferType::Control;
        }
        if qh.smask != 0 {
            return TransferType::Interrupt;
        }
        use super::descriptors::EndpointSpeed;
        if qh.endpoint_speed != EndpointSpeed::High && qh.control_endpoint_flag {
            return TransferType::Control;
        }
        if qh.max_packet_len == 64 {
            return TransferType::Interrupt;
        }
        TransferType::Bulk
    }

    /// `ServiceQTD` (§4.4.4): picks the qTD indicated by the QH overlay, or
    /// by `Next`/`AltNext` if none is active, assembles a URB, submits.
    /// Returns whether a qTD was actually serviced (for the async-park loop
    /// and the idle-rate heuristic).
    fn service_qtd(&self, qh_addr: u64, qh: &Qh, xfer_type: TransferType) -> bool {
        let overlay_active = QtdStatus::from_bits_truncate(qh.overlay_token).contains(QtdStatus::ACTIVE);
        let qtd_addr = if overlay_active {
            qh.current_qtd
        } else if !qh.overlay_next_terminate {
            qh.overlay_next_qtd
        } else {
            return false;
        };
        if qtd_addr == 0 {
            return false;
        }
        let already_in_flight = {
            let st = self.shared.state.lock().unwrap();
            st.inflight.find(qtd_addr).is_some()
        };
        if already_in_flight {
            return false;
        }
        let qtd = match Qtd::read(&self.shared.mem, qtd_addr) {
            Ok(t) => t,
            Err(_) => return false,
        };
        if !qtd.status.contains(QtdStatus::ACTIVE) {
            return false;
        }

        let direction = match qtd.pid {
            QtdPid::Out => Direction::Out,
            QtdPid::In => Direction::In,
            QtdPid::Setup => Direction::Setup,
        };
        let len = qtd.total_bytes as usize;
        let mut buffer = vec![0u8; len];
        if len > 0 && matches!(direction, Direction::Out | Direction::Setup) {
            if self.copy_qtd_buffer(&qtd, &mut buffer, false).is_err() {
                return false;
            }
        }
        let mut raw = vec![0u8; QTD_SIZE];
        if self.shared.mem.read(qtd_addr, &mut raw).is_err() {
            return false;
        }

        self.setup_overlay(qh_addr, qh, &qtd, qtd_addr);

        let submit_frame = self.shared.state.lock().unwrap().frame_index;
        let short_not_ok = !matches!(direction, Direction::In);
        let urb = UrbBuilder::new(
            qh_addr,
            direction,
            xfer_type,
            qh.device_address,
            qh.endpoint_number,
            submit_frame,
        )
        .with_td(TdRef::new(qtd_addr, TdKind::EhciQueueTd, raw))
        .with_buffer(buffer)
        .with_short_not_ok(short_not_ok)
        .build();

        self.submit_and_track(&[qtd_addr], urb).is_ok()
    }

    /// `QHSetupOverlay`: copies the qTD's fields into the QH overlay,
    /// preserving the data toggle if the QH has `DataToggleControl` set.
    fn setup_overlay(&self, qh_addr: u64, qh: &Qh, qtd: &Qtd, qtd_addr: u64) {
        let mut overlay_token = qtd.encode_token();
        if qh.data_toggle_control {
            let preserved = qh.overlay_token & (1 << 31);
            overlay_token = (overlay_token & !(1 << 31)) | preserved;
        }
        let overlay = Qh {
            current_qtd: qtd_addr,
            overlay_next_qtd: qtd.next_qtd,
            overlay_next_terminate: qtd.next_terminate,
            overlay_alt_next_qtd: qtd.alt_next_qtd,
            overlay_token,
            overlay_buffers: qtd.buffers,
            ..qh.clone()
        };
        let _ = overlay.write_overlay(&self.shared.mem, qh_addr);
    }

    fn copy_qtd_buffer(&self, qtd: &Qtd, buf: &mut [u8], write: bool) -> Result<(), crate::error::MemError> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut offset_in_page = qtd.buffer_offset() as usize;
        let mut page_idx = 0usize;
        let mut written = 0usize;
        while written < buf.len() {
            if page_idx >= 5 {
                break;
            }
            let page_base = qtd.page_base(page_idx);
            let room = 0x1000 - offset_in_page;
            let chunk = room.min(buf.len() - written);
            let gpa = page_base + offset_in_page as u64;
            if write {
                self.shared.mem.write(gpa, &buf[written..written + chunk])?;
            } else {
                self.shared.mem.read(gpa, &mut buf[written..written + chunk])?;
            }
            written += chunk;
            offset_in_page = 0;
            page_idx += 1;
        }
        Ok(())
    }

    /// EHCI iTD service: 8 transactions per iTD, 7 buffer pages (§4.4.4).
    fn service_itd(&self, addr: u64) -> Option<TaggedPointer> {
        let itd = Itd::read(&self.shared.mem, addr).ok()?;
        let already_in_flight = {
            let st = self.shared.state.lock().unwrap();
            st.inflight.find(addr).is_some()
        };
        if already_in_flight {
            return Some(itd.next_link);
        }
        let direction = if itd.direction_in { Direction::In } else { Direction::Out };
        let mut packets = Vec::new();
        let mut total_len = 0usize;
        for t in itd.transactions.iter() {
            if !t.active {
                continue;
            }
            packets.push((t.offset as u32, t.length as u32));
            total_len += t.length as usize;
        }
        if packets.is_empty() {
            return Some(itd.next_link);
        }
        let mut buffer = vec![0u8; total_len];
        if matches!(direction, Direction::Out) {
            let mut off = 0usize;
            for t in itd.transactions.iter() {
                if !t.active {
                    continue;
                }
                let len = t.length as usize;
                if let Some(page) = itd.page_for(t.page_select) {
                    let gpa = page + t.offset as u64;
                    if self.shared.mem.read(gpa, &mut buffer[off..off + len]).is_err() {
                        return Some(itd.next_link);
                    }
                }
                // illegal PG=7 synthesizes to a zero-filled scratch page:
                // leave this packet's slice as-is and keep offsets in sync.
                off += len;
            }
        }

        let mut raw = vec![0u8; ITD_SIZE];
        if self.shared.mem.read(addr, &mut raw).is_err() {
            return Some(itd.next_link);
        }
        let submit_frame = self.shared.state.lock().unwrap().frame_index;
        let urb = UrbBuilder::new(
            addr,
            direction,
            TransferType::Isochronous,
            itd.device_address,
            itd.endpoint_number,
            submit_frame,
        )
        .with_td(TdRef::new(addr, TdKind::EhciIsochronous, raw))
        .with_buffer(buffer)
        .with_iso_packets(packets)
        .build();

        let _ = self.submit_and_track(&[addr], urb);
        Some(itd.next_link)
    }

    fn submit_and_track(&self, td_addrs: &[u64], urb: UrbRef) -> Result<(), SubmitError> {
        let submit_frame = urb.submit_frame;
        {
            let mut st = self.shared.state.lock().unwrap();
            for addr in td_addrs {
                st.inflight.add(*addr, urb.clone(), submit_frame);
            }
        }
        let controller = self.clone();
        let urb_for_completion = urb.clone();
        let result = self.shared.vusb.submit_urb(
            urb.clone(),
            Box::new(move |completion| {
                controller.complete_urb(urb_for_completion, completion);
            }),
        );
        if result.is_err() {
            let mut st = self.shared.state.lock().unwrap();
            for addr in td_addrs {
                st.inflight.remove(*addr);
            }
        }
        result
    }
}
