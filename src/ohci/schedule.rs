//! Descriptor walkers (C3) and URB assembler/submitter (C4, C5) for OHCI.

use crate::error::SubmitError;
use crate::mem::GuestMemory;
use crate::pages::copy_across_pages;
use crate::urb::{Direction, TdKind, TdRef, TransferType, UrbBuilder, UrbRef};
use crate::vusb::VusbConnector;

use super::descriptors::{Ed, EdDirection, GeneralTd, Hcca, IsoTd, ED_SIZE, ITD_SIZE, TD_SIZE};
use super::regs::{ConditionCode, HcControl};
use super::Ohci;

const ITERATION_BUDGET: usize = 128;
const MAX_COMBINED_TDS: usize = 128;

impl<M: GuestMemory, V: VusbConnector> Ohci<M, V> {
    /// Runs one frame's worth of schedule servicing: periodic, then
    /// control, then bulk, in that order (§4.9 bullet 6).
    pub(crate) fn service_schedules(&self) {
        self.walk_periodic_list();
        self.walk_control_list();
        self.walk_bulk_list();
    }

    pub(crate) fn walk_control_list(&self) {
        let (enabled, filled, head) = {
            let st = self.shared.state.lock().unwrap();
            (
                st.control & HcControl::CLE.bits() != 0,
                st.control_list_filled,
                st.control_head_ed,
            )
        };
        if !enabled || !filled || head == 0 {
            return;
        }
        let mut addr = head;
        let mut budget = ITERATION_BUDGET;
        while addr != 0 && budget > 0 {
            budget -= 1;
            let ed = match Ed::read(&self.shared.mem, addr) {
                Ok(ed) => ed,
                Err(_) => break,
            };
            if ed.skip || ed.halted {
                self.cancel_ed_urb(&ed);
            } else if ed.is_ready() {
                self.service_ed_single(addr, &ed, TransferType::Control);
            }
            let next = ed.next_ed;
            if next == 0 || next == head {
                break;
            }
            addr = next;
        }
    }

    pub(crate) fn walk_bulk_list(&self) {
        let (enabled, filled, head) = {
            let st = self.shared.state.lock().unwrap();
            (
                st.control & HcControl::BLE.bits() != 0,
                st.bulk_list_filled,
                st.bulk_head_ed,
            )
        };
        if !enabled || !filled || head == 0 {
            return;
        }
        let mut addr = head;
        let mut budget = ITERATION_BUDGET;
        while addr != 0 && budget > 0 {
            budget -= 1;
            let ed = match Ed::read(&self.shared.mem, addr) {
                Ok(ed) => ed,
                Err(_) => break,
            };
            if ed.skip || ed.halted {
                self.cancel_ed_urb(&ed);
            } else if ed.is_ready() {
                self.service_ed_multiple(addr, &ed, TransferType::Bulk);
            }
            let next = ed.next_ed;
            if next == 0 || next == head {
                break;
            }
            addr = next;
        }
    }

    pub(crate) fn walk_periodic_list(&self) {
        let (frame, hcca_addr, control) = {
            let st = self.shared.state.lock().unwrap();
            (st.frame_number, st.hcca_addr, st.control)
        };
        if hcca_addr == 0 || control & HcControl::PLE.bits() == 0 {
            return;
        }
        let hcca = match Hcca::read(&self.shared.mem, hcca_addr) {
            Ok(h) => h,
            Err(_) => return,
        };
        let head = hcca.interrupt_head(frame);
        let mut addr = head;
        let mut budget = ITERATION_BUDGET;
        while addr != 0 && budget > 0 {
            budget -= 1;
            let ed = match Ed::read(&self.shared.mem, addr) {
                Ok(ed) => ed,
                Err(_) => break,
            };
            if ed.skip || ed.halted {
                self.cancel_ed_urb(&ed);
            } else if ed.is_ready() {
                if ed.isochronous {
                    if control & HcControl::IE.bits() != 0 {
                        self.service_iso_ed(addr, &ed);
                    }
                } else {
                    self.service_ed_multiple(addr, &ed, TransferType::Interrupt);
                }
            }
            let next = ed.next_ed;
            if next == 0 || next == head {
                break;
            }
            addr = next;
        }
    }

    /// Cancels the URB currently pinned by `ed`'s head TD, if any, so a
    /// newly-skipped or newly-halted ED doesn't stall the device.
    fn cancel_ed_urb(&self, ed: &Ed) {
        let head_td = ed.head_pointer & super::descriptors::PTR_MASK;
        if head_td == 0 {
            return;
        }
        let found = {
            let st = self.shared.state.lock().unwrap();
            st.inflight.find(head_td)
        };
        if found.is_some() {
            self.shared
                .vusb
                .cancel_urbs_for_endpoint(ed.function_address, ed.endpoint_number);
        }
    }

    fn effective_direction(ed: &Ed, td_pid: &GeneralTd) -> Direction {
        match ed.direction {
            EdDirection::Out => Direction::Out,
            EdDirection::In => Direction::In,
            EdDirection::FromTd => match td_pid.direction_pid {
                super::descriptors::DirectionPid::Setup => Direction::Setup,
                super::descriptors::DirectionPid::Out => Direction::Out,
                _ => Direction::In,
            },
        }
    }

    fn read_td_bytes(&self, addr: u64) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; TD_SIZE];
        self.shared.mem.read(addr, &mut buf).ok()?;
        Some(buf)
    }

    /// `ServiceTd`: single-TD variant used for control endpoints.
    fn service_ed_single(&self, ed_addr: u64, ed: &Ed, xfer_type: TransferType) {
        let td_addr = ed.head_pointer & super::descriptors::PTR_MASK;
        let already_in_flight = {
            let st = self.shared.state.lock().unwrap();
            st.inflight.find(td_addr).is_some()
        };
        if already_in_flight {
            return;
        }
        let td = match GeneralTd::read(&self.shared.mem, td_addr) {
            Ok(t) => t,
            Err(_) => return,
        };
        let direction = Self::effective_direction(ed, &td);
        let len = td.remaining_len();
        let mut buffer = vec![0u8; len];
        if len > 0 && matches!(direction, Direction::Out | Direction::Setup) {
            if self.copy_td_buffer(&td, &mut buffer, false).is_err() {
                return;
            }
        }
        let raw = match self.read_td_bytes(td_addr) {
            Some(r) => r,
            None => return,
        };
        let submit_frame = self.shared.state.lock().unwrap().frame_number;
        let urb = UrbBuilder::new(
            ed_addr,
            direction,
            xfer_type,
            ed.function_address,
            ed.endpoint_number,
            submit_frame,
        )
        .with_td(TdRef::new(td_addr, TdKind::OhciGeneral, raw))
        .with_buffer(buffer)
        .with_short_not_ok(!td.rounding)
        .build();

        let _ = self.submit_and_track(&[td_addr], urb);
    }

    /// `ServiceTdMultiple`: combines consecutive full-page TDs of matching
    /// direction into one URB.
    fn service_ed_multiple(&self, ed_addr: u64, ed: &Ed, xfer_type: TransferType) {
        let head_addr = ed.head_pointer & super::descriptors::PTR_MASK;
        let already_in_flight = {
            let st = self.shared.state.lock().unwrap();
            st.inflight.find(head_addr).is_some()
        };
        if already_in_flight {
            return;
        }
        let tail = ed.tail_pointer & super::descriptors::PTR_MASK;

        let mut tds: Vec<(u64, GeneralTd)> = Vec::new();
        let mut addr = head_addr;
        let first = match GeneralTd::read(&self.shared.mem, addr) {
            Ok(t) => t,
            Err(_) => return,
        };
        let first_direction = Self::effective_direction(ed, &first);
        tds.push((addr, first));

        loop {
            if tds.len() >= MAX_COMBINED_TDS {
                break;
            }
            let (cur_addr, cur) = tds.last().unwrap();
            let cur_addr = *cur_addr;
            let cur_len = cur.remaining_len();
            let is_full_pages = cur_len == 0x1000 || cur_len == 0x2000;
            if !is_full_pages || cur.rounding || cur.next_td_terminate {
                break;
            }
            let next_addr = cur.next_td;
            if next_addr == 0 || next_addr == tail {
                break;
            }
            let _ = cur_addr;
            let next_td = match GeneralTd::read(&self.shared.mem, next_addr) {
                Ok(t) => t,
                Err(_) => break,
            };
            let next_direction = Self::effective_direction(ed, &next_td);
            if next_direction != first_direction {
                break;
            }
            addr = next_addr;
            tds.push((addr, next_td));
        }

        let total_len: usize = tds.iter().map(|(_, t)| t.remaining_len()).sum();
        let mut buffer = vec![0u8; total_len];
        let mut offset = 0usize;
        let mut td_refs = Vec::with_capacity(tds.len());
        for (addr, td) in &tds {
            let td_len = td.remaining_len();
            if td_len > 0
                && matches!(first_direction, Direction::Out | Direction::Setup)
                && self
                    .copy_td_buffer(td, &mut buffer[offset..offset + td_len], false)
                    .is_err()
            {
                return;
            }
            offset += td_len;
            let raw = match self.read_td_bytes(*addr) {
                Some(r) => r,
                None => return,
            };
            td_refs.push(TdRef::new(*addr, TdKind::OhciGeneral, raw));
        }

        let submit_frame = self.shared.state.lock().unwrap().frame_number;
        let mut builder = UrbBuilder::new(
            ed_addr,
            first_direction,
            xfer_type,
            ed.function_address,
            ed.endpoint_number,
            submit_frame,
        )
        .with_buffer(buffer)
        .with_short_not_ok(!tds.last().unwrap().1.rounding);
        for td_ref in td_refs {
            builder = builder.with_td(td_ref);
        }
        let urb = builder.build();
        let td_addrs: Vec<u64> = tds.iter().map(|(a, _)| *a).collect();
        let _ = self.submit_and_track(&td_addrs, urb);
    }

    /// `ServiceIsochronousTd`: one iTD covering up to 8 packets.
    fn service_iso_ed(&self, ed_addr: u64, ed: &Ed) {
        let td_addr = ed.head_pointer & super::descriptors::PTR_MASK;
        let already_in_flight = {
            let st = self.shared.state.lock().unwrap();
            st.inflight.find(td_addr).is_some()
        };
        if already_in_flight {
            return;
        }
        let itd = match IsoTd::read(&self.shared.mem, td_addr) {
            Ok(t) => t,
            Err(_) => return,
        };
        let current_frame = self.shared.state.lock().unwrap().frame_number & 0xFFFF;
        let r = (current_frame as i32) - (itd.starting_frame as i32);
        if r < 0 && (-r) as usize > 1 {
            // ahead of schedule by more than one frame: wait.
            return;
        }
        if r as i64 >= itd.num_packets() as i64 {
            // launch window passed without being serviced: overrun.
            self.retire_iso_overrun(ed_addr, td_addr, &itd);
            return;
        }
        let direction = match ed.direction {
            EdDirection::Out => Direction::Out,
            _ => Direction::In,
        };
        let start = r.max(0) as usize;
        let num_packets = itd.num_packets() - start;
        let mut packets = Vec::with_capacity(num_packets);
        let mut total_len = 0usize;
        for i in 0..num_packets {
            let idx = start + i;
            let offset = itd.psw[idx].offset_or_size as u32;
            let next_offset = if idx + 1 < itd.num_packets() {
                itd.psw[idx + 1].offset_or_size as u32
            } else {
                let be_low = itd.buffer_end & 0xFFF;
                let extra = if (itd.buffer_end & !0xFFF) != (itd.buffer_page0 & !0xFFF) {
                    0x1000
                } else {
                    0
                };
                be_low + extra + 1
            };
            let packet_len = next_offset.saturating_sub(offset) as usize;
            packets.push((offset, packet_len as u32));
            total_len += packet_len;
        }

        let mut buffer = vec![0u8; total_len];
        if matches!(direction, Direction::Out) {
            let page1 = itd.buffer_end as u64 & !0xFFF;
            let mut off = 0usize;
            for (pkt_offset, pkt_len) in &packets {
                let offset_in_page0 = (*pkt_offset & 0xFFF) as u64;
                if copy_across_pages(
                    &self.shared.mem,
                    itd.buffer_page0 as u64,
                    page1,
                    offset_in_page0,
                    *pkt_len as usize,
                    &mut buffer[off..off + *pkt_len as usize],
                    false,
                )
                .is_err()
                {
                    return;
                }
                off += *pkt_len as usize;
            }
        }

        let raw = match self.read_td_bytes_n(td_addr, ITD_SIZE) {
            Some(r) => r,
            None => return,
        };
        let submit_frame = self.shared.state.lock().unwrap().frame_number;
        let urb = UrbBuilder::new(
            ed_addr,
            direction,
            TransferType::Isochronous,
            ed.function_address,
            ed.endpoint_number,
            submit_frame,
        )
        .with_td(TdRef::new(td_addr, TdKind::OhciIsochronous, raw))
        .with_buffer(buffer)
        .with_iso_packets(packets)
        .build();

        let _ = self.submit_and_track(&[td_addr], urb);
    }

    fn retire_iso_overrun(&self, _ed_addr: u64, td_addr: u64, itd: &IsoTd) {
        let mut itd = *itd;
        itd.condition_code = ConditionCode::DataOverrun.bits() as u8;
        let _ = itd.write_back(&self.shared.mem, td_addr);
        self.append_done(td_addr);
    }

    fn read_td_bytes_n(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.shared.mem.read(addr, &mut buf).ok()?;
        Some(buf)
    }

    fn copy_td_buffer(&self, td: &GeneralTd, buf: &mut [u8], write: bool) -> Result<(), crate::error::MemError> {
        if td.current_buffer_pointer == 0 {
            return Ok(());
        }
        let offset_in_page0 = (td.current_buffer_pointer & 0xFFF) as u64;
        copy_across_pages(
            &self.shared.mem,
            td.page0(),
            td.page1(),
            offset_in_page0,
            buf.len(),
            buf,
            write,
        )
    }

    /// Inserts `td_addrs` into the In-Flight Table under `urb`, then submits
    /// via VUSB. On failure, removes the entries again and leaves the ED
    /// unchanged so the guest's next frame retries it.
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

    /// Appends a retired TD's guest address onto the pending done chain,
    /// using the TD's own next-pointer dword as the link (exactly as real
    /// OHCI hardware threads the done queue through guest memory).
    pub(crate) fn append_done(&self, td_addr: u64) {
        let mut st = self.shared.state.lock().unwrap();
        let prev_head = st.done_head;
        drop(st);
        let _ = self.shared.mem.write_u32(td_addr + 8, prev_head as u32);
        let mut st = self.shared.state.lock().unwrap();
        st.done_head = td_addr;
    }
}
