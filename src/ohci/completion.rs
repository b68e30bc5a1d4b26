//! Completion retirer (C6) and error-retry policy (C7) for OHCI.

use crate::mem::GuestMemory;
use crate::urb::{Direction, TdKind, TransferType, UrbCompletion, UrbRef, VusbStatus};
use crate::vusb::VusbConnector;

use super::descriptors::{ConditionCode as Cc, Ed, GeneralTd, IsoTd};
use super::regs::{ConditionCode, HcInterrupt};
use super::Ohci;

/// A TD's 2-bit error counter saturates the transfer after this many
/// consecutive errors (§4.6: "retires when it reaches `TD_ERRORS_MAX - 1 =
/// 3`").
const TD_ERRORS_MAX: u8 = 3;

fn map_status(status: VusbStatus) -> ConditionCode {
    match status {
        VusbStatus::Ok => ConditionCode::NoError,
        VusbStatus::Stall => ConditionCode::Stall,
        VusbStatus::Crc => ConditionCode::Crc,
        VusbStatus::DataUnderrun => ConditionCode::DataUnderrun,
        VusbStatus::DataOverrun => ConditionCode::DataOverrun,
        VusbStatus::Dnr => ConditionCode::DeviceNotResponding,
        VusbStatus::NotAccessed => ConditionCode::NotAccessed,
    }
}

impl<M: GuestMemory, V: VusbConnector> Ohci<M, V> {
    /// Invoked by the VUSB connector, on whatever thread it completes the
    /// URB on. Re-acquires the device lock (by virtue of every method below
    /// locking `shared.state` itself) before touching any schedule state.
    pub(crate) fn complete_urb(&self, urb: UrbRef, completion: UrbCompletion) {
        self.shared.mem.invalidate();

        let cf_age = {
            let mut st = self.shared.state.lock().unwrap();
            let mut age = -1i64;
            for td in &urb.tds {
                if let Some((_, submit_frame)) = st.inflight.remove(td.addr) {
                    age = (st.frame_number as i64) - (submit_frame as i64);
                }
            }
            st.inflight.remove_urb(&urb);
            age
        };

        if urb.xfer_type == TransferType::Isochronous {
            self.complete_iso(&urb, completion, cf_age);
            return;
        }

        let first_td = match urb.tds.first() {
            Some(t) => t,
            None => return,
        };

        let current_bytes = {
            let mut buf = vec![0u8; first_td.copy.len()];
            if self.shared.mem.read(first_td.addr, &mut buf).is_err() {
                return;
            }
            buf
        };
        // Ignore the next-TD word (bytes 8..12) when comparing: a
        // not-yet-retired TD's own next pointer may legitimately differ if
        // the guest appended more work after it without disturbing this TD.
        let cancelled = cf_age < 0 || !tds_match_ignoring_next(&first_td.copy, &current_bytes);

        let ed = match Ed::read(&self.shared.mem, urb.anchor_addr) {
            Ok(ed) => ed,
            Err(_) => return,
        };
        let ed_diverged = (ed.head_pointer & super::descriptors::PTR_MASK) != first_td.addr
            && urb.tds.len() == 1;

        if cancelled || ed.skip || ed.halted || ed_diverged {
            self.stat_dropped();
            return;
        }

        if !urb.mark_unlinked() {
            return;
        }

        let mut td = match GeneralTd::from_dwords(&dwords4(&first_td.copy)) {
            Ok(t) => t,
            Err(_) => return,
        };

        if completion.status.is_error() {
            if self.should_retry(&urb, completion.status, &mut td) {
                urb.mark_unlinked(); // no-op (already true); kept for clarity at call site
                let _ = td.write_back(&self.shared.mem, first_td.addr);
                return;
            }
            td.set_condition_code(map_status(completion.status));
        } else {
            td.set_condition_code(Cc::NoError);
            if matches!(urb.direction, Direction::In) {
                let n = completion.data.len().min(urb.buffer.len());
                let _ = self.write_back_in_data(&td, &completion.data[..n]);
                td.current_buffer_pointer = advance_cbp(&td, n);
            } else {
                td.current_buffer_pointer = 0;
            }
            td.data_toggle = flipped_toggle(td.data_toggle);
        }

        let _ = td.write_back(&self.shared.mem, first_td.addr);
        self.unlink_td(&ed, urb.anchor_addr, first_td.addr);

        if completion.status.is_error() {
            let mut st = self.shared.state.lock().unwrap();
            st.dqic = 0;
            let mut ed2 = ed;
            ed2.halted = true;
            drop(st);
            let _ = ed2.write_head(&self.shared.mem, urb.anchor_addr);
        }

        self.append_done(first_td.addr);
        self.maybe_writeback_done_queue();
    }

    fn complete_iso(&self, urb: &UrbRef, completion: UrbCompletion, cf_age: i64) {
        let first_td = match urb.tds.first() {
            Some(t) => t,
            None => return,
        };
        if cf_age < 0 {
            self.stat_dropped();
            return;
        }
        if !urb.mark_unlinked() {
            return;
        }
        let mut itd = match IsoTd::read(&self.shared.mem, first_td.addr) {
            Ok(t) => t,
            Err(_) => return,
        };
        let results = completion.iso_results.unwrap_or_default();
        let mut last_not_accessed = false;
        let start = itd.num_packets() - results.len();
        for (i, r) in results.iter().enumerate() {
            let idx = start + i;
            if idx >= 8 {
                break;
            }
            itd.psw[idx].condition_code = map_status(r.status).bits() as u8;
            itd.psw[idx].offset_or_size = if r.status == VusbStatus::NotAccessed {
                0
            } else {
                r.length as u16
            };
            last_not_accessed = r.status == VusbStatus::NotAccessed;
        }
        itd.condition_code = if last_not_accessed {
            Cc::DataOverrun.bits() as u8
        } else {
            Cc::NoError.bits() as u8
        };

        if matches!(urb.direction, Direction::In) {
            if let Some(packets) = &urb.iso_packets {
                let page1 = itd.buffer_end as u64 & !0xFFF;
                let mut off = 0usize;
                for (pkt_offset, pkt_len) in packets {
                    let len = (*pkt_len as usize).min(completion.data.len().saturating_sub(off));
                    if len > 0 {
                        let offset_in_page0 = (*pkt_offset & 0xFFF) as u64;
                        let _ = crate::pages::copy_across_pages(
                            &self.shared.mem,
                            itd.buffer_page0 as u64,
                            page1,
                            offset_in_page0,
                            len,
                            &mut completion.data[off..off + len].to_vec(),
                            true,
                        );
                    }
                    off += *pkt_len as usize;
                }
            }
        }

        let _ = itd.write_back(&self.shared.mem, first_td.addr);
        self.append_done(first_td.addr);
        self.maybe_writeback_done_queue();
    }

    /// Writes the bytes received for an IN transfer back across the TD's
    /// (up to two) buffer pages.
    fn write_back_in_data(&self, td: &GeneralTd, data: &[u8]) -> Result<(), crate::error::MemError> {
        if td.current_buffer_pointer == 0 || data.is_empty() {
            return Ok(());
        }
        let offset_in_page0 = (td.current_buffer_pointer & 0xFFF) as u64;
        let mut buf = data.to_vec();
        crate::pages::copy_across_pages(
            &self.shared.mem,
            td.page0(),
            td.page1(),
            offset_in_page0,
            data.len(),
            &mut buf,
            true,
        )
    }

    /// §4.6: isochronous and STALL never retry; cancellation detected at
    /// error time retires; otherwise increment the error counter and retry
    /// while it's below `TD_ERRORS_MAX - 1`.
    fn should_retry(&self, urb: &UrbRef, status: VusbStatus, td: &mut GeneralTd) -> bool {
        if urb.xfer_type == TransferType::Isochronous || status == VusbStatus::Stall {
            return false;
        }
        td.error_count = td.error_count.saturating_add(1);
        td.error_count < TD_ERRORS_MAX
    }

    fn unlink_td(&self, ed: &Ed, ed_addr: u64, td_addr: u64) {
        // The retired TD is always the head TD (single-TD service path, or
        // the first of a combined run for ServiceTdMultiple), so unlinking
        // means advancing HeadP past it.
        let _ = td_addr;
        let td = match GeneralTd::read(&self.shared.mem, ed.head_pointer & super::descriptors::PTR_MASK) {
            Ok(t) => t,
            Err(_) => return,
        };
        let mut ed2 = *ed;
        ed2.head_pointer = td.next_td & super::descriptors::PTR_MASK;
        let _ = ed2.write_head(&self.shared.mem, ed_addr);
    }

    fn stat_dropped(&self) {
        self.shared.state.lock().unwrap().stat_dropped_urbs += 1;
    }

    /// §4.5 done-queue writeback bullet: if `dqic == 0` and `WRITE_DONE_HEAD`
    /// is not already pending, write the HCCA done-head and reset the
    /// counter. This is also invoked once per frame tick from the clock.
    pub(crate) fn maybe_writeback_done_queue(&self) {
        let should_write = {
            let st = self.shared.state.lock().unwrap();
            st.dqic == 0 && !st.done_pending_wdh && st.done_head != 0
        };
        if !should_write {
            return;
        }
        let (hcca_addr, done_head) = {
            let st = self.shared.state.lock().unwrap();
            (st.hcca_addr, st.done_head)
        };
        if hcca_addr == 0 {
            return;
        }
        let other_pending = {
            let irq = self.shared.irq.lock().unwrap();
            irq.status & irq.enable & !(HcInterrupt::WDH.bits() | HcInterrupt::OC.bits()) != 0
        };
        let marked = done_head as u32 | other_pending as u32;
        if self.shared.mem.write_u32(hcca_addr + 132, marked).is_err() {
            return;
        }
        {
            let mut st = self.shared.state.lock().unwrap();
            st.done_head = 0;
            st.dqic = 7;
            st.done_pending_wdh = true;
        }
        self.raise_interrupt(HcInterrupt::WDH.bits());
    }
}

fn dwords4(bytes: &[u8]) -> [u32; 4] {
    let mut dw = [0u32; 4];
    for (i, chunk) in bytes.chunks_exact(4).enumerate().take(4) {
        dw[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    dw
}

/// Compares two verbatim TD copies, field-by-field, ignoring the next-TD
/// dword (bytes 8..12 of a general TD) per §4.5 bullet "Cancellation check".
fn tds_match_ignoring_next(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a[0..8] == b[0..8] && a[12..a.len().min(16)] == b[12..b.len().min(16)]
}

fn advance_cbp(td: &GeneralTd, transferred: usize) -> u32 {
    if transferred == 0 {
        return td.current_buffer_pointer;
    }
    let remaining = td.remaining_len();
    if transferred >= remaining {
        0
    } else {
        td.current_buffer_pointer.wrapping_add(transferred as u32)
    }
}

fn flipped_toggle(t: super::descriptors::DataToggle) -> super::descriptors::DataToggle {
    use super::descriptors::DataToggle::*;
    match t {
        Data0 => Data1,
        Data1 => Data0,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ohci::{descriptors::ED_SIZE, Config};
    use crate::urb::{Direction, IsoPacketResult, TdRef, TransferType, UrbBuilder};
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
            VecMemory(Mutex::new(vec![0u8; 1 << 20])),
            Arc::new(RecordingConnector::default()),
            Arc::new(RecordingInterruptLine::default()),
            Config::default(),
        )
    }

    fn write_ed(hc: &Ohci<VecMemory, RecordingConnector>, addr: u64, head: u64, tail: u64) {
        hc.shared.mem.write_dwords(addr, &[0, tail as u32, head as u32, 0]).unwrap();
    }

    fn write_td(hc: &Ohci<VecMemory, RecordingConnector>, addr: u64, cbp: u32, be: u32) {
        hc.shared.mem.write_dwords(addr, &[1 << 18, cbp, 0, be]).unwrap();
    }

    #[test]
    fn successful_bulk_out_clears_cbp_and_flips_toggle() {
        let hc = controller();
        let ed_addr = 0x10000;
        let td_addr = 0x10040;
        write_ed(&hc, ed_addr, td_addr, 0x10080);
        write_td(&hc, td_addr, 0x20000, 0x2003F);
        for i in 0..64u8 {
            hc.shared.mem.write(0x20000 + i as u64, &[i]).unwrap();
        }

        let raw = {
            let mut buf = vec![0u8; 16];
            hc.shared.mem.read(td_addr, &mut buf).unwrap();
            buf
        };
        let urb = UrbBuilder::new(ed_addr, Direction::Out, TransferType::Bulk, 1, 1, 0)
            .with_td(TdRef::new(td_addr, crate::urb::TdKind::OhciGeneral, raw))
            .with_buffer((0..64u8).collect())
            .build();
        hc.shared.state.lock().unwrap().inflight.add(td_addr, urb.clone(), 0);

        hc.complete_urb(
            urb,
            UrbCompletion {
                status: VusbStatus::Ok,
                data: vec![],
                iso_results: None,
            },
        );

        let td = GeneralTd::read(&hc.shared.mem, td_addr).unwrap();
        assert_eq!(td.current_buffer_pointer, 0);
        assert_eq!(td.condition_code, 0);
        let ed = Ed::read(&hc.shared.mem, ed_addr).unwrap();
        assert_eq!(ed.head_pointer, 0x10080);
    }

    #[test]
    fn short_in_sets_data_underrun_and_halts_ed() {
        let hc = controller();
        let ed_addr = 0x10000;
        let td_addr = 0x10040;
        write_ed(&hc, ed_addr, td_addr, 0x10080);
        write_td(&hc, td_addr, 0x20000, 0x201FF); // 512 bytes requested

        let raw = {
            let mut buf = vec![0u8; 16];
            hc.shared.mem.read(td_addr, &mut buf).unwrap();
            buf
        };
        let urb = UrbBuilder::new(ed_addr, Direction::In, TransferType::Bulk, 1, 1, 0)
            .with_td(TdRef::new(td_addr, crate::urb::TdKind::OhciGeneral, raw))
            .with_buffer(vec![0u8; 512])
            .build();
        hc.shared.state.lock().unwrap().inflight.add(td_addr, urb.clone(), 0);

        hc.complete_urb(
            urb,
            UrbCompletion {
                status: VusbStatus::DataUnderrun,
                data: vec![0xAAu8; 200],
                iso_results: None,
            },
        );

        let td = GeneralTd::read(&hc.shared.mem, td_addr).unwrap();
        assert_eq!(td.condition_code, ConditionCode::DataUnderrun.bits() as u8);
        let ed = Ed::read(&hc.shared.mem, ed_addr).unwrap();
        assert!(ed.halted);
        let mut readback = [0u8; 200];
        hc.shared.mem.read(0x20000, &mut readback).unwrap();
        assert_eq!(&readback[..], &[0xAAu8; 200][..]);
    }

    #[test]
    fn cancelled_urb_is_dropped_without_touching_guest_memory() {
        let hc = controller();
        let ed_addr = 0x10000;
        let td_addr = 0x10040;
        write_ed(&hc, ed_addr, td_addr, 0x10080);
        write_td(&hc, td_addr, 0x20000, 0x2003F);

        let raw = {
            let mut buf = vec![0u8; 16];
            hc.shared.mem.read(td_addr, &mut buf).unwrap();
            buf
        };
        let urb = UrbBuilder::new(ed_addr, Direction::Out, TransferType::Bulk, 1, 1, 0)
            .with_td(TdRef::new(td_addr, crate::urb::TdKind::OhciGeneral, raw))
            .with_buffer(vec![0u8; 64])
            .build();
        hc.shared.state.lock().unwrap().inflight.add(td_addr, urb.clone(), 0);

        // Guest mutates the ED head to a different TD before completion.
        write_ed(&hc, ed_addr, 0x10080, 0x10080);

        hc.complete_urb(
            urb,
            UrbCompletion {
                status: VusbStatus::Ok,
                data: vec![],
                iso_results: None,
            },
        );

        assert_eq!(hc.shared.state.lock().unwrap().stat_dropped_urbs, 1);
        let td = GeneralTd::read(&hc.shared.mem, td_addr).unwrap();
        assert_eq!(td.current_buffer_pointer, 0x20000);
    }

    #[test]
    fn iso_completion_sets_data_overrun_on_trailing_not_accessed() {
        let hc = controller();
        let td_addr = 0x30000;
        // frame_count = 7 (8 packets), starting_frame = 0.
        let d0 = 7u32 << 24;
        hc.shared.mem.write_dwords(td_addr, &[d0, 0x40000, 0, 0x40000 | 0x1C0, 0, 0, 0, 0]).unwrap();

        let raw = {
            let mut buf = vec![0u8; 32];
            hc.shared.mem.read(td_addr, &mut buf).unwrap();
            buf
        };
        let urb = UrbBuilder::new(0x1000, Direction::In, TransferType::Isochronous, 1, 1, 0)
            .with_td(TdRef::new(td_addr, crate::urb::TdKind::OhciIsochronous, raw))
            .with_buffer(vec![0u8; 0x40 * 8])
            .with_iso_packets((0..8).map(|i| (i * 0x40, 0x40)).collect())
            .build();
        hc.shared.state.lock().unwrap().inflight.add(td_addr, urb.clone(), 0);

        let mut results: Vec<IsoPacketResult> = (0..7)
            .map(|i| IsoPacketResult { offset: i * 0x40, length: 0x40, status: VusbStatus::Ok })
            .collect();
        results.push(IsoPacketResult { offset: 7 * 0x40, length: 0, status: VusbStatus::NotAccessed });

        hc.complete_urb(
            urb,
            UrbCompletion {
                status: VusbStatus::Ok,
                data: vec![0u8; 0x40 * 7],
                iso_results: Some(results),
            },
        );

        let itd = IsoTd::read(&hc.shared.mem, td_addr).unwrap();
        assert_eq!(itd.condition_code, ConditionCode::DataOverrun.bits() as u8);
    }
}
