//! Completion retirer (C6) and error-retry policy (C7) for EHCI.

use crate::mem::GuestMemory;
use crate::urb::{Direction, TransferType, UrbCompletion, UrbRef, VusbStatus};
use crate::vusb::VusbConnector;

use super::descriptors::{Itd, Qh, Qtd};
use super::regs::{QtdStatus, UsbSts};
use super::Ehci;

fn map_status_bits(status: VusbStatus) -> QtdStatus {
    match status {
        VusbStatus::Ok => QtdStatus::empty(),
        VusbStatus::Stall => QtdStatus::HALTED,
        VusbStatus::Crc => QtdStatus::TRANSACT_ERR,
        VusbStatus::DataUnderrun => QtdStatus::DATA_BUF_ERR,
        VusbStatus::DataOverrun => QtdStatus::DATA_BUF_ERR,
        VusbStatus::Dnr => QtdStatus::TRANSACT_ERR,
        VusbStatus::NotAccessed => QtdStatus::empty(),
    }
}

impl<M: GuestMemory, V: VusbConnector> Ehci<M, V> {
    pub(crate) fn complete_urb(&self, urb: UrbRef, completion: UrbCompletion) {
        self.shared.mem.invalidate();

        let cf_age = {
            let mut st = self.shared.state.lock().unwrap();
            let mut age = -1i64;
            for td in &urb.tds {
                if let Some((_, submit_frame)) = st.inflight.remove(td.addr) {
                    age = (st.frame_index as i64) - (submit_frame as i64);
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
        let cancelled = cf_age < 0 || !tds_match_ignoring_next(&first_td.copy, &current_bytes);

        let qh = match Qh::read(&self.shared.mem, urb.anchor_addr) {
            Ok(q) => q,
            Err(_) => return,
        };
        let token = QtdStatus::from_bits_truncate(qh.overlay_token);
        let qh_diverged = qh.current_qtd != first_td.addr;

        if cancelled || token.contains(QtdStatus::HALTED) || qh_diverged {
            self.stat_dropped();
            let mut qh2 = qh;
            qh2.overlay_token &= !QtdStatus::ACTIVE.bits();
            let _ = qh2.write_overlay(&self.shared.mem, urb.anchor_addr);
            return;
        }

        if !urb.mark_unlinked() {
            return;
        }

        let mut qtd = match Qtd::from_dwords(&dwords8(&first_td.copy)) {
            Ok(t) => t,
            Err(_) => return,
        };

        if completion.status.is_error() {
            if self.should_retry(&urb, completion.status, &mut qtd) {
                let _ = self.write_back_qtd_status(&qtd, &qh, urb.anchor_addr);
                return;
            }
            qtd.status = map_status_bits(completion.status) | QtdStatus::HALTED;
        } else {
            qtd.status = QtdStatus::empty();
            if matches!(urb.direction, Direction::In) {
                let n = completion.data.len().min(urb.buffer.len());
                let short = n < urb.buffer.len();
                let _ = self.write_back_in_data(&qtd, &completion.data[..n]);
                qtd.total_bytes = (urb.buffer.len() - n) as u16;
                if short && urb.short_not_ok {
                    qtd.status = QtdStatus::DATA_BUF_ERR | QtdStatus::HALTED;
                }
            } else {
                qtd.total_bytes = 0;
            }
        }

        let preserve_toggle = qh.data_toggle_control;
        self.write_back_qh_overlay(&qh, &qtd, urb.anchor_addr, preserve_toggle);

        if completion.status.is_error() && qtd.status.contains(QtdStatus::HALTED) {
            self.raise_interrupt(UsbSts::USBERRINT.bits());
        }
        if qtd.ioc || (matches!(urb.direction, Direction::In) && completion.data.len() < urb.buffer.len()) {
            self.raise_interrupt(UsbSts::USBINT.bits());
        }
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
        let mut itd = match Itd::read(&self.shared.mem, first_td.addr) {
            Ok(t) => t,
            Err(_) => return,
        };
        let results = completion.iso_results.unwrap_or_default();
        let active_idx: Vec<usize> = itd
            .transactions
            .iter()
            .enumerate()
            .filter(|(_, t)| t.active)
            .map(|(i, _)| i)
            .collect();
        for (r, &idx) in results.iter().zip(active_idx.iter()) {
            itd.transactions[idx].active = false;
            itd.transactions[idx].status = map_status_bits(r.status).bits() as u8 & 0x7;
            itd.transactions[idx].length = r.length as u16;
        }

        if matches!(urb.direction, Direction::In) {
            if let Some(packets) = &urb.iso_packets {
                let mut off = 0usize;
                for (&idx, (_, pkt_len)) in active_idx.iter().zip(packets.iter()) {
                    let len = (*pkt_len as usize).min(completion.data.len().saturating_sub(off));
                    if len > 0 {
                        if let Some(page) = itd.page_for(itd.transactions[idx].page_select) {
                            let gpa = page + itd.transactions[idx].offset as u64;
                            let _ = self.shared.mem.write(gpa, &completion.data[off..off + len]);
                        }
                    }
                    off += *pkt_len as usize;
                }
            }
        }

        let _ = itd.write_back_statuses(&self.shared.mem, first_td.addr);
        self.raise_interrupt(UsbSts::USBINT.bits());
    }

    fn write_back_in_data(&self, qtd: &Qtd, data: &[u8]) -> Result<(), crate::error::MemError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut offset_in_page = qtd.buffer_offset() as usize;
        let mut page_idx = 0usize;
        let mut written = 0usize;
        while written < data.len() && page_idx < 5 {
            let page_base = qtd.page_base(page_idx);
            let room = 0x1000 - offset_in_page;
            let chunk = room.min(data.len() - written);
            let gpa = page_base + offset_in_page as u64;
            self.shared.mem.write(gpa, &data[written..written + chunk])?;
            written += chunk;
            offset_in_page = 0;
            page_idx += 1;
        }
        Ok(())
    }

    /// §4.6: isochronous and STALL never retry; otherwise increment the
    /// error counter in the frozen copy and retry while below the 3-strike
    /// limit encoded in the qTD's 2-bit field.
    fn should_retry(&self, urb: &UrbRef, status: VusbStatus, qtd: &mut Qtd) -> bool {
        if urb.xfer_type == TransferType::Isochronous || status == VusbStatus::Stall {
            return false;
        }
        qtd.error_counter = qtd.error_counter.saturating_add(1);
        qtd.error_counter < 3
    }

    fn write_back_qtd_status(&self, qtd: &Qtd, qh: &Qh, qh_addr: u64) -> Result<(), crate::error::MemError> {
        let mut overlay = qh.clone();
        overlay.overlay_token = qtd.encode_token();
        overlay.write_overlay(&self.shared.mem, qh_addr)
    }

    /// §4.5 bullet 8: clear Active, preserve toggle when the QH carries
    /// `DataToggleControl`, advance the overlay to the qTD's next pointer.
    fn write_back_qh_overlay(&self, qh: &Qh, qtd: &Qtd, qh_addr: u64, preserve_toggle: bool) {
        let mut token = qtd.encode_token() & !(QtdStatus::ACTIVE.bits());
        if preserve_toggle {
            let prior = qh.overlay_token & (1 << 31);
            token = (token & !(1 << 31)) | prior;
        }
        let overlay = Qh {
            current_qtd: qh.current_qtd,
            overlay_next_qtd: qtd.next_qtd,
            overlay_next_terminate: qtd.next_terminate,
            overlay_alt_next_qtd: qtd.alt_next_qtd,
            overlay_token: token,
            overlay_buffers: qtd.buffers,
            ..qh.clone()
        };
        let _ = overlay.write_overlay(&self.shared.mem, qh_addr);
    }

    fn stat_dropped(&self) {
        self.shared.state.lock().unwrap().stat_dropped_urbs += 1;
    }
}

fn dwords8(bytes: &[u8]) -> [u32; 8] {
    let mut dw = [0u32; 8];
    for (i, chunk) in bytes.chunks_exact(4).enumerate().take(8) {
        dw[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    dw
}

/// Byte-compares two verbatim qTD copies, ignoring the next-qTD dword
/// (bytes 0..4) per §4.5's cancellation check.
fn tds_match_ignoring_next(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a[4..a.len()] == b[4..b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ehci::Config;
    use crate::urb::{Direction, TdRef, TransferType, UrbBuilder};
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
            VecMemory(Mutex::new(vec![0u8; 1 << 20])),
            Arc::new(RecordingConnector::default()),
            Arc::new(RecordingInterruptLine::default()),
            Config::default(),
        )
    }

    fn write_qh(hc: &Ehci<VecMemory, RecordingConnector>, addr: u64, current_qtd: u64) {
        let mut dw = [0u32; 12];
        dw[3] = current_qtd as u32;
        hc.shared.mem.write_dwords(addr, &dw).unwrap();
    }

    fn write_qtd(hc: &Ehci<VecMemory, RecordingConnector>, addr: u64, buf0: u32, total_bytes: u16) {
        let mut dw = [0u32; 8];
        dw[2] = QtdStatus::ACTIVE.bits() | ((total_bytes as u32) << 16);
        dw[3] = buf0;
        hc.shared.mem.write_dwords(addr, &dw).unwrap();
    }

    #[test]
    fn successful_out_clears_active_and_total_bytes() {
        let hc = controller();
        let qh_addr = 0x10000;
        let qtd_addr = 0x10040;
        write_qh(&hc, qh_addr, qtd_addr);
        write_qtd(&hc, qtd_addr, 0x20000, 64);

        let raw = {
            let mut buf = vec![0u8; 32];
            hc.shared.mem.read(qtd_addr, &mut buf).unwrap();
            buf
        };
        let urb = UrbBuilder::new(qh_addr, Direction::Out, TransferType::Bulk, 1, 1, 0)
            .with_td(TdRef::new(qtd_addr, crate::urb::TdKind::EhciQueueTd, raw))
            .with_buffer((0..64u8).collect())
            .build();
        hc.shared.state.lock().unwrap().inflight.add(qtd_addr, urb.clone(), 0);

        hc.complete_urb(
            urb,
            UrbCompletion {
                status: VusbStatus::Ok,
                data: vec![],
                iso_results: None,
            },
        );

        let qh = Qh::read(&hc.shared.mem, qh_addr).unwrap();
        let token = QtdStatus::from_bits_truncate(qh.overlay_token);
        assert!(!token.contains(QtdStatus::ACTIVE));
    }

    #[test]
    fn diverged_qh_drops_without_touching_memory() {
        let hc = controller();
        let qh_addr = 0x10000;
        let qtd_addr = 0x10040;
        write_qh(&hc, qh_addr, qtd_addr);
        write_qtd(&hc, qtd_addr, 0x20000, 64);

        let raw = {
            let mut buf = vec![0u8; 32];
            hc.shared.mem.read(qtd_addr, &mut buf).unwrap();
            buf
        };
        let urb = UrbBuilder::new(qh_addr, Direction::Out, TransferType::Bulk, 1, 1, 0)
            .with_td(TdRef::new(qtd_addr, crate::urb::TdKind::EhciQueueTd, raw))
            .with_buffer(vec![0u8; 64])
            .build();
        hc.shared.state.lock().unwrap().inflight.add(qtd_addr, urb.clone(), 0);

        // Guest's QH now points somewhere else before completion lands.
        write_qh(&hc, qh_addr, 0x10080);

        hc.complete_urb(
            urb,
            UrbCompletion {
                status: VusbStatus::Ok,
                data: vec![],
                iso_results: None,
            },
        );

        assert_eq!(hc.shared.state.lock().unwrap().stat_dropped_urbs, 1);
    }
}
