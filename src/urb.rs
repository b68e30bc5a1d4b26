//! The logical transfer unit handed to the virtual USB bus (C4/C5), and the
//! status vocabulary shared by the completion retirers (C6) of both cores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Direction of a transfer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Setup,
    In,
    Out,
}

/// USB transfer type, as inferred by the assembler (§4.4.3 for EHCI; OHCI's
/// ED carries an explicit ISO bit and everything else is general/control).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Outcome reported by the virtual USB bus on completion. Maps to an OHCI
/// condition code and an EHCI token bit pattern at retirement time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VusbStatus {
    Ok,
    Stall,
    Crc,
    DataUnderrun,
    DataOverrun,
    Dnr,
    NotAccessed,
}

impl VusbStatus {
    pub fn is_error(self) -> bool {
        !matches!(self, VusbStatus::Ok)
    }
}

/// One packet's worth of result for an isochronous URB.
#[derive(Debug, Clone, Copy)]
pub struct IsoPacketResult {
    pub offset: u32,
    pub length: u32,
    pub status: VusbStatus,
}

/// Descriptor kind backing one TD slot of a URB, used only to size and
/// interpret the verbatim copy taken at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdKind {
    OhciGeneral,
    OhciIsochronous,
    EhciQueueTd,
    EhciIsochronous,
}

impl TdKind {
    pub fn byte_len(self) -> usize {
        match self {
            TdKind::OhciGeneral => 16,
            TdKind::OhciIsochronous => 32,
            TdKind::EhciQueueTd => 32,
            TdKind::EhciIsochronous => 32 + 4, // header dword + 7 buffer-page dwords
        }
    }
}

/// One guest-memory descriptor that forms part of a URB, plus the verbatim
/// bytes read at submit time. Used at retirement to detect whether the
/// guest mutated the descriptor out from under an in-flight transfer.
#[derive(Debug, Clone)]
pub struct TdRef {
    pub addr: u64,
    pub kind: TdKind,
    pub copy: Vec<u8>,
}

impl TdRef {
    pub fn new(addr: u64, kind: TdKind, copy: Vec<u8>) -> Self {
        debug_assert_eq!(copy.len(), kind.byte_len());
        Self { addr, kind, copy }
    }
}

/// The logical transfer request assembled from one or more consecutive TDs
/// (C4) and handed to the virtual USB bus (C5).
#[derive(Debug)]
pub struct Urb {
    /// ED address (OHCI) or QH address (EHCI) this URB's TDs hang off of.
    pub anchor_addr: u64,
    pub tds: Vec<TdRef>,
    pub direction: Direction,
    pub xfer_type: TransferType,
    pub device_address: u8,
    pub endpoint: u8,
    /// OUT/SETUP payload to send, or the buffer sized to receive an IN.
    pub buffer: Vec<u8>,
    /// Per-packet offsets/lengths for isochronous URBs.
    pub iso_packets: Option<Vec<(u32, u32)>>,
    /// `HcFmNumber`/`FRINDEX` at submit time, for frame-age computation.
    pub submit_frame: u32,
    /// Set once at retirement; gates the unlink path so cancelling an
    /// already-cancelled URB is a no-op.
    unlinked: AtomicBool,
    /// `fShortNotOk` equivalent: whether a short transfer is an error.
    pub short_not_ok: bool,
}

pub type UrbRef = Arc<Urb>;

impl Urb {
    pub fn first_td_addr(&self) -> u64 {
        self.tds.first().map(|t| t.addr).unwrap_or(0)
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    /// Returns `true` the first time it's called (the unlink actually
    /// happens); `false` on every subsequent call.
    pub fn mark_unlinked(&self) -> bool {
        self.unlinked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Builder used by the OHCI/EHCI assemblers; kept separate from `Urb` so the
/// `unlinked` flag can't accidentally be constructed as already-set.
pub struct UrbBuilder {
    anchor_addr: u64,
    tds: Vec<TdRef>,
    direction: Direction,
    xfer_type: TransferType,
    device_address: u8,
    endpoint: u8,
    buffer: Vec<u8>,
    iso_packets: Option<Vec<(u32, u32)>>,
    submit_frame: u32,
    short_not_ok: bool,
}

impl UrbBuilder {
    pub fn new(
        anchor_addr: u64,
        direction: Direction,
        xfer_type: TransferType,
        device_address: u8,
        endpoint: u8,
        submit_frame: u32,
    ) -> Self {
        Self {
            anchor_addr,
            tds: Vec::new(),
            direction,
            xfer_type,
            device_address,
            endpoint,
            buffer: Vec::new(),
            iso_packets: None,
            submit_frame,
            short_not_ok: false,
        }
    }

    pub fn with_td(mut self, td: TdRef) -> Self {
        self.tds.push(td);
        self
    }

    pub fn with_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_iso_packets(mut self, packets: Vec<(u32, u32)>) -> Self {
        self.iso_packets = Some(packets);
        self
    }

    pub fn with_short_not_ok(mut self, v: bool) -> Self {
        self.short_not_ok = v;
        self
    }

    pub fn build(self) -> UrbRef {
        Arc::new(Urb {
            anchor_addr: self.anchor_addr,
            tds: self.tds,
            direction: self.direction,
            xfer_type: self.xfer_type,
            device_address: self.device_address,
            endpoint: self.endpoint,
            buffer: self.buffer,
            iso_packets: self.iso_packets,
            submit_frame: self.submit_frame,
            unlinked: AtomicBool::new(false),
            short_not_ok: self.short_not_ok,
        })
    }
}

/// Delivered by the virtual USB bus when a submitted URB finishes.
#[derive(Debug, Clone)]
pub struct UrbCompletion {
    pub status: VusbStatus,
    /// Bytes actually transferred; meaningful length for IN, informational
    /// echo for OUT.
    pub data: Vec<u8>,
    pub iso_results: Option<Vec<IsoPacketResult>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_unlinked_is_idempotent() {
        let urb = UrbBuilder::new(0x1000, Direction::In, TransferType::Bulk, 1, 1, 0).build();
        assert!(!urb.is_unlinked());
        assert!(urb.mark_unlinked());
        assert!(urb.is_unlinked());
        assert!(!urb.mark_unlinked());
    }
}
