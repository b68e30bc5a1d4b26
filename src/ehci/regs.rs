//! EHCI capability and operational register offsets/bit layouts. The
//! capability region is a fixed 0x20 bytes; operational registers start at
//! `CAP_LENGTH` and port-status registers at `0x40 + 4*port` (§6.1).

use bitflags::bitflags;

pub const CAP_LENGTH: u32 = 0x20;

pub const REG_CAPLENGTH: u32 = 0x00; // u8, but read as the low byte of a dword
pub const REG_HCIVERSION: u32 = 0x02; // u16
pub const REG_HCSPARAMS: u32 = 0x04;
pub const REG_HCCPARAMS: u32 = 0x08;

pub const REG_USBCMD: u32 = CAP_LENGTH + 0x00;
pub const REG_USBSTS: u32 = CAP_LENGTH + 0x04;
pub const REG_USBINTR: u32 = CAP_LENGTH + 0x08;
pub const REG_FRINDEX: u32 = CAP_LENGTH + 0x0C;
pub const REG_CTRLDSSEGMENT: u32 = CAP_LENGTH + 0x10;
pub const REG_PERIODICLISTBASE: u32 = CAP_LENGTH + 0x14;
pub const REG_ASYNCLISTADDR: u32 = CAP_LENGTH + 0x18;
pub const REG_CONFIGFLAG: u32 = CAP_LENGTH + 0x1C;
pub const REG_PORTSC_BASE: u32 = 0x40;

pub const MAX_PORTS: usize = 15;

pub fn port_status_offset(port: usize) -> u32 {
    REG_PORTSC_BASE + 4 * port as u32
}

pub fn port_from_offset(offset: u32) -> Option<usize> {
    if offset < REG_PORTSC_BASE {
        return None;
    }
    let idx = ((offset - REG_PORTSC_BASE) / 4) as usize;
    (idx < MAX_PORTS).then_some(idx)
}

pub const HCIVERSION: u32 = 0x0100;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcsParams: u32 {
        const N_PORTS_MASK = 0x0000_000F;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HccParams: u32 {
        const PROGRAMMABLE_FRAME_LIST = 1 << 1;
        const EECP_MASK               = 0x0000_FF00;
    }
}

bitflags! {
    /// `USBCMD`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        const RS               = 1 << 0;
        const HCRESET          = 1 << 1;
        const FLS_MASK         = 0x0000_000C;
        const PSE              = 1 << 4;
        const ASE              = 1 << 5;
        const IAAD             = 1 << 6; // interrupt on async advance doorbell
        const LHCRESET         = 1 << 7;
        const ASYNC_PARK_MASK  = 0x0000_0300;
        const ASYNC_PARK_EN    = 1 << 11;
        const ITC_MASK         = 0x00FF_0000;
    }
}

bitflags! {
    /// `USBSTS` / `USBINTR` shared bit layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        const USBINT      = 1 << 0;
        const USBERRINT   = 1 << 1;
        const PORT_CHANGE = 1 << 2;
        const FLR         = 1 << 3; // frame list rollover
        const HSE         = 1 << 4; // host system error
        const IAA         = 1 << 5; // interrupt on async advance
        const HCHALTED    = 1 << 12;
        const RECLAMATION = 1 << 13;
        const PERIODIC_ST = 1 << 14;
        const ASYNC_ST    = 1 << 15;
    }
}

pub const USBSTS_INTR_MASK: u32 = UsbSts::USBINT.bits()
    | UsbSts::USBERRINT.bits()
    | UsbSts::PORT_CHANGE.bits()
    | UsbSts::FLR.bits()
    | UsbSts::HSE.bits()
    | UsbSts::IAA.bits();

bitflags! {
    /// `PORTSC` per-port bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        const CCS  = 1 << 0;  // current connect status
        const CSC  = 1 << 1;  // connect status change
        const PED  = 1 << 2;  // port enabled
        const PEDC = 1 << 3;  // port enable change
        const OCA  = 1 << 4;  // overcurrent active
        const OCC  = 1 << 5;  // overcurrent change
        const FPR  = 1 << 6;  // force port resume
        const SUSP = 1 << 7;  // suspend
        const PR   = 1 << 8;  // port reset
        const LS_MASK = 0x0000_3000; // line status
        const PP   = 1 << 12; // port power
        const PO   = 1 << 13; // port owner (routed to companion controller)
        const WKCNNT = 1 << 20;
        const WKDSCNNT = 1 << 21;
        const WKOC = 1 << 22;
    }
}

pub const PORTSC_CHANGE_MASK: u32 = PortSc::CSC.bits() | PortSc::PEDC.bits() | PortSc::OCC.bits();

/// qTD/overlay token status bits (§4.5 table).
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QtdStatus: u32 {
        const PING          = 1 << 0;
        const SPLIT_XSTATE  = 1 << 1;
        const MMF           = 1 << 2; // missed micro-frame
        const TRANSACT_ERR  = 1 << 3;
        const BABBLE        = 1 << 4;
        const DATA_BUF_ERR  = 1 << 5;
        const HALTED        = 1 << 6;
        const ACTIVE        = 1 << 7;
    }
}
