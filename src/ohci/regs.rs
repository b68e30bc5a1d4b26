//! OHCI register offsets and bit layouts (26 operational registers, laid
//! out exactly as an OHCI HCD expects to find them in the 4 KiB PCI BAR).

use bitflags::bitflags;

pub const REG_HC_REVISION: u32 = 0x00;
pub const REG_HC_CONTROL: u32 = 0x04;
pub const REG_HC_COMMAND_STATUS: u32 = 0x08;
pub const REG_HC_INTERRUPT_STATUS: u32 = 0x0C;
pub const REG_HC_INTERRUPT_ENABLE: u32 = 0x10;
pub const REG_HC_INTERRUPT_DISABLE: u32 = 0x14;
pub const REG_HC_HCCA: u32 = 0x18;
pub const REG_HC_PERIOD_CURRENT_ED: u32 = 0x1C;
pub const REG_HC_CONTROL_HEAD_ED: u32 = 0x20;
pub const REG_HC_CONTROL_CURRENT_ED: u32 = 0x24;
pub const REG_HC_BULK_HEAD_ED: u32 = 0x28;
pub const REG_HC_BULK_CURRENT_ED: u32 = 0x2C;
pub const REG_HC_DONE_HEAD: u32 = 0x30;
pub const REG_HC_FM_INTERVAL: u32 = 0x34;
pub const REG_HC_FM_REMAINING: u32 = 0x38;
pub const REG_HC_FM_NUMBER: u32 = 0x3C;
pub const REG_HC_PERIODIC_START: u32 = 0x40;
pub const REG_HC_LS_THRESHOLD: u32 = 0x44;
pub const REG_HC_RH_DESCRIPTOR_A: u32 = 0x48;
pub const REG_HC_RH_DESCRIPTOR_B: u32 = 0x4C;
pub const REG_HC_RH_STATUS: u32 = 0x50;
pub const REG_HC_RH_PORT_STATUS_BASE: u32 = 0x54;

pub const MAX_PORTS: usize = 15;

pub fn port_status_offset(port: usize) -> u32 {
    REG_HC_RH_PORT_STATUS_BASE + 4 * port as u32
}

pub fn port_from_offset(offset: u32) -> Option<usize> {
    if offset < REG_HC_RH_PORT_STATUS_BASE {
        return None;
    }
    let idx = ((offset - REG_HC_RH_PORT_STATUS_BASE) / 4) as usize;
    (idx < MAX_PORTS).then_some(idx)
}

pub const HC_REVISION: u32 = 0x10;

bitflags! {
    /// `HcControl` — bits 0..10.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcControl: u32 {
        const CBSR_MASK       = 0x0000_0003;
        const PLE             = 1 << 2;
        const IE              = 1 << 3;
        const CLE             = 1 << 4;
        const BLE             = 1 << 5;
        const HCFS_MASK       = 0x0000_00C0;
        const IR              = 1 << 8;
        const RWC             = 1 << 9;
        const RWE             = 1 << 10;
    }
}

/// `HCFS` sub-field of `HcControl` (bits 6..7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcfsState {
    Reset,
    Resume,
    Operational,
    Suspend,
}

impl HcfsState {
    pub fn from_bits(control: u32) -> Self {
        match (control >> 6) & 0x3 {
            0 => HcfsState::Reset,
            1 => HcfsState::Resume,
            2 => HcfsState::Operational,
            _ => HcfsState::Suspend,
        }
    }

    pub fn to_bits(self) -> u32 {
        (match self {
            HcfsState::Reset => 0,
            HcfsState::Resume => 1,
            HcfsState::Operational => 2,
            HcfsState::Suspend => 3,
        }) << 6
    }
}

bitflags! {
    /// `HcCommandStatus` — bits 0..3, 16..17 (SOC, read-only count, masked out here).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcCommandStatus: u32 {
        const HCR  = 1 << 0;
        const CLF  = 1 << 1;
        const BLF  = 1 << 2;
        const OCR  = 1 << 3;
    }
}

bitflags! {
    /// Shared layout of `HcInterruptStatus`/`HcInterruptEnable`/`HcInterruptDisable`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcInterrupt: u32 {
        const SO   = 1 << 0; // scheduling overrun
        const WDH  = 1 << 1; // write-done-head
        const SF   = 1 << 2; // start-of-frame
        const RD   = 1 << 3; // resume-detected
        const UE   = 1 << 4; // unrecoverable error
        const FNO  = 1 << 5; // frame-number overflow
        const RHSC = 1 << 6; // root-hub status change
        const OC   = 1 << 30; // ownership change
        const MIE  = 1 << 31; // master interrupt enable (enable register only)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RhDescriptorA: u32 {
        const NDP_MASK = 0x0000_00FF;
        const PSM      = 1 << 8;  // power switching mode
        const NPS      = 1 << 9;  // no power switching
        const DT       = 1 << 10; // device type (always 0)
        const OCPM     = 1 << 11; // overcurrent protection mode
        const NOCP     = 1 << 12; // no overcurrent protection
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RhStatus: u32 {
        const LPS  = 1 << 0;  // local power status (write: clear global power)
        const OCI  = 1 << 1;  // overcurrent indicator
        const DRWE = 1 << 15; // device remote wakeup enable
        const LPSC = 1 << 16; // local power status change (write: set global power)
        const OCIC = 1 << 17; // overcurrent indicator change
        const CRWE = 1 << 31; // clear remote wakeup enable
    }
}

bitflags! {
    /// `HcRhPortStatus` per-port bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u32 {
        const CCS  = 1 << 0;  // current connect status      (write: clear port enable)
        const PES  = 1 << 1;  // port enable status          (write: set port enable)
        const PSS  = 1 << 2;  // port suspend status         (write: set port suspend)
        const POCI = 1 << 3;  // port overcurrent indicator  (write: resume from suspend)
        const PRS  = 1 << 4;  // port reset status           (write: set port reset)
        const PPS  = 1 << 8;  // port power status           (write: set port power)
        const LSDA = 1 << 9;  // low-speed device attached   (write: clear port power)
        const CSC  = 1 << 16; // connect status change
        const PESC = 1 << 17; // port enable status change
        const PSSC = 1 << 18; // port suspend status change
        const OCIC = 1 << 19; // port overcurrent change
        const PRSC = 1 << 20; // port reset status change
    }
}

pub const PORT_CHANGE_MASK: u32 = (PortStatus::CSC.bits())
    | (PortStatus::PESC.bits())
    | (PortStatus::PSSC.bits())
    | (PortStatus::OCIC.bits())
    | (PortStatus::PRSC.bits());

/// OHCI TD condition codes (§4.5 table), as they appear in a TD's
/// `ConditionCode` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCode {
    NoError = 0,
    Crc = 1,
    BitStuffing = 2,
    DataToggleMismatch = 3,
    Stall = 4,
    DeviceNotResponding = 5,
    PidCheckFailure = 6,
    UnexpectedPid = 7,
    DataOverrun = 8,
    DataUnderrun = 9,
    BufferOverrun = 12,
    BufferUnderrun = 13,
    NotAccessed = 15,
}

impl ConditionCode {
    pub fn bits(self) -> u32 {
        self as u32
    }
}
