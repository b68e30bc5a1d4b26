//! Page-straddling DMA helper. Isochronous TDs (both OHCI iTD and EHCI iTD)
//! describe a buffer as a start address plus an offset table whose entries
//! can cross a 4 KiB page boundary; this is the one place that arithmetic
//! lives instead of being repeated per-descriptor.

use crate::error::MemError;
use crate::mem::{GuestMemory, MemAccessor};

const PAGE_SIZE: u64 = 4096;

/// Copies `len` bytes starting at `gpa`, where the backing buffer is made up
/// of up to two non-contiguous guest pages (`page0`, `page1`) as OHCI/EHCI
/// isochronous descriptors describe them: `gpa` may land anywhere in
/// `page0`, and the copy continues into `page1` at offset 0 once `page0`
/// runs out, regardless of the low bits of `page1`.
pub fn copy_across_pages<M: GuestMemory>(
    mem: &MemAccessor<M>,
    page0: u64,
    page1: u64,
    offset_in_page0: u64,
    len: usize,
    buf: &mut [u8],
    write: bool,
) -> Result<(), MemError> {
    debug_assert!(buf.len() >= len);
    let first_page_room = (PAGE_SIZE - offset_in_page0) as usize;
    let first_len = first_page_room.min(len);
    let gpa0 = page0 + offset_in_page0;

    if write {
        mem.write(gpa0, &buf[..first_len])?;
    } else {
        mem.read(gpa0, &mut buf[..first_len])?;
    }

    let remaining = len - first_len;
    if remaining > 0 {
        if write {
            mem.write(page1, &buf[first_len..first_len + remaining])?;
        } else {
            mem.read(page1, &mut buf[first_len..first_len + remaining])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct VecMemory(Mutex<Vec<u8>>);

    impl GuestMemory for VecMemory {
        fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemError> {
            let mem = self.0.lock().unwrap();
            let start = gpa as usize;
            buf.copy_from_slice(&mem[start..start + buf.len()]);
            Ok(())
        }

        fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), MemError> {
            let mut mem = self.0.lock().unwrap();
            let start = gpa as usize;
            mem[start..start + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    #[test]
    fn copy_spanning_two_pages_splits_correctly() {
        let mem = MemAccessor::new(VecMemory(Mutex::new(vec![0u8; 3 * 4096])));
        let page0 = 0u64;
        let page1 = 4096u64;
        let offset = 4094u64;
        let data = [0xAAu8, 0xBB, 0xCC, 0xDD];
        mem.write(page0 + offset, &data[..2]).unwrap();
        mem.write(page1, &data[2..]).unwrap();

        let mut out = [0u8; 4];
        copy_across_pages(&mem, page0, page1, offset, 4, &mut out, false).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn copy_within_single_page_never_touches_page1() {
        let mem = MemAccessor::new(VecMemory(Mutex::new(vec![0u8; 2 * 4096])));
        let mut out = [0u8; 4];
        let src = [1u8, 2, 3, 4];
        mem.write(0x10, &src).unwrap();
        // page1 deliberately points at an address that would fault reads;
        // since the whole 4 bytes fit in page0 it must never be touched.
        copy_across_pages(&mem, 0, u64::MAX, 0x10, 4, &mut out, false).unwrap();
        assert_eq!(out, src);
    }
}
