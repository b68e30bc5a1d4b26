//! Guest-physical memory access (C1): every descriptor and data-buffer read
//! or write a controller performs goes through here, never directly through
//! the embedder's memory primitive.

use crate::error::MemError;

/// Minimal guest-physical memory primitive the embedder supplies. A single
/// controller instance is given one implementor and treats it as globally
/// addressable; page straddling is this module's problem, not the
/// embedder's.
pub trait GuestMemory: Send + Sync {
    /// Copy `buf.len()` bytes starting at `gpa` into `buf`.
    fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemError>;

    /// Copy `buf` into guest memory starting at `gpa`.
    fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), MemError>;
}

const PAGE_SIZE: u64 = 4096;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

fn page_base(gpa: u64) -> u64 {
    gpa & !PAGE_MASK
}

/// Wraps a `GuestMemory` with a single-page read cache: repeated descriptor
/// polling within the same schedule walk (an ED and its TD both live on the
/// same guest page, or the walker revisits an ED every frame) hits the cache
/// instead of round-tripping through the embedder on every dword.
///
/// The cache holds at most one page and is invalidated on every write that
/// falls inside it, and unconditionally at the start of each frame tick (the
/// controller calls `invalidate()` itself; this module has no notion of
/// frames).
pub struct MemAccessor<M: GuestMemory> {
    backing: M,
    cache: std::cell::RefCell<Option<CachedPage>>,
}

struct CachedPage {
    base: u64,
    bytes: [u8; PAGE_SIZE as usize],
}

impl<M: GuestMemory> MemAccessor<M> {
    pub fn new(backing: M) -> Self {
        Self {
            backing,
            cache: std::cell::RefCell::new(None),
        }
    }

    pub fn invalidate(&self) {
        *self.cache.borrow_mut() = None;
    }

    fn fill_cache(&self, base: u64) -> Result<(), MemError> {
        let mut bytes = [0u8; PAGE_SIZE as usize];
        self.backing.read(base, &mut bytes)?;
        *self.cache.borrow_mut() = Some(CachedPage { base, bytes });
        Ok(())
    }

    /// Reads `buf.len()` bytes at `gpa`. Falls back to an uncached read if
    /// the access straddles a page boundary.
    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemError> {
        let base = page_base(gpa);
        let end = gpa + buf.len() as u64;
        if buf.is_empty() || end > base + PAGE_SIZE {
            return self.backing.read(gpa, buf);
        }
        {
            let cache = self.cache.borrow();
            if let Some(page) = cache.as_ref() {
                if page.base == base {
                    let off = (gpa - base) as usize;
                    buf.copy_from_slice(&page.bytes[off..off + buf.len()]);
                    return Ok(());
                }
            }
        }
        self.fill_cache(base)?;
        let cache = self.cache.borrow();
        let page = cache.as_ref().unwrap();
        let off = (gpa - base) as usize;
        buf.copy_from_slice(&page.bytes[off..off + buf.len()]);
        Ok(())
    }

    pub fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), MemError> {
        self.backing.write(gpa, buf)?;
        let base = page_base(gpa);
        let mut cache = self.cache.borrow_mut();
        if let Some(page) = cache.as_ref() {
            if page.base == base {
                *cache = None;
            }
        }
        Ok(())
    }

    pub fn read_u32(&self, gpa: u64) -> Result<u32, MemError> {
        let mut buf = [0u8; 4];
        self.read(gpa, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, gpa: u64, val: u32) -> Result<(), MemError> {
        self.write(gpa, &val.to_le_bytes())
    }

    pub fn read_dwords(&self, gpa: u64, out: &mut [u32]) -> Result<(), MemError> {
        let mut buf = vec![0u8; out.len() * 4];
        self.read(gpa, &mut buf)?;
        for (i, chunk) in buf.chunks_exact(4).enumerate() {
            out[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }

    pub fn write_dwords(&self, gpa: u64, dwords: &[u32]) -> Result<(), MemError> {
        let mut buf = Vec::with_capacity(dwords.len() * 4);
        for d in dwords {
            buf.extend_from_slice(&d.to_le_bytes());
        }
        self.write(gpa, &buf)
    }
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
            let end = start + buf.len();
            if end > mem.len() {
                return Err(MemError::OutOfRange { gpa, len: buf.len() });
            }
            buf.copy_from_slice(&mem[start..end]);
            Ok(())
        }

        fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), MemError> {
            let mut mem = self.0.lock().unwrap();
            let start = gpa as usize;
            let end = start + buf.len();
            if end > mem.len() {
                return Err(MemError::OutOfRange { gpa, len: buf.len() });
            }
            mem[start..end].copy_from_slice(buf);
            Ok(())
        }
    }

    fn accessor(size: usize) -> MemAccessor<VecMemory> {
        MemAccessor::new(VecMemory(Mutex::new(vec![0u8; size])))
    }

    #[test]
    fn read_write_u32_round_trips() {
        let acc = accessor(8192);
        acc.write_u32(0x100, 0xdead_beef).unwrap();
        assert_eq!(acc.read_u32(0x100).unwrap(), 0xdead_beef);
    }

    #[test]
    fn cached_read_reflects_subsequent_write() {
        let acc = accessor(8192);
        acc.write_u32(0x100, 1).unwrap();
        assert_eq!(acc.read_u32(0x100).unwrap(), 1);
        acc.write_u32(0x100, 2).unwrap();
        assert_eq!(acc.read_u32(0x100).unwrap(), 2);
    }

    #[test]
    fn invalidate_forces_reread() {
        let acc = accessor(8192);
        acc.write_u32(0x100, 1).unwrap();
        assert_eq!(acc.read_u32(0x100).unwrap(), 1);
        acc.backing.write(0x100, &2u32.to_le_bytes()).unwrap();
        acc.invalidate();
        assert_eq!(acc.read_u32(0x100).unwrap(), 2);
    }

    #[test]
    fn read_across_page_boundary_bypasses_cache() {
        let acc = accessor(16384);
        let gpa = 4096 - 2;
        acc.write(gpa, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        acc.read(gpa, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
