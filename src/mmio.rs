//! Two-variant MMIO dispatch result. The original host controller's
//! register handlers could suspend a guest exit and resume it later; the
//! embedder here instead gets a plain enum and decides for itself how to
//! retry.

/// Result of a single MMIO register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioResult<T> {
    /// The access completed; here is the value (for reads) or nothing (for
    /// writes, `T = ()`).
    Done(T),
    /// The controller couldn't service the access right now (e.g. a write
    /// landed while the frame-clock thread holds the device lock) and the
    /// embedder should retry the same access.
    Retry,
}

impl<T> MmioResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MmioResult<U> {
        match self {
            MmioResult::Done(v) => MmioResult::Done(f(v)),
            MmioResult::Retry => MmioResult::Retry,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, MmioResult::Retry)
    }
}
