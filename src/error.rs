//! Error types shared across the OHCI/EHCI cores and the USB/IP client.
//!
//! Schedule walkers never throw: they service, skip, or abort the walk
//! after setting a status bit. Only true system-boundary calls return
//! `Result`; these types cover those boundaries.

use std::time::{Duration, Instant};

/// Guest-physical memory access failed (out of range, or the embedder's
/// `GuestMemory` primitive reported a fault).
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("guest physical address {gpa:#x} (len {len}) is out of range")]
    OutOfRange { gpa: u64, len: usize },
    #[error("backing store reported a fault at {gpa:#x}")]
    Fault { gpa: u64 },
}

/// Submission to the virtual USB bus failed.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("no device attached at that address/endpoint")]
    NoSuchEndpoint,
    #[error("backend rejected the URB (would block)")]
    Busy,
    #[error("backend is shutting down")]
    ShuttingDown,
}

/// A malformed or truncated USB/IP wire frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("unexpected reply code {0:#06x}")]
    UnexpectedCode(u16),
    #[error("unexpected protocol version {0:#06x}")]
    BadVersion(u16),
    #[error("device list header reported {0} devices, more than the sanity cap")]
    TooManyDevices(u32),
}

/// Gate a log line so a burst of identical triggers (an unsupported
/// descriptor seen every frame, a USB/IP socket repeatedly failing to
/// connect) produces one line per window instead of flooding the log.
///
/// Tracks a monotonic last-emit timestamp per caller rather than a token
/// bucket: callers only need "at most every so often", not precise rate
/// shaping.
pub struct RateLimiter {
    window: Duration,
    last_emit: Option<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
        }
    }

    /// Returns `true` the first time it's called, and then at most once per
    /// `window` afterward.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn rate_limiter_suppresses_bursts_then_reopens() {
        let mut rl = RateLimiter::new(Duration::from_millis(20));
        assert!(rl.allow());
        assert!(!rl.allow());
        assert!(!rl.allow());
        sleep(Duration::from_millis(30));
        assert!(rl.allow());
    }
}
