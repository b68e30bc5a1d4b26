//! Frame clock (C10): a 1 kHz (by default) periodic tick that walks the
//! schedules, bumps the frame number, and services the done-queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::mem::GuestMemory;
use crate::vusb::VusbConnector;

use super::regs::HcInterrupt;
use super::Ohci;

const MIN_FRAME_RATE_HZ: u32 = 50;
const FRAME_RATE_STEP_HZ: u32 = 500;

/// Wake primitive shared between the clock thread and `interrupt_wait`-style
/// external callers: a condvar the thread waits on with a computed timeout,
/// signalled either by the timeout elapsing or by an explicit wakeup.
struct ClockWake {
    mutex: Mutex<bool>,
    cv: Condvar,
}

impl ClockWake {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait_timeout(&self, dur: Duration) {
        let guard = self.mutex.lock().unwrap();
        let (_guard, _timeout) = self
            .cv
            .wait_timeout_while(guard, dur, |&mut woken| !woken)
            .unwrap();
    }

    fn signal(&self) {
        *self.mutex.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.mutex.lock().unwrap() = false;
    }
}

pub(crate) struct ClockHandle {
    stop: Arc<AtomicBool>,
    wake: Arc<ClockWake>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ClockHandle {
    pub(crate) fn request_stop_and_join(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.signal();
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }

    /// The external `interrupt_wait` primitive: unblocks the clock thread
    /// immediately instead of waiting out its current timeout.
    pub(crate) fn interrupt_wait(&self) {
        self.wake.signal();
    }
}

impl<M: GuestMemory + 'static, V: VusbConnector + 'static> Ohci<M, V> {
    /// Starts the frame-clock thread. Idempotent only in the sense that
    /// calling it twice spawns two threads; callers (the embedder) are
    /// expected to call this once per live controller instance.
    pub fn start_frame_clock(&self) -> Arc<ClockHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(ClockWake::new());
        let controller = self.clone();
        let stop2 = stop.clone();
        let wake2 = wake.clone();
        let join = std::thread::Builder::new()
            .name("ohci-frame-clock".into())
            .spawn(move || controller.frame_clock_loop(stop2, wake2))
            .expect("spawn frame-clock thread");
        Arc::new(ClockHandle {
            stop,
            wake,
            join: Mutex::new(Some(join)),
        })
    }

    fn frame_clock_loop(&self, stop: Arc<AtomicBool>, wake: Arc<ClockWake>) {
        while !stop.load(Ordering::Acquire) {
            let rate_hz = self.shared.state.lock().unwrap().frame_rate_hz;
            let interval = Duration::from_secs_f64(1.0 / rate_hz.max(1) as f64);
            let started = Instant::now();
            wake.reset();
            wake.wait_timeout(interval);
            let _ = started;
            if stop.load(Ordering::Acquire) {
                break;
            }
            self.tick();
        }
    }

    /// One frame tick (§4.9), run under the device lock for its entirety.
    pub(crate) fn tick(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if !st.running {
                return;
            }
            let ticks = self.shared.config.default_frame_rate_khz.max(1);
            let (next, wrapped) = st.frame_number.overflowing_add(ticks);
            let crossed_16bit = (st.frame_number & 0xFFFF) > (next & 0xFFFF) && !wrapped;
            st.frame_number = next;
            if wrapped || crossed_16bit {
                drop(st);
                self.raise_interrupt(HcInterrupt::FNO.bits());
                st = self.shared.state.lock().unwrap();
            }
            if st.dqic > 0 && st.dqic < 7 {
                st.dqic -= 1;
            }
        }

        self.cancel_orphaned_urbs();
        self.update_hcca_frame_number();
        self.maybe_writeback_done_queue();
        self.raise_interrupt(HcInterrupt::SF.bits());

        let did_work = self.service_schedules_reporting_work();

        let mut st = self.shared.state.lock().unwrap();
        let default_hz = self.shared.config.default_frame_rate_khz.max(1) * 1000;
        if did_work {
            st.idle_ticks = 0;
            st.frame_rate_hz = default_hz;
        } else {
            st.idle_ticks += 1;
            // N = 2 * frame_rate (§4.9 bullet 7): two seconds' worth of
            // idle ticks at the current rate.
            let threshold = 2 * st.frame_rate_hz.max(1);
            if st.idle_ticks >= threshold {
                st.idle_ticks = 0;
                st.frame_rate_hz = st
                    .frame_rate_hz
                    .saturating_sub(FRAME_RATE_STEP_HZ)
                    .max(MIN_FRAME_RATE_HZ);
            }
        }
    }

    /// Runs the three schedules and reports whether any of them found work,
    /// for the idle-rate heuristic (§4.9 bullet 7).
    fn service_schedules_reporting_work(&self) -> bool {
        let before = self.shared.state.lock().unwrap().inflight.len();
        self.service_schedules();
        let after = self.shared.state.lock().unwrap().inflight.len();
        after != before
    }

    fn update_hcca_frame_number(&self) {
        let (hcca_addr, frame_number) = {
            let st = self.shared.state.lock().unwrap();
            (st.hcca_addr, (st.frame_number & 0xFFFF) as u16)
        };
        if hcca_addr == 0 {
            return;
        }
        let _ = self.shared.mem.write_u32(hcca_addr + 128, frame_number as u32);
    }

    /// `CancelOrphanedURBs` (§4.9 bullet 3): mark every in-flight URB
    /// inactive, re-mark any whose TD is still linked as active by walking
    /// all three schedules, then cancel anything still inactive (except
    /// control, which is allowed to sit waiting for its next stage).
    fn cancel_orphaned_urbs(&self) {
        // The in-flight table itself has no "inactive" scratch bit in this
        // implementation (simpler invariant: an entry's mere presence means
        // "active"); instead we directly detect orphaned entries by
        // checking whether their owning ED/QH still points at them.
        let entries: Vec<(u64, crate::urb::UrbRef)> = {
            let st = self.shared.state.lock().unwrap();
            st.inflight.snapshot()
        };
        for (td_addr, urb) in entries {
            if urb.xfer_type == crate::urb::TransferType::Control {
                continue;
            }
            let ed = super::descriptors::Ed::read(&self.shared.mem, urb.anchor_addr);
            let still_linked = match ed {
                Ok(ed) => (ed.head_pointer & super::descriptors::PTR_MASK) == td_addr && !ed.skip && !ed.halted,
                Err(_) => false,
            };
            if !still_linked {
                self.shared
                    .vusb
                    .cancel_urbs_for_endpoint(urb.device_address, urb.endpoint);
            }
        }
    }
}
