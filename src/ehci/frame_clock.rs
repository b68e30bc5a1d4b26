//! Frame clock (C10) for EHCI: runs at up to 8 kHz for micro-frame
//! emulation; `uFramesPerTimerCall` lets one callback service several
//! micro-frames in a pass when configured below 8 kHz. Wake/stop plumbing
//! mirrors the OHCI frame clock exactly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::mem::GuestMemory;
use crate::vusb::VusbConnector;

use super::regs::UsbSts;
use super::Ehci;

const MIN_FRAME_RATE_HZ: u32 = 50;
const FRAME_RATE_STEP_HZ: u32 = 500;
const MICROFRAMES_PER_FRAME: u32 = 8;

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
        let _ = self.cv.wait_timeout_while(guard, dur, |&mut woken| !woken).unwrap();
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

    pub(crate) fn interrupt_wait(&self) {
        self.wake.signal();
    }
}

impl<M: GuestMemory + 'static, V: VusbConnector + 'static> Ehci<M, V> {
    pub fn start_frame_clock(&self) -> Arc<ClockHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(ClockWake::new());
        let controller = self.clone();
        let stop2 = stop.clone();
        let wake2 = wake.clone();
        let join = std::thread::Builder::new()
            .name("ehci-frame-clock".into())
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
            wake.reset();
            wake.wait_timeout(interval);
            if stop.load(Ordering::Acquire) {
                break;
            }
            self.tick();
        }
    }

    /// One micro-frame tick. At the default 8 kHz rate this fires once per
    /// USB micro-frame; a configured lower rate services
    /// `uFramesPerTimerCall = 8 / configured_khz` micro-frames per callback.
    pub(crate) fn tick(&self) {
        let microframes_per_call = {
            let st = self.shared.state.lock().unwrap();
            if !st.running {
                return;
            }
            (MICROFRAMES_PER_FRAME / (st.frame_rate_hz / 1000).clamp(1, 8)).max(1)
        };

        {
            let mut st = self.shared.state.lock().unwrap();
            let (next, wrapped) = st.frame_index.overflowing_add(microframes_per_call);
            st.frame_index = next & 0x3FFF;
            let rolled_over = wrapped || next > 0x3FFF;
            drop(st);
            if rolled_over {
                self.raise_interrupt(UsbSts::FLR.bits());
            }
        }

        self.cancel_orphaned_urbs();

        let did_work = self.service_schedules_reporting_work();

        let mut st = self.shared.state.lock().unwrap();
        let default_hz = (self.shared.config.default_frame_rate_khz.clamp(1, 8)) * 1000;
        if did_work {
            st.idle_ticks = 0;
            st.frame_rate_hz = default_hz;
        } else {
            st.idle_ticks += 1;
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

    fn service_schedules_reporting_work(&self) -> bool {
        let before = self.shared.state.lock().unwrap().inflight.len();
        self.service_schedules();
        let after = self.shared.state.lock().unwrap().inflight.len();
        after != before
    }

    /// `CancelOrphanedURBs` generalized to EHCI: an in-flight qTD whose
    /// owning QH no longer points at it (or whose QH went inactive/halted)
    /// is cancelled, except control endpoints.
    fn cancel_orphaned_urbs(&self) {
        let entries: Vec<(u64, crate::urb::UrbRef)> = {
            let st = self.shared.state.lock().unwrap();
            st.inflight.snapshot()
        };
        for (qtd_addr, urb) in entries {
            if urb.xfer_type == crate::urb::TransferType::Control {
                continue;
            }
            let qh = super::descriptors::Qh::read(&self.shared.mem, urb.anchor_addr);
            let still_linked = match qh {
                Ok(qh) => qh.current_qtd == qtd_addr && qh.is_ready(),
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
