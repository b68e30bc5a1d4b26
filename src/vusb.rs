//! The external virtual USB bus seam (C5): the boundary between a
//! controller's schedule walker and whatever owns the actual device models
//! (a USB/IP remote, a software device, a passthrough backend).

use crate::error::SubmitError;
use crate::urb::{UrbCompletion, UrbRef};

/// Invoked exactly once per submitted URB, from whatever thread the bus
/// backend completes it on. The controller's implementation re-acquires its
/// device lock before touching any schedule state.
pub type CompletionCallback = Box<dyn FnOnce(UrbCompletion) + Send + 'static>;

/// Implemented by whatever backend the embedder plugs in underneath a
/// controller. Controllers never block on this trait: `submit_urb` either
/// accepts the URB (and promises exactly one callback invocation later) or
/// fails synchronously.
pub trait VusbConnector: Send + Sync {
    /// Hand a fully assembled URB to the bus. On success, `on_complete` is
    /// guaranteed to run exactly once, even if the URB is later cancelled
    /// (cancellation only asks the device to abort early; the callback
    /// still fires with whatever status the device settles on).
    fn submit_urb(
        &self,
        urb: UrbRef,
        on_complete: CompletionCallback,
    ) -> Result<(), SubmitError>;

    /// Best-effort request to abort all outstanding URBs queued against the
    /// given device/endpoint pair. Does not guarantee immediate completion;
    /// the normal completion callback still fires later.
    fn cancel_urbs_for_endpoint(&self, device_address: u8, endpoint: u8);

    /// Root-hub port power control, called when a port's power bit changes.
    fn port_power(&self, port: u8, powered: bool);

    /// Root-hub requests the attached device perform (or simulate) a bus
    /// reset on the given port.
    fn request_port_reset(&self, port: u8);
}

/// The interrupt-raise primitive, supplied by the embedder. A controller
/// calls `set_level` every time its computed line state (`status & enable`,
/// gated by master-enable/routing bits) changes; it does not edge-detect on
/// the caller's behalf.
pub trait InterruptLine: Send + Sync {
    fn set_level(&self, asserted: bool);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every call made to it; used by controller unit tests that
    /// don't need a real device behind the bus.
    #[derive(Default)]
    pub struct RecordingConnector {
        pub submitted: Mutex<Vec<UrbRef>>,
        pub cancelled: Mutex<Vec<(u8, u8)>>,
        pub power: Mutex<Vec<(u8, bool)>>,
        pub resets: Mutex<Vec<u8>>,
    }

    impl VusbConnector for RecordingConnector {
        fn submit_urb(
            &self,
            urb: UrbRef,
            _on_complete: CompletionCallback,
        ) -> Result<(), SubmitError> {
            self.submitted.lock().unwrap().push(urb);
            Ok(())
        }

        fn cancel_urbs_for_endpoint(&self, device_address: u8, endpoint: u8) {
            self.cancelled.lock().unwrap().push((device_address, endpoint));
        }

        fn port_power(&self, port: u8, powered: bool) {
            self.power.lock().unwrap().push((port, powered));
        }

        fn request_port_reset(&self, port: u8) {
            self.resets.lock().unwrap().push(port);
        }
    }

    /// Records every level transition; used by controller unit tests that
    /// assert on interrupt-line behavior without a real interrupt controller.
    #[derive(Default)]
    pub struct RecordingInterruptLine {
        pub levels: Mutex<Vec<bool>>,
    }

    impl InterruptLine for RecordingInterruptLine {
        fn set_level(&self, asserted: bool) {
            self.levels.lock().unwrap().push(asserted);
        }
    }
}
