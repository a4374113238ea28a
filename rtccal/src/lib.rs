//! # rtccal
//!
//! Calibrate the real-time clock of a microcontroller board over a serial
//! link.
//!
//! The board runs a small text-mode firmware. This crate drives it through
//! a prompt-synchronized command protocol: reset and handshake, set the
//! device clock aligned to a whole second of host time, let the device
//! count a fixed number of oscillator ticks while the host measures the
//! same interval, then program the resulting frequency offset. Three
//! windows of increasing length (1 minute, 1 hour, 6 hours) run in turn so
//! each correction refines the previous one.
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: serialization of timing results
//!
//! ## Example
//!
//! ```rust,no_run
//! use rtccal::{CalibrationEvent, CalibrationPlan, Calibrator, Session, SystemClock};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let port = rtccal::NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!         let session = Session::new(port, SystemClock::new());
//!         let mut calibrator = Calibrator::new(session, CalibrationPlan::new());
//!
//!         let summary = calibrator.run(|event| {
//!             if let CalibrationEvent::WindowMeasured(outcome) = event {
//!                 println!("{}: diff {} ticks", outcome.window, outcome.drift.diff);
//!             }
//!         })?;
//!         println!("{} window(s) calibrated", summary.outcomes.len());
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod calibrate;
pub mod clock;
pub mod error;
pub mod port;
pub mod protocol;
pub mod reader;
pub mod session;

#[cfg(test)]
mod sim;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running waits.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Sessions poll
/// it between reads and while sleeping unless given their own check with
/// [`Session::with_cancel`].
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    calibrate::{CalibrationEvent, CalibrationPlan, CalibrationSummary, Calibrator, WindowOutcome},
    clock::{Clock, SystemClock},
    error::{Error, Result},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{DeviceTime, DriftReport, MeasurementWindow, TimingResult, WINDOWS},
    reader::{Wait, block_until},
    session::{Session, SessionConfig},
};
