//! Calibration firmware command-mode protocol.
//!
//! The firmware speaks newline-terminated ASCII. The host types a command
//! keyword, the device echoes it, prints free-form output containing fixed
//! markers, and finally returns to the idle prompt:
//!
//! ```text
//! host   : time1M\n
//! device : time1M\r\n
//!          2024-03-01 12:00:01\r\n
//!          Timing 1966080 RTC ticks\r\n
//!          START\r\n                      <- host records start
//!          ...60 s of counting...
//!          STOP!\r\n                      <- host records end
//!          2024-03-01 12:01:01\r\n
//!          >>>                            <- idle prompt
//! ```
//!
//! This module holds the wire vocabulary, the measurement window table and
//! the tick arithmetic shared by the session and the orchestrator.

use chrono::{DateTime, Local, TimeDelta};
use std::time::Duration;

/// Idle prompt printed whenever the device is ready for a command.
pub const PROMPT: &str = ">>> ";

/// Banner the firmware prints once it has booted.
pub const BOOT_BANNER: &str = "Setup()";

/// Token that switches a freshly booted device into command mode.
pub const ESCAPE_TOKEN: &[u8] = b"<<<\n";

/// Number of escape tokens sent after boot.
pub const ESCAPE_REPEAT: usize = 3;

/// Command keywords.
pub mod cmd {
    /// Byte echo round-trip test.
    pub const ECHO: &str = "echo";
    /// Set date and time.
    pub const SET_DATE_TIME: &str = "setDT";
    /// Print the EEPROM configuration.
    pub const DUMP: &str = "dump";
    /// Print the device's current date and time.
    pub const NOW: &str = "now";
    /// Clear the RTC voltage-low flag.
    pub const CLEAR_VOLT_LOW: &str = "clearVL";
    /// Program the oscillator offset.
    pub const SET_OFFSET: &str = "setOffset";
}

/// Echo test markers and sentinel.
pub mod echo {
    /// Device asks for the byte to echo.
    pub const REQUEST: &str = " one byte: ";
    /// Byte sent by the host.
    pub const SENTINEL: u8 = 0xEF;
    /// Device's rendering of the echoed sentinel.
    pub const REPLY: &str = "0xEF";
}

/// setDT markers.
pub mod set_dt {
    /// Device asks for the 12-digit date/time.
    pub const REQUEST: &str = "Enter date/time in 'yymmddhhmmss' format:";
    /// Device waits for the latch keystroke.
    pub const SYNC: &str = "---Enter to synchronize---";
    /// Keystroke that latches the entered time.
    pub const LATCH: &[u8] = b"\r\n";
}

/// Timing window markers.
pub mod timing {
    /// End of the "Timing N RTC ticks" announcement.
    pub const TICKS: &str = "RTC ticks";
    /// Counting has started.
    pub const START: &str = "START";
    /// Counting has finished.
    pub const STOP: &str = "STOP!";
}

/// setOffset markers.
pub mod set_offset {
    /// Device asks for the expected tick count.
    pub const EXPECTED: &str = "Enter expected ticks:";
    /// Device asks for the measured tick count.
    pub const ACTUAL: &str = "Enter actual ticks:";
    /// Device could not parse a number the host sent.
    pub const PARSE_ERROR: &str = "Error parsing number";
    /// Precedes the new offset in the device's reply.
    pub const RESULT: &str = "Offset is now:";
}

/// Nominal frequency of the RTC's 32 kHz clock output.
pub const TICK_FREQUENCY_HZ: u32 = 32768;

/// Settle time for the 1 minute window.
///
/// Empirical: the host sleeps this long after START before it starts
/// looking for STOP!, leaving slack for device-side processing.
pub const SETTLE_1M: Duration = Duration::from_secs(50);

/// Settle time for the 1 hour window.
pub const SETTLE_1H: Duration = Duration::from_secs(60 * 60 - 10);

/// Settle time for the 6 hour window.
pub const SETTLE_6H: Duration = Duration::from_secs(6 * 60 * 60 - 30);

/// One timing trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementWindow {
    /// Short name ("1M", "1H", "6H").
    pub name: &'static str,
    /// Command keyword that starts the trial.
    pub command: &'static str,
    /// Marker that ends the trial.
    pub stop_marker: &'static str,
    /// How long the host sleeps after START before waiting for the stop marker.
    pub settle: Duration,
    /// Nominal window length in seconds.
    pub nominal_secs: u64,
}

impl MeasurementWindow {
    /// Nominal window length.
    pub fn nominal(&self) -> Duration {
        Duration::from_secs(self.nominal_secs)
    }

    /// Copy of this window with a different settle time.
    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

/// The calibration windows, in increasing size order.
pub const WINDOWS: [MeasurementWindow; 3] = [
    MeasurementWindow {
        name: "1M",
        command: "time1M",
        stop_marker: timing::STOP,
        settle: SETTLE_1M,
        nominal_secs: 60,
    },
    MeasurementWindow {
        name: "1H",
        command: "time1H",
        stop_marker: timing::STOP,
        settle: SETTLE_1H,
        nominal_secs: 60 * 60,
    },
    MeasurementWindow {
        name: "6H",
        command: "time6H",
        stop_marker: timing::STOP,
        settle: SETTLE_6H,
        nominal_secs: 6 * 60 * 60,
    },
];

/// Look up a window by name (case-insensitive).
pub fn window_by_name(name: &str) -> Option<MeasurementWindow> {
    WINDOWS
        .iter()
        .find(|w| w.name.eq_ignore_ascii_case(name))
        .copied()
}

/// Outcome of one timing trial.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TimingResult {
    /// Host time at START.
    pub start: DateTime<Local>,
    /// Host time at STOP!.
    pub end: DateTime<Local>,
    /// Nominal window length in seconds.
    pub nominal_secs: u64,
}

impl TimingResult {
    /// Build a result from the START timestamp and the monotonic time until STOP!.
    ///
    /// Deriving `end` from a monotonic duration keeps `end >= start` even if
    /// the wall clock is stepped during a multi-hour window.
    pub fn new(start: DateTime<Local>, elapsed: Duration, nominal_secs: u64) -> Self {
        let end = TimeDelta::from_std(elapsed)
            .ok()
            .and_then(|delta| start.checked_add_signed(delta))
            .unwrap_or(start);
        Self {
            start,
            end,
            nominal_secs,
        }
    }

    /// Host time between START and STOP!.
    pub fn elapsed(&self) -> Duration {
        (self.end - self.start)
            .to_std()
            .unwrap_or_default()
    }
}

/// Expected tick count for a nominal window.
pub fn expected_ticks(nominal_secs: u64, tick_hz: u32) -> u64 {
    nominal_secs * u64::from(tick_hz)
}

/// Host-measured duration converted to ticks, rounded once.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn measured_ticks(elapsed: Duration, tick_hz: u32) -> u64 {
    (elapsed.as_secs_f64() * f64::from(tick_hz)).round() as u64
}

/// Drift of one window, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DriftReport {
    /// Host-measured duration in ticks (the "actual ticks" sent to the device).
    pub measured_ticks: u64,
    /// Nominal duration in ticks (the "expected ticks" sent to the device).
    pub expected_ticks: u64,
    /// `measured_ticks - expected_ticks`.
    pub diff: i64,
}

impl DriftReport {
    /// Compute the drift of a timing result.
    #[allow(clippy::cast_possible_wrap)]
    pub fn from_timing(result: &TimingResult, tick_hz: u32) -> Self {
        let measured = measured_ticks(result.elapsed(), tick_hz);
        let expected = expected_ticks(result.nominal_secs, tick_hz);
        Self {
            measured_ticks: measured,
            expected_ticks: expected,
            diff: measured as i64 - expected as i64,
        }
    }

    /// Drift in parts per million of the nominal window.
    pub fn ppm(&self) -> f64 {
        if self.expected_ticks == 0 {
            return 0.0;
        }
        self.diff as f64 * 1e6 / self.expected_ticks as f64
    }
}

/// Format a timestamp the way setDT expects it: `yymmddhhmmss`.
pub fn format_datetime(at: &DateTime<Local>) -> String {
    at.format("%y%m%d%H%M%S").to_string()
}

/// Extract `N` from the device's "Timing N RTC ticks" announcement.
pub fn parse_announced_ticks(text: &str) -> Option<u64> {
    let (head, _) = text.rsplit_once(timing::TICKS)?;
    head.split_whitespace()
        .next_back()?
        .parse()
        .ok()
}

/// Extract the new millihertz offset from the device's setOffset reply.
pub fn parse_millihertz_offset(text: &str) -> Option<i64> {
    let (_, tail) = text.split_once(set_offset::RESULT)?;
    tail.split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Device date/time as reported by the `now` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTime {
    /// Date and time exactly as the device printed them.
    pub text: String,
    /// The RTC's voltage-low flag was set (the time may be invalid).
    pub voltage_low: bool,
}

/// Parse the reply to `now`: the last non-empty line before the prompt.
///
/// The firmware appends `?` when the RTC's voltage-low flag is set.
pub fn parse_device_time(reply: &str, command: &str) -> Option<DeviceTime> {
    let line = reply
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty() && !l.starts_with(PROMPT.trim_end()) && *l != command)?;
    let (text, voltage_low) = match line.strip_suffix('?') {
        Some(stripped) => (stripped.trim_end(), true),
        None => (line, false),
    };
    Some(DeviceTime {
        text: text.to_string(),
        voltage_low,
    })
}
