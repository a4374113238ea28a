//! Calibration orchestrator.
//!
//! Runs the fixed pipeline over one [`Session`]:
//!
//! ```text
//! ready check ─► handshake ─► [clearVL] ─┬─► setDT ─► dump ─► timeN ─► report ─► setOffset ─┐
//!                                        └──────────────── next window ◄─────────────────────┘
//!                                                             ─► setDT ─► dump
//! ```
//!
//! Windows run smallest first so each larger window is measured with the
//! correction from the previous one already applied. The first error ends
//! the run.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::{DriftReport, MeasurementWindow, TimingResult, WINDOWS, window_by_name};
use crate::session::Session;
use chrono::{DateTime, Local};
use log::{info, warn};
use std::time::Duration;

/// Which windows to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationPlan {
    windows: Vec<MeasurementWindow>,
    clear_voltage_low: bool,
}

impl Default for CalibrationPlan {
    fn default() -> Self {
        Self {
            windows: WINDOWS.to_vec(),
            clear_voltage_low: false,
        }
    }
}

impl CalibrationPlan {
    /// All three windows with their default settle times.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the settle time of the window called `name`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an unknown window name or a settle time that is
    /// not shorter than the window itself.
    pub fn with_settle_override(mut self, name: &str, settle: Duration) -> Result<Self> {
        let known = window_by_name(name)
            .ok_or_else(|| Error::Config(format!("unknown window {name:?}")))?;
        if settle >= known.nominal() {
            return Err(Error::Config(format!(
                "settle time {:.1}s for window {} must be shorter than {}s",
                settle.as_secs_f64(),
                known.name,
                known.nominal_secs
            )));
        }
        for window in self.windows.iter_mut().filter(|w| w.name == known.name) {
            *window = window.with_settle(settle);
        }
        Ok(self)
    }

    /// Restrict the run to the named windows. Order stays smallest first.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an unknown name or an empty selection.
    pub fn only<S: AsRef<str>>(mut self, names: &[S]) -> Result<Self> {
        let mut keep = Vec::with_capacity(names.len());
        for name in names {
            let window = window_by_name(name.as_ref())
                .ok_or_else(|| Error::Config(format!("unknown window {:?}", name.as_ref())))?;
            keep.push(window.name);
        }
        if keep.is_empty() {
            return Err(Error::Config("no windows selected".into()));
        }
        self.windows.retain(|w| keep.contains(&w.name));
        Ok(self)
    }

    /// Clear the RTC voltage-low flag right after the handshake.
    #[must_use]
    pub fn with_clear_voltage_low(mut self, clear: bool) -> Self {
        self.clear_voltage_low = clear;
        self
    }

    /// Windows in run order.
    pub fn windows(&self) -> &[MeasurementWindow] {
        &self.windows
    }

    /// Sum of the nominal window lengths.
    pub fn total_duration(&self) -> Duration {
        self.windows.iter().map(MeasurementWindow::nominal).sum()
    }
}

/// Progress notifications from [`Calibrator::run`].
#[derive(Debug, Clone, Copy)]
pub enum CalibrationEvent<'a> {
    /// A timing window is about to start.
    WindowStarted(&'a MeasurementWindow),
    /// A timing window finished; the offset has not been programmed yet.
    WindowMeasured(&'a WindowOutcome),
    /// The device accepted the offset for a window.
    OffsetProgrammed(&'a WindowOutcome),
}

/// Result of one window.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WindowOutcome {
    /// Window name ("1M", "1H", "6H").
    pub window: &'static str,
    /// Host timestamps of START and STOP!.
    pub timing: TimingResult,
    /// Drift derived from `timing`.
    pub drift: DriftReport,
    /// Offset reported by the device after programming, in millihertz.
    pub millihertz: Option<i64>,
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct CalibrationSummary {
    /// One entry per window, in run order.
    pub outcomes: Vec<WindowOutcome>,
    /// The instant the device clock was last set to.
    pub final_clock: DateTime<Local>,
    /// Device configuration printed at the end of the run.
    pub final_state: String,
}

/// Drives a full calibration run over one session.
pub struct Calibrator<P: Port, C: Clock> {
    session: Session<P, C>,
    plan: CalibrationPlan,
}

impl<P: Port, C: Clock> Calibrator<P, C> {
    /// Create a calibrator.
    pub fn new(session: Session<P, C>, plan: CalibrationPlan) -> Self {
        Self { session, plan }
    }

    /// The plan being run.
    pub fn plan(&self) -> &CalibrationPlan {
        &self.plan
    }

    /// The underlying session.
    pub fn session_mut(&mut self) -> &mut Session<P, C> {
        &mut self.session
    }

    /// Give the session back.
    pub fn into_session(self) -> Session<P, C> {
        self.session
    }

    /// Run the plan to completion.
    ///
    /// `on_event` is called as each window starts, is measured and has its
    /// offset programmed.
    pub fn run<F>(&mut self, mut on_event: F) -> Result<CalibrationSummary>
    where
        F: FnMut(CalibrationEvent<'_>),
    {
        self.session.ensure_ready()?;
        self.session.handshake()?;

        if self.plan.clear_voltage_low {
            self.session.clear_voltage_low()?;
        }
        if self.session.query_time()?.voltage_low {
            warn!("Calibrating with the voltage-low flag set");
        }

        let hz = self.session.config().tick_frequency_hz;
        let windows = self.plan.windows.clone();
        let mut outcomes = Vec::with_capacity(windows.len());

        for window in &windows {
            self.session.set_clock()?;
            self.session.dump_state()?;

            on_event(CalibrationEvent::WindowStarted(window));
            let timing = self.session.measure_window(window)?;
            let mut outcome = WindowOutcome {
                window: window.name,
                drift: DriftReport::from_timing(&timing, hz),
                timing,
                millihertz: None,
            };
            info!(
                "{} window: diff {} ticks ({:+.3} ppm)",
                window.name,
                outcome.drift.diff,
                outcome.drift.ppm()
            );
            on_event(CalibrationEvent::WindowMeasured(&outcome));

            outcome.millihertz = self.session.program_offset(&outcome.timing)?;
            on_event(CalibrationEvent::OffsetProgrammed(&outcome));
            outcomes.push(outcome);
        }

        let final_clock = self.session.set_clock()?;
        let final_state = self.session.dump_state()?;
        info!("Calibration finished ({} window(s))", outcomes.len());

        Ok(CalibrationSummary {
            outcomes,
            final_clock,
            final_state,
        })
    }
}
