//! Calibration session over one serial connection.
//!
//! A [`Session`] owns the port for the lifetime of a calibration run and
//! serializes every protocol exchange through `&mut self`. The handshake
//! lives in [`handshake`], the named commands in [`commands`]; this module
//! provides the primitives they share: writing command lines, waiting for
//! markers and cancellable sleeps.

pub mod commands;
pub mod handshake;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::{PROMPT, TICK_FREQUENCY_HZ};
use crate::reader::{Wait, block_until, block_until_any};
use log::{debug, trace};
use std::io::Write;
use std::time::Duration;

/// Default bound for one request/response exchange.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause around each escape token during the handshake.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// How far ahead of "now" the clock is set.
pub const CLOCK_LEAD: Duration = Duration::from_secs(2);

/// The latch keystroke is sent this long before the whole-second deadline.
pub const LATCH_MARGIN: Duration = Duration::from_millis(1);

/// Upper bound for the clock-setting busy-wait.
pub const DEFAULT_MAX_SPIN: Duration = Duration::from_secs(5);

/// Granularity of cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Timing and protocol parameters of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound for each marker wait in a short exchange.
    pub command_timeout: Duration,
    /// Pause around escape tokens.
    pub settle_delay: Duration,
    /// Lead time between computing the clock value and latching it.
    pub clock_lead: Duration,
    /// Latch this long before the deadline.
    pub latch_margin: Duration,
    /// Longest acceptable busy-wait.
    pub max_spin: Duration,
    /// Nominal oscillator frequency.
    pub tick_frequency_hz: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            settle_delay: SETTLE_DELAY,
            clock_lead: CLOCK_LEAD,
            latch_margin: LATCH_MARGIN,
            max_spin: DEFAULT_MAX_SPIN,
            tick_frequency_hz: TICK_FREQUENCY_HZ,
        }
    }
}

impl SessionConfig {
    /// Set the command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the busy-wait bound.
    #[must_use]
    pub fn with_max_spin(mut self, max_spin: Duration) -> Self {
        self.max_spin = max_spin;
        self
    }

    /// Set the nominal oscillator frequency.
    #[must_use]
    pub fn with_tick_frequency(mut self, hz: u32) -> Self {
        self.tick_frequency_hz = hz;
        self
    }
}

/// A calibration session: one port, one clock, one echo sink.
pub struct Session<P: Port, C: Clock> {
    port: P,
    clock: C,
    echo: Box<dyn Write + Send>,
    config: SessionConfig,
    cancelled: Box<dyn Fn() -> bool + Send>,
}

impl<P: Port, C: Clock> Session<P, C> {
    /// Create a session echoing device output to stdout.
    ///
    /// Cancellation defaults to the global interrupt checker
    /// ([`crate::set_interrupt_checker`]).
    pub fn new(port: P, clock: C) -> Self {
        Self {
            port,
            clock,
            echo: Box::new(std::io::stdout()),
            config: SessionConfig::default(),
            cancelled: Box::new(crate::is_interrupted_requested),
        }
    }

    /// Replace the session parameters.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Send device output somewhere other than stdout.
    #[must_use]
    pub fn with_echo(mut self, echo: impl Write + Send + 'static) -> Self {
        self.echo = Box::new(echo);
        self
    }

    /// Use a custom cancellation check instead of the global one.
    #[must_use]
    pub fn with_cancel<F>(mut self, cancelled: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.cancelled = Box::new(cancelled);
        self
    }

    /// Session parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// The session's clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Check clear-to-send before anything else is attempted.
    pub fn ensure_ready(&mut self) -> Result<()> {
        if self.port.read_cts()? {
            debug!("CTS asserted on {}", self.port.name());
            Ok(())
        } else {
            Err(Error::DeviceNotReady(format!(
                "CTS not asserted on {}",
                self.port.name()
            )))
        }
    }

    /// Write raw bytes.
    pub(crate) fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        trace!("Sending {:?}", String::from_utf8_lossy(data));
        self.port.write_all_bytes(data)
    }

    /// Write one command line.
    pub(crate) fn send_line(&mut self, line: &str) -> Result<()> {
        debug!("> {line}");
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send_raw(&data)
    }

    /// Wait for `marker` within the command timeout.
    pub(crate) fn expect(&mut self, marker: &str) -> Result<String> {
        self.expect_within(marker, Wait::Bounded(self.config.command_timeout))
    }

    /// Wait for `marker` with an explicit deadline.
    pub(crate) fn expect_within(&mut self, marker: &str, wait: Wait) -> Result<String> {
        block_until(
            &mut self.port,
            &self.clock,
            marker,
            self.echo.as_mut(),
            wait,
            self.cancelled.as_ref(),
        )
    }

    /// Wait within the command timeout for whichever of `markers` comes
    /// first; returns its index and the text consumed.
    pub(crate) fn expect_any(&mut self, markers: &[&str]) -> Result<(usize, String)> {
        block_until_any(
            &mut self.port,
            &self.clock,
            markers,
            self.echo.as_mut(),
            Wait::Bounded(self.config.command_timeout),
            self.cancelled.as_ref(),
        )
    }

    /// Wait for the idle prompt.
    pub(crate) fn expect_prompt(&mut self) -> Result<String> {
        self.expect(PROMPT)
    }

    /// Sleep in slices so cancellation is noticed within a second.
    pub(crate) fn sleep(&mut self, duration: Duration) -> Result<()> {
        let until = self.clock.elapsed() + duration;
        loop {
            if (self.cancelled)() {
                return Err(Error::Interrupted);
            }
            let now = self.clock.elapsed();
            if now >= until {
                return Ok(());
            }
            self.clock.sleep((until - now).min(SLEEP_SLICE));
        }
    }
}
