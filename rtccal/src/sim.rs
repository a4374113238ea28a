//! Simulated calibration board and virtual clock for tests.
//!
//! Time only moves when the host sleeps, spins, or performs a read that
//! times out, so multi-hour windows run instantly and every timestamp is
//! deterministic.

use crate::clock::Clock;
use crate::error::Result;
use crate::port::Port;
use crate::protocol::{PROMPT, TICK_FREQUENCY_HZ};
use chrono::{DateTime, Local, TimeDelta, TimeZone};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Virtual read timeout of the simulated ports.
pub(crate) const SIM_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// One busy-wait iteration on the virtual clock.
pub(crate) const SIM_SPIN_STEP: Duration = Duration::from_micros(100);

/// Shared virtual clock, counted in microseconds since `base`.
#[derive(Debug, Clone)]
pub(crate) struct SimClock {
    micros: Arc<AtomicU64>,
    base: DateTime<Local>,
}

impl SimClock {
    pub(crate) fn new() -> Self {
        // 2024-03-01T12:00:00.250Z
        Self {
            micros: Arc::new(AtomicU64::new(0)),
            base: Local.timestamp_opt(1_709_294_400, 250_000_000).unwrap(),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap();
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }

    pub(crate) fn at(&self, offset: Duration) -> DateTime<Local> {
        self.base + TimeDelta::from_std(offset).unwrap()
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Local> {
        self.at(self.elapsed())
    }

    fn elapsed(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn spin(&self) {
        self.advance(SIM_SPIN_STEP);
    }
}

fn timed_out() -> std::io::Error {
    std::io::Error::new(ErrorKind::TimedOut, "read timed out")
}

/// Port replaying a fixed byte stream, with optional bytes released later.
pub(crate) struct ScriptedStream {
    clock: SimClock,
    ready: VecDeque<u8>,
    scheduled: Vec<(Duration, Vec<u8>)>,
    pub(crate) written: Vec<u8>,
    /// Flushes fail as if the output were blocked.
    pub(crate) stall_flush: bool,
}

impl ScriptedStream {
    pub(crate) fn new(clock: &SimClock, data: &[u8]) -> Self {
        Self {
            clock: clock.clone(),
            ready: data.iter().copied().collect(),
            scheduled: Vec::new(),
            written: Vec::new(),
            stall_flush: false,
        }
    }

    /// Release `data` once the virtual clock reaches `at`.
    pub(crate) fn push_at(&mut self, at: Duration, data: &[u8]) {
        self.scheduled.push((at, data.to_vec()));
        self.scheduled.sort_by_key(|(t, _)| *t);
    }

    pub(crate) fn remaining(&self) -> Vec<u8> {
        self.ready.iter().copied().collect()
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let now = self.clock.elapsed();
        while self.scheduled.first().is_some_and(|(t, _)| *t <= now) {
            let (_, data) = self.scheduled.remove(0);
            self.ready.extend(data);
        }
        if let Some(b) = self.ready.pop_front() {
            buf[0] = b;
            return Ok(1);
        }
        let step = self
            .scheduled
            .first()
            .map_or(SIM_READ_TIMEOUT, |(t, _)| (*t - now).min(SIM_READ_TIMEOUT));
        self.clock.advance(step);
        Err(timed_out())
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.stall_flush {
            return Err(std::io::Error::new(ErrorKind::TimedOut, "write timed out"));
        }
        Ok(())
    }
}

impl Port for ScriptedStream {
    fn clear_buffers(&mut self) -> Result<()> {
        self.ready.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn read_cts(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// Where the simulated firmware is in its command loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Mode {
    /// Held in reset by DTR.
    Reset,
    /// Booted, counting escape tokens.
    Booted { escapes: usize },
    /// Idle at the prompt.
    Command,
    /// `echo`: waiting for the byte to echo.
    AwaitEchoByte,
    /// `setDT`: reading the 12 digits.
    AwaitDateTime,
    /// `setDT`: waiting for the latch keystroke.
    AwaitSync { digits: String },
    /// `setOffset`: reading the expected tick count.
    AwaitExpected,
    /// `setOffset`: reading the actual tick count.
    AwaitActual { expected: String },
    /// Counting ticks until `stop_at`.
    Timing { stop_at: Duration },
}

/// Model of the RTC calibration firmware.
///
/// The board's oscillator runs at `true_hz`; `setOffset` accumulates a
/// correction that the board subtracts from it for subsequent windows.
pub(crate) struct SimDevice {
    clock: SimClock,
    pub(crate) mode: Mode,
    pub(crate) cts: bool,
    /// Releasing DTR boots the firmware.
    pub(crate) boots_on_reset: bool,
    pub(crate) true_hz: f64,
    pub(crate) correction_hz: f64,
    pub(crate) voltage_low: bool,
    /// Escape tokens needed to enter command mode.
    pub(crate) escapes_needed: usize,
    /// Byte rendered in the echo reply instead of the one received.
    pub(crate) echo_override: Option<u8>,
    /// Fixed window duration overriding the oscillator model.
    pub(crate) window_override: Option<Duration>,
    /// `setOffset` answers the expected count with a parse error.
    pub(crate) reject_expected: bool,
    /// `setOffset` answers the actual count with a parse error.
    pub(crate) reject_actual: bool,
    line: Vec<u8>,
    out: VecDeque<u8>,
    pub(crate) boots: usize,
    pub(crate) written: Vec<u8>,
    pub(crate) commands: Vec<String>,
    /// (digits, virtual time of the latch keystroke)
    pub(crate) clock_sets: Vec<(String, DateTime<Local>)>,
    /// (expected, actual) as received
    pub(crate) offsets: Vec<(String, String)>,
}

impl SimDevice {
    pub(crate) fn new(clock: &SimClock) -> Self {
        Self {
            clock: clock.clone(),
            mode: Mode::Reset,
            cts: true,
            boots_on_reset: true,
            true_hz: f64::from(TICK_FREQUENCY_HZ),
            correction_hz: 0.0,
            voltage_low: false,
            escapes_needed: 3,
            echo_override: None,
            window_override: None,
            reject_expected: false,
            reject_actual: false,
            line: Vec::new(),
            out: VecDeque::new(),
            boots: 0,
            written: Vec::new(),
            commands: Vec::new(),
            clock_sets: Vec::new(),
            offsets: Vec::new(),
        }
    }

    /// Board whose oscillator runs `ppm` parts per million fast.
    pub(crate) fn with_ppm(clock: &SimClock, ppm: f64) -> Self {
        let mut device = Self::new(clock);
        device.true_hz = f64::from(TICK_FREQUENCY_HZ) * (1.0 + ppm * 1e-6);
        device
    }

    pub(crate) fn millihertz(&self) -> i64 {
        (self.correction_hz * 1000.0).round() as i64
    }

    fn emit(&mut self, text: &str) {
        self.out.extend(text.as_bytes());
    }

    fn prompt(&mut self) {
        self.emit("\r\n");
        self.emit(PROMPT);
        self.mode = Mode::Command;
    }

    fn stamp(&self) -> String {
        self.clock.now().format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Collect a typed line with echo; returns it once complete.
    fn take_line(&mut self, byte: u8) -> Option<String> {
        match byte {
            b'\r' | b'\n' => Some(String::from_utf8_lossy(&std::mem::take(&mut self.line)).into_owned()),
            _ => {
                self.line.push(byte);
                self.out.push_back(byte);
                None
            },
        }
    }

    fn dispatch(&mut self, command: &str) {
        self.commands.push(command.to_string());
        self.emit("\r\n");
        match command {
            "echo" => {
                self.emit("Send one byte: 0x");
                self.mode = Mode::AwaitEchoByte;
            },
            "setDT" => {
                self.emit("Enter date/time in 'yymmddhhmmss' format: ");
                self.mode = Mode::AwaitDateTime;
            },
            "dump" => {
                let mhz = self.millihertz();
                self.emit("Eeprom address: 16\r\n\tclkoutHz: 32768\r\n");
                self.emit(&format!("\thzOffset/1000: {mhz}\r\n"));
                self.prompt();
            },
            "now" => {
                let flag = if self.voltage_low { "?" } else { "" };
                let line = format!("{}{flag}\r\n", self.stamp());
                self.emit(&line);
                self.prompt();
            },
            "clearVL" => {
                self.voltage_low = false;
                self.prompt();
            },
            "setOffset" => {
                let mhz = self.millihertz();
                self.emit(&format!(
                    "Base frequency is: 32768 + MiliHertz Offset: {mhz}\r\nEnter expected ticks: "
                ));
                self.mode = Mode::AwaitExpected;
            },
            "time1M" | "time1H" | "time6H" => {
                let secs: u64 = match command {
                    "time1M" => 60,
                    "time1H" => 3600,
                    _ => 21600,
                };
                let ticks = secs * u64::from(TICK_FREQUENCY_HZ);
                let real = self.window_override.unwrap_or_else(|| {
                    let effective_hz = self.true_hz - self.correction_hz;
                    let micros = (ticks as f64 / effective_hz * 1e6).round() as u64;
                    Duration::from_micros(micros)
                });
                let announce = format!("{}\r\nTiming {ticks} RTC ticks\r\nSTART\r\n", self.stamp());
                self.emit(&announce);
                self.mode = Mode::Timing {
                    stop_at: self.clock.elapsed() + real,
                };
            },
            _ => {
                self.emit("Unknown/invalid command, type 'help' for help.");
                self.prompt();
            },
        }
    }

    fn accept(&mut self, byte: u8) {
        match self.mode.clone() {
            Mode::Reset | Mode::Timing { .. } => {},
            Mode::Booted { escapes } => {
                if byte == b'\n' {
                    let line = std::mem::take(&mut self.line);
                    let escapes = if line == b"<<<" { escapes + 1 } else { escapes };
                    if escapes >= self.escapes_needed {
                        self.prompt();
                    } else {
                        self.mode = Mode::Booted { escapes };
                    }
                } else {
                    self.line.push(byte);
                }
            },
            Mode::Command => {
                if let Some(line) = self.take_line(byte) {
                    let line = line.trim().to_string();
                    if !line.is_empty() {
                        self.dispatch(&line);
                    }
                }
            },
            Mode::AwaitEchoByte => {
                let shown = self.echo_override.unwrap_or(byte);
                self.emit(&format!("{shown:X}\r\n"));
                self.prompt();
            },
            Mode::AwaitDateTime => {
                if let Some(line) = self.take_line(byte) {
                    let digits = line.trim().to_string();
                    if digits.len() == 12 && digits.bytes().all(|b| b.is_ascii_digit()) {
                        self.emit("\r\n---Enter to synchronize---\r\n");
                        self.mode = Mode::AwaitSync { digits };
                    } else {
                        self.emit(&format!("\r\nInput too long ({}/12)", digits.len()));
                        self.prompt();
                    }
                }
            },
            Mode::AwaitSync { digits } => {
                if byte == b'\r' || byte == b'\n' {
                    let latched = self.clock.now();
                    self.clock_sets.push((digits, latched));
                } else {
                    self.emit("Aborted");
                }
                self.prompt();
            },
            Mode::AwaitExpected => {
                if let Some(line) = self.take_line(byte) {
                    if !self.reject_expected && line.trim().parse::<u64>().is_ok() {
                        self.emit("\r\nEnter actual ticks: ");
                        self.mode = Mode::AwaitActual {
                            expected: line.trim().to_string(),
                        };
                    } else {
                        self.emit("\r\nError parsing number");
                        self.prompt();
                    }
                }
            },
            Mode::AwaitActual { expected } => {
                if let Some(line) = self.take_line(byte) {
                    let actual = line.trim().to_string();
                    match (expected.parse::<f64>(), actual.parse::<f64>()) {
                        (Ok(e), Ok(a)) if a > 0.0 && !self.reject_actual => {
                            let nominal = f64::from(TICK_FREQUENCY_HZ);
                            self.correction_hz += nominal * e / a - nominal;
                            self.offsets.push((expected, actual));
                            let mhz = self.millihertz();
                            self.emit(&format!("\r\n MiliHertz Offset is now: {mhz}"));
                        },
                        _ => self.emit("\r\nError parsing number"),
                    }
                    self.prompt();
                }
            },
        }
    }
}

impl Read for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let now = self.clock.elapsed();
        if let Mode::Timing { stop_at } = self.mode {
            if now >= stop_at {
                let tail = format!("STOP!\r\n{}", self.stamp());
                self.emit(&tail);
                self.prompt();
            }
        }
        if let Some(b) = self.out.pop_front() {
            buf[0] = b;
            return Ok(1);
        }
        let step = match self.mode {
            Mode::Timing { stop_at } => (stop_at - now).min(SIM_READ_TIMEOUT),
            _ => SIM_READ_TIMEOUT,
        };
        self.clock.advance(step);
        Err(timed_out())
    }
}

impl Write for SimDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.extend_from_slice(buf);
        for &b in buf {
            self.accept(b);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for SimDevice {
    fn clear_buffers(&mut self) -> Result<()> {
        self.out.clear();
        self.line.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "/dev/ttyUSB0"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        if level {
            self.mode = Mode::Reset;
            self.out.clear();
            self.line.clear();
        } else if self.mode == Mode::Reset && self.boots_on_reset {
            self.boots += 1;
            self.emit("\r\nRTC calibration firmware\r\nSetup()\r\n");
            self.mode = Mode::Booted { escapes: 0 };
        }
        Ok(())
    }

    fn read_cts(&mut self) -> Result<bool> {
        Ok(self.cts)
    }
}
