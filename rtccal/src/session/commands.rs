//! Named request/response exchanges with the calibration firmware.
//!
//! Every command follows the same shape: write the keyword, wait for each
//! expected marker in order (sending payload in between where the firmware
//! asks for it) and finally wait for the prompt. A missed marker means host
//! and device are out of step, so the error propagates and the run ends.

use super::Session;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::{
    DeviceTime, DriftReport, MeasurementWindow, TimingResult, cmd, expected_ticks,
    format_datetime, parse_announced_ticks, parse_device_time, parse_millihertz_offset,
    set_dt, set_offset, timing,
};
use crate::reader::Wait;
use chrono::{DateTime, Local, SubsecRound, TimeDelta};
use log::{debug, info, warn};

impl<P: Port, C: Clock> Session<P, C> {
    /// Set the device clock, aligned to a whole second of host time.
    ///
    /// The value sent is `now + lead`, truncated to the second. The latch
    /// keystroke is held back in a busy-wait until just before that instant
    /// so the device starts counting from it with sub-millisecond skew.
    /// Returns the instant the device clock was set to.
    pub fn set_clock(&mut self) -> Result<DateTime<Local>> {
        self.send_line(cmd::SET_DATE_TIME)?;
        self.expect(set_dt::REQUEST)?;

        let lead = to_delta(self.config.clock_lead)?;
        let deadline = (self.clock.now() + lead).trunc_subsecs(0);
        let digits = format_datetime(&deadline);
        debug!("Setting device clock to {digits}");
        self.send_line(&digits)?;
        self.expect(set_dt::SYNC)?;

        let latch_at = deadline - to_delta(self.config.latch_margin)?;
        self.spin_until(latch_at)?;
        self.send_raw(set_dt::LATCH)?;
        self.expect_prompt()?;

        info!("Device clock set to {}", deadline.format("%Y-%m-%d %H:%M:%S"));
        Ok(deadline)
    }

    /// Busy-wait until the wall clock reaches `target`.
    fn spin_until(&mut self, target: DateTime<Local>) -> Result<()> {
        let max_spin = self.config.max_spin;
        let Ok(remaining) = (target - self.clock.now()).to_std() else {
            warn!("Clock latch deadline already passed, latching late");
            return Ok(());
        };
        if remaining > max_spin {
            return Err(Error::ClockSkew(format!(
                "latch deadline is {:.3}s away, limit is {:.3}s",
                remaining.as_secs_f64(),
                max_spin.as_secs_f64()
            )));
        }

        let started = self.clock.elapsed();
        while self.clock.now() < target {
            if self.clock.elapsed().saturating_sub(started) > max_spin {
                return Err(Error::ClockSkew(format!(
                    "wall clock did not reach the latch deadline within {:.3}s",
                    max_spin.as_secs_f64()
                )));
            }
            self.clock.spin();
        }
        Ok(())
    }

    /// Print the device's EEPROM configuration.
    ///
    /// The text is for the operator only and is returned unparsed.
    pub fn dump_state(&mut self) -> Result<String> {
        self.send_line(cmd::DUMP)?;
        self.expect_prompt()
    }

    /// Ask the device for its current date and time.
    pub fn query_time(&mut self) -> Result<DeviceTime> {
        self.send_line(cmd::NOW)?;
        let reply = self.expect_prompt()?;
        let time = parse_device_time(&reply, cmd::NOW)
            .ok_or_else(|| Error::Protocol(format!("no date/time in reply to {:?}", cmd::NOW)))?;
        if time.voltage_low {
            warn!("RTC voltage-low flag is set, device time may be invalid");
        }
        Ok(time)
    }

    /// Clear the RTC's voltage-low flag.
    pub fn clear_voltage_low(&mut self) -> Result<()> {
        self.send_line(cmd::CLEAR_VOLT_LOW)?;
        self.expect_prompt()?;
        debug!("Voltage-low flag cleared");
        Ok(())
    }

    /// Run one timing window and measure it against host time.
    ///
    /// Blocks for roughly the window's nominal length. The wait for the stop
    /// marker is bounded by the time left after settling plus the command
    /// timeout.
    pub fn measure_window(&mut self, window: &MeasurementWindow) -> Result<TimingResult> {
        info!(
            "Starting {} window ({}s), expect to wait until about {}",
            window.name,
            window.nominal_secs,
            (self.clock.now() + to_delta(window.nominal())?).format("%H:%M:%S")
        );
        self.send_line(window.command)?;

        let announcement = self.expect(timing::TICKS)?;
        let expected = expected_ticks(window.nominal_secs, self.config.tick_frequency_hz);
        match parse_announced_ticks(&announcement) {
            Some(announced) if announced != expected => warn!(
                "Device announced {announced} ticks for the {} window, expected {expected}; \
                 check its clkout frequency",
                window.name
            ),
            Some(_) => {},
            None => debug!("No tick count in window announcement"),
        }

        self.expect(timing::START)?;
        let start = self.clock.now();
        let started = self.clock.elapsed();

        self.sleep(window.settle)?;

        let stop_wait = window.nominal().saturating_sub(window.settle) + self.config.command_timeout;
        self.expect_within(window.stop_marker, Wait::Bounded(stop_wait))?;
        let elapsed = self.clock.elapsed().saturating_sub(started);
        self.expect_prompt()?;

        let result = TimingResult::new(start, elapsed, window.nominal_secs);
        debug!(
            "{} window took {:.6}s",
            window.name,
            result.elapsed().as_secs_f64()
        );
        Ok(result)
    }

    /// Program the oscillator offset measured by a timing window.
    ///
    /// Sends the nominal tick count as "expected" and the host-measured
    /// duration in ticks as "actual". Returns the device's new offset in
    /// millihertz when it reports one.
    pub fn program_offset(&mut self, result: &TimingResult) -> Result<Option<i64>> {
        let report = DriftReport::from_timing(result, self.config.tick_frequency_hz);

        self.send_line(cmd::SET_OFFSET)?;
        self.expect(set_offset::EXPECTED)?;
        self.send_line(&report.expected_ticks.to_string())?;
        // A rejected count drops the firmware straight back to the prompt.
        let (matched, _) = self.expect_any(&[set_offset::ACTUAL, set_offset::PARSE_ERROR])?;
        if matched == 1 {
            self.expect_prompt()?;
            return Err(rejected("expected", report.expected_ticks));
        }
        self.send_line(&report.measured_ticks.to_string())?;
        let reply = self.expect_prompt()?;

        if reply.contains(set_offset::PARSE_ERROR) {
            return Err(rejected("actual", report.measured_ticks));
        }

        let millihertz = parse_millihertz_offset(&reply);
        match millihertz {
            Some(mhz) => info!("Device offset is now {mhz} mHz"),
            None => debug!("Device did not report its new offset"),
        }
        Ok(millihertz)
    }
}

fn rejected(which: &str, ticks: u64) -> Error {
    Error::Protocol(format!("device rejected {which} tick count {ticks}"))
}

fn to_delta(duration: std::time::Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(duration).map_err(|e| Error::Config(format!("duration out of range: {e}")))
}
