//! Reset handshake: bring the board from power-on into command mode.
//!
//! ```text
//! Reset ──► BootWait ──► Escape ──► EchoVerify ──► command mode
//!  DTR        "Setup()"    "<<<\n" x3    echo / 0xEF
//! ```
//!
//! The sequence is linear. Any stage that misses its marker aborts with
//! [`Error::HandshakeFailed`](crate::Error::HandshakeFailed); the board is
//! in an unknown state at that point, so nothing is retried.

use super::Session;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::{BOOT_BANNER, ESCAPE_REPEAT, ESCAPE_TOKEN, cmd, echo};
use log::{debug, info};

impl<P: Port, C: Clock> Session<P, C> {
    /// Reset the board and enter command mode.
    ///
    /// Running this again later repeats the full reset, so the board always
    /// ends up at a fresh prompt.
    pub fn handshake(&mut self) -> Result<()> {
        self.reset_device()?;
        self.expect(BOOT_BANNER)
            .map_err(|e| e.into_handshake("boot"))?;
        debug!("Board booted");

        self.enter_command_mode()
            .map_err(|e| e.into_handshake("escape"))?;
        self.echo_test()
            .map_err(|e| e.into_handshake("echo"))?;

        info!("Command mode active on {}", self.port.name());
        Ok(())
    }

    /// Pulse DTR to reset the board, dropping anything buffered meanwhile.
    fn reset_device(&mut self) -> Result<()> {
        self.port.set_dtr(true)?;
        self.port.clear_buffers()?;
        info!("Waiting for device reset...");
        self.port.set_dtr(false)?;
        Ok(())
    }

    /// Send the escape token until the firmware drops into its command loop.
    fn enter_command_mode(&mut self) -> Result<()> {
        let settle = self.config.settle_delay;
        self.sleep(settle)?;
        for i in 1..=ESCAPE_REPEAT {
            self.send_raw(ESCAPE_TOKEN)?;
            if i < ESCAPE_REPEAT {
                self.sleep(settle)?;
            }
        }
        self.expect_prompt()?;
        Ok(())
    }

    /// Round-trip one byte to prove the link is clean in both directions.
    fn echo_test(&mut self) -> Result<()> {
        self.send_line(cmd::ECHO)?;
        self.expect(echo::REQUEST)?;
        self.send_raw(&[echo::SENTINEL])?;
        let line = self.expect("\r\n")?;
        let shown = line.trim();
        if !shown.eq_ignore_ascii_case(echo::REPLY) {
            return Err(Error::HandshakeFailed {
                stage: "echo",
                reason: format!("sent {:#04X}, device echoed {shown:?}", echo::SENTINEL),
            });
        }
        self.expect_prompt()?;
        debug!("Echo test passed");
        Ok(())
    }
}
