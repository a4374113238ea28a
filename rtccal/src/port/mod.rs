//! Port abstraction for the serial link to the RTC board.
//!
//! The calibration protocol only needs a handful of operations from the
//! transport: raw byte reads bounded by a timeout, raw writes, buffer
//! discards and two modem control lines (DTR drives the board's reset, CTS
//! reports whether the adapter is ready). The `Port` trait captures exactly
//! that, so the protocol layer can run against a real serial port or a
//! simulated device.
//!
//! ```text
//! +--------------------+
//! | Calibrator         |
//! +---------+----------+
//!           |
//! +---------v----------+
//! | Session / reader   |
//! +---------+----------+
//!           |
//! +---------v----------+     +--------------------+
//! |   Port Trait       +---->| NativePort         |
//! +--------------------+     |   (serialport)     |
//!                            +--------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use rtccal::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> rtccal::Result<()> {
//!     port.write_all_bytes(b"dump\n")?;
//!     while let Some(byte) = port.read_byte()? {
//!         print!("{}", byte as char);
//!     }
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default baud rate of the calibration firmware.
pub const DEFAULT_BAUD: u32 = 115200;

/// Default per-operation read/write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout: how long a single byte read may block.
    pub timeout: Duration,
    /// Write timeout: how long a write may block before failing.
    pub write_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// Unified port trait for the calibration link.
pub trait Port: Read + Write + Send {
    /// Discard buffered unread and unsent bytes.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    ///
    /// On Arduino-style boards asserting DTR holds the target in reset.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Read CTS (Clear To Send) pin state.
    fn read_cts(&mut self) -> Result<bool>;

    /// Write all bytes and flush, blocking until complete.
    ///
    /// A write that cannot complete within the write timeout fails with
    /// [`Error::WriteTimeout`].
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let result = Write::write_all(self, buf).and_then(|()| Write::flush(self));
        result.map_err(|e| write_error(e, || format!("{} byte(s) to {}", buf.len(), self.name())))
    }

    /// Flush pending output, with the same timeout mapping as
    /// [`write_all_bytes`](Port::write_all_bytes).
    fn flush_output(&mut self) -> Result<()> {
        Write::flush(self).map_err(|e| write_error(e, || format!("flush of {}", self.name())))
    }

    /// Read a single byte.
    ///
    /// Returns `None` when the read timeout elapses with no data; never
    /// blocks longer than that.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match Read::read(self, &mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl<P: Port + ?Sized> Port for &mut P {
    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }

    fn read_cts(&mut self) -> Result<bool> {
        (**self).read_cts()
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write_all_bytes(buf)
    }

    fn flush_output(&mut self) -> Result<()> {
        (**self).flush_output()
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        (**self).read_byte()
    }
}

/// Map an output error: a timeout becomes [`Error::WriteTimeout`].
fn write_error(e: std::io::Error, what: impl FnOnce() -> String) -> Error {
    if e.kind() == ErrorKind::TimedOut {
        Error::WriteTimeout(what())
    } else {
        Error::Io(e)
    }
}

/// Trait for listing available serial ports.
///
/// Separate from `Port` because it doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
