//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, SerialConfig},
    },
    log::trace,
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits},
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timeout: Duration,
    write_timeout: Duration,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    ///
    /// The port is opened 8N1 without flow control and with DTR left
    /// deasserted, so opening it does not by itself reset the board.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .dtr_on_open(false)
            .open()
            .map_err(|e| Error::Connection {
                port: config.port_name.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            port,
            name: config.port_name.clone(),
            timeout: config.timeout,
            write_timeout: config.write_timeout,
        })
    }

    /// Open a serial port with default timeouts.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }
}

impl Port for NativePort {
    fn clear_buffers(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn read_cts(&mut self) -> Result<bool> {
        self.port
            .read_clear_to_send()
            .map_err(Error::Serial)
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for NativePort {
    // serialport has one timeout for both directions; swap in the write
    // timeout only while writing.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.write_timeout == self.timeout {
            return self.port.write(buf);
        }
        self.port.set_timeout(self.write_timeout)?;
        let written = self.port.write(buf);
        self.port.set_timeout(self.timeout)?;
        written
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, product) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => {
                        (Some(info.vid), Some(info.pid), info.product.clone())
                    },
                    _ => (None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    product,
                }
            })
            .collect())
    }
}
