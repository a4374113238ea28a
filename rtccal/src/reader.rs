//! Prompt-synchronized reader.
//!
//! The calibration firmware talks in free-form text and signals each step
//! with a fixed marker (`">>> "`, `"START"`, ...). [`block_until`] consumes
//! the byte stream one byte at a time, echoing every byte to a sink as it
//! arrives, until the marker shows up. Each individual read is bounded by
//! the port timeout; the overall wait is bounded by a [`Wait`] deadline and
//! can be cancelled between reads.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;
use std::io::Write;
use std::time::Duration;

/// Overall deadline for one marker wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail with [`Error::ProtocolTimeout`] after this much time.
    Bounded(Duration),
    /// Wait as long as it takes (cancellation still applies).
    Unbounded,
}

impl Wait {
    fn expired(self, waited: Duration) -> bool {
        match self {
            Self::Bounded(limit) => waited >= limit,
            Self::Unbounded => false,
        }
    }
}

/// Incremental substring scan over a byte stream.
///
/// Bytes are accumulated until the accumulator ends with one of the
/// markers, which happens exactly at the first occurrence since every byte
/// is checked.
#[derive(Debug)]
pub struct MarkerScan<'a> {
    markers: Vec<&'a [u8]>,
    buffer: Vec<u8>,
}

impl<'a> MarkerScan<'a> {
    /// Start scanning for `marker`.
    pub fn new(marker: &'a str) -> Self {
        Self::any(&[marker])
    }

    /// Start scanning for whichever of `markers` appears first.
    pub fn any(markers: &[&'a str]) -> Self {
        Self {
            markers: markers.iter().map(|m| m.as_bytes()).collect(),
            buffer: Vec::new(),
        }
    }

    /// Feed one byte; returns `true` once a marker has been seen.
    pub fn push(&mut self, byte: u8) -> bool {
        self.buffer.push(byte);
        self.found()
    }

    /// Whether the accumulated bytes end with a marker.
    pub fn found(&self) -> bool {
        self.matched().is_some()
    }

    /// Index of the marker the accumulated bytes end with.
    pub fn matched(&self) -> Option<usize> {
        self.markers
            .iter()
            .position(|m| !m.is_empty() && self.buffer.ends_with(m))
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the scan, returning the accumulated text.
    pub fn into_text(self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

/// Read from `port` until `marker` appears, echoing every byte to `sink`.
///
/// Returns everything consumed, ending with `marker`. Nothing past the
/// first occurrence of the marker is read.
///
/// # Errors
///
/// - [`Error::ProtocolTimeout`] when `wait` expires first.
/// - [`Error::Interrupted`] when `cancelled` reports true between reads.
/// - [`Error::Protocol`] for an empty marker.
/// - Transport errors from the port.
pub fn block_until<P, C>(
    port: &mut P,
    clock: &C,
    marker: &str,
    sink: &mut dyn Write,
    wait: Wait,
    cancelled: &dyn Fn() -> bool,
) -> Result<String>
where
    P: Port + ?Sized,
    C: Clock + ?Sized,
{
    block_until_any(port, clock, &[marker], sink, wait, cancelled).map(|(_, text)| text)
}

/// Like [`block_until`], but stops at the first of several markers.
///
/// Returns the index into `markers` of the one that matched together with
/// everything consumed. A timeout names all markers, joined with `|`.
///
/// # Errors
///
/// As for [`block_until`]; an empty list or any empty marker is
/// [`Error::Protocol`].
pub fn block_until_any<P, C>(
    port: &mut P,
    clock: &C,
    markers: &[&str],
    sink: &mut dyn Write,
    wait: Wait,
    cancelled: &dyn Fn() -> bool,
) -> Result<(usize, String)>
where
    P: Port + ?Sized,
    C: Clock + ?Sized,
{
    if markers.is_empty() || markers.iter().any(|m| m.is_empty()) {
        return Err(Error::Protocol("cannot wait for an empty marker".into()));
    }

    trace!("Waiting for {markers:?} ({wait:?})");
    // Push out whatever command preceded this wait.
    port.flush_output()?;

    let started = clock.elapsed();
    let mut scan = MarkerScan::any(markers);

    loop {
        if cancelled() {
            sink.flush().ok();
            return Err(Error::Interrupted);
        }

        let waited = clock.elapsed().saturating_sub(started);
        if wait.expired(waited) {
            sink.flush().ok();
            return Err(Error::ProtocolTimeout {
                marker: markers.join("|"),
                waited,
            });
        }

        match port.read_byte()? {
            Some(byte) => {
                // The echo is only for the operator; a closed stdout must not
                // abort a calibration run.
                sink.write_all(&[byte]).ok();
                scan.push(byte);
                if let Some(index) = scan.matched() {
                    sink.flush().ok();
                    trace!(
                        "Found {:?} after {} byte(s)",
                        markers[index],
                        scan.consumed().len()
                    );
                    return Ok((index, scan.into_text()));
                }
            },
            None => {
                sink.flush().ok();
            },
        }
    }
}
