//! Raw-paste windowed transfer
//!
//! After a successful `0x05 'A' 0x01` negotiation the target sends a
//! little-endian u16 window size. The host may have at most that many
//! unacknowledged bytes in flight; each `0x01` from the target grants another
//! window, a `0x04` aborts the transfer.

use byteorder::{ByteOrder, LittleEndian};
use std::time::Duration;

use super::{ctrl, ReplError, SerialLink};

/// Poll interval used while draining already-buffered flow-control bytes
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Flow-control window for one raw-paste transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferWindow {
    window_size: u16,
    window_remaining: u16,
}

impl TransferWindow {
    /// Full window of `window_size` bytes
    pub fn new(window_size: u16) -> Self {
        Self {
            window_size,
            window_remaining: window_size,
        }
    }

    /// Decode the 2-byte little-endian header sent by the target
    pub fn from_header(header: &[u8]) -> Result<Self, ReplError> {
        if header.len() != 2 {
            return Err(ReplError::Protocol(format!(
                "raw-paste window header has {} bytes",
                header.len()
            )));
        }
        Ok(Self::new(LittleEndian::read_u16(header)))
    }

    /// Bytes granted per credit
    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    /// Bytes that may be sent before the next credit
    pub fn remaining(&self) -> u16 {
        self.window_remaining
    }

    /// Apply one flow-control credit byte
    pub fn credit(&mut self) {
        self.window_remaining = self.window_remaining.saturating_add(self.window_size);
    }

    /// How many of `left` bytes may be sent now
    pub fn sendable(&self, left: usize) -> usize {
        left.min(self.window_remaining as usize)
    }

    /// Account for bytes just sent
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.window_remaining as usize);
        self.window_remaining -= n as u16;
    }
}

/// How a raw-paste transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasteOutcome {
    /// All data sent and the end marker acknowledged
    Completed,
    /// Target aborted mid-transfer; the abort was acknowledged
    Aborted,
}

enum Inbound {
    Continue,
    Abort,
}

fn handle_control(
    link: &SerialLink,
    window: &mut TransferWindow,
    byte: u8,
) -> Result<Inbound, ReplError> {
    match byte {
        0x01 => {
            window.credit();
            tracing::trace!("raw-paste credit, window now {}", window.remaining());
            Ok(Inbound::Continue)
        }
        ctrl::EOF => {
            link.write_bytes(&[ctrl::EOF])?;
            tracing::debug!("raw-paste aborted by target");
            Ok(Inbound::Abort)
        }
        other => Err(ReplError::Protocol(format!(
            "unexpected byte {:#04x} during raw paste",
            other
        ))),
    }
}

/// Send `data` with raw-paste flow control.
///
/// `header_timeout` bounds the wait for the window header and the final
/// acknowledgment, `credit_timeout` bounds each wait for a window credit.
pub fn raw_paste_write(
    link: &SerialLink,
    data: &[u8],
    header_timeout: Duration,
    credit_timeout: Duration,
) -> Result<PasteOutcome, ReplError> {
    let header = link.read_exact_timed(2, header_timeout)?;
    if header.is_empty() {
        return Err(ReplError::timeout("raw-paste window size"));
    }
    let mut window = TransferWindow::from_header(&header)?;
    tracing::debug!("raw-paste window size {}", window.window_size());

    let mut sent = 0;
    while sent < data.len() {
        // Drain what is already buffered; block only when the window is exhausted
        loop {
            let byte = if window.remaining() == 0 {
                match link.read_byte_timed(credit_timeout)? {
                    Some(b) => b,
                    None => return Err(ReplError::timeout("raw-paste flow-control credit")),
                }
            } else if link.bytes_available()? > 0 {
                match link.read_byte_timed(DRAIN_POLL)? {
                    Some(b) => b,
                    None => break,
                }
            } else {
                break;
            };
            if let Inbound::Abort = handle_control(link, &mut window, byte)? {
                return Ok(PasteOutcome::Aborted);
            }
        }

        let n = window.sendable(data.len() - sent);
        link.write_bytes(&data[sent..sent + n])?;
        window.consume(n);
        sent += n;
    }

    link.write_bytes(&[ctrl::EOF])?;

    // Late credits may still be queued ahead of the acknowledgment
    loop {
        match link.read_byte_timed(header_timeout)? {
            Some(ctrl::EOF) => return Ok(PasteOutcome::Completed),
            Some(0x01) => continue,
            Some(other) => {
                return Err(ReplError::Protocol(format!(
                    "raw-paste end acknowledged with {:#04x}",
                    other
                )))
            }
            None => return Err(ReplError::timeout("raw-paste end acknowledgment")),
        }
    }
}
