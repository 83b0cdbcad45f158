//! Serial link
//!
//! Timed, blocking byte I/O over a [`Transport`] with a fixed configuration.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{
    serial::{configure_port, open_port},
    stream::{SerialChannel, TcpChannel, Transport},
    ReplError, DEFAULT_BAUD_RATE,
};

/// Chunk sizes the target handles comfortably
pub mod chunk_size {
    /// Slow or heavily loaded targets
    pub const SMALL: usize = 64;
    /// Default
    pub const MEDIUM: usize = 256;
    /// Native-USB boards
    pub const LARGE: usize = 512;
    /// Fast links with large RX buffers
    pub const VERY_LARGE: usize = 1024;
}

/// Accumulator bound for banner/prompt waits
const ACCUMULATOR_LIMIT: usize = 4096;
/// Tail retained when the accumulator is truncated
const ACCUMULATOR_KEEP: usize = 1024;
/// Longest single blocking read inside a wait loop
const POLL_SLICE: Duration = Duration::from_millis(30);

/// Which REPL protocol the driver speaks by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplProtocol {
    /// Human prompt + paste mode (CircuitPython-style targets)
    #[default]
    Friendly,
    /// Machine raw REPL with raw-paste transfer
    Raw,
}

/// Timeout classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Banners and single acknowledgments
    pub short_ms: u64,
    /// Program output
    pub medium_ms: u64,
    /// Soft reset and slow operations
    pub long_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            short_ms: 1000,
            medium_ms: 5000,
            long_ms: 10000,
        }
    }
}

impl TimeoutConfig {
    /// Short class as a duration
    pub fn short(&self) -> Duration {
        Duration::from_millis(self.short_ms)
    }

    /// Medium class as a duration
    pub fn medium(&self) -> Duration {
        Duration::from_millis(self.medium_ms)
    }

    /// Long class as a duration
    pub fn long(&self) -> Duration {
        Duration::from_millis(self.long_ms)
    }
}

/// Write pacing for targets whose line editor cannot absorb bursts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Delay after every character in paste mode
    pub per_char_us: u64,
    /// Extra delay after every newline in paste mode
    pub per_newline_us: u64,
    /// Gap between chunks of a plain (non raw-paste) raw-REPL transfer
    pub plain_chunk_gap_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            per_char_us: 200,
            per_newline_us: 300,
            plain_chunk_gap_ms: 10,
        }
    }
}

impl PacingConfig {
    /// No pacing at all (simulated targets)
    pub fn none() -> Self {
        Self {
            per_char_us: 0,
            per_newline_us: 0,
            plain_chunk_gap_ms: 0,
        }
    }
}

/// Serial link configuration. Immutable once the link is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port name, or `tcp://host:port` for a network serial adapter
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Timeout classes
    pub timeouts: TimeoutConfig,
    /// Transfer chunk size for file content and plain raw-REPL writes
    pub chunk_size: usize,
    /// Protocol the driver uses for `exec`
    pub protocol: ReplProtocol,
    /// Write pacing
    pub pacing: PacingConfig,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeouts: TimeoutConfig::default(),
            chunk_size: chunk_size::MEDIUM,
            protocol: ReplProtocol::Friendly,
            pacing: PacingConfig::default(),
        }
    }
}

struct Port {
    transport: Box<dyn Transport>,
    /// Bytes read past a needle, served before the transport
    pending: VecDeque<u8>,
}

impl Port {
    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ReplError> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        self.transport
            .read_timeout(buf, timeout)
            .map_err(ReplError::transport)
    }

    fn unread(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.pending.push_front(b);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Raw duplex byte link to the target
pub struct SerialLink {
    port: Mutex<Port>,
    config: SerialConfig,
}

impl SerialLink {
    /// Open the port named in `config`
    pub fn open(config: SerialConfig) -> Result<Self, ReplError> {
        let transport: Box<dyn Transport> =
            if let Some(addr) = config.port_name.strip_prefix("tcp://") {
                Box::new(TcpChannel::connect(addr).map_err(ReplError::transport)?)
            } else {
                let mut port = open_port(&config.port_name, config.baud_rate)?;
                configure_port(port.as_mut())?;
                Box::new(SerialChannel::new(port))
            };
        tracing::info!(
            "Opened {} at {} baud (chunk {})",
            config.port_name,
            config.baud_rate,
            config.chunk_size
        );
        Ok(Self::with_transport(transport, config))
    }

    /// Build a link over an already-open transport
    pub fn with_transport(transport: Box<dyn Transport>, config: SerialConfig) -> Self {
        Self {
            port: Mutex::new(Port {
                transport,
                pending: VecDeque::new(),
            }),
            config,
        }
    }

    /// Settings the link was opened with
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn port(&self) -> MutexGuard<'_, Port> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write every byte or fail; a partial write is never reported as success
    pub fn write_bytes(&self, data: &[u8]) -> Result<(), ReplError> {
        let mut port = self.port();
        let mut sent = 0;
        while sent < data.len() {
            match port.transport.write(&data[sent..]) {
                Ok(0) => {
                    return Err(ReplError::Transport(format!(
                        "transport accepted {} of {} bytes",
                        sent,
                        data.len()
                    )))
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ReplError::transport(e)),
            }
        }
        Ok(())
    }

    /// Discard buffered input
    pub fn flush_input(&self) -> Result<(), ReplError> {
        let mut port = self.port();
        port.pending.clear();
        port.transport.clear_input().map_err(ReplError::transport)
    }

    /// Put bytes back in front of the input queue
    pub(crate) fn unread(&self, bytes: &[u8]) {
        self.port().unread(bytes);
    }

    /// Bytes that can be read right now without blocking
    pub fn bytes_available(&self) -> Result<usize, ReplError> {
        let mut port = self.port();
        let buffered = port.transport.bytes_to_read().map_err(ReplError::transport)?;
        Ok(port.pending.len() + buffered)
    }

    /// One bounded read of whatever arrives within `timeout`
    pub fn read_available(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, ReplError> {
        self.port().read_some(buf, timeout)
    }

    /// Poll for a single byte
    pub fn read_byte_timed(&self, timeout: Duration) -> Result<Option<u8>, ReplError> {
        let got = self.read_exact_timed(1, timeout)?;
        Ok(got.first().copied())
    }

    /// Read up to `n` bytes, returning early with fewer if `timeout` expires
    pub fn read_exact_timed(&self, n: usize, timeout: Duration) -> Result<Vec<u8>, ReplError> {
        let mut port = self.port();
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(n);
        let mut buf = [0u8; 64];
        while out.len() < n {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let want = (n - out.len()).min(buf.len());
            let slice = (deadline - now).min(POLL_SLICE);
            let got = port.read_some(&mut buf[..want], slice)?;
            out.extend_from_slice(&buf[..got]);
        }
        Ok(out)
    }

    /// Wait for `needle`, keeping only a bounded tail of what was seen.
    ///
    /// Returns the retained text up to and including the needle. Anything
    /// that arrived after the needle stays queued for the next read.
    pub fn read_until(&self, needle: &[u8], timeout: Duration) -> Result<Vec<u8>, ReplError> {
        self.read_until_inner(&[needle], timeout, true)
            .map(|(_, text)| text)
    }

    /// Like [`read_until`](Self::read_until) but keeps everything; used to capture program output
    pub fn capture_until(&self, needle: &[u8], timeout: Duration) -> Result<Vec<u8>, ReplError> {
        self.read_until_inner(&[needle], timeout, false)
            .map(|(_, text)| text)
    }

    /// Wait for whichever of `needles` completes first; returns its index and the text
    pub fn read_until_any(
        &self,
        needles: &[&[u8]],
        timeout: Duration,
    ) -> Result<(usize, Vec<u8>), ReplError> {
        self.read_until_inner(needles, timeout, true)
    }

    fn read_until_inner(
        &self,
        needles: &[&[u8]],
        timeout: Duration,
        bounded: bool,
    ) -> Result<(usize, Vec<u8>), ReplError> {
        let mut port = self.port();
        let deadline = Instant::now() + timeout;
        let mut acc: Vec<u8> = Vec::with_capacity(512);
        let mut buf = [0u8; 128];

        loop {
            let now = Instant::now();
            if now >= deadline {
                let wanted: Vec<_> = needles.iter().map(|n| String::from_utf8_lossy(n)).collect();
                return Err(ReplError::timeout(format!("{:?}", wanted)));
            }
            let n = port.read_some(&mut buf, (deadline - now).min(POLL_SLICE))?;
            if n == 0 {
                continue;
            }
            let before = acc.len();
            acc.extend_from_slice(&buf[..n]);

            // Earliest-ending match; only the new bytes plus a needle-length overlap can hold one
            let mut best: Option<(usize, usize)> = None;
            for (i, needle) in needles.iter().enumerate() {
                let from = before.saturating_sub(needle.len().saturating_sub(1));
                if let Some(pos) = find(&acc[from..], needle) {
                    let end = from + pos + needle.len();
                    if best.map_or(true, |(e, _)| end < e) {
                        best = Some((end, i));
                    }
                }
            }
            if let Some((end, i)) = best {
                port.unread(&acc[end..]);
                acc.truncate(end);
                return Ok((i, acc));
            }
            if bounded && acc.len() > ACCUMULATOR_LIMIT {
                acc.drain(..acc.len() - ACCUMULATOR_KEEP);
            }
        }
    }
}
