//! Byte-duplex transports
//!
//! [`Transport`] is the capability the link is built on: write bytes, read with a
//! timeout, ask how much is already buffered, and discard pending input.

use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for communication channels (Serial, TCP or in-memory)
pub trait Transport: Send {
    /// Write bytes, returning how many were accepted
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Get number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Discard any pending input
    fn clear_input(&mut self) -> io::Result<()>;
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Serial port wrapper implementing Transport
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    current_timeout: Option<Duration>,
}

impl SerialChannel {
    /// Wrap an opened and configured port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            current_timeout: None,
        }
    }
}

impl Transport for SerialChannel {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.port.write(data)?;
        self.port.flush()?;
        Ok(n)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        // serialport rejects a zero timeout on some platforms
        let timeout = timeout.max(Duration::from_millis(1));
        if self.current_timeout != Some(timeout) {
            self.port
                .set_timeout(timeout)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            self.current_timeout = Some(timeout);
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if is_timeout(e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// TCP stream wrapper implementing Transport (serial-over-network adapters)
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Connect to `host:port`
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl Transport for TcpChannel {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(data)?;
        self.stream.flush()?;
        Ok(n)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "TCP peer closed the connection",
            )),
            Ok(n) => Ok(n),
            Err(ref e) if is_timeout(e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.stream.set_nonblocking(true)?;
        // peek() returns min(available, buffer size)
        let mut buf = [0u8; 8192];
        let result = self.stream.peek(&mut buf);
        self.stream.set_nonblocking(false)?;

        match result {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        // No "clear buffer" syscall for sockets: drain until WouldBlock
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let _ = self.stream.set_nonblocking(false);
                    return Err(e);
                }
            }
        }
        self.stream.set_nonblocking(false)?;
        Ok(())
    }
}

/// Simulated device: sees every written chunk and may queue bytes to be read back
pub type DeviceFn = Box<dyn FnMut(&[u8], &mut VecDeque<u8>) + Send>;

struct MemoryState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    device: Option<DeviceFn>,
    fail_writes: bool,
    accept_limit: Option<usize>,
}

/// In-memory transport.
///
/// Clones share the same buffers, so one clone can be handed to a link while
/// another feeds inbound bytes and inspects what was written.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Transport with empty buffers and no device
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                inbound: VecDeque::new(),
                written: Vec::new(),
                device: None,
                fail_writes: false,
                accept_limit: None,
            })),
        }
    }

    /// Create a transport whose writes are answered by `device`
    pub fn with_device<F>(device: F) -> Self
    where
        F: FnMut(&[u8], &mut VecDeque<u8>) + Send + 'static,
    {
        let transport = Self::new();
        transport.state().device = Some(Box::new(device));
        transport
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes for the reader
    pub fn push_inbound(&self, data: &[u8]) {
        self.state().inbound.extend(data.iter().copied());
    }

    /// Everything written so far
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    /// Take and clear the written log
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().written)
    }

    /// Number of inbound bytes not yet read
    pub fn pending_inbound(&self) -> usize {
        self.state().inbound.len()
    }

    /// Make every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Accept at most `limit` bytes per write call
    pub fn set_accept_limit(&self, limit: Option<usize>) {
        self.state().accept_limit = limit;
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
        }
        let n = state.accept_limit.map_or(data.len(), |l| l.min(data.len()));
        let accepted = &data[..n];
        state.written.extend_from_slice(accepted);
        let MemoryState {
            inbound, device, ..
        } = &mut *state;
        if let Some(device) = device.as_mut() {
            device(accepted, inbound);
        }
        Ok(n)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        {
            let mut state = self.state();
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(0)
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.state().inbound.len())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state().inbound.clear();
        Ok(())
    }
}
