//! Serial to network bridge
//!
//! Moves terminal traffic between the serial link and a single network
//! session. A reader thread pulls serial bytes into a bounded [`StreamBuffer`]
//! whenever the [`ModeArbiter`] grants a terminal burst; a sender task drains
//! the buffer into frames, coalescing and pacing them, and hands them to a
//! [`FrameSink`].

mod buffer;

pub use buffer::StreamBuffer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::arbiter::{ModeArbiter, ReplMode};
use crate::protocol::ReplError;

/// Identifier the network layer uses for a connected peer
pub type PeerId = u64;

/// Bridge tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Capacity of the serial-to-network buffer
    pub buffer_capacity: usize,
    /// Largest single serial read
    pub read_chunk: usize,
    /// Timeout of one serial read burst
    pub read_wait_ms: u64,
    /// Largest outbound frame
    pub max_frame: usize,
    /// Minimum gap between outbound frames
    pub min_frame_gap_ms: u64,
    /// Sleep while no session is active
    pub idle_poll_ms: u64,
    /// Sleep after the arbiter declines a terminal burst
    pub declined_poll_ms: u64,
    /// Back-off after a failed send
    pub send_retry_ms: u64,
    /// How long the sender waits for buffered data per cycle
    pub receive_wait_ms: u64,
    /// How long keyboard input waits for a read burst to release the link
    pub input_wait_ms: u64,
    /// Sent through the normal pipeline when a session opens
    pub greeting: String,
    /// Sent back to the peer when it types during a controlled operation
    pub busy_notice: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 16 * 1024,
            read_chunk: 512,
            read_wait_ms: 20,
            max_frame: 1024,
            min_frame_gap_ms: 16,
            idle_poll_ms: 20,
            declined_poll_ms: 5,
            send_retry_ms: 10,
            receive_wait_ms: 50,
            input_wait_ms: 100,
            greeting: ">> REPL ready (session connected)\r\n".to_string(),
            busy_notice: "[serial link busy with a controlled operation]\r\n".to_string(),
        }
    }
}

/// Frames exchanged with the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw terminal bytes
    Binary(Vec<u8>),
    /// UTF-8 text; inbound text is forwarded like binary
    Text(String),
    /// Close the connection
    Close {
        /// Shown to the peer
        reason: String,
    },
}

/// Why a frame could not be sent
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Outbound queue is full; worth retrying later
    #[error("send queue full")]
    Busy,
    /// The peer is gone
    #[error("peer disconnected: {0}")]
    Closed(String),
}

/// Outbound half of the network layer
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver `frame` to `peer`
    async fn send_frame(&self, peer: PeerId, frame: Frame) -> Result<(), SinkError>;
}

/// The one live network session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Network peer that owns the session
    pub peer: PeerId,
    /// Unique per opened session, even if a peer id is reused
    pub id: Uuid,
    /// When the session was accepted
    pub opened_at: DateTime<Utc>,
}

impl Session {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
        }
    }
}

/// Traffic counters
#[derive(Debug, Default)]
pub struct BridgeStats {
    serial_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_out: AtomicU64,
    send_failures: AtomicU64,
    busy_rejections: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Bytes read from the serial link
    pub serial_in: u64,
    /// Frames delivered to the sink
    pub frames_out: u64,
    /// Bytes delivered to the sink
    pub bytes_out: u64,
    /// Bytes discarded by the full buffer
    pub dropped: u64,
    /// Sends refused by the sink
    pub send_failures: u64,
    /// Inbound writes answered with the busy notice
    pub busy_rejections: u64,
}

struct Shared {
    arbiter: Arc<ModeArbiter>,
    sink: Arc<dyn FrameSink>,
    config: BridgeConfig,
    buffer: StreamBuffer,
    session: watch::Sender<Option<Session>>,
    stats: BridgeStats,
    cancel: CancellationToken,
}

impl Shared {
    fn active_peer(&self) -> Option<PeerId> {
        self.session.borrow().as_ref().map(|s| s.peer)
    }

    fn end_session(&self, peer: PeerId) -> bool {
        self.session.send_if_modified(|current| match current {
            Some(s) if s.peer == peer => {
                *current = None;
                true
            }
            _ => false,
        })
    }
}

/// Serial/network bridge
pub struct Bridge {
    shared: Arc<Shared>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    sender: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Bridge {
    /// Create a bridge; no loops run until [`start`](Self::start)
    pub fn new(arbiter: Arc<ModeArbiter>, sink: Arc<dyn FrameSink>, config: BridgeConfig) -> Self {
        let (session, _) = watch::channel(None);
        let buffer = StreamBuffer::new(config.buffer_capacity);
        Self {
            shared: Arc::new(Shared {
                arbiter,
                sink,
                config,
                buffer,
                session,
                stats: BridgeStats::default(),
                cancel: CancellationToken::new(),
            }),
            reader: Mutex::new(None),
            sender: Mutex::new(None),
        }
    }

    /// Spawn the reader thread and the sender task. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), ReplError> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if reader.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || reader_loop(shared))?;
        *reader = Some(handle);

        let shared = Arc::clone(&self.shared);
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(tokio::spawn(sender_loop(shared)));

        tracing::info!("Bridge started");
        Ok(())
    }

    /// Stop both loops and wait for them to finish
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            if let Err(e) = sender.await {
                tracing::warn!("Sender task ended abnormally: {}", e);
            }
        }

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            let joined = tokio::task::spawn_blocking(move || reader.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!("Reader thread ended abnormally");
            }
        }
        tracing::info!("Bridge stopped");
    }

    /// Tuning this bridge was built with
    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Serial-to-network buffer
    pub fn buffer(&self) -> &StreamBuffer {
        &self.shared.buffer
    }

    /// Current session, if any
    pub fn session(&self) -> Option<Session> {
        self.shared.session.borrow().clone()
    }

    /// Watch session changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.shared.session.subscribe()
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.shared.stats;
        StatsSnapshot {
            serial_in: s.serial_in.load(Ordering::Relaxed),
            frames_out: s.frames_out.load(Ordering::Relaxed),
            bytes_out: s.bytes_out.load(Ordering::Relaxed),
            dropped: self.shared.buffer.dropped(),
            send_failures: s.send_failures.load(Ordering::Relaxed),
            busy_rejections: s.busy_rejections.load(Ordering::Relaxed),
        }
    }

    /// Accept a new peer, or refuse it with a close frame if one is already connected
    pub async fn open_session(&self, peer: PeerId) -> Option<Session> {
        let candidate = Session::new(peer);
        let accepted = self.shared.session.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(candidate.clone());
                true
            }
        });

        if !accepted {
            tracing::warn!("Refusing peer {}: a session is already active", peer);
            let close = Frame::Close {
                reason: "another session is already active".to_string(),
            };
            if let Err(e) = self.shared.sink.send_frame(peer, close).await {
                tracing::debug!("Close frame to refused peer {} failed: {}", peer, e);
            }
            return None;
        }

        self.shared.arbiter.set_mode_terminal();
        self.shared.buffer.clear();
        self.shared.buffer.push(self.shared.config.greeting.as_bytes());
        tracing::info!("Session {} opened for peer {}", candidate.id, peer);
        Some(candidate)
    }

    /// End the session of `peer`; returns false if it was not the active one
    pub fn close_session(&self, peer: PeerId) -> bool {
        let closed = self.shared.end_session(peer);
        if closed {
            tracing::info!("Session for peer {} closed", peer);
        }
        closed
    }

    /// Handle a frame received from `peer`
    pub async fn handle_frame(&self, peer: PeerId, frame: Frame) -> Result<(), ReplError> {
        match frame {
            Frame::Binary(data) => self.handle_inbound(peer, data).await,
            Frame::Text(text) => self.handle_inbound(peer, text.into_bytes()).await,
            Frame::Close { .. } => {
                self.close_session(peer);
                Ok(())
            }
        }
    }

    /// Forward keyboard input to the target, or answer with a busy notice
    pub async fn handle_inbound(&self, peer: PeerId, data: Vec<u8>) -> Result<(), ReplError> {
        if self.shared.active_peer() != Some(peer) {
            tracing::debug!("Ignoring input from inactive peer {}", peer);
            return Ok(());
        }

        if !self.send_to_serial(data).await? {
            self.shared
                .stats
                .busy_rejections
                .fetch_add(1, Ordering::Relaxed);
            let notice = Frame::Text(self.shared.config.busy_notice.clone());
            if let Err(e) = self.shared.sink.send_frame(peer, notice).await {
                tracing::debug!("Busy notice to peer {} failed: {}", peer, e);
            }
        }
        Ok(())
    }

    /// Write bytes to the serial link under a terminal grant.
    ///
    /// Returns `Ok(false)` without writing while a controlled operation owns
    /// the link.
    pub async fn send_to_serial(&self, data: Vec<u8>) -> Result<bool, ReplError> {
        if data.is_empty() {
            return Ok(true);
        }
        if self.shared.arbiter.mode() != ReplMode::Terminal {
            return Ok(false);
        }
        let arbiter = Arc::clone(&self.shared.arbiter);
        let wait = Duration::from_millis(self.shared.config.input_wait_ms);
        let written = tokio::task::spawn_blocking(move || arbiter.write_terminal(&data, wait))
            .await
            .map_err(|e| ReplError::Transport(format!("serial write task failed: {}", e)))?;
        if let Err(e) = &written {
            tracing::warn!("Serial write from session failed: {}", e);
        }
        written
    }
}

fn reader_loop(shared: Arc<Shared>) {
    let config = &shared.config;
    let idle = Duration::from_millis(config.idle_poll_ms);
    let declined = Duration::from_millis(config.declined_poll_ms);
    let read_wait = Duration::from_millis(config.read_wait_ms);
    let mut buf = vec![0u8; config.read_chunk.max(1)];

    tracing::debug!("Serial reader running");
    while !shared.cancel.is_cancelled() {
        if shared.active_peer().is_none() {
            thread::sleep(idle);
            continue;
        }

        let Some(grant) = shared.arbiter.try_terminal() else {
            thread::sleep(declined);
            continue;
        };
        let read = grant.link().read_available(&mut buf, read_wait);
        drop(grant);

        match read {
            Ok(0) => {}
            Ok(n) => {
                shared.stats.serial_in.fetch_add(n as u64, Ordering::Relaxed);
                shared.buffer.push(&buf[..n]);
            }
            Err(e) => {
                tracing::warn!("Serial read failed: {}", e);
                thread::sleep(idle);
            }
        }
    }
    tracing::debug!("Serial reader stopped");
}

async fn sender_loop(shared: Arc<Shared>) {
    let config = &shared.config;
    let idle = Duration::from_millis(config.idle_poll_ms);
    let receive_wait = Duration::from_millis(config.receive_wait_ms);
    let retry = Duration::from_millis(config.send_retry_ms);
    let gap = Duration::from_millis(config.min_frame_gap_ms);

    tracing::debug!("Frame sender running");
    loop {
        if shared.active_peer().is_none() {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
            continue;
        }

        let chunk = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            chunk = shared.buffer.recv(config.max_frame, receive_wait) => chunk,
        };
        if chunk.is_empty() {
            continue;
        }
        // The session may have changed while we waited
        let Some(peer) = shared.active_peer() else {
            tracing::debug!("Session ended, dropping {} bytes", chunk.len());
            continue;
        };

        let len = chunk.len() as u64;
        match shared.sink.send_frame(peer, Frame::Binary(chunk)).await {
            Ok(()) => {
                shared.stats.frames_out.fetch_add(1, Ordering::Relaxed);
                shared.stats.bytes_out.fetch_add(len, Ordering::Relaxed);
                tokio::time::sleep(gap).await;
            }
            Err(SinkError::Busy) => {
                shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Send queue full, dropping {} bytes", len);
                tokio::time::sleep(retry).await;
            }
            Err(SinkError::Closed(reason)) => {
                shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Peer {} gone ({}), ending session", peer, reason);
                shared.end_session(peer);
            }
        }
    }
    tracing::debug!("Frame sender stopped");
}
