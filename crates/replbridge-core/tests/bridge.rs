//! Bridge loops running against an in-memory link

mod common;

use async_trait::async_trait;
use common::driver_for;
use pretty_assertions::assert_eq;
use replbridge_core::arbiter::ModeArbiter;
use replbridge_core::bridge::{Bridge, BridgeConfig, Frame, FrameSink, PeerId, SinkError};
use replbridge_core::protocol::{MemoryTransport, ReplProtocol};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Records delivered frames; replies come from a script, then `Ok`
#[derive(Default)]
struct ScriptedSink {
    frames: Mutex<Vec<(PeerId, Frame)>>,
    replies: Mutex<VecDeque<Result<(), SinkError>>>,
}

impl ScriptedSink {
    fn replying(replies: Vec<Result<(), SinkError>>) -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            replies: Mutex::new(replies.into()),
        }
    }

    fn binary(&self) -> Vec<u8> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, f)| match f {
                Frame::Binary(data) => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn binary_for(&self, peer: PeerId) -> Vec<u8> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(p, f)| match f {
                Frame::Binary(data) if *p == peer => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn others(&self) -> Vec<(PeerId, Frame)> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, f)| !matches!(f, Frame::Binary(_)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FrameSink for ScriptedSink {
    async fn send_frame(&self, peer: PeerId, frame: Frame) -> Result<(), SinkError> {
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if reply.is_ok() {
            self.frames.lock().unwrap().push((peer, frame));
        }
        reply
    }
}

fn setup(sink: ScriptedSink) -> (Bridge, Arc<ScriptedSink>, Arc<ModeArbiter>, MemoryTransport) {
    let mem = MemoryTransport::new();
    let arbiter = Arc::new(ModeArbiter::new(driver_for(&mem, ReplProtocol::Friendly)));
    let sink = Arc::new(sink);
    let bridge = Bridge::new(Arc::clone(&arbiter), sink.clone(), BridgeConfig::default());
    (bridge, sink, arbiter, mem)
}

async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serial_output_reaches_session() {
    let (bridge, sink, _arbiter, mem) = setup(ScriptedSink::default());
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();

    let echo = b">>> print(1)\r\n1\r\n";
    mem.push_inbound(echo);
    let mut expected = BridgeConfig::default().greeting.into_bytes();
    expected.extend_from_slice(echo);
    assert!(wait_for(|| sink.binary() == expected).await);

    let stats = bridge.stats();
    assert_eq!(stats.serial_in, echo.len() as u64);
    assert_eq!(stats.bytes_out, expected.len() as u64);
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_reads_while_controlled() {
    let (bridge, sink, arbiter, mem) = setup(ScriptedSink::default());
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();
    let greeting = BridgeConfig::default().greeting.into_bytes();
    assert!(wait_for(|| sink.binary() == greeting).await);

    let guard = arbiter.acquire_controlled("test");
    mem.push_inbound(b"owned by exec");
    sleep(Duration::from_millis(150)).await;
    assert_eq!(mem.pending_inbound(), 13);
    assert_eq!(sink.binary(), greeting);
    drop(guard);

    assert!(wait_for(|| sink.binary().ends_with(b"owned by exec")).await);
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_reads_without_session() {
    let (bridge, sink, _arbiter, mem) = setup(ScriptedSink::default());
    bridge.start().unwrap();

    mem.push_inbound(b"boot noise");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(mem.pending_inbound(), 10);
    assert!(sink.frames.lock().unwrap().is_empty());
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_sink_drops_chunk_and_keeps_session() {
    let (bridge, sink, _arbiter, mem) = setup(ScriptedSink::replying(vec![Err(SinkError::Busy)]));
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();

    assert!(wait_for(|| bridge.stats().send_failures == 1).await);
    mem.push_inbound(b"after");
    assert!(wait_for(|| sink.binary() == b"after").await);
    assert!(bridge.session().is_some());
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_sink_ends_session() {
    let (bridge, _sink, _arbiter, _mem) = setup(ScriptedSink::replying(vec![Err(
        SinkError::Closed("connection reset".to_string()),
    )]));
    let mut sessions = bridge.subscribe();
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let current = sessions.borrow_and_update().clone();
            if current.is_none() {
                break;
            }
            if sessions.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    assert!(bridge.session().is_none());

    // A new peer is accepted once the old session is gone
    assert!(bridge.open_session(2).await.is_some());
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_loops() {
    let (bridge, sink, _arbiter, mem) = setup(ScriptedSink::default());
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();
    assert!(wait_for(|| !sink.binary().is_empty()).await);

    tokio::time::timeout(Duration::from_secs(3), bridge.shutdown())
        .await
        .unwrap();

    mem.push_inbound(b"late");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(mem.pending_inbound(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keyboard_input_written_to_link() {
    let (bridge, _sink, _arbiter, mem) = setup(ScriptedSink::default());
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();

    bridge
        .handle_frame(1, Frame::Binary(vec![0x03]))
        .await
        .unwrap();
    bridge
        .handle_frame(2, Frame::Text("ignored".to_string()))
        .await
        .unwrap();
    assert_eq!(mem.written(), vec![0x03]);
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_peer_refused_session_kept() {
    let (bridge, sink, _arbiter, _mem) = setup(ScriptedSink::default());
    bridge.start().unwrap();
    let first = bridge.open_session(1).await.unwrap();

    assert!(bridge.open_session(2).await.is_none());
    assert_eq!(bridge.session(), Some(first));

    let others = sink.others();
    assert_eq!(others.len(), 1);
    assert!(matches!(&others[0], (2, Frame::Close { .. })));

    // Peer 1 keeps receiving
    let greeting = BridgeConfig::default().greeting.into_bytes();
    assert!(wait_for(|| sink.binary_for(1) == greeting).await);
    assert!(sink.binary_for(2).is_empty());
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_input_during_controlled_gets_busy_notice() {
    let (bridge, sink, arbiter, mem) = setup(ScriptedSink::default());
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();

    let guard = arbiter.acquire_controlled("exec");
    bridge
        .handle_frame(1, Frame::Binary(b"import os\r".to_vec()))
        .await
        .unwrap();
    assert!(mem.written().is_empty());
    drop(guard);

    assert_eq!(
        sink.others(),
        vec![(1, Frame::Text(BridgeConfig::default().busy_notice))]
    );
    assert_eq!(bridge.stats().busy_rejections, 1);

    // Once released, input goes through again
    bridge
        .handle_frame(1, Frame::Binary(b"\r".to_vec()))
        .await
        .unwrap();
    assert_eq!(mem.written(), b"\r".to_vec());
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_input_never_interleaves_controlled_writes() {
    let (bridge, _sink, arbiter, mem) = setup(ScriptedSink::default());
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();

    let controller = {
        let arbiter = Arc::clone(&arbiter);
        std::thread::spawn(move || {
            for _ in 0..20 {
                let mut guard = arbiter.acquire_controlled("exec");
                guard.write_raw(b"[").unwrap();
                std::thread::sleep(Duration::from_millis(2));
                guard.write_raw(b"]").unwrap();
                drop(guard);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };
    for _ in 0..40 {
        bridge
            .handle_frame(1, Frame::Binary(b"k".to_vec()))
            .await
            .unwrap();
        sleep(Duration::from_millis(1)).await;
    }
    controller.join().unwrap();

    // Keystrokes only ever land between a controlled op's bytes
    let mut inside = false;
    for byte in mem.written() {
        match byte {
            b'[' => inside = true,
            b']' => inside = false,
            b'k' => assert!(!inside, "keystroke written during a controlled operation"),
            _ => {}
        }
    }
    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reopened_session_gets_its_own_output() {
    let (bridge, sink, _arbiter, _mem) = setup(ScriptedSink::default());
    let greeting = BridgeConfig::default().greeting.into_bytes();
    bridge.start().unwrap();
    bridge.open_session(1).await.unwrap();
    assert!(wait_for(|| sink.binary_for(1) == greeting).await);

    // The sender is now parked waiting for data on behalf of peer 1
    sleep(Duration::from_millis(20)).await;
    assert!(bridge.close_session(1));
    bridge.open_session(2).await.unwrap();

    assert!(wait_for(|| sink.binary_for(2) == greeting).await);
    assert_eq!(sink.binary_for(1), greeting);
    bridge.shutdown().await;
}
