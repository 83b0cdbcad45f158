//! Mode arbitration across threads

mod common;

use common::{driver_for, friendly_board};
use pretty_assertions::assert_eq;
use replbridge_core::arbiter::{LinkPromptWaiter, ModeArbiter, ReplMode};
use replbridge_core::protocol::{MemoryTransport, ReplProtocol};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn arbiter_over(mem: &MemoryTransport) -> ModeArbiter {
    ModeArbiter::new(driver_for(mem, ReplProtocol::Friendly))
}

#[test]
fn test_terminal_never_reads_during_controlled_operation() {
    let arbiter = Arc::new(arbiter_over(&MemoryTransport::new()));
    let controlled_active = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let grants = Arc::new(AtomicUsize::new(0));

    let terminal = {
        let arbiter = Arc::clone(&arbiter);
        let controlled_active = Arc::clone(&controlled_active);
        let stop = Arc::clone(&stop);
        let grants = Arc::clone(&grants);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if let Some(_grant) = arbiter.try_terminal() {
                    assert!(!controlled_active.load(Ordering::SeqCst));
                    grants.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(200));
                }
            }
        })
    };

    for _ in 0..20 {
        let guard = arbiter.acquire_controlled("stress");
        controlled_active.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(2));
        controlled_active.store(false, Ordering::SeqCst);
        drop(guard);
        thread::sleep(Duration::from_millis(2));
    }

    stop.store(true, Ordering::SeqCst);
    terminal.join().unwrap();
    assert!(grants.load(Ordering::SeqCst) > 0);
    assert_eq!(arbiter.mode(), ReplMode::Terminal);
}

#[test]
fn test_controlled_operations_serialize() {
    let arbiter = Arc::new(arbiter_over(&MemoryTransport::new()));
    let inside = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let arbiter = Arc::clone(&arbiter);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                for _ in 0..10 {
                    let _guard = arbiter.acquire_controlled("worker");
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_micros(100));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(arbiter.mode(), ReplMode::Terminal);
}

#[test]
fn test_exec_through_arbiter_returns_to_terminal() {
    let mem = friendly_board(|_| "3\r\n".to_string());
    let arbiter = arbiter_over(&mem);

    let result = arbiter.exec("print(1 + 2)").unwrap();
    assert_eq!(result.stdout, "3");
    assert_eq!(arbiter.mode(), ReplMode::Terminal);
    assert!(arbiter.try_terminal().is_some());
}

#[test]
fn test_fs_holds_link_until_dropped() {
    let arbiter = arbiter_over(&MemoryTransport::new());
    let fs = arbiter.fs("listing");
    assert_eq!(arbiter.mode(), ReplMode::Controlled);
    assert!(arbiter.try_acquire_controlled("other").is_none());
    drop(fs);
    assert!(arbiter.try_acquire_controlled("other").is_some());
}

#[test]
fn test_ensure_idle_against_friendly_board() {
    let mem = friendly_board(|_| String::new());
    let driver = driver_for(&mem, ReplProtocol::Friendly);
    let waiter = LinkPromptWaiter::new(Arc::clone(driver.link()));
    let arbiter = ModeArbiter::new(driver).with_prompt_waiter(waiter);

    assert!(arbiter.ensure_idle(Duration::from_millis(500)).unwrap());
    assert_eq!(mem.written(), vec![0x03, 0x04, 0x03]);
    assert_eq!(arbiter.mode(), ReplMode::Terminal);
}
