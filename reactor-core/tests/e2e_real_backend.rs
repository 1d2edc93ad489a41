// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! End-to-end scenarios driven against the real `mio`-backed reactor (no test double),
//! using Unix domain sockets so they run without root or network access.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reactor_core::events::{READ, Revents, TIMER, WRITE};
use reactor_core::reactor::Reactor;
use reactor_core::watcher::{IoWatcher, TimerWatcher};

#[test]
fn fire_once_timer_fires_within_its_window() {
    let mut reactor = Reactor::new().unwrap();
    let fired_at = Arc::new(Mutex::new(None));
    let fired_at_clone = Arc::clone(&fired_at);
    let start = Instant::now();

    reactor
        .timer_start(TimerWatcher::new(50, 0, move |revents, reactor| {
            assert_eq!(revents, TIMER);
            *fired_at_clone.lock().unwrap() = Some(start.elapsed());
            reactor.quit();
        }))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    reactor.run(|_| Instant::now() < deadline).unwrap();

    let elapsed = fired_at.lock().unwrap().expect("timer never fired");
    assert!(elapsed >= Duration::from_millis(50), "fired too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired too late: {elapsed:?}");
    assert_eq!(reactor.timer_count(), 0);
}

#[test]
fn coalesced_read_write_over_a_real_socket_dispatches_once() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.write_all(b"ping").unwrap();

    let mut reactor = Reactor::new().unwrap();
    let calls: Arc<Mutex<Vec<Revents>>> = Arc::new(Mutex::new(Vec::new()));
    let calls_clone = Arc::clone(&calls);
    let fd = a.as_raw_fd();

    reactor
        .io_start(IoWatcher::new(fd, READ | WRITE, move |revents, reactor| {
            calls_clone.lock().unwrap().push(revents);
            reactor.quit();
        }))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    reactor.run(|_| Instant::now() < deadline).unwrap();

    let seen = calls.lock().unwrap();
    assert_eq!(seen.len(), 1, "expected exactly one coalesced dispatch, got {:?}", *seen);
    assert_eq!(seen[0] & READ, READ, "missing READ bit in {:#x}", seen[0]);
    assert_eq!(seen[0] & WRITE, WRITE, "missing WRITE bit in {:#x}", seen[0]);
}

#[test]
fn stop_before_first_tick_means_the_callback_never_runs() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let (mut a, mut b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();

    let mut reactor = Reactor::new().unwrap();
    let fd = a.as_raw_fd();
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_clone = Arc::clone(&invoked);
    let handle = reactor
        .io_start(IoWatcher::new(fd, READ, move |_, _| invoked_clone.store(true, Ordering::SeqCst)))
        .unwrap();
    reactor.io_stop(handle);

    // Make the fd ready; since the watcher was stopped before any tick boundary (the
    // start/stop round-trip law), the backend must never have been told to watch it, so
    // this readiness is never observed.
    b.write_all(b"ping").unwrap();

    let mut ticks = 0;
    reactor
        .run(|_| {
            ticks += 1;
            ticks < 3
        })
        .unwrap();

    assert!(!invoked.load(Ordering::SeqCst));
}

#[test]
fn periodic_timer_catches_up_without_bursting() {
    let mut reactor = Reactor::new().unwrap();
    let fires = Arc::new(Mutex::new(0u32));
    let fires_clone = Arc::clone(&fires);

    reactor
        .timer_start(TimerWatcher::new(10, 10, move |revents, _reactor| {
            assert_eq!(revents, TIMER);
            let mut n = fires_clone.lock().unwrap();
            *n += 1;
            // Make the loop run badly late exactly once, long enough to miss several
            // 10 ms intervals in a row.
            if *n == 1 {
                std::thread::sleep(Duration::from_millis(55));
            }
        }))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    reactor
        .run(|_| *fires.lock().unwrap() < 2 && Instant::now() < deadline)
        .unwrap();

    // If the missed intervals were replayed one at a time instead of snapped forward,
    // this tick would have dispatched five or six times instead of once.
    assert_eq!(*fires.lock().unwrap(), 2);
    assert_eq!(reactor.timer_count(), 1);
}
