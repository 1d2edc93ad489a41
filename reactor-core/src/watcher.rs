// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! Caller-facing watcher types and the handles returned by `start`.
//!
//! The source this engine is modeled on keeps a raw back-pointer from each watcher to
//! its owning loop. That pattern does not survive translation into Rust's ownership
//! model without `unsafe`, so instead: `io_start`/`timer_start` take ownership of a
//! caller-built [`IoWatcher`]/[`TimerWatcher`] (fd/delay, requested events, callback)
//! and hand back an opaque [`IoHandle`]/[`TimerHandle`] - a slot index plus a generation
//! counter. `stop` consumes the handle and hands ownership of the callback back. A
//! handle from a stopped or recycled slot is rejected rather than silently aliasing a
//! newer watcher, the same staleness check `RRTLiveness`'s generation counter performs
//! across thread relaunches.

use std::os::unix::io::RawFd;

use crate::events::Revents;
use crate::reactor::Reactor;

/// Opaque reference to a live I/O registration, returned by `io_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle {
    pub(crate) fd: RawFd,
    pub(crate) generation: u32,
}

/// Opaque reference to a live timer registration, returned by `timer_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

/// A type-erased, repeatable callback invoked with the accumulated `revents` for a
/// dispatch.
///
/// The callback receives `&mut Reactor`, not a captured reference to one: the reactor
/// owns the callback for the lifetime of the registration, so a closure cannot also
/// capture a handle back to its owner without a `Rc<RefCell<_>>` cycle. Passing the
/// reactor in as an argument at call time is what lets a callback freely start/stop
/// other watchers (§4.5.1) without that indirection.
///
/// Not `Send`: the reactor runs on a single thread and never moves a callback across
/// one, so a watcher is free to close over `Rc<RefCell<_>>`-shared state with other
/// watchers on the same reactor.
pub type Callback = Box<dyn FnMut(Revents, &mut Reactor) + 'static>;

/// A caller-owned descriptor registration, ready to be handed to `io_start`.
pub struct IoWatcher {
    pub(crate) fd: RawFd,
    pub(crate) events: Revents,
    pub(crate) callback: Callback,
}

impl IoWatcher {
    /// Builds a watcher for `fd`, requesting `events` (a combination of
    /// [`crate::events::READ`]/[`crate::events::WRITE`]), invoking `callback` on
    /// dispatch.
    pub fn new(fd: RawFd, events: Revents, callback: impl FnMut(Revents, &mut Reactor) + 'static) -> Self {
        Self { fd, events, callback: Box::new(callback) }
    }
}

impl std::fmt::Debug for IoWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoWatcher")
            .field("fd", &self.fd)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// A caller-owned timer registration, ready to be handed to `timer_start`.
pub struct TimerWatcher {
    pub(crate) delay_ms: i64,
    pub(crate) repeat_ms: i64,
    pub(crate) callback: Callback,
}

impl TimerWatcher {
    /// Builds a one-shot or repeating timer. `delay_ms` is relative to the moment
    /// `timer_start` is called; `repeat_ms` of `0` means fire once.
    pub fn new(delay_ms: i64, repeat_ms: i64, callback: impl FnMut(Revents, &mut Reactor) + 'static) -> Self {
        Self { delay_ms, repeat_ms, callback: Box::new(callback) }
    }
}

impl std::fmt::Debug for TimerWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWatcher")
            .field("delay_ms", &self.delay_ms)
            .field("repeat_ms", &self.repeat_ms)
            .finish_non_exhaustive()
    }
}
