// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! A single-threaded reactor combining readiness-driven I/O multiplexing, a monotonic
//! timer heap, and a deferred pending-event queue, for embedding in a larger
//! application's own event loop.
//!
//! The moving parts, leaves first:
//!
//! - [`clock`] - monotonic time plus a cheap, interpolated wall-clock estimate.
//! - [`backend`] - the OS readiness multiplexer ([`backend::MioBackend`] by default).
//! - [`timer`] - the min-heap of timer watchers.
//! - [`watcher`] - caller-owned watcher types and the handles `start` returns.
//! - [`reactor`] - the loop driver tying the above together.
//!
//! This crate does not install a logging subscriber; it emits [`tracing`] spans and
//! events and leaves wiring a subscriber to the embedding binary.
//!
//! # Example
//!
//! ```no_run
//! use reactor_core::events::TIMER;
//! use reactor_core::reactor::Reactor;
//! use reactor_core::watcher::TimerWatcher;
//!
//! let mut reactor = Reactor::new()?;
//! reactor.timer_start(TimerWatcher::new(1_000, 0, |revents, reactor| {
//!     assert_eq!(revents, TIMER);
//!     reactor.quit();
//! }))?;
//! reactor.run(|_| true)?;
//! # Ok::<(), reactor_core::error::ReactorError>(())
//! ```

#![forbid(unsafe_code)]

pub mod backend;
pub mod clock;
pub mod error;
pub mod events;
pub mod reactor;
pub mod timer;
pub mod watcher;

pub use error::{ReactorError, Result};
pub use reactor::{Handle, Reactor, ReactorConfig};
