// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! Error taxonomy for the reactor core.
//!
//! Programmer errors (starting an already-active watcher, a negative timer repeat) are
//! returned here rather than panicking, so embedders can decide their own fail-fast
//! policy; debug builds additionally `debug_assert!` at the call site. Backend failures
//! that leave the reactor's internal state unrecoverable are also modeled here, but are
//! not meant to be caught and handled - see [`crate::reactor::Reactor::run`].

use std::io;

use miette::Diagnostic;
use thiserror::Error;

/// Everything that can go wrong at a reactor API boundary.
#[derive(Debug, Error, Diagnostic)]
pub enum ReactorError {
    /// `io_start` was called with a descriptor the platform cannot represent.
    #[error("file descriptor {fd} is out of the representable range")]
    #[diagnostic(
        code(reactor_core::fd_out_of_range),
        help("descriptors must fit in a non-negative platform `RawFd`")
    )]
    FdOutOfRange {
        /// The offending descriptor value, widened for display.
        fd: i64,
    },

    /// `io_start`/`timer_start` was called on a watcher handle that is already active.
    #[error("watcher is already active")]
    #[diagnostic(
        code(reactor_core::watcher_already_active),
        help("call stop() before starting the same watcher again")
    )]
    WatcherAlreadyActive,

    /// `timer_start` was called with a negative repeat interval.
    #[error("timer repeat interval must be non-negative, got {repeat_ms} ms")]
    #[diagnostic(
        code(reactor_core::invalid_timer_repeat),
        help("use 0 for a one-shot timer")
    )]
    InvalidTimerRepeat {
        /// The rejected repeat value, in milliseconds.
        repeat_ms: i64,
    },

    /// A [`crate::reactor::ReactorConfig`] had `backend_min_tm_ms > backend_max_tm_ms`,
    /// which would make every tick's `wait_time.clamp(min, max)` panic.
    #[error("backend_min_tm_ms ({backend_min_tm_ms}) must not exceed backend_max_tm_ms ({backend_max_tm_ms})")]
    #[diagnostic(
        code(reactor_core::invalid_config),
        help("swap the two values, or leave one at its `ReactorConfig::default()` setting")
    )]
    InvalidConfig {
        /// The rejected floor, in milliseconds.
        backend_min_tm_ms: i64,
        /// The rejected ceiling, in milliseconds.
        backend_max_tm_ms: i64,
    },

    /// The readiness backend failed in a way that is not covered by the descriptor-
    /// recycling recovery rules. The reactor's invariants can no longer be trusted past
    /// this point.
    #[error("readiness backend failed fatally")]
    #[diagnostic(
        code(reactor_core::backend_fatal),
        help(
            "this usually means a kernel resource limit was hit (check `ulimit -n`) or \
             the backend's internal state was corrupted; the process should restart"
        )
    )]
    BackendFatal(#[source] io::Error),

    /// Constructing the readiness backend (including its cross-thread wake primitive)
    /// failed.
    #[error("failed to create readiness backend")]
    #[diagnostic(
        code(reactor_core::poll_creation),
        help("check available file descriptors and platform epoll/kqueue/eventfd support")
    )]
    PollCreation(#[source] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReactorError>;
