// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! The readiness backend (C2): translates watcher mask transitions into OS calls and
//! blocks until descriptors are ready.
//!
//! `mio` already supplies the "pluggable per-OS-primitive" abstraction the design calls
//! for (edge-triggered epoll on Linux, kqueue on BSD/macOS), so [`MioBackend`] wraps it
//! rather than hand-rolling `epoll_ctl`. The [`Backend`] trait is the seam an alternate
//! platform backend (plain `poll`, IOCP) would implement.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{trace, warn};

use crate::events::{READ, Revents, WRITE};

/// One reconciled OS operation, derived from an `(old_mask, new_mask)` pair per the
/// reactor's descriptor-transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    NoOp,
    Add,
    Modify,
    Delete,
}

/// Classifies a mask transition into the OS operation needed to realize it.
pub(crate) fn classify(old_mask: Revents, new_mask: Revents) -> Operation {
    match (old_mask == 0, new_mask == 0) {
        (true, true) => Operation::NoOp,
        (true, false) => Operation::Add,
        (false, true) => Operation::Delete,
        (false, false) => {
            if new_mask == old_mask {
                Operation::NoOp
            } else {
                Operation::Modify
            }
        }
    }
}

fn to_interest(mask: Revents) -> Option<Interest> {
    match (mask & READ != 0, mask & WRITE != 0) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn raw_errno(err: &io::Error) -> Option<i32> {
    err.raw_os_error()
}

fn is_errno(err: &io::Error, expected: i32) -> bool {
    raw_errno(err) == Some(expected)
}

/// Capability set a readiness multiplexer must provide.
pub trait Backend {
    /// Reconciles a single descriptor's registration from `old_mask` to `new_mask`,
    /// applying the descriptor-recycling error-recovery rules internally. Only a
    /// genuinely fatal backend failure escapes as `Err`.
    fn modify(&mut self, fd: RawFd, old_mask: Revents, new_mask: Revents) -> io::Result<()>;

    /// Blocks up to `timeout_ms`, appending `(fd, mask)` to `ready` for every descriptor
    /// the backend reports readiness on. An error or hangup condition is delivered as
    /// simultaneous `READ | WRITE`, never a separate bit, per the reactor's contract.
    fn wait(&mut self, timeout_ms: i64, ready: &mut Vec<(RawFd, Revents)>) -> io::Result<()>;

    /// Causes a currently-blocked `wait` to return promptly. Safe to call from another
    /// thread.
    fn wake(&self) -> io::Result<()>;

    /// A thread-safe, cloneable handle that can wake a blocked `wait()` from outside the
    /// loop thread. This is the only backend capability the reactor exposes across a
    /// thread boundary (alongside the atomic `done` flag it pairs with in
    /// [`crate::reactor::Handle`]).
    fn waker(&self) -> WakeHandle;
}

/// A thread-safe callback that wakes a blocked [`Backend::wait`].
pub type WakeHandle = Arc<dyn Fn() -> io::Result<()> + Send + Sync>;

/// `mio`-backed implementation of [`Backend`].
pub struct MioBackend {
    poll: Poll,
    waker: Arc<Waker>,
    events: Events,
}

/// `mio::Token` reserved for the cross-thread wake primitive; descriptor tokens use the
/// fd value itself, so this must not collide with any valid fd.
const WAKE_TOKEN: Token = Token(usize::MAX);

impl std::fmt::Debug for MioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioBackend").finish_non_exhaustive()
    }
}

impl MioBackend {
    /// Creates a backend with room for `events_capacity` readiness notifications per
    /// `wait` call.
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self { poll, waker, events: Events::with_capacity(events_capacity) })
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }
}

impl Backend for MioBackend {
    fn modify(&mut self, fd: RawFd, old_mask: Revents, new_mask: Revents) -> io::Result<()> {
        match classify(old_mask, new_mask) {
            Operation::NoOp => Ok(()),
            Operation::Add => {
                let interest = to_interest(new_mask).expect("Add implies new_mask != 0");
                match self.register(fd, interest) {
                    Ok(()) => Ok(()),
                    Err(err) if is_errno(&err, libc::EEXIST) => {
                        warn!(fd, "fd already registered with backend, retrying as MODIFY");
                        self.reregister(fd, interest)
                    }
                    Err(err) => Err(err),
                }
            }
            Operation::Modify => {
                let interest = to_interest(new_mask).expect("Modify implies new_mask != 0");
                match self.reregister(fd, interest) {
                    Ok(()) => Ok(()),
                    Err(err) if is_errno(&err, libc::ENOENT) => {
                        warn!(fd, "fd missing from backend (recycled), retrying as ADD");
                        self.register(fd, interest)
                    }
                    Err(err) => Err(err),
                }
            }
            Operation::Delete => match self.deregister(fd) {
                Ok(()) => Ok(()),
                Err(err)
                    if is_errno(&err, libc::ENOENT) || is_errno(&err, libc::EBADF) =>
                {
                    trace!(fd, "descriptor already gone on DELETE, ignoring");
                    Ok(())
                }
                Err(err) if is_errno(&err, libc::EPERM) => {
                    trace!(fd, "descriptor type does not support polling, ignoring");
                    Ok(())
                }
                Err(err) => Err(err),
            },
        }
    }

    fn wait(&mut self, timeout_ms: i64, ready: &mut Vec<(RawFd, Revents)>) -> io::Result<()> {
        let timeout = Duration::from_millis(u64::try_from(timeout_ms.max(0)).unwrap_or(u64::MAX));
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        for event in &self.events {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            // Safety note: tokens are minted from `fd as usize` in `register`, so the
            // cast back is exact on every platform this crate supports.
            let fd = event.token().0 as RawFd;
            let errored = event.is_error() || event.is_read_closed() || event.is_write_closed();
            let mut mask = 0;
            if event.is_readable() || errored {
                mask |= READ;
            }
            if event.is_writable() || errored {
                mask |= WRITE;
            }
            ready.push((fd, mask));
        }
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    fn waker(&self) -> WakeHandle {
        let waker = Arc::clone(&self.waker);
        Arc::new(move || waker.wake())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_transition_table() {
        assert_eq!(classify(0, 0), Operation::NoOp);
        assert_eq!(classify(0, READ), Operation::Add);
        assert_eq!(classify(READ, 0), Operation::Delete);
        assert_eq!(classify(READ, WRITE), Operation::Modify);
        assert_eq!(classify(READ, READ), Operation::NoOp);
    }
}
