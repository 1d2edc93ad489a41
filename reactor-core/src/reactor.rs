// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! The loop driver (C5): ties the clock, backend, timer heap and watcher registry
//! together into the eight-step reactor iteration.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, instrument, trace};

use crate::backend::{Backend, MioBackend, WakeHandle};
use crate::clock::Clock;
use crate::error::{ReactorError, Result};
use crate::events::{Revents, TIMER};
use crate::timer::TimerHeap;
use crate::watcher::{Callback, IoHandle, IoWatcher, TimerHandle, TimerWatcher};

/// Timeouts passed to the backend are floored at this many milliseconds.
pub const BACKEND_MIN_TM: i64 = 1;

/// ...and ceilinged at this many milliseconds (below the backend's own internal limit).
pub const BACKEND_MAX_TM: i64 = 59_743;

/// Tunable knobs for a [`Reactor`]; all have defaults matching the reactor's historical
/// behavior.
#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    /// Floor on the backend's blocking timeout, in milliseconds.
    pub backend_min_tm_ms: i64,
    /// Ceiling on the backend's blocking timeout, in milliseconds.
    pub backend_max_tm_ms: i64,
    /// How many readiness notifications the backend may return from a single `wait`.
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self { backend_min_tm_ms: BACKEND_MIN_TM, backend_max_tm_ms: BACKEND_MAX_TM, events_capacity: 8192 }
    }
}

/// Per-descriptor backend-registration state.
///
/// Mirrors a split the source keeps implicitly: `emask` is what the backend currently
/// has installed for this fd and persists across a `stop()` until `fd_reify` actually
/// reconciles it, independent of whether a watcher is currently attached. This is what
/// lets `fd_reify` compute a correct `(old_mask, new_mask)` transition even when the
/// watcher that used to own the descriptor has already been torn down this tick.
#[derive(Default)]
struct FdSlot {
    emask: Revents,
    watcher: Option<ActiveIo>,
}

struct ActiveIo {
    events: Revents,
    generation: u32,
    callback: Callback,
    revents: Revents,
    pending: usize,
}

/// A pending-queue entry: either an I/O or a timer watcher awaiting dispatch.
enum PendingRef {
    Io(RawFd),
    Timer(TimerHandle),
}

/// A thread-safe capability for requesting loop termination from outside the loop
/// thread. The only cross-thread contact the core makes, per its concurrency model.
#[derive(Clone)]
pub struct Handle {
    done: Arc<AtomicBool>,
    wake: WakeHandle,
}

impl Handle {
    /// Requests termination: sets the atomic `done` flag and wakes a blocked `wait` so
    /// the loop notices promptly instead of waiting out its current timeout.
    pub fn quit(&self) {
        self.done.store(true, Ordering::Relaxed);
        if let Err(err) = (self.wake)() {
            error!(?err, "failed to wake backend for cross-thread quit request");
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("done", &self.done.load(Ordering::Relaxed)).finish_non_exhaustive()
    }
}

fn inert_callback() -> Callback {
    Box::new(|_, _| {})
}

/// The reactor: a single-threaded event loop over a readiness backend.
///
/// The backend is held as `Box<dyn Backend>` so an embedder can substitute an alternate
/// readiness multiplexer (platform `poll`, a test double) at construction time;
/// [`MioBackend`] is the default and the only implementation this crate ships.
pub struct Reactor {
    clock: Clock,
    backend: Box<dyn Backend>,
    fds: Vec<FdSlot>,
    fd_changes: Vec<RawFd>,
    timers: TimerHeap,
    pendings: Vec<PendingRef>,
    done: Arc<AtomicBool>,
    busy_time: i64,
    backend_time_coarse: i64,
    last_ms: i64,
    next_io_generation: u32,
    config: ReactorConfig,
    ready_buf: Vec<(RawFd, Revents)>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("fd_count", &self.fds.len())
            .field("timer_count", &self.timers.count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Creates a reactor with default configuration and [`MioBackend`].
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying backend (epoll/kqueue handle, wake primitive)
    /// cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    /// Creates a reactor with the given configuration and [`MioBackend`].
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying backend cannot be created, or if `config` is
    /// invalid (see [`ReactorConfig`]).
    pub fn with_config(config: ReactorConfig) -> Result<Self> {
        let backend = MioBackend::new(config.events_capacity).map_err(ReactorError::PollCreation)?;
        Self::with_backend(backend, config)
    }

    /// Creates a reactor around a caller-supplied backend, for platforms or tests that
    /// need something other than [`MioBackend`].
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidConfig`] if `config.backend_min_tm_ms >
    /// config.backend_max_tm_ms`; every tick clamps the backend wait time into that
    /// range, which would otherwise panic.
    pub fn with_backend(backend: impl Backend + 'static, config: ReactorConfig) -> Result<Self> {
        if config.backend_min_tm_ms > config.backend_max_tm_ms {
            return Err(ReactorError::InvalidConfig {
                backend_min_tm_ms: config.backend_min_tm_ms,
                backend_max_tm_ms: config.backend_max_tm_ms,
            });
        }
        let clock = Clock::new();
        let mn_time = clock.monotonic_ms();
        Ok(Self {
            clock,
            backend: Box::new(backend),
            fds: Vec::new(),
            fd_changes: Vec::new(),
            timers: TimerHeap::new(),
            pendings: Vec::new(),
            done: Arc::new(AtomicBool::new(false)),
            busy_time: 0,
            backend_time_coarse: mn_time + config.backend_max_tm_ms,
            last_ms: mn_time,
            next_io_generation: 1,
            config,
            ready_buf: Vec::new(),
        })
    }

    /// A cross-thread handle that can request termination.
    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle { done: Arc::clone(&self.done), wake: self.backend.waker() }
    }

    /// Monotonic milliseconds since an unspecified epoch.
    #[must_use]
    pub fn monotonic_ms(&self) -> i64 {
        self.clock.monotonic_ms()
    }

    /// Seconds since the Unix epoch, interpolated between real syscalls.
    #[must_use]
    pub fn realtime_seconds(&self) -> i64 {
        self.clock.realtime_seconds()
    }

    /// Milliseconds spent in the last non-blocking phase of the loop (the time between
    /// two successive returns from `backend.wait`).
    #[must_use]
    pub fn busy_time(&self) -> i64 {
        self.busy_time
    }

    /// Lowers (never raises) the deadline by which the next `backend.wait` must return,
    /// letting an embedder shorten the next sleep without installing a new timer.
    pub fn set_backend_time_coarse(&mut self, t: i64) {
        self.backend_time_coarse = self.backend_time_coarse.min(t);
    }

    /// Requests termination. The loop exits after the current `invoke_pending`
    /// completes.
    pub fn quit(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    // ---- C4: watcher registry -------------------------------------------------

    /// Registers `watcher` for readiness dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::FdOutOfRange`] if `watcher.fd` cannot be represented, or
    /// [`ReactorError::WatcherAlreadyActive`] if the descriptor already has a live
    /// watcher.
    pub fn io_start(&mut self, watcher: IoWatcher) -> Result<IoHandle> {
        let IoWatcher { fd, events, callback } = watcher;
        if fd < 0 {
            return Err(ReactorError::FdOutOfRange { fd: i64::from(fd) });
        }
        let index = usize::try_from(fd).map_err(|_| ReactorError::FdOutOfRange { fd: i64::from(fd) })?;
        if index >= self.fds.len() {
            self.fds.resize_with(index + 1, FdSlot::default);
        }
        if self.fds[index].watcher.is_some() {
            return Err(ReactorError::WatcherAlreadyActive);
        }

        let generation = self.next_io_generation;
        self.next_io_generation = self.next_io_generation.wrapping_add(1).max(1);
        self.fds[index].watcher = Some(ActiveIo { events, generation, callback, revents: 0, pending: 0 });
        self.fd_changes.push(fd);

        Ok(IoHandle { fd, generation })
    }

    /// Unregisters a descriptor watcher. Idempotent: stopping an already-inactive or
    /// stale handle is a no-op, matching the reactor's stop laws.
    pub fn io_stop(&mut self, handle: IoHandle) {
        let Ok(index) = usize::try_from(handle.fd) else { return };
        let Some(slot) = self.fds.get_mut(index) else { return };
        let Some(active) = &slot.watcher else { return };
        if active.generation != handle.generation {
            return;
        }
        slot.watcher = None;
        self.fd_changes.push(handle.fd);
        // `pending != 0` entries are neutralized lazily at dispatch time (the pending
        // queue itself is not shifted), matching `clear_pending`'s contract.
    }

    // ---- C3: timers -------------------------------------------------------------

    /// Registers `watcher`, rebasing its relative delay to absolute monotonic time.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidTimerRepeat`] if `repeat_ms` is negative.
    pub fn timer_start(&mut self, watcher: TimerWatcher) -> Result<TimerHandle> {
        let TimerWatcher { delay_ms, repeat_ms, callback } = watcher;
        if repeat_ms < 0 {
            return Err(ReactorError::InvalidTimerRepeat { repeat_ms });
        }
        let at = self.clock.monotonic_ms() + delay_ms;
        Ok(self.timers.insert(at, repeat_ms, callback))
    }

    /// Unregisters a timer watcher. Idempotent.
    pub fn timer_stop(&mut self, handle: TimerHandle) {
        self.timers.remove(handle);
    }

    /// Returns true if `handle` still names a live timer (used by tests and embedders
    /// that want to check status without holding their own bookkeeping).
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.count()
    }

    // ---- C5: loop driver ----------------------------------------------------------

    /// Runs the reactor until [`Self::quit`]/[`Handle::quit`] is called, or the
    /// caller-supplied `running` hook returns `false`.
    ///
    /// `running` is invoked once per iteration (step 8 of the driver) and must not
    /// block; it is where an embedder drains cross-thread result queues and
    /// interleaves other per-tick work. Returning `false` from it ends the loop exactly
    /// like `quit()`.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::BackendFatal`] if the readiness backend fails in a way
    /// the descriptor-recycling recovery rules do not cover.
    pub fn run(&mut self, mut running: impl FnMut(&mut Self) -> bool) -> Result<()> {
        self.clock.update();
        while !self.done.load(Ordering::Relaxed) {
            self.run_once()?;
            if !running(self) {
                break;
            }
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    fn run_once(&mut self) -> Result<()> {
        self.fd_reify()?;

        self.clock.update();
        let mn_time = self.clock.monotonic_ms();
        self.busy_time = mn_time - self.last_ms;

        let mut wait_time = self.backend_time_coarse - mn_time;
        if let Some(root_at) = self.timers.root_at() {
            wait_time = wait_time.min(root_at - mn_time);
        }
        wait_time = wait_time.clamp(self.config.backend_min_tm_ms, self.config.backend_max_tm_ms);
        trace!(wait_time, "blocking on backend");

        self.ready_buf.clear();
        self.backend.wait(wait_time, &mut self.ready_buf).map_err(ReactorError::BackendFatal)?;
        let ready = std::mem::take(&mut self.ready_buf);
        for (fd, mask) in &ready {
            self.fd_event(*fd, *mask);
        }
        self.ready_buf = ready;

        self.clock.update();
        self.last_ms = self.clock.monotonic_ms();
        self.backend_time_coarse = self.last_ms + self.config.backend_max_tm_ms;

        self.timers_reify();
        self.invoke_pending();

        Ok(())
    }

    /// C4's change-set reconciliation: runs exactly once per tick, at the top.
    fn fd_reify(&mut self) -> Result<()> {
        for fd in self.fd_changes.drain(..) {
            let Ok(index) = usize::try_from(fd) else { continue };
            let Some(slot) = self.fds.get_mut(index) else { continue };
            let old_mask = slot.emask;
            let new_mask = slot.watcher.as_ref().map_or(0, |w| w.events);
            debug!(fd, old_mask, new_mask, "fd_reify");
            if let Err(err) = self.backend.modify(fd, old_mask, new_mask) {
                error!(fd, ?err, "backend reported a fatal error reconciling descriptor state");
                return Err(ReactorError::BackendFatal(err));
            }
            slot.emask = new_mask;
        }
        Ok(())
    }

    /// C2→C5: a descriptor became ready; accumulate it on the pending queue.
    fn fd_event(&mut self, fd: RawFd, mask: Revents) {
        let Ok(index) = usize::try_from(fd) else { return };
        let Some(slot) = self.fds.get_mut(index) else { return };
        let Some(active) = &mut slot.watcher else { return };
        active.revents |= mask;
        if active.pending == 0 {
            self.pendings.push(PendingRef::Io(fd));
            active.pending = self.pendings.len();
        }
    }

    /// C3→C5: fires every timer whose `at` has passed, catching up repeat timers
    /// without bursting.
    fn timers_reify(&mut self) {
        let now = self.clock.monotonic_ms();
        while let Some(root_at) = self.timers.root_at() {
            if root_at >= now {
                break;
            }
            let handle = self.timers.root_handle().expect("root_at implies a root exists");
            let repeat = self.timers.slot_mut(handle).expect("handle just read from root").repeat;

            if repeat > 0 {
                let slot = self.timers.slot_mut(handle).expect("handle still valid, no reentrant removal yet");
                slot.at += repeat;
                // Catch-up: if still behind after one interval, snap forward instead of
                // bursting through every missed interval.
                if slot.at < now {
                    slot.at = now;
                }
                self.timers.sift_down_root();
                self.feed_timer(handle, TIMER);
            } else {
                self.timers.detach_from_heap(handle);
                self.feed_timer(handle, TIMER);
            }
        }
    }

    fn feed_timer(&mut self, handle: TimerHandle, revents: Revents) {
        let Some(slot) = self.timers.slot_mut(handle) else { return };
        slot.revents |= revents;
        if slot.pending == 0 {
            self.pendings.push(PendingRef::Timer(handle));
            slot.pending = self.pendings.len();
        }
    }

    /// Drains the pending queue in insertion order, invoking each watcher's callback at
    /// most once with its fully-coalesced `revents`.
    fn invoke_pending(&mut self) {
        for entry in std::mem::take(&mut self.pendings) {
            match entry {
                PendingRef::Io(fd) => self.invoke_pending_io(fd),
                PendingRef::Timer(handle) => self.invoke_pending_timer(handle),
            }
        }
    }

    fn invoke_pending_io(&mut self, fd: RawFd) {
        let Ok(index) = usize::try_from(fd) else { return };
        let generation = {
            let Some(active) = self.fds.get_mut(index).and_then(|slot| slot.watcher.as_mut()) else { return };
            if active.pending == 0 {
                // Stopped mid-tick by an earlier callback in this same dispatch pass.
                return;
            }
            active.pending = 0;
            active.generation
        };
        let revents = {
            let active = self.fds[index].watcher.as_mut().unwrap();
            std::mem::take(&mut active.revents)
        };
        // Take the callback out so the reactor itself is free for the callback to
        // borrow mutably - e.g. to stop another watcher. It is restored below only if
        // the slot is still occupied by the same generation (the callback may have
        // stopped or replaced itself).
        let mut callback = std::mem::replace(&mut self.fds[index].watcher.as_mut().unwrap().callback, inert_callback());
        callback(revents, self);
        if let Some(active) = self.fds.get_mut(index).and_then(|slot| slot.watcher.as_mut()) {
            if active.generation == generation {
                active.callback = callback;
            }
        }
    }

    fn invoke_pending_timer(&mut self, handle: TimerHandle) {
        let revents = {
            let Some(slot) = self.timers.slot_mut(handle) else { return };
            if slot.pending == 0 {
                return;
            }
            slot.pending = 0;
            std::mem::take(&mut slot.revents)
        };
        let mut callback = {
            let Some(slot) = self.timers.slot_mut(handle) else { return };
            std::mem::replace(&mut slot.callback, inert_callback())
        };
        callback(revents, self);
        if let Some(slot) = self.timers.slot_mut(handle) {
            slot.callback = callback;
        }
        // A one-shot timer is detached from the heap (not re-armed) by the time it's
        // dispatched; its slab slot is only safe to release now that the callback has
        // run. A repeating timer is still in the heap at this point and is left alone.
        self.timers.free_if_detached(handle);
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::backend::WakeHandle;
    use crate::events::{READ, WRITE};

    /// An in-memory stand-in backend for exercising the loop driver without real
    /// descriptors: `wait` replays a scripted batch of `(fd, mask)` readiness events on
    /// each call, oldest batch first, then reports nothing.
    struct ScriptedBackend {
        batches: Mutex<Vec<Vec<(RawFd, Revents)>>>,
        modify_calls: Arc<Mutex<Vec<(RawFd, Revents, Revents)>>>,
    }

    impl ScriptedBackend {
        fn new(mut batches: Vec<Vec<(RawFd, Revents)>>) -> Self {
            batches.reverse();
            Self { batches: Mutex::new(batches), modify_calls: Arc::new(Mutex::new(Vec::new())) }
        }

        fn with_modify_log(mut batches: Vec<Vec<(RawFd, Revents)>>) -> (Self, Arc<Mutex<Vec<(RawFd, Revents, Revents)>>>) {
            batches.reverse();
            let modify_calls = Arc::new(Mutex::new(Vec::new()));
            (Self { batches: Mutex::new(batches), modify_calls: Arc::clone(&modify_calls) }, modify_calls)
        }
    }

    impl Backend for ScriptedBackend {
        fn modify(&mut self, fd: RawFd, old_mask: Revents, new_mask: Revents) -> io::Result<()> {
            // Mirrors `MioBackend`: only a real transition reaches the "OS", so
            // repeated `fd_changes` entries for an unchanged end state are no-ops here
            // too, same as they would be against a live epoll/kqueue instance.
            if crate::backend::classify(old_mask, new_mask) != crate::backend::Operation::NoOp {
                self.modify_calls.lock().unwrap().push((fd, old_mask, new_mask));
            }
            Ok(())
        }

        fn wait(&mut self, timeout_ms: i64, ready: &mut Vec<(RawFd, Revents)>) -> io::Result<()> {
            // Sleep like a real backend would, so tests relying on monotonic time
            // actually advancing between ticks (e.g. a zero-delay timer) are
            // deterministic rather than racing millisecond-granularity clock reads.
            std::thread::sleep(std::time::Duration::from_millis(u64::try_from(timeout_ms.max(1)).unwrap_or(1)));
            if let Some(batch) = self.batches.lock().unwrap().pop() {
                ready.extend(batch);
            }
            Ok(())
        }

        fn wake(&self) -> io::Result<()> {
            Ok(())
        }

        fn waker(&self) -> WakeHandle {
            Arc::new(|| Ok(()))
        }
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let backend = ScriptedBackend::new(vec![]);
        let mut reactor = Reactor::with_backend(backend, ReactorConfig::default()).unwrap();
        let fired = Arc::new(Mutex::new(0));
        let fired_clone = Arc::clone(&fired);
        reactor
            .timer_start(TimerWatcher::new(0, 0, move |revents, _reactor| {
                assert_eq!(revents, TIMER);
                *fired_clone.lock().unwrap() += 1;
            }))
            .unwrap();

        let mut ticks = 0;
        reactor
            .run(|r| {
                ticks += 1;
                ticks < 10 && r.timer_count() > 0
            })
            .unwrap();

        assert_eq!(*fired.lock().unwrap(), 1);
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn coalesced_read_write_dispatches_once() {
        let backend = ScriptedBackend::new(vec![vec![(3, READ | WRITE)]]);
        let mut reactor = Reactor::with_backend(backend, ReactorConfig::default()).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = Arc::clone(&calls);
        reactor
            .io_start(IoWatcher::new(3, READ | WRITE, move |revents, _reactor| calls_clone.lock().unwrap().push(revents)))
            .unwrap();

        let mut ticks = 0;
        reactor.run(|_| { ticks += 1; ticks < 1 }).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![READ | WRITE]);
    }

    #[test]
    fn stop_inside_callback_prevents_later_dispatch() {
        // Watcher A is registered (and so enters the pending queue) ahead of watcher B,
        // and A's callback stops B before B's own turn in `invoke_pending` arrives.
        let backend = ScriptedBackend::new(vec![]);
        let mut reactor = Reactor::with_backend(backend, ReactorConfig::default()).unwrap();
        let handle_b_cell: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
        let handle_b_cell_clone = Arc::clone(&handle_b_cell);

        reactor
            .timer_start(TimerWatcher::new(0, 0, move |_, reactor| {
                if let Some(b) = handle_b_cell_clone.lock().unwrap().take() {
                    reactor.timer_stop(b);
                }
            }))
            .unwrap();

        let b_fired = Arc::new(Mutex::new(false));
        let b_fired_clone = Arc::clone(&b_fired);
        let handle_b = reactor.timer_start(TimerWatcher::new(0, 0, move |_, _reactor| *b_fired_clone.lock().unwrap() = true)).unwrap();
        *handle_b_cell.lock().unwrap() = Some(handle_b);

        reactor.run(|_| false).unwrap();

        assert!(!*b_fired.lock().unwrap());
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn descriptor_recycled_within_one_tick_collapses_to_single_modify() {
        // Register fd 7, stop it, then register a brand new watcher on the same fd
        // number before any tick boundary - exactly the within-tick recycling scenario
        // `fd_changes` is designed to absorb. Only one `modify` call should reach the
        // backend, reflecting the net start-state -> end-state transition.
        let (backend, modify_calls) = ScriptedBackend::with_modify_log(vec![]);
        let mut reactor = Reactor::with_backend(backend, ReactorConfig::default()).unwrap();

        let first = reactor.io_start(IoWatcher::new(7, READ, |_, _| {})).unwrap();
        reactor.io_stop(first);
        reactor.io_start(IoWatcher::new(7, WRITE, |_, _| {})).unwrap();

        reactor.run(|_| false).unwrap();

        let calls = modify_calls.lock().unwrap();
        assert_eq!(&*calls, &[(7, 0, WRITE)]);
    }
}
