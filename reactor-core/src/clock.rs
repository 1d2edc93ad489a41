// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! Monotonic time plus a cheap, interpolated wall-clock estimate.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

/// Below this much elapsed monotonic time since the last realtime syscall, the wall
/// clock is interpolated instead of resampled.
const RT_RESAMPLE_INTERVAL_MS: i64 = 500;

/// A jump between two successive `rtmn_diff` samples larger than this is assumed to be
/// preemption noise rather than an actual wall-clock change, and triggers a resample.
const MIN_TIMEJUMP_MS: i64 = 1000;

/// Resampling the realtime clock gets at most this many attempts to settle before the
/// loop just accepts whatever it last read.
const MAX_RESAMPLE_ITERATIONS: u32 = 4;

/// Source of monotonic and wall-clock time, with wall-clock interpolation.
///
/// `monotonic_ms` is refreshed every call to [`Clock::update`]; `realtime_seconds` is
/// refreshed from a real syscall only occasionally and interpolated the rest of the
/// time, per the reactor's §4.1 clock design.
#[derive(Debug)]
pub struct Clock {
    mn_time: i64,
    rt_time: i64,
    rtmn_diff: i64,
    last_rt_update: i64,
    monotonic_origin: std::time::Instant,
}

impl Clock {
    /// Creates a clock with both monotonic and wall-clock time initialized from a real
    /// syscall.
    #[must_use]
    pub fn new() -> Self {
        let monotonic_origin = std::time::Instant::now();
        let mut clock = Self {
            mn_time: 0,
            rt_time: 0,
            rtmn_diff: 0,
            last_rt_update: i64::MIN / 2,
            monotonic_origin,
        };
        clock.mn_time = clock.read_monotonic_ms();
        clock.resample_realtime();
        clock
    }

    fn read_monotonic_ms(&self) -> i64 {
        i64::try_from(self.monotonic_origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    fn read_realtime_seconds() -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            // A system clock set before the epoch; treat it as epoch zero rather than
            // panicking on a tick boundary.
            Err(_) => 0,
        }
    }

    fn resample_realtime(&mut self) {
        self.rt_time = Self::read_realtime_seconds();
        self.rtmn_diff = self.rt_time * 1000 - self.mn_time;
        self.last_rt_update = self.mn_time;
    }

    /// Monotonic milliseconds since an unspecified epoch. Never decreases.
    #[must_use]
    pub fn monotonic_ms(&self) -> i64 {
        self.mn_time
    }

    /// Seconds since the Unix epoch, interpolated between real syscalls. May jump
    /// forward or backward if the system wall clock is adjusted.
    #[must_use]
    pub fn realtime_seconds(&self) -> i64 {
        self.rt_time
    }

    /// Refreshes `monotonic_ms` unconditionally, then refreshes or interpolates
    /// `realtime_seconds` per the 500 ms / jump-detection rule.
    pub fn update(&mut self) {
        self.mn_time = self.read_monotonic_ms();

        if self.mn_time - self.last_rt_update < RT_RESAMPLE_INTERVAL_MS {
            self.rt_time = (self.rtmn_diff + self.mn_time) / 1000;
            return;
        }

        let prior_diff = self.rtmn_diff;
        for _ in 0..MAX_RESAMPLE_ITERATIONS {
            self.mn_time = self.read_monotonic_ms();
            self.resample_realtime();
            if (self.rtmn_diff - prior_diff).abs() < MIN_TIMEJUMP_MS {
                return;
            }
            trace!(
                prior_diff,
                new_diff = self.rtmn_diff,
                "wall-clock resample exceeded MIN_TIMEJUMP, retrying"
            );
        }
        // Four iterations in and still jittering: accept the latest sample anyway
        // rather than loop forever on a genuinely moving wall clock.
    }

    /// The current `rtmn_diff` offset, exposed for tests that want to assert it
    /// resyncs within one tick after a wall-clock jump.
    #[cfg(test)]
    pub(crate) fn rtmn_diff(&self) -> i64 {
        self.rtmn_diff
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
