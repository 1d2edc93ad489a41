// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! Event-mask bit values.
//!
//! These are part of the public ABI: callback payloads carry a raw [`Revents`] so that
//! embedding code on the other side of an FFI boundary can read the bits directly. A
//! `bitflags!`-generated type would wrap the same bits in a newtype that such callers
//! cannot read without going through this crate; a plain `u32` with associated constants
//! keeps the layout guarantee explicit.

/// A bitmask of fired event kinds, as delivered to a watcher callback.
pub type Revents = u32;

/// The descriptor became readable, or (or'd together with [`WRITE`]) errored/hung up.
pub const READ: Revents = 0x0000_0001;

/// The descriptor became writable, or (or'd together with [`READ`]) errored/hung up.
pub const WRITE: Revents = 0x0000_0002;

/// A timer watcher fired.
pub const TIMER: Revents = 0x0000_0100;

/// Set alongside `READ | WRITE` when the backend observed an error or hangup condition.
///
/// The core never sets this bit itself; it is reserved for backend implementations that
/// can distinguish "ready" from "ready because of an error" and want to pass that
/// distinction through to the callback instead of making the callback discover it via a
/// failed read/write.
pub const ERROR: Revents = 0x8000_0000;
