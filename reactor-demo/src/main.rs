// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! Bootstrap binary showing `reactor-core`'s watcher-registration interface wired up to a
//! real listening socket and a heartbeat timer.

use std::net::TcpListener;
use std::os::unix::io::AsRawFd;

use clap::Parser;
use miette::IntoDiagnostic;
use reactor_core::events::READ;
use reactor_core::reactor::{Reactor, ReactorConfig};
use reactor_core::watcher::{IoWatcher, TimerWatcher};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Demo server looping a reactor over a TCP listener and a heartbeat timer")]
#[command(version)]
struct CliArgs {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 7878)]
    port: u16,

    /// Milliseconds between heartbeat log lines.
    #[arg(long, default_value_t = 5_000)]
    heartbeat_ms: u64,

    /// Stop after this many heartbeats. 0 means run until killed.
    #[arg(long, default_value_t = 0)]
    max_heartbeats: u64,

    /// Repeat for more verbose logging (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Ceiling on the backend's blocking timeout, in milliseconds.
    #[arg(long, default_value_t = reactor_core::reactor::BACKEND_MAX_TM as u64)]
    backend_max_tm_ms: u64,
}

fn init_tracing(verbose: u8) {
    let default_directive = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn main() -> miette::Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.verbose);

    let listener = TcpListener::bind(("127.0.0.1", args.port)).into_diagnostic()?;
    listener.set_nonblocking(true).into_diagnostic()?;
    info!(port = args.port, "listening");

    let config = ReactorConfig { backend_max_tm_ms: args.backend_max_tm_ms as i64, ..ReactorConfig::default() };
    let mut reactor = Reactor::with_config(config)?;

    let listener_fd = listener.as_raw_fd();
    reactor.io_start(IoWatcher::new(listener_fd, READ, move |_revents, _reactor| {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    info!(%addr, "accepted connection");
                    drop(stream);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }))?;

    let max_heartbeats = args.max_heartbeats;
    let mut heartbeats = 0u64;
    reactor.timer_start(TimerWatcher::new(args.heartbeat_ms as i64, args.heartbeat_ms as i64, move |_revents, reactor| {
        heartbeats += 1;
        info!(heartbeats, "heartbeat");
        if max_heartbeats > 0 && heartbeats >= max_heartbeats {
            reactor.quit();
        }
    }))?;

    reactor.run(|_| true)?;
    info!("reactor stopped");
    Ok(())
}
