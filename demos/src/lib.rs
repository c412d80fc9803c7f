//! # streamio Demos
//!
//! Runnable programs showing how the streamio crates fit together.
//!
//! ## Running Demos
//!
//! Start the line echo server, then drive it with the ping-pong client:
//!
//! ```bash
//! cargo run --example echo_server -- --debug
//! cargo run --example pingpong_client -- --count 10000
//! ```
//!
//! Every demo takes `--backend sync|async` to pick the I/O strategy.

#![warn(rust_2018_idioms)]

use clap::ValueEnum;
use crossbeam_channel::Receiver;
use std::{io::Write, str::FromStr};

/// I/O strategy a demo runs its sessions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// A reader and a writer thread per session.
    Sync,
    /// One shared tokio poller pool.
    Async,
}

/// Installs the `file:line [LEVEL] time - msg` logger used by every demo.
pub fn init_logger(debug: bool, log_level: &str) -> anyhow::Result<()> {
    let log_level = log::LevelFilter::from_str(log_level)?;
    if debug {
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    }
    Ok(())
}

/// Returns a receiver that yields once on the first Ctrl-C.
pub fn ctrl_c() -> anyhow::Result<Receiver<()>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })?;
    Ok(rx)
}
