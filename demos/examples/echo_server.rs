use clap::Parser;
use log::{info, warn};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use streamio::SessionBuilder;
use streamio_bootstrap::Listener;
use streamio_codec::{LineBasedUnpacker, StringEncoder, TerminatorType};
use streamio_demos::{ctrl_c, init_logger, BackendKind};
use streamio_rt::{AsyncService, Backend, SyncBackend};

#[derive(Parser)]
#[command(name = "Echo Server")]
#[command(version = "0.1.0")]
#[command(about = "A line echo server on streamio sessions", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("0.0.0.0"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
    #[arg(long, value_enum, default_value_t = BackendKind::Async)]
    backend: BackendKind,
    /// Seconds of silence before a client is dropped, 0 keeps it forever.
    #[arg(long, default_value_t = 60)]
    idle_secs: u64,
    /// Pin the async backend's workers onto the machine's cores.
    #[arg(long)]
    pin: bool,
}

fn serve<B: Backend>(backend: B, cli: &Cli) -> anyhow::Result<()> {
    let live = Arc::new(AtomicUsize::new(0));
    let idle = Duration::from_secs(cli.idle_secs);

    let mut listener = Listener::new(backend);
    listener.on_accept(move |transport| {
        let session = SessionBuilder::new()
            .recv_timeout(idle)
            .unpacker(LineBasedUnpacker::new(8192, true, TerminatorType::Both))
            .encoder(StringEncoder::with_crlf())
            .bind(transport);
        let peer = session
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("{} joined, {} online", peer, live.fetch_add(1, Ordering::SeqCst) + 1);

        let live = Arc::clone(&live);
        let who = peer.clone();
        session.set_close_callback(move |_, reason| {
            let left = live.fetch_sub(1, Ordering::SeqCst) - 1;
            match reason {
                Some(reason) => info!("{} left ({}), {} online", who, reason, left),
                None => info!("{} left, {} online", who, left),
            }
        });
        let started = session.begin_recv(move |session, line| {
            info!("received: {} from {}", line, peer);
            if line == "quit" {
                session.close(None, Duration::from_secs(1));
            } else if let Err(err) = session.send(streamio::Outgoing::message(line)) {
                warn!("echo to {} failed: {}", peer, err);
            }
        });
        if let Err(err) = started {
            warn!("begin_recv failed: {}", err);
        }
    });

    let addr = listener.bind_tcp(format!("{}:{}", cli.host, cli.port))?;
    info!("listening {} on the {:?} backend", addr, cli.backend);
    info!("Press ctrl-c to stop");
    info!("try `nc {} {}` in another shell", cli.host, cli.port);

    let _ = ctrl_c()?.recv();
    listener.graceful_stop();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug, &cli.log_level)?;

    match cli.backend {
        BackendKind::Sync => serve(SyncBackend::new(), &cli),
        BackendKind::Async => {
            let mut builder = AsyncService::builder().name("echo-aio");
            if cli.pin {
                builder = builder.pin_all_cores();
            }
            let service = builder.build()?;
            serve(Arc::new(service), &cli)
        }
    }
}
