use clap::Parser;
use crossbeam_channel::{bounded, select};
use log::{info, warn};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use streamio::{Outgoing, SessionBuilder, Transport};
use streamio_bootstrap::Connector;
use streamio_codec::{LineBasedUnpacker, StringEncoder, TerminatorType};
use streamio_demos::{ctrl_c, init_logger, BackendKind};
use streamio_rt::{AsyncService, Backend, SyncBackend};

#[derive(Parser)]
#[command(name = "Ping-Pong Client")]
#[command(version = "0.1.0")]
#[command(about = "Measures round trips against the echo server", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("127.0.0.1"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
    #[arg(long, value_enum, default_value_t = BackendKind::Sync)]
    backend: BackendKind,
    /// Round trips to run before disconnecting.
    #[arg(long, default_value_t = 1000)]
    count: usize,
    /// Messages kept in flight at once.
    #[arg(long, default_value_t = 1)]
    window: usize,
}

fn run<B: Backend>(backend: B, cli: &Cli) -> anyhow::Result<()> {
    // the connector owns the backend and has to outlive the session
    let connector = Connector::new(backend)
        .timeout(Duration::from_secs(3))
        .nodelay(true);
    let transport = connector.connect_tcp((cli.host.as_str(), cli.port))?;
    info!("connected to {}", transport.peer_addr()?);

    let session = SessionBuilder::new()
        .unpacker(LineBasedUnpacker::new(1024, true, TerminatorType::Both))
        .encoder(StringEncoder::with_newline())
        .bind(transport);

    let (done_tx, done) = bounded(1);
    let (closed_tx, closed) = bounded(1);
    session.set_close_callback(move |_, reason| {
        let _ = closed_tx.try_send(reason.map(|r| r.to_string()));
    });

    let count = cli.count;
    let received = Arc::new(AtomicUsize::new(0));
    let sent = Arc::new(AtomicUsize::new(0));
    let next = Arc::clone(&sent);
    let acked = Arc::clone(&received);
    session.begin_recv(move |session, line| {
        let n = acked.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("pong {}: {}", n, line);
        if n == count {
            let _ = done_tx.try_send(());
            return;
        }
        let seq = next.fetch_add(1, Ordering::SeqCst);
        if seq < count {
            if let Err(err) = session.send(Outgoing::message(format!("ping {}", seq))) {
                warn!("send failed: {}", err);
            }
        }
    })?;

    let start = Instant::now();
    for _ in 0..cli.window.clamp(1, count.max(1)) {
        let seq = sent.fetch_add(1, Ordering::SeqCst);
        session.send_timeout(Outgoing::message(format!("ping {}", seq)), Duration::ZERO)?;
    }

    let interrupted = ctrl_c()?;
    select! {
        recv(done) -> _ => {
            let elapsed = start.elapsed();
            info!(
                "{} round trips in {:?}, {:.1} us each",
                count,
                elapsed,
                elapsed.as_secs_f64() * 1e6 / count.max(1) as f64
            );
        }
        recv(closed) -> reason => {
            warn!("server closed the session early: {:?}", reason.ok().flatten());
            return Ok(());
        }
        recv(interrupted) -> _ => {
            info!("interrupted after {} round trips", received.load(Ordering::SeqCst));
        }
    }

    session.close(None, Duration::from_secs(1));
    if let Ok(reason) = closed.recv_timeout(Duration::from_secs(2)) {
        info!("session closed: {}", reason.unwrap_or_else(|| "ok".to_string()));
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug, &cli.log_level)?;

    match cli.backend {
        BackendKind::Sync => run(SyncBackend::new(), &cli),
        BackendKind::Async => {
            let service = AsyncService::builder().name("pingpong-aio").workers(1).build()?;
            run(service, &cli)
        }
    }
}
