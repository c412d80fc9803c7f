use clap::Parser;
use log::info;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};

use streamio::{Addr, Outgoing, SessionBuilder, StreamSession};
use streamio_bootstrap::Listener;
use streamio_codec::{LineBasedUnpacker, StringEncoder, TerminatorType};
use streamio_demos::{ctrl_c, init_logger, BackendKind};
use streamio_rt::{AsyncService, Backend, SyncBackend};

type ChatSession<B> = StreamSession<<B as Backend>::Transport, String, String>;

/// Nickname stored as session user data.
struct Nick(String);

////////////////////////////////////////////////////////////////////////////////////////////////////
struct Shared<B: Backend> {
    peers: HashMap<Addr, ChatSession<B>>,
}

impl<B: Backend> Shared<B> {
    fn new() -> Self {
        Shared {
            peers: HashMap::new(),
        }
    }

    fn join(&mut self, peer: Addr, session: ChatSession<B>) {
        info!("{} joined", peer);
        self.peers.insert(peer, session);
    }

    fn leave(&mut self, peer: &Addr) {
        info!("{} left", peer);
        self.peers.remove(peer);
    }

    /// Every peer, except for the sender.
    fn others(&self, sender: &Addr) -> Vec<ChatSession<B>> {
        self.peers
            .iter()
            .filter(|(peer, _)| *peer != sender)
            .map(|(_, session)| session.clone())
            .collect()
    }
}

/// Send message to every session. Slow readers miss lines instead of
/// stalling the room.
fn broadcast<B: Backend>(sessions: Vec<ChatSession<B>>, msg: &str) {
    for session in sessions {
        let _ = session.send(Outgoing::message(msg.to_string()));
    }
}

#[derive(Parser)]
#[command(name = "Chat Server")]
#[command(version = "0.1.0")]
#[command(about = "A line based chat room on streamio sessions", long_about = None)]
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
}

fn serve<B: Backend>(backend: B, cli: &Cli) -> anyhow::Result<()> {
    let state: Arc<Mutex<Shared<B>>> = Arc::new(Mutex::new(Shared::new()));

    let mut listener = Listener::new(backend);
    let rooms = Arc::clone(&state);
    listener.on_accept(move |transport| {
        let state = &rooms;
        let session: ChatSession<B> = SessionBuilder::new()
            .send_queue_size(256)
            .unpacker(LineBasedUnpacker::new(8192, true, TerminatorType::Both))
            .encoder(StringEncoder::with_crlf())
            .bind(transport);
        let Ok(peer) = session.remote_addr() else {
            session.close(None, Duration::ZERO);
            return;
        };
        session.set_user_data(Nick(peer.to_string()));
        state.lock().join(peer.clone(), session.clone());

        let room = Arc::clone(state);
        let who = peer.clone();
        session.set_close_callback(move |_, _| {
            // leave first, so the room stops broadcasting to a dead session
            room.lock().leave(&who);
        });

        let room = Arc::clone(state);
        let _ = session.begin_recv(move |session, line| {
            if let Some(nick) = line.strip_prefix("/nick ") {
                session.set_user_data(Nick(nick.trim().to_string()));
                return;
            }
            let nick = session
                .user_data::<Nick>()
                .map(|nick| nick.0.clone())
                .unwrap_or_default();
            info!("received: {} from {}", line, nick);
            let others = room.lock().others(&peer);
            broadcast::<B>(others, &format!("{}: {}", nick, line));
        });
    });

    let addr = listener.bind_tcp(format!("{}:{}", cli.host, cli.port))?;
    info!("listening {}...", addr);
    info!("Press ctrl-c to stop");
    info!("try `nc {} {}` in another shell", cli.host, cli.port);

    let _ = ctrl_c()?.recv();
    listener.graceful_stop();

    let peers: Vec<_> = state.lock().peers.values().cloned().collect();
    for session in peers {
        session.close(None, Duration::from_millis(500));
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug, &cli.log_level)?;

    match cli.backend {
        BackendKind::Sync => serve(SyncBackend::new(), &cli),
        BackendKind::Async => {
            let service = AsyncService::builder().name("chat-aio").build()?;
            serve(Arc::new(service), &cli)
        }
    }
}
