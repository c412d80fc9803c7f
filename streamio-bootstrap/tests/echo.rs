use bytes::Bytes;
use crossbeam_channel::unbounded;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use streamio::{Addr, Outgoing, SessionBuilder};
use streamio_bootstrap::{Connector, Listener};
use streamio_codec::{LengthDelimitedEncoder, LengthDelimitedUnpacker};
use streamio_rt::{AsyncService, Backend, SyncBackend};

const WAIT: Duration = Duration::from_secs(5);

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn serve_echo<B: Backend>(backend: B, sessions: Arc<AtomicUsize>) -> Listener<B> {
    let mut listener = Listener::new(backend);
    listener.on_accept(move |transport| {
        sessions.fetch_add(1, Ordering::SeqCst);
        let session = SessionBuilder::new()
            .unpacker(LengthDelimitedUnpacker::new(256))
            .encoder(LengthDelimitedEncoder::new(256))
            .bind(transport);
        let _ = session.begin_recv(|session, msg| {
            let _ = session.send(Outgoing::message(msg.freeze()));
        });
    });
    listener
}

fn echo_round_trips<B: Backend + Clone>(backend: B, addr: &str) {
    let sessions = Arc::new(AtomicUsize::new(0));
    let listener = serve_echo(backend.clone(), Arc::clone(&sessions));
    let local = listener.bind_tcp(addr).expect("bind");
    let Addr::Inet(local) = local else {
        panic!("expected an inet address, got {}", local);
    };

    let connector = Connector::new(backend)
        .timeout(Duration::from_secs(1))
        .nodelay(true);
    let client = SessionBuilder::new()
        .unpacker(LengthDelimitedUnpacker::new(256))
        .encoder(LengthDelimitedEncoder::new(256))
        .bind(connector.connect_tcp(local).expect("connect"));
    let (tx, replies) = unbounded();
    client
        .begin_recv(move |_, msg| {
            let _ = tx.send(msg.freeze());
        })
        .unwrap();

    for i in 0..50 {
        client
            .send(Outgoing::message(Bytes::from(format!("hello {}", i))))
            .unwrap();
    }
    for i in 0..50 {
        let reply = replies.recv_timeout(WAIT).expect("echo reply");
        assert_eq!(reply, Bytes::from(format!("hello {}", i)));
    }
    assert_eq!(sessions.load(Ordering::SeqCst), 1);

    client.close(None, Duration::ZERO);
    listener.graceful_stop();
    assert!(connector.connect_tcp(local).is_err());
}

#[test]
fn sync_listener_echo() {
    init_log();
    echo_round_trips(SyncBackend::new(), "127.0.0.1:0");
}

#[test]
fn async_listener_echo() {
    init_log();
    let service = Arc::new(
        AsyncService::builder()
            .name("bootstrap-aio")
            .workers(2)
            .build()
            .unwrap(),
    );
    echo_round_trips(Arc::clone(&service), "127.0.0.1:0");
}

#[cfg(unix)]
#[test]
fn unix_listener_echo_and_cleanup() {
    init_log();
    let path = std::env::temp_dir().join(format!("streamio-bootstrap-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let sessions = Arc::new(AtomicUsize::new(0));
    let listener = serve_echo(SyncBackend::new(), Arc::clone(&sessions));
    assert_eq!(
        listener.bind_unix(path.clone()).unwrap(),
        Addr::Unix(Some(path.clone()))
    );

    let client = SessionBuilder::new()
        .unpacker(LengthDelimitedUnpacker::new(256))
        .encoder(LengthDelimitedEncoder::new(256))
        .bind(Connector::new(SyncBackend::new()).connect_unix(&path).unwrap());
    let (tx, replies) = unbounded();
    client
        .begin_recv(move |_, msg| {
            let _ = tx.send(msg.freeze());
        })
        .unwrap();
    client
        .send(Outgoing::message(Bytes::from_static(b"unix")))
        .unwrap();
    assert_eq!(replies.recv_timeout(WAIT).unwrap(), Bytes::from_static(b"unix"));

    client.close(None, Duration::ZERO);
    listener.graceful_stop();
    assert!(!path.exists());
}

#[test]
fn connect_refused_reports_error() {
    init_log();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let connector = Connector::new(SyncBackend::new()).timeout(Duration::from_millis(200));
    assert!(connector.connect_tcp(addr).is_err());
}
