use log::{error, trace, warn};
use parking_lot::Mutex;
use std::{
    io,
    net::{TcpListener as StdTcpListener, ToSocketAddrs},
    sync::Arc,
    thread,
};
use tokio::sync::broadcast;
use wg::WaitGroup;

#[cfg(unix)]
use std::{os::unix::net::UnixListener as StdUnixListener, path::PathBuf};

use streamio::Addr;
use streamio_rt::{Backend, Stream};

/// Receives the transport of every accepted connection.
pub type AcceptFn<B> = Arc<dyn Fn(<B as Backend>::Transport) + Send + Sync + 'static>;

/// Accepts connections on a dedicated thread and binds them to a backend.
///
/// One listener may serve several addresses; [`stop`](Listener::stop)
/// ends every accept loop started through it.
pub struct Listener<B: Backend> {
    backend: Arc<B>,
    name: String,
    on_accept: Option<AcceptFn<B>>,
    close_tx: Mutex<Option<broadcast::Sender<()>>>,
    wg: Mutex<Option<WaitGroup>>,
}

impl<B: Backend> Listener<B> {
    /// Creates a listener feeding `backend`.
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            name: "streamio-accept".to_string(),
            on_accept: None,
            close_tx: Mutex::new(None),
            wg: Mutex::new(None),
        }
    }

    /// Names the accept threads.
    pub fn name(&mut self, name: &str) -> &mut Self {
        self.name = name.to_string();
        self
    }

    /// Sets the closure receiving accepted transports.
    pub fn on_accept<F>(&mut self, on_accept: F) -> &mut Self
    where
        F: Fn(B::Transport) + Send + Sync + 'static,
    {
        self.on_accept = Some(Arc::new(on_accept));
        self
    }

    /// Listens on a TCP address and returns the bound local address.
    pub fn bind_tcp<A: ToSocketAddrs>(&self, addr: A) -> io::Result<Addr> {
        let listener = StdTcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = Addr::Inet(listener.local_addr()?);
        self.spawn(Acceptor::Tcp(listener), local_addr.clone())?;
        Ok(local_addr)
    }

    /// Listens on a Unix socket path. The socket file is removed once the
    /// accept loop stops.
    #[cfg(unix)]
    pub fn bind_unix<P: Into<PathBuf>>(&self, path: P) -> io::Result<Addr> {
        let path = path.into();
        let listener = StdUnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        let local_addr = Addr::Unix(Some(path.clone()));
        self.spawn(Acceptor::Unix(listener, path), local_addr.clone())?;
        Ok(local_addr)
    }

    fn spawn(&self, acceptor: Acceptor, local_addr: Addr) -> io::Result<()> {
        let on_accept = match &self.on_accept {
            Some(on_accept) => Arc::clone(on_accept),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "on_accept is not set",
                ))
            }
        };
        let backend = Arc::clone(&self.backend);
        let close_rx = self
            .close_tx
            .lock()
            .get_or_insert_with(|| broadcast::channel(1).0)
            .subscribe();
        let worker = self.wg.lock().get_or_insert_with(WaitGroup::new).add(1);

        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(accept_loop(
                        acceptor,
                        local_addr,
                        backend,
                        on_accept,
                        close_rx,
                    )),
                    Err(err) => error!("accept runtime for {} failed: {}", local_addr, err),
                }
                worker.done();
            });
        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                // the closure, and the worker registered above, were dropped
                // unrun; balance the wait group before reporting
                if let Some(wg) = self.wg.lock().as_ref() {
                    wg.done();
                }
                Err(err)
            }
        }
    }

    /// Signals every accept loop to exit. Established sessions are unaffected.
    pub fn stop(&self) {
        if let Some(close_tx) = self.close_tx.lock().take() {
            let _ = close_tx.send(());
        }
    }

    /// Blocks until every accept loop has exited.
    pub fn wait_for_stop(&self) {
        let wg = self.wg.lock().take();
        if let Some(wg) = wg {
            wg.wait();
        }
    }

    /// [`stop`](Listener::stop) followed by
    /// [`wait_for_stop`](Listener::wait_for_stop).
    pub fn graceful_stop(&self) {
        self.stop();
        self.wait_for_stop();
    }
}

impl<B: Backend> Drop for Listener<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Acceptor {
    Tcp(StdTcpListener),
    #[cfg(unix)]
    Unix(StdUnixListener, PathBuf),
}

enum AsyncAcceptor {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

impl AsyncAcceptor {
    fn from_std(acceptor: Acceptor) -> io::Result<Self> {
        Ok(match acceptor {
            Acceptor::Tcp(l) => AsyncAcceptor::Tcp(tokio::net::TcpListener::from_std(l)?),
            #[cfg(unix)]
            Acceptor::Unix(l, path) => {
                AsyncAcceptor::Unix(tokio::net::UnixListener::from_std(l)?, path)
            }
        })
    }

    async fn accept(&self) -> io::Result<Stream> {
        match self {
            AsyncAcceptor::Tcp(l) => {
                let (socket, _) = l.accept().await?;
                Ok(Stream::Tcp(socket.into_std()?))
            }
            #[cfg(unix)]
            AsyncAcceptor::Unix(l, _) => {
                let (socket, _) = l.accept().await?;
                Ok(Stream::Unix(socket.into_std()?))
            }
        }
    }
}

impl Drop for AsyncAcceptor {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let AsyncAcceptor::Unix(_, path) = self {
            if let Err(err) = std::fs::remove_file(&*path) {
                trace!("remove {}: {}", path.display(), err);
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn accept_loop<B: Backend>(
    acceptor: Acceptor,
    local_addr: Addr,
    backend: Arc<B>,
    on_accept: AcceptFn<B>,
    mut close_rx: broadcast::Receiver<()>,
) {
    let acceptor = match AsyncAcceptor::from_std(acceptor) {
        Ok(acceptor) => acceptor,
        Err(err) => {
            error!("listener on {} failed to register: {}", local_addr, err);
            return;
        }
    };
    trace!("listening on {}", local_addr);
    loop {
        tokio::select! {
            _ = close_rx.recv() => {
                trace!("listener on {} exit loop", local_addr);
                break;
            }
            res = acceptor.accept() => {
                match res {
                    Ok(stream) => {
                        trace!("accepted {}", stream);
                        match backend.bind(stream) {
                            Ok(transport) => (on_accept)(transport),
                            Err(err) => warn!("binding accepted stream failed: {}", err),
                        }
                    }
                    Err(err) if is_transient(&err) => {
                        trace!("listener on {} accept error {}", local_addr, err);
                    }
                    Err(err) => {
                        warn!("listener on {} accept error {}", local_addr, err);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::TcpStream,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use streamio_rt::SyncBackend;

    #[test]
    fn bind_without_on_accept_fails() {
        let listener = Listener::new(SyncBackend::new());
        let err = listener.bind_tcp("127.0.0.1:0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn stop_ends_accept_loop() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let mut listener = Listener::new(SyncBackend::new());
        listener.on_accept(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let addr = match listener.bind_tcp("127.0.0.1:0").unwrap() {
            Addr::Inet(addr) => addr,
            other => panic!("unexpected address {}", other),
        };

        let _conn = TcpStream::connect(addr).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while accepted.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        listener.graceful_stop();
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn graceful_stop_without_bind_returns() {
        let listener = Listener::new(SyncBackend::new());
        listener.graceful_stop();
    }
}
