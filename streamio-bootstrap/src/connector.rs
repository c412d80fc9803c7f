use log::trace;
use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

#[cfg(unix)]
use std::{os::unix::net::UnixStream, path::Path};

use streamio_rt::{Backend, Stream};

/// Dials connections and binds them to a backend.
#[derive(Debug, Clone)]
pub struct Connector<B: Backend> {
    backend: B,
    timeout: Option<Duration>,
    nodelay: bool,
}

impl<B: Backend> Connector<B> {
    /// Connector without a dial timeout.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            timeout: None,
            nodelay: false,
        }
    }

    /// Bounds each TCP connection attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Sets `TCP_NODELAY` on dialed TCP connections.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// The backend dialed connections are bound to.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Dials `addr`, trying each resolved address in turn.
    pub fn connect_tcp<A: ToSocketAddrs>(&self, addr: A) -> io::Result<B::Transport> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            let res = match self.timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match res {
                Ok(stream) => {
                    trace!("connected to {}", addr);
                    stream.set_nodelay(self.nodelay)?;
                    return self.backend.bind(Stream::from(stream));
                }
                Err(err) => {
                    trace!("connect to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    /// Dials a Unix socket path.
    #[cfg(unix)]
    pub fn connect_unix<P: AsRef<Path>>(&self, path: P) -> io::Result<B::Transport> {
        let stream = UnixStream::connect(path.as_ref())?;
        trace!("connected to {}", path.as_ref().display());
        self.backend.bind(Stream::from(stream))
    }
}
