use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use streamio::Addr;

/// A connected byte stream handed to a backend.
#[derive(Debug)]
pub enum Stream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix domain stream socket.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl From<TcpStream> for Stream {
    fn from(s: TcpStream) -> Self {
        Stream::Tcp(s)
    }
}

#[cfg(unix)]
impl From<UnixStream> for Stream {
    fn from(s: UnixStream) -> Self {
        Stream::Unix(s)
    }
}

#[cfg(unix)]
fn unix_addr(addr: std::os::unix::net::SocketAddr) -> Addr {
    Addr::Unix(addr.as_pathname().map(|p| p.to_path_buf()))
}

impl Stream {
    /// Duplicates the handle.
    pub fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
        }
    }

    /// Local endpoint.
    pub fn local_addr(&self) -> io::Result<Addr> {
        match self {
            Stream::Tcp(s) => s.local_addr().map(Addr::Inet),
            #[cfg(unix)]
            Stream::Unix(s) => s.local_addr().map(unix_addr),
        }
    }

    /// Remote endpoint.
    pub fn peer_addr(&self) -> io::Result<Addr> {
        match self {
            Stream::Tcp(s) => s.peer_addr().map(Addr::Inet),
            #[cfg(unix)]
            Stream::Unix(s) => s.peer_addr().map(unix_addr),
        }
    }

    /// Shuts one or both directions.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(how),
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown(how),
        }
    }

    /// Switches blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    /// Disables Nagle's algorithm on TCP; no-op for Unix sockets.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nodelay(nodelay),
            #[cfg(unix)]
            Stream::Unix(_) => Ok(()),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_write_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    /// Blocking read bounded by `deadline`.
    pub(crate) fn read_with_deadline(
        &self,
        buf: &mut [u8],
        deadline: Option<Duration>,
    ) -> io::Result<usize> {
        self.set_read_timeout(deadline)?;
        loop {
            let res = match self {
                Stream::Tcp(s) => (&*s).read(buf),
                #[cfg(unix)]
                Stream::Unix(s) => (&*s).read(buf),
            };
            match res {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    /// Blocking write of all of `buf`, the deadline bounding the whole
    /// buffer. `written` tracks progress so a timed out write can resume.
    pub(crate) fn write_with_deadline(
        &self,
        buf: &[u8],
        deadline: Option<Duration>,
        written: &mut usize,
    ) -> io::Result<()> {
        let until = deadline.map(|d| Instant::now() + d);
        if until.is_none() {
            self.set_write_timeout(None)?;
        }
        while *written < buf.len() {
            if let Some(until) = until {
                let left = until.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(io::Error::from(io::ErrorKind::TimedOut));
                }
                self.set_write_timeout(Some(left))?;
            }
            let res = match self {
                Stream::Tcp(s) => (&*s).write(&buf[*written..]),
                #[cfg(unix)]
                Stream::Unix(s) => (&*s).write(&buf[*written..]),
            };
            match res {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => *written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr() {
            Ok(addr) => write!(f, "stream({})", addr),
            Err(_) => f.write_str("stream(disconnected)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (Stream, Stream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Stream::from(client), Stream::from(server))
    }

    #[test]
    fn read_deadline_expires_as_timeout() {
        let (a, _b) = pair();
        let mut buf = [0u8; 8];
        let err = a
            .read_with_deadline(&mut buf, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(streamio::is_timeout(&err), "{:?}", err);
    }

    #[test]
    fn write_then_read() {
        let (a, b) = pair();
        let mut written = 0;
        a.write_with_deadline(b"ping", Some(Duration::from_secs(1)), &mut written)
            .unwrap();
        assert_eq!(written, 4);
        let mut buf = [0u8; 8];
        let n = b.read_with_deadline(&mut buf, None).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(a.peer_addr().unwrap(), b.local_addr().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn unix_pair_addresses_are_unnamed() {
        let (a, _b) = UnixStream::pair().unwrap();
        let a = Stream::from(a);
        assert_eq!(a.local_addr().unwrap(), Addr::Unix(None));
    }
}
