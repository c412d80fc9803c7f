use std::{error::Error, io, sync::Arc};

/// Boxed error returned by user-supplied encoders and unpackers.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Errors surfaced by a [`StreamSession`](crate::StreamSession).
///
/// The type is cheap to clone so the same value can be recorded as the close
/// reason and handed to the error callback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// An empty raw payload was handed to `send`.
    #[error("invalid object")]
    InvalidObject,
    /// A typed message was sent before any encoder was installed.
    #[error("no encoder installed")]
    InvalidEncoder,
    /// The outbound queue is at capacity.
    #[error("send queue full")]
    SendQueueFull,
    /// A send or a write did not complete before its deadline.
    #[error("send timeout")]
    SendTimeout,
    /// A read did not complete before its deadline.
    #[error("recv timeout")]
    RecvTimeout,
    /// The session, or the direction the operation needs, is closed.
    #[error("socket closed")]
    SocketClosed,
    /// The peer closed its write half.
    #[error("connection closed by peer")]
    Eof,
    /// The unpacker rejected the inbound byte stream.
    #[error("unpack error: {0}")]
    Unpack(Arc<dyn Error + Send + Sync + 'static>),
    /// The encoder rejected an outbound message.
    #[error("encode error: {0}")]
    Encode(Arc<dyn Error + Send + Sync + 'static>),
    /// The transport reported an I/O failure.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    /// Application supplied close reason.
    #[error("{0}")]
    Other(Arc<dyn Error + Send + Sync + 'static>),
}

impl SessionError {
    /// Wraps an application error, typically used as a close reason.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        SessionError::Other(Arc::from(err.into()))
    }

    pub(crate) fn unpack(err: BoxError) -> Self {
        SessionError::Unpack(Arc::from(err))
    }

    pub(crate) fn encode(err: BoxError) -> Self {
        SessionError::Encode(Arc::from(err))
    }

    /// Returns true for the transient deadline errors the pipelines retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::SendTimeout | SessionError::RecvTimeout)
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Io(Arc::new(err))
    }
}

/// Returns true when `err` is the deadline expiry of a socket operation.
///
/// Blocking sockets report an expired `SO_RCVTIMEO`/`SO_SNDTIMEO` as
/// `WouldBlock` on unix and `TimedOut` on windows; the async backend reports
/// `TimedOut`.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_accepts_plain_strings() {
        let err = SessionError::other("idle");
        assert_eq!(err.to_string(), "idle");
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), "idle");
    }

    #[test]
    fn timeout_detection() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(SessionError::RecvTimeout.is_timeout());
        assert!(!SessionError::Eof.is_timeout());
    }
}
