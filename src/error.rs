use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Service name too long")]
    LineTooLong,

    #[error("Service name contains invalid character")]
    InvalidCharacter,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("Service already exists")]
    AlreadyExists(String),

    #[error("Service not found")]
    NotFound(String),

    /// The daemon refused a registration with the given reason.
    #[error("registration rejected: {0}")]
    Rejected(String),

    /// The daemon refused a remote connect with the given reason.
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("operation timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    /// Closest `io::ErrorKind` for callers that speak socket errors.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::LineTooLong | Self::InvalidCharacter => io::ErrorKind::InvalidInput,
            Self::PeerClosed | Self::ConnectionReset(_) => io::ErrorKind::ConnectionReset,
            Self::AlreadyExists(_) | Self::Rejected(_) => io::ErrorKind::AddrInUse,
            Self::NotFound(_) | Self::Refused(_) => io::ErrorKind::ConnectionRefused,
            Self::Timeout => io::ErrorKind::TimedOut,
            Self::Io(e) => e.kind(),
        }
    }

    /// True for errors caused by a malformed request line.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::LineTooLong | Self::InvalidCharacter | Self::PeerClosed
        )
    }

    pub(crate) fn reset(detail: impl Into<String>) -> Self {
        Self::ConnectionReset(detail.into())
    }
}

impl From<MuxError> for io::Error {
    fn from(e: MuxError) -> Self {
        match e {
            MuxError::Io(inner) => inner,
            other => io::Error::new(other.kind(), other),
        }
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_failures_surface_the_wire_reasons() {
        assert_eq!(MuxError::LineTooLong.to_string(), "Service name too long");
        assert_eq!(
            MuxError::InvalidCharacter.to_string(),
            "Service name contains invalid character"
        );
        assert_eq!(
            MuxError::AlreadyExists("foo".into()).to_string(),
            "Service already exists"
        );
        assert_eq!(
            MuxError::NotFound("foo".into()).to_string(),
            "Service not found"
        );
    }

    #[test]
    fn client_errors_map_to_socket_kinds() {
        assert_eq!(
            MuxError::Rejected("x".into()).kind(),
            io::ErrorKind::AddrInUse
        );
        assert_eq!(
            MuxError::Refused("x".into()).kind(),
            io::ErrorKind::ConnectionRefused
        );
        assert_eq!(MuxError::Timeout.kind(), io::ErrorKind::TimedOut);
        assert_eq!(
            MuxError::reset("bad sentinel").kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn converts_back_into_io_error() {
        let err: io::Error = MuxError::Timeout.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let inner = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err: io::Error = MuxError::Io(inner).into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
