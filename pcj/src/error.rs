use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories of the runtime. Reply messages carry these across the
/// wire so remote failures re-raise at the requester's future.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// Invalid or contradictory launch configuration.
    Config = 0,
    /// A peer connection could not be established.
    ConnectFailed = 1,
    /// A peer connection dropped while the job was still running.
    ConnectionLost = 2,
    /// Truncated stream, unknown kind or type tag, or undecodable payload.
    MalformedMessage = 3,
    UnknownGroup = 4,
    UnknownThread = 5,
    NoSuchStorage = 6,
    NoSuchVariable = 7,
    /// A stored value could not be decoded as the requested type.
    TypeMismatch = 8,
    /// A failure raised by user code in a remote handler.
    UserException = 9,
    Timeout = 10,
    /// Any other I/O failure on a peer socket.
    Io = 11,
}

impl ErrorKind {
    pub fn from_u8(value: u8) -> Option<ErrorKind> {
        Some(match value {
            0 => ErrorKind::Config,
            1 => ErrorKind::ConnectFailed,
            2 => ErrorKind::ConnectionLost,
            3 => ErrorKind::MalformedMessage,
            4 => ErrorKind::UnknownGroup,
            5 => ErrorKind::UnknownThread,
            6 => ErrorKind::NoSuchStorage,
            7 => ErrorKind::NoSuchVariable,
            8 => ErrorKind::TypeMismatch,
            9 => ErrorKind::UserException,
            10 => ErrorKind::Timeout,
            11 => ErrorKind::Io,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Config => "Config",
            ErrorKind::ConnectFailed => "ConnectFailed",
            ErrorKind::ConnectionLost => "ConnectionLost",
            ErrorKind::MalformedMessage => "MalformedMessage",
            ErrorKind::UnknownGroup => "UnknownGroup",
            ErrorKind::UnknownThread => "UnknownThread",
            ErrorKind::NoSuchStorage => "NoSuchStorage",
            ErrorKind::NoSuchVariable => "NoSuchVariable",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::UserException => "UserException",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Io => "Io",
        }
    }
}

/// An error kind plus human readable detail. The detail survives the wire
/// round trip; for `UserException` it carries the remote failure message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    detail: String,
}

impl Error {
    #[inline]
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            detail: String::new(),
        }
    }

    #[inline]
    pub fn with_detail<S: Into<String>>(kind: ErrorKind, detail: S) -> Error {
        Error {
            kind,
            detail: detail.into(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.detail)
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectFailed,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionLost,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };

        Error::with_detail(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_roundtrip() {
        for value in 0..12u8 {
            let kind = ErrorKind::from_u8(value).unwrap();
            assert_eq!(kind as u8, value);
        }
        assert_eq!(ErrorKind::from_u8(12), None);
    }

    #[test]
    fn io_error_folding() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);

        let err: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);

        let err: Error = io::Error::from(io::ErrorKind::InvalidData).into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn display_carries_detail() {
        let err = Error::with_detail(ErrorKind::NoSuchVariable, "x");
        assert_eq!(err.to_string(), "NoSuchVariable: x");
        assert_eq!(Error::new(ErrorKind::Timeout).to_string(), "Timeout");
    }
}
