use std::io;

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    NoError,
    Socket,
    CryptoCore,
    Decryption,
    Protocol,
    BufferExceeded,
    ServerError,
    PeerTimeout,
    WrongState,
    InvalidParameters,
    System,
    ConnectionRefused,
}

/// A concrete failure: the kind plus the captured OS error code, when the
/// failure came out of a syscall.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Fault {
    pub kind: ErrorKind,
    pub code: i32,
}

impl Fault {
    #[inline]
    pub fn new(kind: ErrorKind) -> Fault {
        Fault { kind, code: 0 }
    }

    #[inline]
    pub fn socket(err: &io::Error) -> Fault {
        Fault {
            kind: ErrorKind::Socket,
            code: err.raw_os_error().unwrap_or(0),
        }
    }
}

pub type ConnResult<T> = Result<T, Fault>;

/// Internal result plumbing for the restartable I/O paths. `Wait` means the
/// operation would block and should be resumed on the next readiness event;
/// everything else is fatal for the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(Fault),
}

impl NetError {
    #[inline]
    pub fn fatal(kind: ErrorKind) -> NetError {
        NetError::Fatal(Fault::new(kind))
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            _ => NetError::Fatal(Fault::socket(&io_error)),
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}
