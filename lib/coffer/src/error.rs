use std::fmt;
use std::io;

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors emitted by the data-plane core. None of these are recovered
/// internally: a filter chain records the first error and refuses further
/// work, and the protocol helper leaves a failed slot empty so a retry will
/// re-spawn.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A driver violated the filter contract (e.g. claimed there was more
    /// output but produced none into a fresh buffer).
    FilterInterface(String),
    /// A result was requested for an unknown or resultless stage.
    FilterResultMissing(String),
    /// An operation was attempted on a closed chain.
    FilterClosed,
    /// The peer identified itself with an unexpected service name.
    ProtocolHandshake { expected: String, actual: String },
    /// An endpoint blocked past the configured protocol timeout.
    ProtocolTimeout,
    /// A frame arrived that could not be decoded.
    ProtocolFrame(String),
    /// The peer answered with an error frame.
    ProtocolResponse { code: i64, message: String },
    /// A child process could not be started or managed.
    ExecSpawn { name: String, kind: io::ErrorKind },
    /// A child process exited with a non-zero status.
    ExecStatus { name: String, code: i32 },
    /// OS-level read failure on a handle.
    IoRead(io::ErrorKind),
    /// OS-level write failure on a handle.
    IoWrite(io::ErrorKind),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoreError::FilterInterface(detail) => write!(f, "invalid filter interface: {}", detail),
            CoreError::FilterResultMissing(filter_type) => {
                write!(f, "no result available for filter '{}'", filter_type)
            }
            CoreError::FilterClosed => write!(f, "filter chain is closed"),
            CoreError::ProtocolHandshake { expected, actual } => write!(
                f,
                "expected service '{}' but peer reported '{}'",
                expected, actual
            ),
            CoreError::ProtocolTimeout => write!(f, "protocol timeout"),
            CoreError::ProtocolFrame(detail) => write!(f, "invalid protocol frame: {}", detail),
            CoreError::ProtocolResponse { code, message } => {
                write!(f, "peer error [{}]: {}", code, message)
            }
            CoreError::ExecSpawn { name, kind } => {
                write!(f, "unable to execute '{}': {:?}", name, kind)
            }
            CoreError::ExecStatus { name, code } => {
                write!(f, "'{}' exited with status {}", name, code)
            }
            CoreError::IoRead(kind) => write!(f, "read failure: {:?}", kind),
            CoreError::IoWrite(kind) => write!(f, "write failure: {:?}", kind),
        }
    }
}

/// Fold an OS read error into the core error plumbing. Timeouts reported by
/// handles surface as protocol timeouts so callers need not special-case the
/// transport.
#[inline]
pub fn read_err(err: io::Error) -> CoreError {
    match err.kind() {
        io::ErrorKind::TimedOut => CoreError::ProtocolTimeout,
        kind => CoreError::IoRead(kind),
    }
}

/// Fold an OS write error into the core error plumbing.
#[inline]
pub fn write_err(err: io::Error) -> CoreError {
    match err.kind() {
        io::ErrorKind::TimedOut => CoreError::ProtocolTimeout,
        kind => CoreError::IoWrite(kind),
    }
}
