//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have `aicp` `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur setting up or tearing down the runtime.
///
/// Completion outcomes never travel through this type; they are delivered
/// to callbacks as [`crate::State`] values. `Error` covers the synchronous
/// failures: registering a handle, binding a socket, opening a file,
/// constructing the poller.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The OS poller could not be created or woken.
    Poller,
    /// The handle registry is full or the handle is in the wrong state.
    Handle,
    /// An `io::Error` occurred while creating or binding a resource.
    Io,
    /// A user-supplied option was rejected.
    User,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_poller<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Poller).with(cause)
    }

    pub(crate) fn new_handle() -> Error {
        Error::new(Kind::Handle)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_user(msg: &'static str) -> Error {
        Error::new(Kind::User).with(msg)
    }

    /// Returns true if the error came from the OS poller.
    pub fn is_poller(&self) -> bool {
        matches!(self.inner.kind, Kind::Poller)
    }

    /// Returns true if the error came from handle registration or state.
    pub fn is_handle(&self) -> bool {
        matches!(self.inner.kind, Kind::Handle)
    }

    /// Returns true if the error wraps an `io::Error`.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Poller => "poller error",
            Kind::Handle => "invalid handle",
            Kind::Io => "I/O error",
            Kind::User => "invalid option",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("aicp::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn error_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::new_io(io);
        assert!(err.is_io());
        assert!(err.source().is_some());
        assert!(err.into_cause().is_some());
    }
}
