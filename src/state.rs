//! Completion states delivered to callbacks.

use std::fmt;

/// The terminal state of a posted request or protocol operation.
///
/// Every accepted submission delivers exactly one callback carrying one of
/// these values; transport states propagate unchanged through the stream,
/// TLS and HTTP layers unless those layers recover from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The operation completed.
    Ok,
    /// A generic I/O failure; the backend detail is logged, not propagated.
    Failed,
    /// Peer close or clean end of stream.
    Closed,
    /// Cancelled via a kill.
    Killed,
    /// Still in flight; not normally user-visible.
    Pending,
    /// The per-operation deadline elapsed.
    Timeout,
    /// The platform lacks the facility (e.g. no sendfile fallback).
    NotSupported,
    /// An internal protocol error with no better classification.
    UnknownError,
    /// An HTTP-level outcome.
    Http(HttpState),
    /// A TLS-level outcome.
    Ssl(SslState),
}

/// HTTP-specific outcome classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    /// 204 No Content.
    Response204,
    /// A 3xx response, carrying the exact code.
    Response3xx(u16),
    /// A 4xx response, carrying the exact code.
    Response4xx(u16),
    /// A 5xx response, carrying the exact code.
    Response5xx(u16),
    /// A response code outside the recognized classes.
    ResponseUnknown,
    /// A Range option with begin past end, rejected before any I/O.
    RangeInvalid,
    /// The POST body transfer failed.
    PostFailed,
    /// A redirect could not be followed.
    RedirectFailed,
    /// The response is compressed but inflate support is unavailable.
    GzipNotSupported,
    /// Any other HTTP protocol error.
    UnknownError,
}

/// TLS-specific outcome classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslState {
    /// The engine needs more ciphertext from the peer.
    WantRead,
    /// The engine has ciphertext that must reach the peer.
    WantWrite,
    /// Waiting on the transport failed.
    WaitFailed,
    /// The handshake or record exchange timed out.
    Timeout,
    /// The engine reported a fatal error.
    Failed,
    /// Any other TLS protocol error.
    UnknownError,
}

impl State {
    /// Whether this is the `Ok` state.
    pub fn is_ok(self) -> bool {
        self == State::Ok
    }

    /// Whether this state was caused by a kill.
    pub fn is_killed(self) -> bool {
        self == State::Killed
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            State::Ok => f.write_str("ok"),
            State::Failed => f.write_str("failed"),
            State::Closed => f.write_str("closed"),
            State::Killed => f.write_str("killed"),
            State::Pending => f.write_str("pending"),
            State::Timeout => f.write_str("timeout"),
            State::NotSupported => f.write_str("not supported"),
            State::UnknownError => f.write_str("unknown error"),
            State::Http(http) => write!(f, "http: {:?}", http),
            State::Ssl(ssl) => write!(f, "ssl: {:?}", ssl),
        }
    }
}
