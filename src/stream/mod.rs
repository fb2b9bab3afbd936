//! The async stream pipeline.
//!
//! A pipeline is a socket transport ([`SockStream`]) optionally wrapped by
//! byte-transform composites ([`FilterStream`]). Composition is immutable:
//! a composite is built over its upstream once and is a distinct type from
//! the bare socket stream, and a pipeline containing a filter cannot seek
//! because filters do not preserve offsets.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::proactor::lock;
use crate::state::State;

pub use self::chunked::ChunkedFilter;
pub use self::inflate::InflateFilter;
pub use self::sock::SockStream;

mod chunked;
mod inflate;
mod sock;

/// A byte transform with a push/pull interface.
///
/// Upstream bytes go in with [`Filter::push`], transformed bytes come out
/// with [`Filter::pull`]. A filter reports its own end of stream (a
/// terminating zero chunk, a finished compressed frame) through
/// [`Filter::eof`].
pub trait Filter: Send {
    /// Consume upstream bytes. Fails on malformed input.
    fn push(&mut self, data: &[u8]) -> io::Result<()>;

    /// Drain whatever output the filter has produced so far.
    fn pull(&mut self) -> Bytes;

    /// Whether the transform has reached its natural end.
    fn eof(&self) -> bool;

    /// Upstream reached end of stream: flush any buffered tail.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Bound the input the filter will consume, so a decoder with no
    /// in-band terminator knows when its frame ends.
    fn limit(&mut self, _limit: u64) {}
}

/// The stream a composite reads from.
#[derive(Clone)]
pub enum Upstream {
    /// The socket transport.
    Sock(SockStream),
    /// Another composite (e.g. inflate over chunked).
    Filter(FilterStream),
}

struct FilterShared {
    up: Upstream,
    filter: Mutex<Box<dyn Filter>>,
}

/// A read-only composite: a filter applied over an upstream stream.
/// Cheap to clone; clones share the filter state.
#[derive(Clone)]
pub struct FilterStream {
    shared: Arc<FilterShared>,
}

impl FilterStream {
    /// Build the composite. The upstream is owned by the composite from
    /// here on.
    pub fn new(up: Upstream, filter: Box<dyn Filter>) -> FilterStream {
        FilterStream {
            shared: Arc::new(FilterShared {
                up,
                filter: Mutex::new(filter),
            }),
        }
    }

    /// Inject bytes read past a boundary (e.g. past the response headers)
    /// before the first upstream read; they must come out of the filter
    /// byte-identically transformed.
    pub fn push(&self, data: &[u8]) -> io::Result<()> {
        lock(&self.shared.filter).push(data)
    }

    /// Bound the filter's input consumption.
    pub fn limit(&self, limit: u64) {
        lock(&self.shared.filter).limit(limit)
    }

    /// Read transformed bytes.
    ///
    /// `func` runs once per produced span while it returns `true`; a
    /// `Closed` callback with no bytes marks the end of the transform.
    pub fn read<F>(&self, size: usize, mut func: F) -> bool
    where
        F: FnMut(State, Bytes) -> bool + Send + 'static,
    {
        // what the filter already holds is delivered before any socket I/O
        let (pending, eof) = {
            let mut filter = lock(&self.shared.filter);
            (filter.pull(), filter.eof())
        };
        if !pending.is_empty() && !func(State::Ok, pending) {
            return true;
        }
        if eof {
            func(State::Closed, Bytes::new());
            return true;
        }
        let this = self.clone();
        let func: Box<dyn FnMut(State, Bytes) -> bool + Send + 'static> =
            Box::new(move |state, data| match state {
            State::Ok => {
                let mut filter = lock(&this.shared.filter);
                if filter.push(&data).is_err() {
                    drop(filter);
                    func(State::UnknownError, Bytes::new());
                    return false;
                }
                let out = filter.pull();
                let eof = filter.eof();
                drop(filter);
                if !out.is_empty() && !func(State::Ok, out) {
                    return false;
                }
                if eof {
                    func(State::Closed, Bytes::new());
                    return false;
                }
                true
            }
            State::Closed => {
                let mut filter = lock(&this.shared.filter);
                let flushed = filter.finish();
                let out = filter.pull();
                drop(filter);
                if flushed.is_err() {
                    func(State::UnknownError, Bytes::new());
                    return false;
                }
                if !out.is_empty() && !func(State::Ok, out) {
                    return false;
                }
                func(State::Closed, Bytes::new());
                false
            }
            other => {
                func(other, Bytes::new());
                false
            }
        });
        self.up_read(size, func)
    }

    fn up_read(
        &self,
        size: usize,
        func: Box<dyn FnMut(State, Bytes) -> bool + Send + 'static>,
    ) -> bool {
        match self.shared.up {
            Upstream::Sock(ref sock) => sock.read(size, func),
            Upstream::Filter(ref filter) => filter.read(size, func),
        }
    }

    /// The socket transport at the bottom of this pipeline.
    pub fn sock(&self) -> SockStream {
        match self.shared.up {
            Upstream::Sock(ref sock) => sock.clone(),
            Upstream::Filter(ref filter) => filter.sock(),
        }
    }
}

impl std::fmt::Debug for FilterStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStream").finish()
    }
}
