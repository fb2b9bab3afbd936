//! The POST body pump.
//!
//! Copies a source (inline bytes or a file) to the socket stream chunk
//! by chunk, with an optional bytes-per-second cap and a per-chunk
//! progress callback that may abort. The final callback carries `Closed`
//! once the source is exhausted, which is the client's cue to start
//! reading the response head.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::aico::Aico;
use crate::proactor::lock;
use crate::state::State;
use crate::stream::SockStream;
use crate::{Aicp, Error, Result};

const CHUNK: usize = 8192;

/// Per-chunk progress: `(state, offset, size, save, rate)`; false aborts.
pub(crate) type TransferFunc = Arc<dyn Fn(State, u64, i64, u64, u64) -> bool + Send + Sync>;

enum Source {
    Data(Bytes),
    File { aico: Aico, size: u64 },
}

struct TransferInner {
    source: Source,
    offset: u64,
    lrate: u64,
    window_start: Instant,
    window_bytes: u64,
    started: Instant,
}

/// A single-use body transfer.
pub(crate) struct Transfer {
    aicp: Aicp,
    inner: Mutex<TransferInner>,
    running: AtomicBool,
    killed: AtomicBool,
}

impl Transfer {
    pub(crate) fn with_data(aicp: Aicp, data: Bytes) -> Arc<Transfer> {
        Transfer::new(aicp, Source::Data(data))
    }

    pub(crate) fn with_file<P: AsRef<Path>>(aicp: Aicp, path: P) -> Result<Arc<Transfer>> {
        let file = std::fs::File::open(path).map_err(Error::new_io)?;
        let size = file.metadata().map_err(Error::new_io)?.len();
        let aico = aicp.aico_file(file)?;
        Ok(Transfer::new(aicp, Source::File { aico, size }))
    }

    fn new(aicp: Aicp, source: Source) -> Arc<Transfer> {
        let now = Instant::now();
        Arc::new(Transfer {
            aicp,
            inner: Mutex::new(TransferInner {
                source,
                offset: 0,
                lrate: 0,
                window_start: now,
                window_bytes: 0,
                started: now,
            }),
            running: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        })
    }

    /// Total body size in bytes.
    pub(crate) fn size(&self) -> u64 {
        match lock(&self.inner).source {
            Source::Data(ref data) => data.len() as u64,
            Source::File { size, .. } => size,
        }
    }

    /// Cap the transfer at `rate` bytes per second (0 removes the cap).
    pub(crate) fn limit_rate(&self, rate: u64) {
        lock(&self.inner).lrate = rate;
    }

    /// Whether nothing is being pumped right now.
    pub(crate) fn clos_try(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Abort the transfer; the in-flight chunk completes with `Killed`.
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("transfer: kill");
        if let Source::File { ref aico, .. } = lock(&self.inner).source {
            aico.kill();
        }
    }

    /// Release the source's handle once the transfer is over.
    pub(crate) fn dispose(&self) {
        if let Source::File { ref aico, .. } = lock(&self.inner).source {
            self.aicp.inner().dispose(aico);
        }
    }

    /// Pump the whole source into `stream`.
    pub(crate) fn run(self: Arc<Self>, stream: SockStream, func: TransferFunc) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let mut inner = lock(&self.inner);
            let now = Instant::now();
            inner.window_start = now;
            inner.started = now;
            inner.window_bytes = 0;
        }
        self.step(stream, func);
        true
    }

    fn step(self: Arc<Self>, stream: SockStream, func: TransferFunc) {
        if self.killed.load(Ordering::SeqCst) {
            self.finish(State::Killed, func);
            return;
        }
        let (offset, size) = {
            let inner = lock(&self.inner);
            (inner.offset, match inner.source {
                Source::Data(ref data) => data.len() as u64,
                Source::File { size, .. } => size,
            })
        };
        if offset >= size {
            self.finish(State::Closed, func);
            return;
        }
        let want = (size - offset).min(CHUNK as u64) as usize;
        match {
            let inner = lock(&self.inner);
            match inner.source {
                Source::Data(ref data) => {
                    Some(data.slice(offset as usize..offset as usize + want))
                }
                Source::File { .. } => None,
            }
        } {
            Some(chunk) => self.send(stream, chunk, func),
            None => {
                // read the next span from the file handle, then send it
                let aico = match lock(&self.inner).source {
                    Source::File { ref aico, .. } => aico.clone(),
                    Source::Data(_) => return,
                };
                let this = self.clone();
                let fallback = func.clone();
                let posted = aico.read(offset, want, move |mut aice| {
                    match aice.state {
                        State::Ok => {
                            let data = aice
                                .take_data()
                                .map(|buf| buf.freeze())
                                .unwrap_or_default();
                            if data.is_empty() {
                                this.finish(State::Closed, func);
                            } else {
                                this.send(stream, data, func);
                            }
                        }
                        State::Closed => this.finish(State::Closed, func),
                        other => this.finish(other, func),
                    }
                    true
                });
                if !posted {
                    self.finish(State::Http(crate::HttpState::PostFailed), fallback);
                }
            }
        }
    }

    fn send(self: Arc<Self>, stream: SockStream, chunk: Bytes, func: TransferFunc) {
        let saved = chunk.len() as u64;
        let this = self.clone();
        let again = stream.clone();
        let fallback = func.clone();
        let posted = stream.writ(chunk, move |state| match state {
            State::Ok => this.account(again, saved, func),
            other => this.finish(other, func),
        });
        if !posted {
            debug!("transfer: writ not posted");
            self.finish(State::Http(crate::HttpState::PostFailed), fallback);
        }
    }

    /// Progress bookkeeping after a chunk lands, then pace the next one.
    fn account(self: Arc<Self>, stream: SockStream, saved: u64, func: TransferFunc) {
        let (offset, size, rate, delay) = {
            let mut inner = lock(&self.inner);
            inner.offset += saved;
            inner.window_bytes += saved;
            let elapsed = inner.started.elapsed().as_millis().max(1) as u64;
            let rate = inner.offset.saturating_mul(1000) / elapsed;
            let delay = if inner.lrate > 0 && inner.window_bytes >= inner.lrate {
                let window = inner.window_start.elapsed().as_millis() as u64;
                if window < 1000 {
                    Some(1000 - window)
                } else {
                    inner.window_start = Instant::now();
                    inner.window_bytes = 0;
                    None
                }
            } else {
                None
            };
            let size = match inner.source {
                Source::Data(ref data) => data.len() as u64,
                Source::File { size, .. } => size,
            };
            (inner.offset, size, rate, delay)
        };
        if !func(State::Ok, offset, size as i64, saved, rate) {
            self.finish(State::UnknownError, func);
            return;
        }
        match delay {
            Some(delay) => {
                trace!(delay, "transfer: rate limited");
                let this = self.clone();
                let again = stream.clone();
                let fallback = func.clone();
                let scheduled = stream.task(delay, move |state| {
                    {
                        let mut inner = lock(&this.inner);
                        inner.window_start = Instant::now();
                        inner.window_bytes = 0;
                    }
                    if state == State::Ok {
                        this.step(again, func);
                    } else {
                        this.finish(state, func);
                    }
                });
                if !scheduled {
                    self.finish(State::UnknownError, fallback);
                }
            }
            None => self.step(stream, func),
        }
    }

    fn finish(self: Arc<Self>, state: State, func: TransferFunc) {
        self.running.store(false, Ordering::SeqCst);
        let (offset, size, rate) = {
            let inner = lock(&self.inner);
            let elapsed = inner.started.elapsed().as_millis().max(1) as u64;
            let size = match inner.source {
                Source::Data(ref data) => data.len() as u64,
                Source::File { size, .. } => size,
            };
            (
                inner.offset,
                size,
                inner.offset.saturating_mul(1000) / elapsed,
            )
        };
        trace!(%state, offset, "transfer: finished");
        func(state, offset, size as i64, 0, rate);
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
