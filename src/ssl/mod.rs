//! The async TLS bridge.
//!
//! A synchronous TLS engine exchanges ciphertext through a BIO: its own
//! open/read/write/close-notify entries call BIO read and write hooks, each
//! returning progress, want-read, want-write or an error. The bridge runs
//! such an engine on the proactor without ever letting BIO I/O block:
//!
//! 1. prime the [`Bio`] rendezvous to "no current need",
//! 2. enter the engine once,
//! 3. ciphertext the engine produced is flushed to the socket first,
//! 4. a recorded BIO-read need becomes an async `recv` on the bound handle,
//! 5. when the socket op completes its bytes land in the BIO and the engine
//!    is re-entered from step 1,
//! 6. an engine verdict (ok, error, or plaintext moved) is delivered to the
//!    user callback only once nothing remains to flush.
//!
//! At most one BIO need is outstanding per bridge at a time, and buffered
//! partial BIO bytes are held across engine re-entries byte-identically:
//! the engine never sees bridge buffers move under it.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::aico::{Aico, TimeoutKind};
use crate::proactor::lock;
use crate::state::{SslState, State};
use crate::Aicp;

#[cfg(feature = "rustls")]
pub use self::rustls::RustlsEngine;

#[cfg(feature = "rustls")]
mod rustls;

/// Builds an engine per connection, given the server name.
pub type EngineFactory =
    Arc<dyn Fn(&str) -> io::Result<Box<dyn SslEngine>> + Send + Sync>;

/// The outcome of an engine control entry (open, close-notify).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The entry completed.
    Ok,
    /// The engine needs ciphertext from the peer.
    WantRead,
    /// The engine produced ciphertext that must reach the peer.
    WantWrite,
    /// The engine failed with the mapped state.
    Failed(SslState),
}

/// The outcome of an engine data entry (read, write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslIo {
    /// Plaintext bytes moved.
    Done(usize),
    /// The peer closed the TLS stream.
    Closed,
    /// The engine needs ciphertext from the peer.
    WantRead,
    /// The engine produced ciphertext that must reach the peer.
    WantWrite,
    /// The engine failed with the mapped state.
    Failed(SslState),
}

/// The consumed synchronous TLS engine.
///
/// Every entry is non-blocking: the engine reads and writes ciphertext
/// through the supplied [`Bio`] and reports want-read/want-write instead of
/// blocking. Engines must never return more bytes than requested.
pub trait SslEngine: Send {
    /// Drive the handshake one step.
    fn open_try(&mut self, bio: &mut Bio) -> Progress;

    /// Read plaintext into `buf`.
    fn read(&mut self, bio: &mut Bio, buf: &mut [u8]) -> SslIo;

    /// Write plaintext from `data`.
    fn writ(&mut self, bio: &mut Bio, data: &[u8]) -> SslIo;

    /// Send a close-notify.
    fn clos_try(&mut self, bio: &mut Bio) -> Progress;
}

/// The one-slot rendezvous between the engine's call frame and the
/// bridge's socket completions.
///
/// Reads drain `incoming` or record a want; writes buffer into `outgoing`
/// and always succeed. The bridge owns both staging buffers exclusively;
/// engine buffer pointers are never reused across suspensions.
pub struct Bio {
    incoming: BytesMut,
    outgoing: BytesMut,
    want: Option<usize>,
}

impl Bio {
    fn new() -> Bio {
        Bio {
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            want: None,
        }
    }

    fn clear(&mut self) {
        self.incoming.clear();
        self.outgoing.clear();
        self.want = None;
    }

    /// Ciphertext produced by the engine, waiting for the socket.
    fn take_outgoing(&mut self) -> Bytes {
        self.outgoing.split().freeze()
    }

    fn feed(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }
}

impl io::Read for Bio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            // record the need; at most one is outstanding at a time
            self.want = Some(buf.len().max(1));
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "bio empty"));
        }
        let n = buf.len().min(self.incoming.len());
        buf[..n].copy_from_slice(&self.incoming[..n]);
        let _ = self.incoming.split_to(n);
        Ok(n)
    }
}

impl io::Write for Bio {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .field("want", &self.want)
            .finish()
    }
}

// bridge states
const CLOSED: u8 = 0;
const OPENING: u8 = 1;
const OPENED: u8 = 2;
const KILLING: u8 = 3;

enum SslOp {
    Open {
        func: Box<dyn FnOnce(State) + Send>,
    },
    Read {
        size: usize,
        func: Box<dyn FnOnce(State, Bytes) + Send>,
    },
    Writ {
        data: Bytes,
        func: Box<dyn FnOnce(State, usize) + Send>,
    },
    Clos {
        func: Box<dyn FnOnce(State) + Send>,
    },
}

/// The result of one engine entry, pending a flush before delivery.
enum Verdict {
    Open(State),
    Read(State, Bytes),
    Writ(State, usize),
    Clos(State),
}

struct SslInner {
    engine: Box<dyn SslEngine>,
    bio: Bio,
    aico: Option<Aico>,
    timeout: i64,
    op: Option<SslOp>,
    /// An engine verdict waiting for outgoing ciphertext to drain.
    verdict: Option<Verdict>,
    /// Delay for the first socket op of the current entry only.
    delay: u64,
}

struct SslShared {
    aicp: Aicp,
    state: AtomicU8,
    inner: Mutex<SslInner>,
}

/// A synchronous TLS engine driven by the proactor. Cheap to clone;
/// clones share the bridge state.
#[derive(Clone)]
pub struct SslStream {
    shared: Arc<SslShared>,
}

impl SslStream {
    /// Wrap an engine. Bind a socket handle with [`SslStream::set_aico`]
    /// before opening.
    pub fn new(aicp: Aicp, engine: Box<dyn SslEngine>) -> SslStream {
        SslStream {
            shared: Arc::new(SslShared {
                aicp,
                state: AtomicU8::new(CLOSED),
                inner: Mutex::new(SslInner {
                    engine,
                    bio: Bio::new(),
                    aico: None,
                    timeout: 0,
                    op: None,
                    verdict: None,
                    delay: 0,
                }),
            }),
        }
    }

    /// Bind the socket handle the ciphertext flows through.
    pub fn set_aico(&self, aico: Aico) {
        lock(&self.shared.inner).aico = Some(aico);
    }

    /// The fixed per-operation timeout in milliseconds, applied to the
    /// bound handle's receive and send deadlines.
    pub fn set_timeout(&self, timeout: i64) {
        lock(&self.shared.inner).timeout = timeout;
    }

    /// The owning proactor.
    pub fn aicp(&self) -> &Aicp {
        &self.shared.aicp
    }

    /// Whether the bridge is opened.
    pub fn is_opened(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == OPENED
    }

    /// Drive the handshake; the callback fires once with the outcome.
    pub fn open<F>(&self, func: F) -> bool
    where
        F: FnOnce(State) + Send + 'static,
    {
        match self.shared.state.compare_exchange(
            CLOSED,
            OPENING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(OPENED) => {
                func(State::Ok);
                return true;
            }
            Err(KILLING) => {
                func(State::Killed);
                return true;
            }
            Err(_) => return false,
        }
        {
            let mut inner = lock(&self.shared.inner);
            if inner.op.is_some() {
                drop(inner);
                self.shared.state.store(CLOSED, Ordering::SeqCst);
                return false;
            }
            let aico = match inner.aico {
                Some(ref aico) => aico.clone(),
                None => {
                    drop(inner);
                    self.shared.state.store(CLOSED, Ordering::SeqCst);
                    func(State::Ssl(SslState::UnknownError));
                    return true;
                }
            };
            if inner.timeout != 0 {
                aico.timeout_set(TimeoutKind::Recv, inner.timeout);
                aico.timeout_set(TimeoutKind::Send, inner.timeout);
            }
            inner.bio.clear();
            inner.delay = 0;
            inner.op = Some(SslOp::Open {
                func: Box::new(func),
            });
        }
        self.drive();
        true
    }

    /// Read up to `size` plaintext bytes.
    pub fn read<F>(&self, size: usize, func: F) -> bool
    where
        F: FnOnce(State, Bytes) + Send + 'static,
    {
        self.read_after(0, size, func)
    }

    /// Read up to `size` plaintext bytes; the first underlying socket op is
    /// deferred by `delay` milliseconds.
    pub fn read_after<F>(&self, delay: u64, size: usize, func: F) -> bool
    where
        F: FnOnce(State, Bytes) + Send + 'static,
    {
        if self.shared.state.load(Ordering::SeqCst) != OPENED || size == 0 {
            return false;
        }
        {
            let mut inner = lock(&self.shared.inner);
            if inner.op.is_some() || inner.aico.is_none() {
                return false;
            }
            inner.delay = delay;
            inner.op = Some(SslOp::Read {
                size,
                func: Box::new(func),
            });
        }
        self.drive();
        true
    }

    /// Write plaintext; the callback reports how many bytes the engine
    /// accepted once their ciphertext reached the socket.
    pub fn writ<F>(&self, data: Bytes, func: F) -> bool
    where
        F: FnOnce(State, usize) + Send + 'static,
    {
        if self.shared.state.load(Ordering::SeqCst) != OPENED || data.is_empty() {
            return false;
        }
        {
            let mut inner = lock(&self.shared.inner);
            if inner.op.is_some() || inner.aico.is_none() {
                return false;
            }
            inner.delay = 0;
            inner.op = Some(SslOp::Writ {
                data,
                func: Box::new(func),
            });
        }
        self.drive();
        true
    }

    /// Open if needed, then read.
    pub fn open_read<F>(&self, size: usize, func: F) -> bool
    where
        F: FnOnce(State, Bytes) + Send + 'static,
    {
        if self.shared.state.load(Ordering::SeqCst) == OPENED {
            return self.read(size, func);
        }
        let this = self.clone();
        self.open(move |state| {
            if state == State::Ok {
                this.read(size, func);
            } else {
                func(state, Bytes::new());
            }
        })
    }

    /// Open if needed, then write.
    pub fn open_writ<F>(&self, data: Bytes, func: F) -> bool
    where
        F: FnOnce(State, usize) + Send + 'static,
    {
        if self.shared.state.load(Ordering::SeqCst) == OPENED {
            return self.writ(data, func);
        }
        let this = self.clone();
        self.open(move |state| {
            if state == State::Ok {
                this.writ(data, func);
            } else {
                func(state, 0);
            }
        })
    }

    /// Run a bare callback after `delay` milliseconds on the bound handle.
    pub fn task<F>(&self, delay: u64, func: F) -> bool
    where
        F: FnOnce(State) + Send + 'static,
    {
        let aico = match lock(&self.shared.inner).aico {
            Some(ref aico) => aico.clone(),
            None => return false,
        };
        aico.task_run(delay, move |aice| {
            func(aice.state);
            true
        })
    }

    /// Try to close: succeeds when already closed or no handle is bound.
    pub fn clos_try(&self) -> bool {
        if self.shared.state.load(Ordering::SeqCst) == CLOSED {
            return true;
        }
        let mut inner = lock(&self.shared.inner);
        if inner.op.is_some() {
            return false;
        }
        if inner.aico.is_none() {
            inner.bio.clear();
            drop(inner);
            self.shared.state.store(CLOSED, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Close politely: a close-notify is pushed through the engine, then
    /// the callback fires from a one-shot task.
    pub fn clos<F>(&self, func: F) -> bool
    where
        F: FnOnce(State) + Send + 'static,
    {
        trace!("ssl: clos");
        if self.clos_try() {
            func(State::Ok);
            return true;
        }
        {
            let mut inner = lock(&self.shared.inner);
            if inner.op.is_some() {
                return false;
            }
            inner.delay = 0;
            inner.op = Some(SslOp::Clos {
                func: Box::new(func),
            });
        }
        self.drive();
        true
    }

    /// Kill the bridge: the bound handle is killed and in-flight ops
    /// complete with [`State::Killed`].
    pub fn kill(&self) {
        let previous = self.shared.state.swap(KILLING, Ordering::SeqCst);
        if previous == KILLING {
            return;
        }
        debug!("ssl: kill");
        if let Some(ref aico) = lock(&self.shared.inner).aico {
            aico.kill();
        }
    }

    /// One engine entry plus whatever socket work it demands.
    fn drive(&self) {
        loop {
            enum Next {
                Deliver(Verdict),
                Send(Aico, Bytes, u64),
                Recv(Aico, usize, u64),
            }
            let next = {
                let mut inner = lock(&self.shared.inner);
                let inner = &mut *inner;
                let aico = match inner.aico {
                    Some(ref aico) => aico.clone(),
                    None => return,
                };
                // ciphertext drains before anything else happens
                if !inner.bio.outgoing.is_empty() {
                    let data = inner.bio.take_outgoing();
                    let delay = std::mem::take(&mut inner.delay);
                    Next::Send(aico, data, delay)
                } else if let Some(verdict) = inner.verdict.take() {
                    Next::Deliver(verdict)
                } else {
                    // snapshot the entry's shape so the parked op is not
                    // borrowed while the engine runs
                    enum Entry {
                        Open,
                        Read(usize),
                        Writ(Bytes),
                        Clos,
                        None,
                    }
                    let entry = match inner.op {
                        Some(SslOp::Open { .. }) => Entry::Open,
                        Some(SslOp::Read { size, .. }) => Entry::Read(size),
                        Some(SslOp::Writ { ref data, .. }) => Entry::Writ(data.clone()),
                        Some(SslOp::Clos { .. }) => Entry::Clos,
                        None => Entry::None,
                    };
                    inner.bio.want = None;
                    let verdict = match entry {
                        Entry::Open => match inner.engine.open_try(&mut inner.bio) {
                            Progress::Ok => Some(Verdict::Open(State::Ok)),
                            Progress::Failed(state) => Some(Verdict::Open(State::Ssl(state))),
                            Progress::WantRead | Progress::WantWrite => None,
                        },
                        Entry::Read(size) => {
                            let mut buf = vec![0u8; size];
                            match inner.engine.read(&mut inner.bio, &mut buf) {
                                SslIo::Done(n) => Some(Verdict::Read(
                                    State::Ok,
                                    Bytes::copy_from_slice(&buf[..n]),
                                )),
                                SslIo::Closed => {
                                    Some(Verdict::Read(State::Closed, Bytes::new()))
                                }
                                SslIo::Failed(state) => {
                                    Some(Verdict::Read(State::Ssl(state), Bytes::new()))
                                }
                                SslIo::WantRead | SslIo::WantWrite => None,
                            }
                        }
                        Entry::Writ(data) => {
                            match inner.engine.writ(&mut inner.bio, &data) {
                                SslIo::Done(n) => Some(Verdict::Writ(State::Ok, n)),
                                SslIo::Closed => Some(Verdict::Writ(State::Closed, 0)),
                                SslIo::Failed(state) => {
                                    Some(Verdict::Writ(State::Ssl(state), 0))
                                }
                                SslIo::WantRead | SslIo::WantWrite => None,
                            }
                        }
                        Entry::Clos => match inner.engine.clos_try(&mut inner.bio) {
                            Progress::Ok | Progress::Failed(_) => {
                                Some(Verdict::Clos(State::Ok))
                            }
                            Progress::WantRead | Progress::WantWrite => None,
                        },
                        Entry::None => return,
                    };
                    match verdict {
                        Some(verdict) => {
                            inner.verdict = Some(verdict);
                            continue;
                        }
                        None => {
                            // suspended: the BIO recorded what it needs
                            if !inner.bio.outgoing.is_empty() {
                                continue;
                            }
                            match inner.bio.want.take() {
                                Some(size) => {
                                    let delay = std::mem::take(&mut inner.delay);
                                    Next::Recv(aico, size, delay)
                                }
                                None => {
                                    // want-* without a recorded need
                                    debug!("ssl: engine suspended without a bio need");
                                    inner.verdict = Some(match inner.op {
                                        Some(SslOp::Open { .. }) => Verdict::Open(
                                            State::Ssl(SslState::UnknownError),
                                        ),
                                        Some(SslOp::Read { .. }) => Verdict::Read(
                                            State::Ssl(SslState::UnknownError),
                                            Bytes::new(),
                                        ),
                                        Some(SslOp::Writ { .. }) => Verdict::Writ(
                                            State::Ssl(SslState::UnknownError),
                                            0,
                                        ),
                                        _ => Verdict::Clos(State::Ok),
                                    });
                                    continue;
                                }
                            }
                        }
                    }
                }
            };
            match next {
                Next::Deliver(verdict) => {
                    self.deliver(verdict);
                    return;
                }
                Next::Send(aico, data, delay) => {
                    let this = self.clone();
                    let posted = aico.send_after(delay, data, move |aice| {
                        if aice.state == State::Ok {
                            if let crate::aice::AiceOp::Send { ref data, real } = aice.op {
                                if real < data.len() {
                                    // partial flush: the tail goes back in
                                    // front of anything the engine adds next
                                    let rest = data.slice(real..);
                                    let mut inner = lock(&this.shared.inner);
                                    let mut outgoing = BytesMut::from(&rest[..]);
                                    outgoing.extend_from_slice(&inner.bio.outgoing);
                                    inner.bio.outgoing = outgoing;
                                    drop(inner);
                                    this.drive();
                                    return true;
                                }
                            }
                        }
                        this.on_sock(aice.state, aice.real(), None);
                        true
                    });
                    if !posted {
                        self.fail_current(State::Ssl(SslState::UnknownError));
                    }
                    return;
                }
                Next::Recv(aico, size, delay) => {
                    trace!(size, "ssl: bio wants recv");
                    let this = self.clone();
                    let posted = aico.recv_after(delay, size, move |mut aice| {
                        let data = aice.take_data();
                        this.on_sock(aice.state, aice.real(), data.map(|buf| buf.freeze()));
                        true
                    });
                    if !posted {
                        self.fail_current(State::Ssl(SslState::UnknownError));
                    }
                    return;
                }
            }
        }
    }

    /// A socket op the bridge posted has completed: absorb it and re-drive
    /// the engine.
    fn on_sock(&self, state: State, real: usize, data: Option<Bytes>) {
        trace!(%state, real, "ssl: sock completion");
        match state {
            State::Ok => {
                if let Some(ref data) = data {
                    let mut inner = lock(&self.shared.inner);
                    inner.bio.feed(data);
                }
                self.drive();
            }
            other => {
                // a failed close still reports Ok after clearing
                let is_clos = matches!(lock(&self.shared.inner).op, Some(SslOp::Clos { .. }));
                if is_clos {
                    self.fail_current(State::Ok);
                } else {
                    self.fail_current(map_sock_state(other));
                }
            }
        }
    }

    fn fail_current(&self, state: State) {
        let verdict = {
            let mut inner = lock(&self.shared.inner);
            let inner = &mut *inner;
            match inner.op {
                Some(SslOp::Open { .. }) => Verdict::Open(state),
                Some(SslOp::Read { .. }) => Verdict::Read(state, Bytes::new()),
                Some(SslOp::Writ { .. }) => Verdict::Writ(state, 0),
                Some(SslOp::Clos { .. }) => Verdict::Clos(State::Ok),
                None => {
                    inner.verdict = None;
                    return;
                }
            }
        };
        self.deliver(verdict);
    }

    /// Hand the settled verdict to the user callback, outside the lock.
    fn deliver(&self, verdict: Verdict) {
        let op = {
            let mut inner = lock(&self.shared.inner);
            inner.verdict = None;
            inner.op.take()
        };
        let op = match op {
            Some(op) => op,
            None => return,
        };
        match (op, verdict) {
            (SslOp::Open { func }, Verdict::Open(state)) => {
                if state == State::Ok {
                    self.shared.state.store(OPENED, Ordering::SeqCst);
                    trace!("ssl: opened");
                } else {
                    self.clear();
                }
                func(state);
            }
            (SslOp::Read { func, .. }, Verdict::Read(state, data)) => func(state, data),
            (SslOp::Writ { func, .. }, Verdict::Writ(state, real)) => func(state, real),
            (SslOp::Clos { func }, Verdict::Clos(state)) => {
                self.clear();
                trace!("ssl: closed");
                func(state);
            }
            // op/verdict pairs never mismatch; both live under the op lock
            _ => debug!("ssl: dropped mismatched verdict"),
        }
    }

    fn clear(&self) {
        let mut inner = lock(&self.shared.inner);
        inner.bio.clear();
        inner.verdict = None;
        drop(inner);
        self.shared.state.store(CLOSED, Ordering::SeqCst);
    }
}

fn map_sock_state(state: State) -> State {
    match state {
        State::Timeout => State::Ssl(SslState::Timeout),
        State::Killed => State::Killed,
        State::Closed => State::Closed,
        _ => State::Ssl(SslState::WaitFailed),
    }
}

impl fmt::Debug for SslStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslStream")
            .field("state", &self.shared.state.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bio_read_records_want_once() {
        let mut bio = Bio::new();
        let mut buf = [0u8; 8];
        let err = io::Read::read(&mut bio, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(bio.want, Some(8));
    }

    #[test]
    fn bio_read_drains_incoming_byte_identically() {
        let mut bio = Bio::new();
        bio.feed(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(io::Read::read(&mut bio, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        let mut buf = [0u8; 4];
        assert_eq!(io::Read::read(&mut bio, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn bio_write_buffers_outgoing() {
        let mut bio = Bio::new();
        assert_eq!(io::Write::write(&mut bio, b"cipher").unwrap(), 6);
        assert_eq!(io::Write::write(&mut bio, b"text").unwrap(), 4);
        assert_eq!(&bio.take_outgoing()[..], b"ciphertext");
        assert!(bio.outgoing.is_empty());
    }
}
