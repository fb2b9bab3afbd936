//! The socket stream transport.
//!
//! Wraps one TCP handle (plain or TLS through the [`SslStream`] bridge)
//! behind open/read/writ/task/clos verbs. Reads re-arm while the callback
//! keeps returning true; writes loop internally until the whole buffer is
//! on the wire. A keep-alive close parks the connected handle under its
//! (host, port, tls) key and the next open against the same key reuses it.

use std::fmt;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::aico::{Aico, TimeoutKind};
use crate::proactor::lock;
use crate::ssl::{EngineFactory, SslStream};
use crate::state::State;
use crate::Aicp;

const CLOSED: u8 = 0;
const OPENING: u8 = 1;
const OPENED: u8 = 2;
const KILLING: u8 = 3;

struct SockInner {
    aico: Option<Aico>,
    ssl: Option<SslStream>,
    host: Option<String>,
    port: u16,
    bssl: bool,
    timeout: i64,
    keep_alive: bool,
    /// Identity of a parked keep-alive connection.
    alive: Option<(String, u16, bool)>,
    ssl_factory: Option<EngineFactory>,
}

struct SockShared {
    aicp: Aicp,
    state: AtomicU8,
    inner: Mutex<SockInner>,
}

/// A socket transport for the async stream pipeline. Cheap to clone.
#[derive(Clone)]
pub struct SockStream {
    shared: Arc<SockShared>,
}

impl SockStream {
    /// A closed stream; point it somewhere with [`SockStream::set_url`].
    pub fn new(aicp: Aicp) -> SockStream {
        SockStream {
            shared: Arc::new(SockShared {
                aicp,
                state: AtomicU8::new(CLOSED),
                inner: Mutex::new(SockInner {
                    aico: None,
                    ssl: None,
                    host: None,
                    port: 0,
                    bssl: false,
                    timeout: 0,
                    keep_alive: false,
                    alive: None,
                    ssl_factory: None,
                }),
            }),
        }
    }

    /// The owning proactor.
    pub fn aicp(&self) -> &Aicp {
        &self.shared.aicp
    }

    /// Point the stream at `host:port`, with or without TLS.
    pub fn set_url(&self, host: &str, port: u16, ssl: bool) {
        let mut inner = lock(&self.shared.inner);
        inner.host = Some(host.to_string());
        inner.port = port;
        inner.bssl = ssl;
    }

    /// The stream-level deadline in milliseconds (0 keeps the runtime
    /// defaults).
    pub fn set_timeout(&self, timeout: i64) {
        lock(&self.shared.inner).timeout = timeout;
    }

    /// Whether a close parks the connection for reuse.
    pub fn set_keep_alive(&self, keep_alive: bool) {
        lock(&self.shared.inner).keep_alive = keep_alive;
    }

    /// The engine factory used when opening with TLS.
    pub fn set_ssl_factory(&self, factory: EngineFactory) {
        lock(&self.shared.inner).ssl_factory = Some(factory);
    }

    /// The host this stream points at.
    pub fn host(&self) -> Option<String> {
        lock(&self.shared.inner).host.clone()
    }

    /// Whether the stream is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == CLOSED
    }

    fn store_state(&self, state: u8) {
        self.shared.state.store(state, Ordering::SeqCst);
    }

    /// Connect (and handshake, when TLS is set). One callback with the
    /// outcome.
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

        let (host, port, bssl, timeout, reuse, stale, factory) = {
            let mut inner = lock(&self.shared.inner);
            let host = match inner.host.clone() {
                Some(host) => host,
                None => {
                    drop(inner);
                    self.store_state(CLOSED);
                    func(State::Failed);
                    return true;
                }
            };
            let key = (host.clone(), inner.port, inner.bssl);
            let reuse = inner.alive.as_ref() == Some(&key) && inner.aico.is_some();
            inner.alive = None;
            let stale = if reuse { None } else { inner.aico.take() };
            if !reuse {
                inner.ssl = None;
            }
            (
                host,
                inner.port,
                inner.bssl,
                inner.timeout,
                reuse,
                stale,
                inner.ssl_factory.clone(),
            )
        };

        if let Some(stale) = stale {
            self.shared.aicp.inner().dispose(&stale);
        }
        if reuse {
            trace!(host = %host, port, "open: reusing kept connection");
            self.store_state(OPENED);
            func(State::Ok);
            return true;
        }

        let addr = match (host.as_str(), port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    self.store_state(CLOSED);
                    func(State::Failed);
                    return true;
                }
            },
            Err(err) => {
                debug!(host = %host, "resolve failed: {}", err);
                self.store_state(CLOSED);
                func(State::Failed);
                return true;
            }
        };

        let aico = match self.shared.aicp.aico_tcp() {
            Ok(aico) => aico,
            Err(err) => {
                debug!("open: no handle: {}", err);
                self.store_state(CLOSED);
                func(State::Failed);
                return true;
            }
        };
        if timeout != 0 {
            aico.timeout_set(TimeoutKind::Conn, timeout);
            aico.timeout_set(TimeoutKind::Recv, timeout);
            aico.timeout_set(TimeoutKind::Send, timeout);
        }
        lock(&self.shared.inner).aico = Some(aico.clone());

        trace!(host = %host, port, ssl = bssl, "open: connecting");
        let this = self.clone();
        let posted = aico.conn(addr, move |aice| {
            match aice.state {
                State::Ok => {
                    if bssl {
                        this.open_ssl(&host, factory, func);
                    } else {
                        this.store_state(OPENED);
                        func(State::Ok);
                    }
                }
                other => {
                    this.store_state(CLOSED);
                    func(other);
                }
            }
            true
        });
        if !posted {
            self.store_state(CLOSED);
            return false;
        }
        true
    }

    fn open_ssl<F>(&self, host: &str, factory: Option<EngineFactory>, func: F)
    where
        F: FnOnce(State) + Send + 'static,
    {
        let engine = match factory {
            Some(factory) => match factory(host) {
                Ok(engine) => engine,
                Err(err) => {
                    debug!("ssl engine init failed: {}", err);
                    self.store_state(CLOSED);
                    func(State::Ssl(crate::SslState::Failed));
                    return;
                }
            },
            None => {
                self.store_state(CLOSED);
                func(State::NotSupported);
                return;
            }
        };
        let (aico, timeout) = {
            let inner = lock(&self.shared.inner);
            (inner.aico.clone(), inner.timeout)
        };
        let aico = match aico {
            Some(aico) => aico,
            None => {
                self.store_state(CLOSED);
                func(State::Failed);
                return;
            }
        };
        let ssl = SslStream::new(self.shared.aicp.clone(), engine);
        ssl.set_aico(aico);
        if timeout != 0 {
            ssl.set_timeout(timeout);
        }
        lock(&self.shared.inner).ssl = Some(ssl.clone());
        let this = self.clone();
        ssl.open(move |state| {
            if state == State::Ok {
                this.store_state(OPENED);
                func(State::Ok);
            } else {
                lock(&this.shared.inner).ssl = None;
                this.store_state(CLOSED);
                func(state);
            }
        });
    }

    /// Read up to `size` bytes at a time. `func` runs per received span
    /// while it returns `true`; `Closed` with no bytes marks end of
    /// stream.
    pub fn read<F>(&self, size: usize, func: F) -> bool
    where
        F: FnMut(State, Bytes) -> bool + Send + 'static,
    {
        self.read_after(0, size, func)
    }

    /// Like [`SockStream::read`] with the first receive deferred by
    /// `delay` milliseconds.
    pub fn read_after<F>(&self, delay: u64, size: usize, func: F) -> bool
    where
        F: FnMut(State, Bytes) -> bool + Send + 'static,
    {
        if self.shared.state.load(Ordering::SeqCst) != OPENED {
            return false;
        }
        let (aico, ssl) = {
            let inner = lock(&self.shared.inner);
            (inner.aico.clone(), inner.ssl.clone())
        };
        if let Some(ssl) = ssl {
            return arm_ssl_read(ssl, delay, size, func);
        }
        match aico {
            Some(aico) => arm_recv(aico, delay, size, func),
            None => false,
        }
    }

    /// Write the whole buffer; one callback when it is fully on the wire
    /// (or on the first error).
    pub fn writ<F>(&self, data: Bytes, func: F) -> bool
    where
        F: FnOnce(State) + Send + 'static,
    {
        if self.shared.state.load(Ordering::SeqCst) != OPENED {
            return false;
        }
        let (aico, ssl) = {
            let inner = lock(&self.shared.inner);
            (inner.aico.clone(), inner.ssl.clone())
        };
        if let Some(ssl) = ssl {
            return arm_ssl_writ(ssl, data, func);
        }
        match aico {
            Some(aico) => arm_send(aico, data, func),
            None => false,
        }
    }

    /// Run a bare callback after `delay` milliseconds.
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

    /// Close the stream. With keep-alive set and a healthy connection the
    /// handle is parked for the next open against the same key.
    pub fn clos<F>(&self, func: F) -> bool
    where
        F: FnOnce(State) + Send + 'static,
    {
        let previous = self.shared.state.swap(CLOSED, Ordering::SeqCst);
        if previous == CLOSED {
            func(State::Ok);
            return true;
        }
        let (keep, ssl, aico) = {
            let mut inner = lock(&self.shared.inner);
            let keep = inner.keep_alive && previous == OPENED && inner.aico.is_some();
            if keep {
                let key = (
                    inner.host.clone().unwrap_or_default(),
                    inner.port,
                    inner.bssl,
                );
                trace!(host = %key.0, port = key.1, "clos: parking keep-alive connection");
                inner.alive = Some(key);
                (true, None, None)
            } else {
                inner.alive = None;
                (false, inner.ssl.take(), inner.aico.take())
            }
        };
        if keep {
            func(State::Ok);
            return true;
        }
        let aicp = self.shared.aicp.clone();
        let close_aico = move |func: Box<dyn FnOnce(State) + Send>| {
            match aico {
                Some(aico) => {
                    let aicp = aicp.clone();
                    let disposed = aico.clone();
                    let func = Arc::new(Mutex::new(Some(func)));
                    let func_for_posted = func.clone();
                    let posted = aico.clos(move |_aice| {
                        if let Some(engine) = disposed.aicp() {
                            engine.inner().dispose(&disposed);
                        }
                        if let Some(func) = lock(&func_for_posted).take() {
                            func(State::Ok);
                        }
                        true
                    });
                    if !posted {
                        aicp.inner().dispose(&aico);
                        if let Some(func) = lock(&func).take() {
                            func(State::Ok);
                        }
                    }
                }
                None => func(State::Ok),
            }
        };
        match ssl {
            Some(ssl) => ssl.clos(move |_state| close_aico(Box::new(func))),
            None => {
                close_aico(Box::new(func));
                true
            }
        }
    }

    /// Try to close without waiting: succeeds when nothing is in flight.
    pub fn clos_try(&self) -> bool {
        if self.shared.state.load(Ordering::SeqCst) == CLOSED {
            return true;
        }
        let busy = {
            let inner = lock(&self.shared.inner);
            match inner.aico {
                Some(ref aico) => aico.has_pending(),
                None => false,
            }
        };
        if busy {
            return false;
        }
        self.clos(|_| {})
    }

    /// Kill the stream: the handle (and any TLS bridge) is killed and
    /// in-flight ops complete with [`State::Killed`].
    pub fn kill(&self) {
        let previous = self.shared.state.swap(KILLING, Ordering::SeqCst);
        if previous == KILLING {
            return;
        }
        debug!("sock stream: kill");
        let inner = lock(&self.shared.inner);
        if let Some(ref ssl) = inner.ssl {
            ssl.kill();
        }
        if let Some(ref aico) = inner.aico {
            aico.kill();
        }
    }
}

fn arm_recv<F>(aico: Aico, delay: u64, size: usize, mut func: F) -> bool
where
    F: FnMut(State, Bytes) -> bool + Send + 'static,
{
    let again = aico.clone();
    aico.recv_after(delay, size, move |mut aice| match aice.state {
        State::Ok => {
            let data = aice.take_data().map(|buf| buf.freeze()).unwrap_or_default();
            if func(State::Ok, data) {
                arm_recv(again, 0, size, func);
                true
            } else {
                false
            }
        }
        other => {
            func(other, Bytes::new());
            false
        }
    })
}

fn arm_send<F>(aico: Aico, data: Bytes, func: F) -> bool
where
    F: FnOnce(State) + Send + 'static,
{
    let again = aico.clone();
    let total = data.len();
    aico.send(data, move |aice| match aice.state {
        State::Ok => {
            let real = aice.real();
            if real < total {
                if let crate::aice::AiceOp::Send { ref data, .. } = aice.op {
                    let rest = data.slice(real..);
                    arm_send(again, rest, func);
                    return true;
                }
                func(State::UnknownError);
                false
            } else {
                func(State::Ok);
                true
            }
        }
        other => {
            func(other);
            false
        }
    })
}

fn arm_ssl_read<F>(ssl: SslStream, delay: u64, size: usize, mut func: F) -> bool
where
    F: FnMut(State, Bytes) -> bool + Send + 'static,
{
    let again = ssl.clone();
    ssl.read_after(delay, size, move |state, data| match state {
        State::Ok if !data.is_empty() => {
            if func(State::Ok, data) {
                arm_ssl_read(again, 0, size, func);
            }
        }
        State::Ok => {
            func(State::Closed, Bytes::new());
        }
        other => {
            func(other, Bytes::new());
        }
    })
}

fn arm_ssl_writ<F>(ssl: SslStream, data: Bytes, func: F) -> bool
where
    F: FnOnce(State) + Send + 'static,
{
    let again = ssl.clone();
    let total = data.len();
    let buffer = data.clone();
    ssl.writ(data, move |state, real| match state {
        State::Ok => {
            if real < total {
                arm_ssl_writ(again, buffer.slice(real..), func);
            } else {
                func(State::Ok);
            }
        }
        other => func(other),
    })
}

impl fmt::Debug for SockStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SockStream")
            .field("state", &self.shared.state.load(Ordering::Relaxed))
            .field("host", &lock(&self.shared.inner).host)
            .finish()
    }
}
