//! The completion handle.
//!
//! An [`Aico`] binds one OS resource (socket or file) or no resource at all
//! (a bare task endpoint) to its owning [`crate::Aicp`]. At most one request
//! is in flight per handle per direction (receives and sends each have one
//! slot on sockets, files and tasks share a single slot), which is what
//! gives callbacks their per-handle single-threaded view.
//!
//! The handle itself is a cheap clone over shared state, so callbacks can
//! carry it around freely. Lifecycle: a handle is created open,
//! [`Aico::kill`] is one-shot and idempotent, [`Aico::clos_try`] succeeds
//! only when nothing is in flight, and [`Aico::exit`] blocks until the
//! handle is quiescent before unregistering it.

use std::fmt;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::aice::{Aice, AiceFunc, AiceOp};
use crate::proactor::{lock, Inner as AicpInner, Posted};
use crate::state::State;
use crate::timer::TaskHandle;
use crate::Aicp;

/// The registered resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AicoKind {
    /// A TCP/UDP socket or listener.
    Sock,
    /// A regular file.
    File,
    /// No resource; only `task_run` and `clos` apply.
    Task,
}

/// The per-socket timeout categories, mapping 1:1 to the connect, receive
/// and send request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Applied to `conn`.
    Conn = 0,
    /// Applied to the receive-direction socket ops.
    Recv = 1,
    /// Applied to the send-direction socket ops.
    Send = 2,
}

// handle states
pub(crate) const STATE_OPEN: u8 = 0;
pub(crate) const STATE_CLOSED: u8 = 1;
pub(crate) const STATE_KILLED: u8 = 2;

// timeout defaults: zero in the slot selects these
pub(crate) const DEFAULT_CONN_TIMEOUT: i64 = 30_000;
pub(crate) const NO_TIMEOUT: i64 = -1;

pub(crate) enum Resource {
    None,
    /// TCP socket not created yet; materialized when `conn` is issued.
    TcpPending,
    Tcp {
        stream: mio::net::TcpStream,
        connected: bool,
    },
    Listener(mio::net::TcpListener),
    Udp(mio::net::UdpSocket),
    File(File),
    Task,
}

impl Resource {
    pub(crate) fn kind(&self) -> AicoKind {
        match *self {
            Resource::File(_) => AicoKind::File,
            Resource::Task => AicoKind::Task,
            _ => AicoKind::Sock,
        }
    }
}

/// One in-flight request slot.
pub(crate) struct Slot {
    pub(crate) posted: Option<Posted>,
    pub(crate) timeout: Option<TaskHandle>,
    /// Bumped every time a request parks; lets a fired timeout recognize
    /// that the slot has since been recycled.
    pub(crate) seq: u64,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            posted: None,
            timeout: None,
            seq: 0,
        }
    }
}

pub(crate) struct AicoInner {
    pub(crate) id: usize,
    pub(crate) aicp: Weak<AicpInner>,
    pub(crate) state: AtomicU8,
    pub(crate) res: Mutex<Resource>,
    /// `[0]` receive direction, `[1]` send direction.
    pub(crate) slots: [Mutex<Slot>; 2],
    timeouts: [AtomicI64; 3],
    /// Count of accepted-but-unresolved requests, and its quiescence signal.
    pub(crate) pending: Mutex<usize>,
    pub(crate) quiescent: Condvar,
    /// Unregister as soon as the handle goes quiescent (internal teardown
    /// from completion callbacks, where a blocking `exit` would deadlock).
    pub(crate) reap: AtomicBool,
}

/// An async I/O completion handle.
#[derive(Clone)]
pub struct Aico {
    pub(crate) inner: Arc<AicoInner>,
}

impl Aico {
    pub(crate) fn create(id: usize, aicp: Weak<AicpInner>, res: Resource) -> Aico {
        Aico {
            inner: Arc::new(AicoInner {
                id,
                aicp,
                state: AtomicU8::new(STATE_OPEN),
                res: Mutex::new(res),
                slots: [Mutex::new(Slot::new()), Mutex::new(Slot::new())],
                timeouts: [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)],
                pending: Mutex::new(0),
                quiescent: Condvar::new(),
                reap: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        *lock(&self.inner.pending) != 0
    }

    /// The resource class of this handle.
    pub fn kind(&self) -> AicoKind {
        lock(&self.inner.res).kind()
    }

    /// The owning proactor, unless it is already gone.
    pub fn aicp(&self) -> Option<Aicp> {
        self.inner.aicp.upgrade().map(Aicp::from_inner)
    }

    /// The socket's local address, when the resource has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *lock(&self.inner.res) {
            Resource::Tcp { ref stream, .. } => stream.local_addr().ok(),
            Resource::Listener(ref listener) => listener.local_addr().ok(),
            Resource::Udp(ref socket) => socket.local_addr().ok(),
            _ => None,
        }
    }

    /// The connected socket's peer address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match *lock(&self.inner.res) {
            Resource::Tcp { ref stream, .. } => stream.peer_addr().ok(),
            _ => None,
        }
    }

    /// The configured timeout in ms for the given category.
    ///
    /// Zero selects the runtime default, negative disables the deadline.
    pub fn timeout(&self, kind: TimeoutKind) -> i64 {
        self.inner.timeouts[kind as usize].load(Ordering::Relaxed)
    }

    /// Set the timeout for the given category. Only sockets honor these.
    pub fn timeout_set(&self, kind: TimeoutKind, timeout: i64) {
        self.inner.timeouts[kind as usize].store(timeout, Ordering::Relaxed);
    }

    pub(crate) fn effective_timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let raw = self.timeout(kind);
        let value = if raw == 0 {
            match kind {
                TimeoutKind::Conn => DEFAULT_CONN_TIMEOUT,
                _ => NO_TIMEOUT,
            }
        } else {
            raw
        };
        if value < 0 {
            None
        } else {
            Some(value as u64)
        }
    }

    /// Whether the handle has been killed.
    pub fn is_killed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_KILLED
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Kill the handle: in-flight and queued requests complete with
    /// [`State::Killed`]. Idempotent.
    pub fn kill(&self) {
        if self.inner.state.swap(STATE_KILLED, Ordering::SeqCst) == STATE_KILLED {
            return;
        }
        trace!(aico = self.inner.id, "kill");
        if let Some(aicp) = self.inner.aicp.upgrade() {
            aicp.cancel_slots(self);
        }
    }

    /// Try to close: succeeds only when no request is in flight, after
    /// which no new request may be posted and no callback will fire.
    pub fn clos_try(&self) -> bool {
        {
            let pending = lock(&self.inner.pending);
            if *pending != 0 {
                return false;
            }
            // no in-flight work; claim the handle before dropping the lock
            if self.inner.state.load(Ordering::SeqCst) == STATE_CLOSED {
                return true;
            }
            self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        }
        if let Some(aicp) = self.inner.aicp.upgrade() {
            aicp.close_resource(self);
        }
        true
    }

    /// Wait until the handle is quiescent, close it and unregister it from
    /// the proactor. Must not be called from a completion callback.
    pub fn exit(self) {
        {
            let mut pending = lock(&self.inner.pending);
            while *pending != 0 {
                pending = match self.inner.quiescent.wait(pending) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
        if self.inner.state.load(Ordering::SeqCst) != STATE_KILLED {
            self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        }
        if let Some(aicp) = self.inner.aicp.upgrade() {
            aicp.close_resource(&self);
            aicp.unregister(&self);
        }
        trace!(aico = self.inner.id, "exit");
    }

    /// Post a request on this handle. Prefer the typed verbs below.
    pub fn post<F>(&self, op: AiceOp, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post_after(0, op, func)
    }

    /// Post a request after `delay` milliseconds.
    pub fn post_after<F>(&self, delay: u64, op: AiceOp, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        let aicp = match self.aicp() {
            Some(aicp) => aicp,
            None => return false,
        };
        aicp.post_raw(self.clone(), delay, op, Box::new(func) as AiceFunc)
    }

    // ---- socket verbs ----

    /// Accept clients; the callback runs once per accepted client and the
    /// accept re-arms while it returns `true`.
    pub fn acpt<F>(&self, func: F) -> bool
    where
        F: FnMut(Aice) -> bool + Send + 'static,
    {
        self.acpt_after(0, func)
    }

    /// Accept clients, first arming after `delay` milliseconds.
    pub fn acpt_after<F>(&self, delay: u64, func: F) -> bool
    where
        F: FnMut(Aice) -> bool + Send + 'static,
    {
        arm_acpt(self.clone(), delay, func)
    }

    /// Connect to `addr`.
    pub fn conn<F>(&self, addr: SocketAddr, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(AiceOp::Conn { addr }, func)
    }

    /// Connect to `addr` after `delay` milliseconds.
    pub fn conn_after<F>(&self, delay: u64, addr: SocketAddr, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post_after(delay, AiceOp::Conn { addr }, func)
    }

    /// Receive up to `size` bytes.
    pub fn recv<F>(&self, size: usize, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.recv_after(0, size, func)
    }

    /// Receive up to `size` bytes, posting after `delay` milliseconds.
    pub fn recv_after<F>(&self, delay: u64, size: usize, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        let data = BytesMut::with_capacity(size);
        self.post_after(delay, AiceOp::Recv { data, real: 0 }, func)
    }

    /// Send the buffer. A zero-length send completes `Ok` without touching
    /// the socket.
    pub fn send<F>(&self, data: Bytes, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.send_after(0, data, func)
    }

    /// Send the buffer after `delay` milliseconds.
    pub fn send_after<F>(&self, delay: u64, data: Bytes, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post_after(delay, AiceOp::Send { data, real: 0 }, func)
    }

    /// Receive one datagram of up to `size` bytes.
    pub fn urecv<F>(&self, size: usize, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.urecv_after(0, size, func)
    }

    /// Receive one datagram, posting after `delay` milliseconds.
    pub fn urecv_after<F>(&self, delay: u64, size: usize, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        let data = BytesMut::with_capacity(size);
        self.post_after(
            delay,
            AiceOp::Urecv {
                data,
                real: 0,
                addr: None,
            },
            func,
        )
    }

    /// Send one datagram to `addr`.
    pub fn usend<F>(&self, addr: SocketAddr, data: Bytes, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.usend_after(0, addr, data, func)
    }

    /// Send one datagram after `delay` milliseconds.
    pub fn usend_after<F>(&self, delay: u64, addr: SocketAddr, data: Bytes, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post_after(delay, AiceOp::Usend { addr, data, real: 0 }, func)
    }

    /// Scatter-receive into the buffer list, by spare capacity.
    pub fn recvv<F>(&self, list: Vec<BytesMut>, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(AiceOp::Recvv { list, real: 0 }, func)
    }

    /// Gather-send the buffer list.
    pub fn sendv<F>(&self, list: Vec<Bytes>, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(AiceOp::Sendv { list, real: 0 }, func)
    }

    /// Scatter-receive one datagram into the buffer list.
    pub fn urecvv<F>(&self, list: Vec<BytesMut>, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(
            AiceOp::Urecvv {
                list,
                real: 0,
                addr: None,
            },
            func,
        )
    }

    /// Gather-send the buffer list as one datagram to `addr`.
    pub fn usendv<F>(&self, addr: SocketAddr, list: Vec<Bytes>, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(AiceOp::Usendv { addr, list, real: 0 }, func)
    }

    /// Copy up to `size` file bytes starting at `seek` to the socket;
    /// `size` of zero means until end of file.
    pub fn sendf<F>(&self, file: File, seek: u64, size: u64, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(
            AiceOp::Sendf {
                file,
                seek,
                size,
                real: 0,
            },
            func,
        )
    }

    // ---- file verbs ----

    /// Read up to `size` bytes at the explicit offset `seek`.
    pub fn read<F>(&self, seek: u64, size: usize, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        let data = BytesMut::with_capacity(size);
        self.post(AiceOp::Read { seek, data, real: 0 }, func)
    }

    /// Write the buffer at the explicit offset `seek`.
    pub fn writ<F>(&self, seek: u64, data: Bytes, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(AiceOp::Writ { seek, data, real: 0 }, func)
    }

    /// Scatter-read at the explicit offset `seek`.
    pub fn readv<F>(&self, seek: u64, list: Vec<BytesMut>, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(AiceOp::Readv { seek, list, real: 0 }, func)
    }

    /// Gather-write at the explicit offset `seek`.
    pub fn writv<F>(&self, seek: u64, list: Vec<Bytes>, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(AiceOp::Writv { seek, list, real: 0 }, func)
    }

    /// Flush file data.
    pub fn fsync<F>(&self, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post(AiceOp::Fsync, func)
    }

    // ---- task verbs ----

    /// Run a one-shot callback after `delay` milliseconds, without I/O.
    pub fn task_run<F>(&self, delay: u64, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        let when = self
            .aicp()
            .map(|aicp| aicp.time() + delay)
            .unwrap_or(delay);
        self.post_after(delay, AiceOp::Runtask { when, delay }, func)
    }

    /// Post a close request: cancels in-flight requests, releases the
    /// resource and completes `Ok`.
    pub fn clos<F>(&self, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.clos_after(0, func)
    }

    /// Post a close request after `delay` milliseconds.
    pub fn clos_after<F>(&self, delay: u64, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post_after(delay, AiceOp::Clos, func)
    }
}

fn arm_acpt<F>(aico: Aico, delay: u64, mut func: F) -> bool
where
    F: FnMut(Aice) -> bool + Send + 'static,
{
    let again = aico.clone();
    aico.post_after(
        delay,
        AiceOp::Acpt {
            aico: None,
            addr: None,
        },
        move |aice: Aice| {
            let state = aice.state;
            let cont = func(aice);
            if cont && state == State::Ok {
                arm_acpt(again, 0, func);
            }
            cont
        },
    )
}

impl fmt::Debug for Aico {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aico")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .finish()
    }
}
