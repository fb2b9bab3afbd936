//! The proactor engine.
//!
//! Requests are issued with non-blocking syscalls at post time; whatever
//! would block parks in its handle's direction slot and is retried when the
//! readiness backend reports the socket ready. Completions are pushed onto
//! a multi-consumer queue and delivered on whichever worker thread pops
//! them.
//!
//! Worker model: every thread calling [`Aicp::run`] joins the pool. One of
//! them at a time (whoever wins the try-lock) owns the `mio::Poll` and
//! blocks in it with the timer's next deadline as the wait bound; the rest
//! block on the completion queue. Posts are thread-safe from any thread and
//! wake the poller through a `mio::Waker`.

use std::fmt;
use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::aice::{Aice, AiceCode, AiceFunc, AiceOp};
use crate::aico::{Aico, Resource, TimeoutKind, STATE_CLOSED, STATE_KILLED, STATE_OPEN};
use crate::clock::Clock;
use crate::error::Error;
use crate::state::State;
use crate::timer::Timer;
use crate::Result;

const DEFAULT_MAXN: usize = 4096;
const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;
/// Idle tick for followers and the poll bound; keeps `run_until` stop
/// predicates responsive even when nothing completes.
const IDLE_TICK: Duration = Duration::from_millis(100);

const RUNNING: u8 = 0;
const KILLING: u8 = 1;

/// Lock a mutex, tolerating poisoning: a panicking user callback must not
/// wedge the whole runtime.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A posted request travelling through the runtime: the record plus its
/// callback.
pub(crate) struct Posted {
    pub(crate) aice: Aice,
    pub(crate) func: AiceFunc,
}

enum Work {
    /// A finished request: deliver its callback.
    Done(Posted),
    /// A file-direction request parked in the handle's slot: execute it on
    /// this worker, then deliver.
    Exec(Aico),
    /// Unwind one worker.
    Stop,
}

/// The async I/O completion port: the proactor engine.
///
/// Cheap to clone; all clones share the same engine.
#[derive(Clone)]
pub struct Aicp {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    maxn: usize,
    clock: Clock,
    timer: Timer,
    registry: mio::Registry,
    poll: Mutex<PollState>,
    waker: Waker,
    aicos: Mutex<Slab<Aico>>,
    drained: Condvar,
    tx: Sender<Work>,
    rx: Receiver<Work>,
    lifecycle: AtomicU8,
    forbid: AtomicBool,
}

struct PollState {
    poll: Poll,
    events: Events,
}

impl Aicp {
    /// Create an engine bounded to `maxn` live handles (0 selects the
    /// default of 4096).
    pub fn new(maxn: usize) -> Result<Aicp> {
        let poll = Poll::new().map_err(Error::new_poller)?;
        let registry = poll.registry().try_clone().map_err(Error::new_poller)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::new_poller)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            maxn: if maxn == 0 { DEFAULT_MAXN } else { maxn },
            clock: Clock::new(),
            timer: Timer::new(),
            registry,
            poll: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            }),
            waker,
            aicos: Mutex::new(Slab::new()),
            drained: Condvar::new(),
            tx,
            rx,
            lifecycle: AtomicU8::new(RUNNING),
            forbid: AtomicBool::new(false),
        });
        Ok(Aicp { inner })
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Aicp {
        Aicp { inner }
    }

    pub(crate) fn inner(&self) -> &Inner {
        &self.inner
    }

    /// The configured handle bound.
    pub fn maxn(&self) -> usize {
        self.inner.maxn
    }

    /// The runtime's cached millisecond clock.
    pub fn time(&self) -> u64 {
        self.inner.time()
    }

    /// The runtime's deadline queue, shared with delayed posts and per-op
    /// timeouts.
    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    // ---- handle constructors ----

    /// A TCP handle whose socket is created when `conn` is issued.
    pub fn aico_tcp(&self) -> Result<Aico> {
        self.register(Resource::TcpPending)
    }

    /// A TCP handle over an already connected standard stream.
    pub fn aico_tcp_from(&self, stream: std::net::TcpStream) -> Result<Aico> {
        stream.set_nonblocking(true).map_err(Error::new_io)?;
        let stream = mio::net::TcpStream::from_std(stream);
        self.register(Resource::Tcp {
            stream,
            connected: true,
        })
    }

    /// A listening TCP handle bound to `addr`.
    pub fn aico_listener(&self, addr: SocketAddr) -> Result<Aico> {
        let listener = mio::net::TcpListener::bind(addr).map_err(Error::new_io)?;
        self.register(Resource::Listener(listener))
    }

    /// A UDP handle bound to `addr`.
    pub fn aico_udp(&self, addr: SocketAddr) -> Result<Aico> {
        let socket = mio::net::UdpSocket::bind(addr).map_err(Error::new_io)?;
        self.register(Resource::Udp(socket))
    }

    /// A file handle over an open file.
    pub fn aico_file(&self, file: File) -> Result<Aico> {
        self.register(Resource::File(file))
    }

    /// A file handle opened from a path with the given options.
    pub fn aico_file_from_path<P: AsRef<Path>>(
        &self,
        path: P,
        options: &std::fs::OpenOptions,
    ) -> Result<Aico> {
        let file = options.open(path).map_err(Error::new_io)?;
        self.register(Resource::File(file))
    }

    /// A bare task handle: only `task_run` and `clos` apply.
    pub fn aico_task(&self) -> Result<Aico> {
        self.register(Resource::Task)
    }

    // ---- posting ----

    /// Post a request on a handle. The typed verbs on [`Aico`] delegate
    /// here.
    pub fn post<F>(&self, aico: &Aico, op: AiceOp, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post_raw(aico.clone(), 0, op, Box::new(func))
    }

    /// Post a request after `delay` milliseconds, held in the timer until
    /// due.
    pub fn post_after<F>(&self, aico: &Aico, delay: u64, op: AiceOp, func: F) -> bool
    where
        F: FnOnce(Aice) -> bool + Send + 'static,
    {
        self.post_raw(aico.clone(), delay, op, Box::new(func))
    }

    pub(crate) fn post_raw(&self, aico: Aico, delay: u64, op: AiceOp, func: AiceFunc) -> bool {
        // closed handles reject synchronously; killed handles (and a killed
        // engine) still deliver exactly one killed callback
        let handle_state = aico.inner.state.load(Ordering::SeqCst);
        if handle_state == STATE_CLOSED && op.code() != AiceCode::Clos {
            return false;
        }
        *lock(&aico.inner.pending) += 1;
        let posted = Posted {
            aice: Aice::new(aico.clone(), op),
            func,
        };
        if handle_state == STATE_KILLED || self.inner.forbid.load(Ordering::SeqCst) {
            self.inner.complete(posted, State::Killed);
            return true;
        }
        if delay > 0 {
            let weak = Arc::downgrade(&self.inner);
            let mut held = Some(posted);
            self.inner.timer.post(delay, false, move |_killed| {
                let posted = match held.take() {
                    Some(posted) => posted,
                    None => return,
                };
                if let Some(inner) = weak.upgrade() {
                    let _ = Aicp::from_inner(inner).issue(posted);
                }
            });
            return true;
        }
        self.issue(posted)
    }

    // ---- loop ----

    /// Join the worker pool until the engine is killed.
    pub fn run(&self) {
        self.run_until(|| false)
    }

    /// Join the worker pool until the engine is killed or `stop` returns
    /// true. `stop` is polled between work items.
    pub fn run_until<F>(&self, mut stop: F)
    where
        F: FnMut() -> bool,
    {
        let inner = &self.inner;
        debug!("worker: enter");
        loop {
            if stop() {
                break;
            }
            let killing = inner.lifecycle.load(Ordering::SeqCst) == KILLING;
            if let Ok(mut guard) = inner.poll.try_lock() {
                inner.clock.spak();
                inner.timer.spak();
                let bound = match inner.timer.delay() {
                    Some(ms) => IDLE_TICK.min(Duration::from_millis(ms)),
                    None => IDLE_TICK,
                };
                let timeout = if killing {
                    Duration::from_millis(0)
                } else {
                    bound
                };
                let mut ready = Vec::new();
                let mut failed = false;
                {
                    let ps = &mut *guard;
                    match ps.poll.poll(&mut ps.events, Some(timeout)) {
                        Ok(()) => {}
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            warn!("worker: poll failed: {}", err);
                            failed = true;
                        }
                    }
                    for event in ps.events.iter() {
                        if event.token() == WAKER_TOKEN {
                            continue;
                        }
                        ready.push((
                            event.token().0,
                            event.is_readable() || event.is_read_closed() || event.is_error(),
                            event.is_writable() || event.is_write_closed() || event.is_error(),
                        ));
                    }
                }
                drop(guard);
                if failed {
                    break;
                }
                for (id, readable, writable) in ready {
                    if let Some(aico) = inner.aico_by_id(id) {
                        self.drive(&aico, readable, writable);
                    }
                }
                // drain what is queued without blocking, then re-poll
                let mut stopped = false;
                while let Ok(work) = inner.rx.try_recv() {
                    if self.work(work) {
                        stopped = true;
                        break;
                    }
                }
                if stopped {
                    break;
                }
                if killing && inner.rx.is_empty() {
                    break;
                }
            } else {
                match inner.rx.recv_timeout(IDLE_TICK) {
                    Ok(work) => {
                        if self.work(work) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if killing {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        debug!("worker: leave");
    }

    /// Stop the worker loop: cancels everything in flight and unwinds the
    /// pool once the cancellations have drained.
    pub fn kill(&self) {
        if self
            .inner
            .lifecycle
            .compare_exchange(RUNNING, KILLING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("kill");
        self.kill_all();
        // enough stop tokens for any plausible pool; extras are harmless
        for _ in 0..64 {
            let _ = self.inner.tx.send(Work::Stop);
        }
        let _ = self.inner.waker.wake();
    }

    /// Cancel every in-flight request and forbid new posts; the loop keeps
    /// running so the killed completions can be delivered.
    pub fn kill_all(&self) {
        self.inner.forbid.store(true, Ordering::SeqCst);
        debug!("kill all");
        let aicos: Vec<Aico> = lock(&self.inner.aicos)
            .iter()
            .map(|(_, aico)| aico.clone())
            .collect();
        for aico in aicos {
            aico.kill();
        }
    }

    /// Block until every handle has exited or `timeout` ms elapse; negative
    /// waits forever. Returns +1 when drained, 0 on timeout, −1 on failure.
    pub fn wait_all(&self, timeout: i64) -> i64 {
        let deadline = if timeout < 0 {
            None
        } else {
            Some(self.inner.clock.now() + timeout as u64)
        };
        let mut aicos = lock(&self.inner.aicos);
        loop {
            if aicos.is_empty() {
                return 1;
            }
            let wait = match deadline {
                None => Duration::from_millis(500),
                Some(deadline) => {
                    let now = self.inner.clock.now();
                    if now >= deadline {
                        return 0;
                    }
                    Duration::from_millis((deadline - now).min(500))
                }
            };
            aicos = match self.inner.drained.wait_timeout(aicos, wait) {
                Ok((guard, _)) => guard,
                Err(_) => return -1,
            };
        }
    }

    /// Tear the engine down. Fails (returning `false`) while handles are
    /// still registered; call [`Aicp::wait_all`] first.
    pub fn exit(self) -> bool {
        if !lock(&self.inner.aicos).is_empty() {
            return false;
        }
        self.kill();
        true
    }

    // ---- registration ----

    fn register(&self, res: Resource) -> Result<Aico> {
        let mut aicos = lock(&self.inner.aicos);
        if aicos.len() >= self.inner.maxn {
            return Err(Error::new_handle());
        }
        let entry = aicos.vacant_entry();
        let id = entry.key();
        let aico = Aico::create(id, Arc::downgrade(&self.inner), res);
        entry.insert(aico.clone());
        drop(aicos);
        if let Err(err) = self.inner.register_source(&aico) {
            self.inner.unregister(&aico);
            return Err(err);
        }
        trace!(aico = id, "register");
        Ok(aico)
    }

    // ---- issuing ----

    /// Dispatch a due request: run it, park it, or queue it for a worker.
    /// Returns false when the submission is rejected synchronously (slot
    /// collision), in which case no callback will fire.
    fn issue(&self, posted: Posted) -> bool {
        let aico = posted.aice.aico.clone();
        // a kill may have landed while the request sat in the timer
        if aico.inner.state.load(Ordering::SeqCst) == STATE_KILLED
            || self.inner.forbid.load(Ordering::SeqCst)
        {
            self.inner.complete(posted, State::Killed);
            return true;
        }
        match posted.aice.code() {
            AiceCode::Runtask => {
                self.inner.complete(posted, State::Ok);
                true
            }
            AiceCode::Clos => {
                self.inner.exec_clos(posted);
                true
            }
            AiceCode::Read
            | AiceCode::Writ
            | AiceCode::Readv
            | AiceCode::Writv
            | AiceCode::Fsync => {
                // park in the single slot and hand to a worker
                let mut slot = lock(&aico.inner.slots[0]);
                if slot.posted.is_some() {
                    drop(slot);
                    self.inner.reject(&aico);
                    return false;
                }
                slot.seq += 1;
                slot.posted = Some(posted);
                drop(slot);
                self.inner.push(Work::Exec(aico));
                true
            }
            _ => self.issue_sock(posted),
        }
    }

    /// Issue a socket op. The slot stays locked across the syscall attempt
    /// so the leader's readiness drive can never observe the
    /// between-wouldblock-and-park window and lose an edge.
    fn issue_sock(&self, mut posted: Posted) -> bool {
        let aico = posted.aice.aico.clone();
        let dir = if posted.aice.op.is_send_dir() { 1 } else { 0 };
        let mut slot = lock(&aico.inner.slots[dir]);
        if slot.posted.is_some() {
            drop(slot);
            self.inner.reject(&aico);
            return false;
        }
        match self.sock_op(&aico, &mut posted.aice) {
            Ok(Some(state)) => {
                drop(slot);
                self.inner.complete(posted, state);
            }
            Ok(None) => {
                self.park(&aico, &mut *slot, dir, posted);
            }
            Err(err) => {
                drop(slot);
                debug!(aico = aico.inner.id, "sock op failed: {}", err);
                let state = io_state(&err);
                self.inner.complete(posted, state);
            }
        }
        true
    }

    /// Park a blocked request in its (already locked) slot and arm the
    /// per-category timeout.
    fn park(&self, aico: &Aico, slot: &mut crate::aico::Slot, dir: usize, posted: Posted) {
        let timeout_kind = match posted.aice.code() {
            AiceCode::Conn => Some(TimeoutKind::Conn),
            AiceCode::Recv | AiceCode::Urecv | AiceCode::Recvv | AiceCode::Urecvv => {
                Some(TimeoutKind::Recv)
            }
            AiceCode::Send
            | AiceCode::Usend
            | AiceCode::Sendv
            | AiceCode::Usendv
            | AiceCode::Sendf => Some(TimeoutKind::Send),
            _ => None,
        };
        slot.seq += 1;
        let seq = slot.seq;
        slot.posted = Some(posted);
        if let Some(kind) = timeout_kind {
            if let Some(ms) = aico.effective_timeout(kind) {
                let weak_inner = Arc::downgrade(&self.inner);
                let weak_aico = Arc::downgrade(&aico.inner);
                let task = self.inner.timer.task_init(ms, false, move |killed| {
                    if killed {
                        return;
                    }
                    let inner = match weak_inner.upgrade() {
                        Some(inner) => inner,
                        None => return,
                    };
                    let aico = match weak_aico.upgrade() {
                        Some(aico) => Aico { inner: aico },
                        None => return,
                    };
                    inner.expire(&aico, dir, seq);
                });
                slot.timeout = Some(task);
            }
        }
    }

    /// Readiness for a handle: retry whatever is parked in the indicated
    /// directions.
    fn drive(&self, aico: &Aico, readable: bool, writable: bool) {
        for &(dir, active) in &[(0usize, readable), (1usize, writable)] {
            if !active {
                continue;
            }
            let taken = {
                let mut slot = lock(&aico.inner.slots[dir]);
                slot.posted.take()
            };
            let mut posted = match taken {
                Some(posted) => posted,
                None => continue,
            };
            match self.sock_op(aico, &mut posted.aice) {
                Ok(Some(state)) => {
                    let mut slot = lock(&aico.inner.slots[dir]);
                    if let Some(task) = slot.timeout.take() {
                        self.inner.timer.task_exit(task);
                    }
                    drop(slot);
                    self.inner.complete(posted, state);
                }
                Ok(None) => {
                    // still blocked; put it back, timeout stays armed
                    let mut slot = lock(&aico.inner.slots[dir]);
                    slot.posted = Some(posted);
                }
                Err(err) => {
                    debug!(aico = aico.inner.id, "sock op failed: {}", err);
                    let state = io_state(&err);
                    let mut slot = lock(&aico.inner.slots[dir]);
                    if let Some(task) = slot.timeout.take() {
                        self.inner.timer.task_exit(task);
                    }
                    drop(slot);
                    self.inner.complete(posted, state);
                }
            }
        }
    }

    /// One non-blocking attempt at a socket op.
    ///
    /// `Ok(Some(state))` means finished with that state, `Ok(None)` would
    /// block, and `Err` failed at the OS level.
    fn sock_op(&self, aico: &Aico, aice: &mut Aice) -> io::Result<Option<State>> {
        let mut res = lock(&aico.inner.res);
        match aice.op {
            AiceOp::Conn { addr } => self.op_conn(aico, &mut res, addr),
            AiceOp::Acpt {
                aico: ref mut client,
                ref mut addr,
            } => self.op_acpt(&mut res, client, addr),
            AiceOp::Recv {
                ref mut data,
                ref mut real,
            } => match *res {
                Resource::Tcp { ref mut stream, .. } => op_recv(stream, data, real),
                _ => Ok(Some(State::NotSupported)),
            },
            AiceOp::Send {
                ref data,
                ref mut real,
            } => match *res {
                Resource::Tcp { ref mut stream, .. } => op_send(stream, data, real),
                _ => Ok(Some(State::NotSupported)),
            },
            AiceOp::Urecv {
                ref mut data,
                ref mut real,
                ref mut addr,
            } => match *res {
                Resource::Udp(ref socket) => op_urecv(socket, data, real, addr),
                _ => Ok(Some(State::NotSupported)),
            },
            AiceOp::Usend {
                addr,
                ref data,
                ref mut real,
            } => match *res {
                Resource::Udp(ref socket) => op_usend(socket, addr, data, real),
                _ => Ok(Some(State::NotSupported)),
            },
            AiceOp::Recvv {
                ref mut list,
                ref mut real,
            } => match *res {
                Resource::Tcp { ref mut stream, .. } => op_recvv(stream, list, real),
                _ => Ok(Some(State::NotSupported)),
            },
            AiceOp::Sendv {
                ref list,
                ref mut real,
            } => match *res {
                Resource::Tcp { ref mut stream, .. } => op_sendv(stream, list, real),
                _ => Ok(Some(State::NotSupported)),
            },
            AiceOp::Urecvv {
                ref mut list,
                ref mut real,
                ref mut addr,
            } => match *res {
                Resource::Udp(ref socket) => op_urecvv(socket, list, real, addr),
                _ => Ok(Some(State::NotSupported)),
            },
            AiceOp::Usendv {
                addr,
                ref list,
                ref mut real,
            } => match *res {
                Resource::Udp(ref socket) => op_usendv(socket, addr, list, real),
                _ => Ok(Some(State::NotSupported)),
            },
            AiceOp::Sendf {
                ref file,
                seek,
                size,
                ref mut real,
            } => match *res {
                Resource::Tcp { ref mut stream, .. } => op_sendf(stream, file, seek, size, real),
                _ => Ok(Some(State::NotSupported)),
            },
            _ => Ok(Some(State::NotSupported)),
        }
    }

    fn op_conn(
        &self,
        aico: &Aico,
        res: &mut Resource,
        addr: SocketAddr,
    ) -> io::Result<Option<State>> {
        match *res {
            Resource::TcpPending => {
                // materialize the socket now and wait for writability
                let mut stream = mio::net::TcpStream::connect(addr)?;
                self.inner.registry.register(
                    &mut stream,
                    Token(aico.inner.id),
                    Interest::READABLE | Interest::WRITABLE,
                )?;
                *res = Resource::Tcp {
                    stream,
                    connected: false,
                };
                Ok(None)
            }
            Resource::Tcp {
                ref stream,
                ref mut connected,
            } => {
                if *connected {
                    return Ok(Some(State::Ok));
                }
                if let Some(err) = stream.take_error()? {
                    return Err(err);
                }
                match stream.peer_addr() {
                    Ok(_) => {
                        *connected = true;
                        Ok(Some(State::Ok))
                    }
                    Err(ref err)
                        if err.kind() == io::ErrorKind::NotConnected
                            || err.kind() == io::ErrorKind::WouldBlock =>
                    {
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
            _ => Ok(Some(State::NotSupported)),
        }
    }

    fn op_acpt(
        &self,
        res: &mut Resource,
        client: &mut Option<Aico>,
        addr: &mut Option<SocketAddr>,
    ) -> io::Result<Option<State>> {
        match *res {
            Resource::Listener(ref listener) => match listener.accept() {
                Ok((stream, peer)) => {
                    match self.register(Resource::Tcp {
                        stream,
                        connected: true,
                    }) {
                        Ok(accepted) => {
                            *client = Some(accepted);
                            *addr = Some(peer);
                            Ok(Some(State::Ok))
                        }
                        Err(_) => Ok(Some(State::Failed)),
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err),
            },
            _ => Ok(Some(State::NotSupported)),
        }
    }

    /// Run one unit of work. Returns true when the worker should unwind.
    fn work(&self, work: Work) -> bool {
        match work {
            Work::Done(posted) => {
                self.inner.deliver(posted);
                false
            }
            Work::Exec(aico) => {
                self.inner.exec_file(&aico);
                false
            }
            Work::Stop => true,
        }
    }
}

impl fmt::Debug for Aicp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aicp")
            .field("maxn", &self.inner.maxn)
            .field("aicos", &lock(&self.inner.aicos).len())
            .finish()
    }
}

impl Inner {
    pub(crate) fn time(&self) -> u64 {
        self.clock.cached()
    }

    fn aico_by_id(&self, id: usize) -> Option<Aico> {
        lock(&self.aicos).get(id).cloned()
    }

    /// Register the handle's socket with the poller, both interests, edge
    /// style: every parked op retries until it would block again.
    fn register_source(&self, aico: &Aico) -> Result<()> {
        let token = Token(aico.inner.id);
        let mut res = lock(&aico.inner.res);
        let interest = Interest::READABLE | Interest::WRITABLE;
        let result = match *res {
            Resource::Tcp { ref mut stream, .. } => {
                self.registry.register(stream, token, interest)
            }
            Resource::Listener(ref mut listener) => {
                self.registry.register(listener, token, Interest::READABLE)
            }
            Resource::Udp(ref mut socket) => self.registry.register(socket, token, interest),
            _ => Ok(()),
        };
        result.map_err(Error::new_poller)
    }

    pub(crate) fn unregister(&self, aico: &Aico) {
        let mut aicos = lock(&self.aicos);
        if aicos.contains(aico.inner.id) {
            aicos.remove(aico.inner.id);
        }
        if aicos.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Deregister and drop the handle's resource.
    pub(crate) fn close_resource(&self, aico: &Aico) {
        let mut res = lock(&aico.inner.res);
        match *res {
            Resource::Tcp { ref mut stream, .. } => {
                let _ = self.registry.deregister(stream);
            }
            Resource::Listener(ref mut listener) => {
                let _ = self.registry.deregister(listener);
            }
            Resource::Udp(ref mut socket) => {
                let _ = self.registry.deregister(socket);
            }
            _ => {}
        }
        *res = Resource::None;
    }

    /// Cancel both direction slots, delivering killed completions.
    pub(crate) fn cancel_slots(&self, aico: &Aico) {
        for dir in 0..2 {
            let taken = {
                let mut slot = lock(&aico.inner.slots[dir]);
                if let Some(task) = slot.timeout.take() {
                    self.timer.task_exit(task);
                }
                slot.posted.take()
            };
            if let Some(mut posted) = taken {
                posted.aice.state = State::Killed;
                self.push(Work::Done(posted));
            }
        }
    }

    fn push(&self, work: Work) {
        let _ = self.tx.send(work);
        let _ = self.waker.wake();
    }

    pub(crate) fn complete(&self, mut posted: Posted, state: State) {
        posted.aice.state = state;
        self.push(Work::Done(posted));
    }

    /// Invoke the callback and resolve the request against its handle.
    fn deliver(&self, posted: Posted) {
        let Posted { aice, func } = posted;
        let aico = aice.aico.clone();
        trace!(
            aico = aico.inner.id,
            code = ?aice.code(),
            state = %aice.state,
            real = aice.real(),
            "complete"
        );
        let _ = func(aice);
        let quiescent = {
            let mut pending = lock(&aico.inner.pending);
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                aico.inner.quiescent.notify_all();
                true
            } else {
                false
            }
        };
        if quiescent && aico.inner.reap.load(Ordering::SeqCst) {
            self.close_resource(&aico);
            self.unregister(&aico);
        }
    }

    /// Mark the handle for unregistration at quiescence; immediate when it
    /// is already quiescent. The non-blocking sibling of [`Aico::exit`].
    pub(crate) fn dispose(&self, aico: &Aico) {
        aico.inner.reap.store(true, Ordering::SeqCst);
        let quiescent = *lock(&aico.inner.pending) == 0;
        if quiescent {
            self.close_resource(aico);
            self.unregister(aico);
        }
    }

    /// A slot collision is a programming error: the request is dropped
    /// without a callback and the pending count is rolled back.
    fn reject(&self, aico: &Aico) {
        warn!(aico = aico.inner.id, "slot busy, request rejected");
        let mut pending = lock(&aico.inner.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            aico.inner.quiescent.notify_all();
        }
    }

    /// Close: cancel in-flight requests, release the resource, complete Ok.
    fn exec_clos(&self, posted: Posted) {
        let aico = posted.aice.aico.clone();
        self.cancel_slots(&aico);
        self.close_resource(&aico);
        if aico.inner.state.load(Ordering::SeqCst) == STATE_OPEN {
            aico.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        }
        self.complete(posted, State::Ok);
    }

    /// A parked request's deadline elapsed: complete it with Timeout.
    fn expire(&self, aico: &Aico, dir: usize, seq: u64) {
        let taken = {
            let mut slot = lock(&aico.inner.slots[dir]);
            if slot.seq != seq {
                return;
            }
            slot.timeout = None;
            slot.posted.take()
        };
        if let Some(posted) = taken {
            trace!(aico = aico.inner.id, dir, "timeout");
            self.complete(posted, State::Timeout);
        }
    }

    /// Execute the parked file op on this worker and deliver it.
    fn exec_file(&self, aico: &Aico) {
        let taken = {
            let mut slot = lock(&aico.inner.slots[0]);
            slot.posted.take()
        };
        let mut posted = match taken {
            Some(posted) => posted,
            None => return,
        };
        let state = {
            let res = lock(&aico.inner.res);
            match *res {
                Resource::File(ref file) => file_op(file, &mut posted.aice.op),
                _ => State::NotSupported,
            }
        };
        posted.aice.state = state;
        self.deliver(posted);
    }
}

/// Map an OS error to a completion state.
fn io_state(err: &io::Error) -> State {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => State::Closed,
        _ => State::Failed,
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn op_recv(
    stream: &mut mio::net::TcpStream,
    data: &mut BytesMut,
    real: &mut usize,
) -> io::Result<Option<State>> {
    let want = data.capacity();
    data.resize(want, 0);
    match stream.read(&mut data[..]) {
        Ok(0) => {
            data.truncate(0);
            Ok(Some(State::Closed))
        }
        Ok(n) => {
            data.truncate(n);
            *real = n;
            Ok(Some(State::Ok))
        }
        Err(ref err) if would_block(err) => {
            data.truncate(0);
            Ok(None)
        }
        Err(err) => {
            data.truncate(0);
            Err(err)
        }
    }
}

fn op_send(
    stream: &mut mio::net::TcpStream,
    data: &bytes::Bytes,
    real: &mut usize,
) -> io::Result<Option<State>> {
    if data.is_empty() {
        return Ok(Some(State::Ok));
    }
    while *real < data.len() {
        match stream.write(&data[*real..]) {
            Ok(0) => return Ok(Some(State::Closed)),
            Ok(n) => *real += n,
            Err(ref err) if would_block(err) => {
                // partial progress still completes; the caller re-posts
                return if *real > 0 {
                    Ok(Some(State::Ok))
                } else {
                    Ok(None)
                };
            }
            Err(err) => return Err(err),
        }
    }
    Ok(Some(State::Ok))
}

fn op_urecv(
    socket: &mio::net::UdpSocket,
    data: &mut BytesMut,
    real: &mut usize,
    addr: &mut Option<SocketAddr>,
) -> io::Result<Option<State>> {
    let want = data.capacity();
    data.resize(want, 0);
    match socket.recv_from(&mut data[..]) {
        Ok((n, peer)) => {
            data.truncate(n);
            *real = n;
            *addr = Some(peer);
            Ok(Some(State::Ok))
        }
        Err(ref err) if would_block(err) => {
            data.truncate(0);
            Ok(None)
        }
        Err(err) => {
            data.truncate(0);
            Err(err)
        }
    }
}

fn op_usend(
    socket: &mio::net::UdpSocket,
    addr: SocketAddr,
    data: &bytes::Bytes,
    real: &mut usize,
) -> io::Result<Option<State>> {
    match socket.send_to(&data[..], addr) {
        Ok(n) => {
            *real = n;
            Ok(Some(State::Ok))
        }
        Err(ref err) if would_block(err) => Ok(None),
        Err(err) => Err(err),
    }
}

fn op_recvv(
    stream: &mut mio::net::TcpStream,
    list: &mut Vec<BytesMut>,
    real: &mut usize,
) -> io::Result<Option<State>> {
    for buf in list.iter_mut() {
        let want = buf.capacity();
        buf.resize(want, 0);
    }
    let n = {
        let mut slices: Vec<IoSliceMut<'_>> = list
            .iter_mut()
            .map(|buf| IoSliceMut::new(&mut buf[..]))
            .collect();
        match stream.read_vectored(&mut slices) {
            Ok(n) => n,
            Err(ref err) if would_block(err) => {
                drop(slices);
                for buf in list.iter_mut() {
                    buf.truncate(0);
                }
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
    };
    let mut left = n;
    for buf in list.iter_mut() {
        let keep = left.min(buf.len());
        buf.truncate(keep);
        left -= keep;
    }
    *real = n;
    if n == 0 {
        Ok(Some(State::Closed))
    } else {
        Ok(Some(State::Ok))
    }
}

fn op_sendv(
    stream: &mut mio::net::TcpStream,
    list: &[bytes::Bytes],
    real: &mut usize,
) -> io::Result<Option<State>> {
    let total: usize = list.iter().map(|buf| buf.len()).sum();
    if total == 0 {
        return Ok(Some(State::Ok));
    }
    while *real < total {
        // skip fully sent buffers, slice into the first partial one
        let mut skip = *real;
        let mut slices = Vec::with_capacity(list.len());
        for buf in list {
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            slices.push(IoSlice::new(&buf[skip..]));
            skip = 0;
        }
        match stream.write_vectored(&slices) {
            Ok(0) => return Ok(Some(State::Closed)),
            Ok(n) => *real += n,
            Err(ref err) if would_block(err) => {
                return if *real > 0 {
                    Ok(Some(State::Ok))
                } else {
                    Ok(None)
                };
            }
            Err(err) => return Err(err),
        }
    }
    Ok(Some(State::Ok))
}

fn op_urecvv(
    socket: &mio::net::UdpSocket,
    list: &mut Vec<BytesMut>,
    real: &mut usize,
    addr: &mut Option<SocketAddr>,
) -> io::Result<Option<State>> {
    let total: usize = list.iter().map(|buf| buf.capacity()).sum();
    let mut staging = vec![0u8; total];
    match socket.recv_from(&mut staging[..]) {
        Ok((n, peer)) => {
            let mut offset = 0;
            for buf in list.iter_mut() {
                let take = buf.capacity().min(n - offset);
                buf.clear();
                buf.extend_from_slice(&staging[offset..offset + take]);
                offset += take;
                if offset == n {
                    break;
                }
            }
            *real = n;
            *addr = Some(peer);
            Ok(Some(State::Ok))
        }
        Err(ref err) if would_block(err) => Ok(None),
        Err(err) => Err(err),
    }
}

fn op_usendv(
    socket: &mio::net::UdpSocket,
    addr: SocketAddr,
    list: &[bytes::Bytes],
    real: &mut usize,
) -> io::Result<Option<State>> {
    // one datagram: coalesce the list
    let total: usize = list.iter().map(|buf| buf.len()).sum();
    let mut staging = BytesMut::with_capacity(total);
    for buf in list {
        staging.extend_from_slice(&buf[..]);
    }
    match socket.send_to(&staging[..], addr) {
        Ok(n) => {
            *real = n;
            Ok(Some(State::Ok))
        }
        Err(ref err) if would_block(err) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(target_os = "linux")]
fn op_sendf(
    stream: &mut mio::net::TcpStream,
    file: &File,
    seek: u64,
    size: u64,
    real: &mut u64,
) -> io::Result<Option<State>> {
    use std::os::unix::io::AsRawFd;
    loop {
        let left = if size > 0 {
            match size.checked_sub(*real) {
                Some(0) | None => return Ok(Some(State::Ok)),
                Some(left) => left,
            }
        } else {
            1 << 20
        };
        let mut offset = (seek + *real) as libc::off_t;
        let n = unsafe {
            libc::sendfile(
                stream.as_raw_fd(),
                file.as_raw_fd(),
                &mut offset,
                left.min(1 << 20) as usize,
            )
        };
        if n == 0 {
            return Ok(Some(State::Ok));
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if would_block(&err) {
                return if *real > 0 { Ok(Some(State::Ok)) } else { Ok(None) };
            }
            return Err(err);
        }
        *real += n as u64;
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn op_sendf(
    stream: &mut mio::net::TcpStream,
    file: &File,
    seek: u64,
    size: u64,
    real: &mut u64,
) -> io::Result<Option<State>> {
    use std::os::unix::fs::FileExt;
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let left = if size > 0 {
            match size.checked_sub(*real) {
                Some(0) | None => return Ok(Some(State::Ok)),
                Some(left) => left,
            }
        } else {
            chunk.len() as u64
        };
        let want = left.min(chunk.len() as u64) as usize;
        let got = file.read_at(&mut chunk[..want], seek + *real)?;
        if got == 0 {
            return Ok(Some(State::Ok));
        }
        match stream.write(&chunk[..got]) {
            Ok(0) => return Ok(Some(State::Closed)),
            // the unsent tail is re-read from the file next time
            Ok(n) => *real += n as u64,
            Err(ref err) if would_block(err) => {
                return if *real > 0 { Ok(Some(State::Ok)) } else { Ok(None) };
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(not(unix))]
fn op_sendf(
    _stream: &mut mio::net::TcpStream,
    _file: &File,
    _seek: u64,
    _size: u64,
    _real: &mut u64,
) -> io::Result<Option<State>> {
    Ok(Some(State::NotSupported))
}

#[cfg(unix)]
fn file_op(file: &File, op: &mut AiceOp) -> State {
    use std::os::unix::fs::FileExt;
    let result: io::Result<()> = (|| {
        match *op {
            AiceOp::Read {
                seek,
                ref mut data,
                ref mut real,
            } => {
                let want = data.capacity();
                data.resize(want, 0);
                let n = file.read_at(&mut data[..], seek)?;
                data.truncate(n);
                *real = n;
            }
            AiceOp::Writ {
                seek,
                ref data,
                ref mut real,
            } => {
                file.write_all_at(&data[..], seek)?;
                *real = data.len();
            }
            AiceOp::Readv {
                seek,
                ref mut list,
                ref mut real,
            } => {
                let mut offset = 0usize;
                for buf in list.iter_mut() {
                    let want = buf.capacity();
                    buf.resize(want, 0);
                    let n = file.read_at(&mut buf[..], seek + offset as u64)?;
                    buf.truncate(n);
                    offset += n;
                    if n < want {
                        break;
                    }
                }
                *real = offset;
            }
            AiceOp::Writv {
                seek,
                ref list,
                ref mut real,
            } => {
                let mut offset = 0usize;
                for buf in list {
                    file.write_all_at(&buf[..], seek + offset as u64)?;
                    offset += buf.len();
                }
                *real = offset;
            }
            AiceOp::Fsync => file.sync_all()?,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a file op")),
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            // a zero-byte read past the end is a clean EOF
            if let AiceOp::Read { real, ref data, .. } = *op {
                if real == 0 && data.is_empty() {
                    return State::Closed;
                }
            }
            State::Ok
        }
        Err(err) => {
            debug!("file op failed: {}", err);
            io_state(&err)
        }
    }
}

#[cfg(not(unix))]
fn file_op(_file: &File, _op: &mut AiceOp) -> State {
    State::NotSupported
}
