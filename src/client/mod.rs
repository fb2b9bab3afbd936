//! The async HTTP/1 client.
//!
//! A [`Client`] drives one request/response exchange at a time over a
//! socket stream owned by the client: connect (or reuse a kept-alive
//! connection), write the request head (streaming the POST body when one
//! is configured), parse the response head line by line, install the
//! chunked and inflate filters the response calls for, then hand the body
//! to the caller's `read` callbacks. Redirects re-enter the open path
//! after the previous body has been drained, so every step yields to the
//! proactor.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use http::Method;
use tracing::{debug, trace};

use crate::proactor::lock;
use crate::ssl::EngineFactory;
use crate::state::{HttpState, State};
use crate::stream::{ChunkedFilter, Filter, FilterStream, InflateFilter, SockStream, Upstream};
use crate::Aicp;

pub use self::cookies::Cookies;
pub use self::option::{HeadFunc, Options, PostFunc};
pub use self::status::Status;

pub mod escape;

mod cookies;
mod option;
mod request;
mod response;
mod status;
mod transfer;

use self::transfer::{Transfer, TransferFunc};

const CLOSED: u8 = 0;
const OPENING: u8 = 1;
const OPENED: u8 = 2;
const KILLING: u8 = 3;

const DEFAULT_READ: usize = 8192;

type OpenCb = Box<dyn FnOnce(State, Status) + Send>;

#[derive(Clone)]
enum Current {
    Sock,
    Filter(FilterStream),
}

struct ClientData {
    option: Options,
    status: Status,
    sstream: SockStream,
    current: Current,
    line_data: String,
    line_size: usize,
    cache_data: BytesMut,
    content_read: u64,
    redirect_tryn: usize,
    transfer: Option<Arc<Transfer>>,
}

struct ClientInner {
    aicp: Aicp,
    state: AtomicU8,
    data: Mutex<ClientData>,
}

/// An async HTTP/1 client.
///
/// Callbacks run on the proactor's worker threads; the client assumes
/// serial progression: one of open/read/seek/clos at a time.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// A closed client on the given proactor.
    pub fn new(aicp: &Aicp) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                aicp: aicp.clone(),
                state: AtomicU8::new(CLOSED),
                data: Mutex::new(ClientData {
                    option: Options::new(),
                    status: Status::new(),
                    sstream: SockStream::new(aicp.clone()),
                    current: Current::Sock,
                    line_data: String::new(),
                    line_size: 0,
                    cache_data: BytesMut::new(),
                    content_read: 0,
                    redirect_tryn: 0,
                    transfer: None,
                }),
            }),
        }
    }

    /// The owning proactor.
    pub fn aicp(&self) -> Aicp {
        self.inner.aicp.clone()
    }

    /// A snapshot of the last response status.
    pub fn status(&self) -> Status {
        lock(&self.inner.data).status.clone()
    }

    fn set_option<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut Options) -> bool,
    {
        // options may only change while closed
        if self.inner.state.load(Ordering::SeqCst) != CLOSED {
            return false;
        }
        apply(&mut lock(&self.inner.data).option)
    }

    /// Set the request URL.
    pub fn set_url(&self, url: &str) -> bool {
        self.set_option(|option| match url::Url::parse(url) {
            Ok(url) => {
                option.url = Some(url);
                true
            }
            Err(_) => false,
        })
    }

    /// Replace the URL's host.
    pub fn set_host(&self, host: &str) -> bool {
        self.set_option(|option| match option.url {
            Some(ref mut url) => url.set_host(Some(host)).is_ok(),
            None => false,
        })
    }

    /// Replace the URL's port.
    pub fn set_port(&self, port: u16) -> bool {
        self.set_option(|option| match option.url {
            Some(ref mut url) => url.set_port(Some(port)).is_ok(),
            None => false,
        })
    }

    /// Replace the URL's path.
    pub fn set_path(&self, path: &str) -> bool {
        self.set_option(|option| match option.url {
            Some(ref mut url) => {
                url.set_path(path);
                true
            }
            None => false,
        })
    }

    /// Select http or https.
    pub fn set_ssl(&self, ssl: bool) -> bool {
        self.set_option(|option| match option.url {
            Some(ref mut url) => url
                .set_scheme(if ssl { "https" } else { "http" })
                .is_ok(),
            None => false,
        })
    }

    /// The request method.
    pub fn set_method(&self, method: Method) -> bool {
        self.set_option(|option| {
            option.method = method;
            true
        })
    }

    /// The minor HTTP version: 0 or 1.
    pub fn set_version(&self, version: u8) -> bool {
        self.set_option(|option| {
            option.version = if version > 1 { 1 } else { version };
            true
        })
    }

    /// Add or replace one custom request header.
    pub fn set_head(&self, name: &str, value: &str) -> bool {
        use std::convert::TryFrom;
        self.set_option(|option| {
            let name = match http::header::HeaderName::try_from(name) {
                Ok(name) => name,
                Err(_) => return false,
            };
            let value = match http::header::HeaderValue::try_from(value) {
                Ok(value) => value,
                Err(_) => return false,
            };
            option.head.insert(name, value);
            true
        })
    }

    /// The per-response-line callback.
    pub fn set_head_func(&self, func: HeadFunc) -> bool {
        self.set_option(|option| {
            option.head_func = Some(func);
            true
        })
    }

    /// The byte range to request; (0, 0) requests the whole document.
    pub fn set_range(&self, bof: u64, eof: u64) -> bool {
        self.set_option(|option| {
            option.range = (bof, eof);
            true
        })
    }

    /// The stream-level deadline (0 restores the default).
    pub fn set_timeout(&self, timeout: i64) -> bool {
        self.set_option(|option| {
            option.timeout = if timeout == 0 {
                option::DEFAULT_TIMEOUT
            } else {
                timeout
            };
            true
        })
    }

    /// The cookie jar to read from and store into.
    pub fn set_cookies(&self, cookies: Option<Arc<Cookies>>) -> bool {
        self.set_option(|option| {
            option.cookies = cookies;
            true
        })
    }

    /// POST body from inline bytes.
    pub fn set_post_data(&self, data: Bytes) -> bool {
        self.set_option(|option| {
            option.post_data = Some(data);
            option.post_url = None;
            true
        })
    }

    /// POST body streamed from a URL (file scheme).
    pub fn set_post_url(&self, url: &str) -> bool {
        self.set_option(|option| match url::Url::parse(url) {
            Ok(url) => {
                option.post_url = Some(url);
                option.post_data = None;
                true
            }
            Err(_) => false,
        })
    }

    /// The POST progress callback.
    pub fn set_post_func(&self, func: PostFunc) -> bool {
        self.set_option(|option| {
            option.post_func = Some(func);
            true
        })
    }

    /// Cap the POST body at `rate` bytes per second (0 removes the cap).
    pub fn set_post_lrate(&self, rate: u64) -> bool {
        self.set_option(|option| {
            option.post_lrate = rate;
            true
        })
    }

    /// Whether to inflate gzip/deflate responses.
    pub fn set_unzip(&self, unzip: bool) -> bool {
        self.set_option(|option| {
            option.bunzip = unzip;
            true
        })
    }

    /// The maximum number of Location follows.
    pub fn set_redirect(&self, redirect: usize) -> bool {
        self.set_option(|option| {
            option.redirect = redirect;
            true
        })
    }

    /// The TLS engine factory used for https URLs.
    pub fn set_ssl_factory(&self, factory: EngineFactory) -> bool {
        if self.inner.state.load(Ordering::SeqCst) != CLOSED {
            return false;
        }
        lock(&self.inner.data).sstream.set_ssl_factory(factory);
        true
    }

    /// Connect and exchange the request head for the response head. The
    /// callback fires once with the outcome and a status snapshot.
    pub fn open<F>(&self, func: F) -> bool
    where
        F: FnOnce(State, Status) + Send + 'static,
    {
        match self.inner.state.compare_exchange(
            CLOSED,
            OPENING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(OPENED) => {
                let mut status = lock(&self.inner.data).status.clone();
                status.state = State::Ok;
                func(State::Ok, status);
                return true;
            }
            Err(_) => return false,
        }
        lock(&self.inner.data).redirect_tryn = 0;
        open_done(self.inner.clone(), Box::new(func));
        true
    }

    /// Read up to `size` body bytes at a time (0 selects the default).
    /// `func` runs per span while it returns `true`; after the last body
    /// byte it runs once more with `Closed` and no bytes.
    pub fn read<F>(&self, size: usize, func: F) -> bool
    where
        F: FnMut(State, Bytes) -> bool + Send + 'static,
    {
        self.read_after(0, size, func)
    }

    /// Like [`Client::read`], with the first stream read deferred by
    /// `delay` milliseconds.
    pub fn read_after<F>(&self, delay: u64, size: usize, mut func: F) -> bool
    where
        F: FnMut(State, Bytes) -> bool + Send + 'static,
    {
        if self.inner.state.load(Ordering::SeqCst) != OPENED {
            return false;
        }
        let this = self.inner.clone();
        // bytes already read past the head are delivered first, whole
        let (cache, done) = {
            let mut data = lock(&this.data);
            if data.cache_data.is_empty() {
                (None, false)
            } else {
                let cache = data.cache_data.split().freeze();
                data.content_read += cache.len() as u64;
                let done = data.status.content_size >= 0
                    && data.content_read >= data.status.content_size as u64;
                (Some(cache), done)
            }
        };
        if let Some(cache) = cache {
            if !func(State::Ok, cache) {
                return true;
            }
            if done {
                func(State::Closed, Bytes::new());
                return true;
            }
        }
        client_read(this, delay, size, func)
    }

    /// Re-open with a Range starting at `offset`. Only valid once the
    /// server has advertised range support and no filter is installed.
    pub fn seek<F>(&self, offset: u64, func: F) -> bool
    where
        F: FnOnce(State, u64) + Send + 'static,
    {
        if !lock(&self.inner.data).status.bseeked {
            return false;
        }
        self.seek_inner(offset, func)
    }

    fn seek_inner<F>(&self, offset: u64, func: F) -> bool
    where
        F: FnOnce(State, u64) + Send + 'static,
    {
        if self.inner.state.load(Ordering::SeqCst) == KILLING {
            return false;
        }
        self.inner.state.store(OPENING, Ordering::SeqCst);
        {
            let mut data = lock(&self.inner.data);
            data.redirect_tryn = 0;
            let eof = if data.status.document_size > 0 {
                data.status.document_size as u64 - 1
            } else {
                0
            };
            data.option.range = (offset, eof);
            trace!(offset, "seek");
        }
        open_done(
            self.inner.clone(),
            Box::new(move |state, _status| func(state, offset)),
        );
        true
    }

    /// Run a bare callback after `delay` milliseconds on the stream.
    pub fn task<F>(&self, delay: u64, func: F) -> bool
    where
        F: FnOnce(State) + Send + 'static,
    {
        if self.inner.state.load(Ordering::SeqCst) != OPENED {
            return false;
        }
        let sstream = lock(&self.inner.data).sstream.clone();
        sstream.task(delay, func)
    }

    /// Open, then read.
    pub fn open_read<F>(&self, size: usize, func: F) -> bool
    where
        F: FnMut(State, Bytes) -> bool + Send + 'static,
    {
        let client = self.clone();
        self.open(move |state, _status| {
            if state == State::Ok {
                client.read(size, func);
            } else {
                let mut func = func;
                func(state, Bytes::new());
            }
        })
    }

    /// Open with a Range starting at `offset`.
    pub fn open_seek<F>(&self, offset: u64, func: F) -> bool
    where
        F: FnOnce(State, u64) + Send + 'static,
    {
        self.seek_inner(offset, func)
    }

    /// Close the exchange. The stream (filters and all) is closed and the
    /// pipeline reverts to the bare socket for the next open.
    pub fn clos<F>(&self, func: F) -> bool
    where
        F: FnOnce(State) + Send + 'static,
    {
        if self.inner.state.load(Ordering::SeqCst) == CLOSED {
            func(State::Ok);
            return true;
        }
        trace!("clos");
        let this = self.inner.clone();
        let (sstream, transfer) = {
            let mut data = lock(&this.data);
            (data.sstream.clone(), data.transfer.take())
        };
        if let Some(transfer) = transfer {
            transfer.dispose();
        }
        sstream.clos(move |state| {
            clos_clear(&this);
            func(state);
        })
    }

    /// Try to close without waiting; fails while anything is in flight.
    pub fn clos_try(&self) -> bool {
        if self.inner.state.load(Ordering::SeqCst) == CLOSED {
            return true;
        }
        let (sstream, transfer_busy) = {
            let data = lock(&self.inner.data);
            let busy = data
                .transfer
                .as_ref()
                .map(|transfer| !transfer.clos_try())
                .unwrap_or(false);
            (data.sstream.clone(), busy)
        };
        if transfer_busy || !sstream.clos_try() {
            return false;
        }
        if let Some(transfer) = lock(&self.inner.data).transfer.take() {
            transfer.dispose();
        }
        clos_clear(&self.inner);
        true
    }

    /// Kill the exchange: the transfer and the stream are killed and
    /// in-flight callbacks complete with [`State::Killed`].
    pub fn kill(&self) {
        if self.inner.state.swap(KILLING, Ordering::SeqCst) == KILLING {
            return;
        }
        debug!("kill");
        let data = lock(&self.inner.data);
        if let Some(ref transfer) = data.transfer {
            transfer.kill();
        }
        data.sstream.kill();
    }
}

fn clos_clear(this: &Arc<ClientInner>) {
    let mut data = lock(&this.data);
    data.current = Current::Sock;
    data.content_read = 0;
    drop(data);
    this.state.store(CLOSED, Ordering::SeqCst);
}

/// Close whatever the previous exchange left behind, then reconnect.
fn open_done(this: Arc<ClientInner>, func: OpenCb) {
    let (sstream, transfer) = {
        let mut data = lock(&this.data);
        (data.sstream.clone(), data.transfer.take())
    };
    if let Some(transfer) = transfer {
        transfer.dispose();
    }
    let again = this.clone();
    sstream.clos(move |state| open_clos(again, state, func));
}

fn open_clos(this: Arc<ClientInner>, state: State, func: OpenCb) {
    if this.state.load(Ordering::SeqCst) == KILLING {
        open_failed(this, State::Killed, func);
        return;
    }
    if state != State::Ok {
        open_failed(this, state, func);
        return;
    }
    let prepared: Result<SockStream, State> = {
        let mut data = lock(&this.data);
        let data = &mut *data;
        data.current = Current::Sock;
        match data.option.host() {
            Some(host) => {
                let host = host.to_string();
                let host_changed = match data.sstream.host() {
                    Some(ref old) => !old.eq_ignore_ascii_case(&host),
                    None => true,
                };
                trace!(host = %host, changed = host_changed, "connect");
                data.sstream
                    .set_url(&host, data.option.port(), data.option.is_ssl());
                data.sstream.set_timeout(data.option.timeout);
                data.status.clear(host_changed);
                data.line_data.clear();
                data.line_size = 0;
                data.cache_data.clear();
                data.content_read = 0;
                Ok(data.sstream.clone())
            }
            None => Err(State::Http(HttpState::UnknownError)),
        }
    };
    match prepared {
        Ok(sstream) => {
            let again = this.clone();
            sstream.open(move |state| sock_open_func(again, state, func));
        }
        Err(state) => open_failed(this, state, func),
    }
}

fn sock_open_func(this: Arc<ClientInner>, state: State, func: OpenCb) {
    if this.state.load(Ordering::SeqCst) == KILLING {
        open_failed(this, State::Killed, func);
        return;
    }
    if state != State::Ok {
        open_failed(this, state, func);
        return;
    }
    // assemble the head; POST needs the body size first
    let prepared: Result<(String, SockStream, bool), State> = {
        let mut data = lock(&this.data);
        let data = &mut *data;
        let is_post = data.option.method == Method::POST;
        if is_post {
            let transfer = if let Some(ref bytes) = data.option.post_data {
                Ok(Transfer::with_data(this.aicp.clone(), bytes.clone()))
            } else if let Some(ref url) = data.option.post_url {
                match url.to_file_path() {
                    Ok(path) => {
                        Transfer::with_file(this.aicp.clone(), path).map_err(|err| {
                            debug!("post source failed: {}", err);
                            State::Http(HttpState::PostFailed)
                        })
                    }
                    Err(_) => Err(State::Http(HttpState::PostFailed)),
                }
            } else {
                Err(State::Http(HttpState::PostFailed))
            };
            match transfer {
                Ok(transfer) => {
                    if data.option.post_lrate > 0 {
                        transfer.limit_rate(data.option.post_lrate);
                    }
                    let size = transfer.size();
                    data.transfer = Some(transfer);
                    request::format_head(&data.option, &data.status, size)
                        .map(|head| (head, data.sstream.clone(), true))
                }
                Err(state) => Err(state),
            }
        } else {
            request::format_head(&data.option, &data.status, 0)
                .map(|head| (head, data.sstream.clone(), false))
        }
    };
    let (head, sstream, is_post) = match prepared {
        Ok(prepared) => prepared,
        Err(state) => {
            open_failed(this, state, func);
            return;
        }
    };
    trace!(size = head.len(), "request head");
    let again = this.clone();
    let posted = sstream.writ(Bytes::from(head.into_bytes()), move |state| {
        head_writ_func(again, state, is_post, func)
    });
    if !posted {
        // the submission was rejected synchronously; no callback will fire
        debug!("request head not posted");
    }
}

fn head_writ_func(this: Arc<ClientInner>, state: State, is_post: bool, func: OpenCb) {
    if this.state.load(Ordering::SeqCst) == KILLING {
        open_failed(this, State::Killed, func);
        return;
    }
    if state != State::Ok {
        open_failed(this, state, func);
        return;
    }
    if !is_post {
        head_read_start(this, func);
        return;
    }
    let (sstream, transfer, post_func) = {
        let data = lock(&this.data);
        (
            data.sstream.clone(),
            data.transfer.clone(),
            data.option.post_func.clone(),
        )
    };
    let transfer = match transfer {
        Some(transfer) => transfer,
        None => {
            open_failed(this, State::Http(HttpState::PostFailed), func);
            return;
        }
    };
    // the open continuation fires exactly once out of a many-shot pump
    let holder = Arc::new(Mutex::new(Some(func)));
    let recover = holder.clone();
    let again = this.clone();
    let pump: TransferFunc = Arc::new(move |state, offset, size, save, rate| {
        if let Some(ref post_func) = post_func {
            if !post_func(state, offset, size, save, rate) {
                if let Some(func) = lock(&holder).take() {
                    open_failed(again.clone(), State::UnknownError, func);
                }
                return false;
            }
        }
        match state {
            State::Ok => true,
            State::Closed => {
                if let Some(func) = lock(&holder).take() {
                    head_read_start(again.clone(), func);
                }
                false
            }
            other => {
                if let Some(func) = lock(&holder).take() {
                    open_failed(again.clone(), other, func);
                }
                false
            }
        }
    });
    if !transfer.run(sstream, pump) {
        if let Some(func) = lock(&recover).take() {
            open_failed(this, State::Http(HttpState::PostFailed), func);
        }
    }
}

/// The request is on the wire: assemble and parse the response head.
fn head_read_start(this: Arc<ClientInner>, func: OpenCb) {
    let sstream = {
        let mut data = lock(&this.data);
        data.line_data.clear();
        data.line_size = 0;
        data.cache_data.clear();
        data.content_read = 0;
        data.sstream.clone()
    };
    let again = this.clone();
    let mut func = Some(func);
    let posted = sstream.read(DEFAULT_READ, move |state, data| {
        head_read_step(&again, &mut func, state, data)
    });
    if !posted {
        debug!("head read not posted");
    }
}

enum After {
    More,
    Fail(State),
    Finished(Bytes),
}

fn head_read_step(
    this: &Arc<ClientInner>,
    func: &mut Option<OpenCb>,
    state: State,
    payload: Bytes,
) -> bool {
    if this.state.load(Ordering::SeqCst) == KILLING {
        if let Some(func) = func.take() {
            open_failed(this.clone(), State::Killed, func);
        }
        return false;
    }
    if state != State::Ok {
        if let Some(func) = func.take() {
            open_failed(this.clone(), state, func);
        }
        return false;
    }
    let after = {
        let mut data = lock(&this.data);
        let data = &mut *data;
        let mut after = After::More;
        let bytes = &payload[..];
        let mut index = 0;
        while index < bytes.len() {
            let byte = bytes[index];
            index += 1;
            if byte == 0 {
                after = After::Fail(State::Http(HttpState::UnknownError));
                break;
            }
            if byte != b'\n' {
                data.line_data.push(byte as char);
                continue;
            }
            if data.line_data.ends_with('\r') {
                data.line_data.pop();
            }
            trace!(line = %data.line_data, "response");
            if let Some(head_func) = data.option.head_func.clone() {
                if !head_func(&data.line_data) {
                    after = After::Fail(State::UnknownError);
                    break;
                }
            }
            if data.line_data.is_empty() {
                after = After::Finished(payload.slice(index..));
                break;
            }
            let line = std::mem::take(&mut data.line_data);
            let parsed = if data.line_size == 0 {
                response::parse_status_line(&line, &mut data.status)
            } else {
                let host = data.option.host().unwrap_or("").to_string();
                let path = data.option.path().to_string();
                let ssl = data.option.is_ssl();
                match data.option.cookies.clone() {
                    Some(jar) => response::parse_header_line(
                        &line,
                        &mut data.status,
                        Some((&jar, &host, &path, ssl)),
                    ),
                    None => response::parse_header_line(&line, &mut data.status, None),
                }
            };
            if let Err(state) = parsed {
                after = After::Fail(state);
                break;
            }
            data.line_size += 1;
        }
        after
    };
    match after {
        After::More => true,
        After::Fail(state) => {
            if let Some(func) = func.take() {
                open_failed(this.clone(), state, func);
            }
            false
        }
        After::Finished(leftover) => {
            if let Some(func) = func.take() {
                head_finished(this.clone(), leftover, func);
            }
            false
        }
    }
}

/// The blank line landed: either follow a redirect or install the filter
/// pipeline and deliver the open.
fn head_finished(this: Arc<ClientInner>, leftover: Bytes, func: OpenCb) {
    let redirect = {
        let mut data = lock(&this.data);
        if !data.status.location.is_empty() && data.redirect_tryn < data.option.redirect {
            data.redirect_tryn += 1;
            data.content_read = leftover.len() as u64;
            let drained = data.status.content_size >= 0
                && data.content_read >= data.status.content_size as u64;
            Some(drained)
        } else {
            None
        }
    };
    match redirect {
        Some(true) => redirect_open(this, func),
        Some(false) => {
            // the redirect body is consumed through reads, yielding to the
            // engine, before the next request begins
            let sstream = lock(&this.data).sstream.clone();
            let again = this.clone();
            let holder = Arc::new(Mutex::new(Some(func)));
            let recover = holder.clone();
            let posted = sstream.read(DEFAULT_READ, move |state, data| {
                head_redt_step(&again, &holder, state, data)
            });
            if !posted {
                if let Some(func) = lock(&recover).take() {
                    open_failed(this, State::Http(HttpState::RedirectFailed), func);
                }
            }
        }
        None => deliver_open(this, leftover, func),
    }
}

fn head_redt_step(
    this: &Arc<ClientInner>,
    holder: &Mutex<Option<OpenCb>>,
    state: State,
    payload: Bytes,
) -> bool {
    if this.state.load(Ordering::SeqCst) == KILLING {
        if let Some(func) = lock(holder).take() {
            open_failed(this.clone(), State::Killed, func);
        }
        return false;
    }
    match state {
        State::Ok => {
            let more = {
                let mut data = lock(&this.data);
                data.content_read += payload.len() as u64;
                data.status.content_size < 0
                    || data.content_read < data.status.content_size as u64
            };
            if more {
                return true;
            }
            if let Some(func) = lock(holder).take() {
                redirect_open(this.clone(), func);
            }
            false
        }
        State::Closed => {
            if let Some(func) = lock(holder).take() {
                redirect_open(this.clone(), func);
            }
            false
        }
        other => {
            if let Some(func) = lock(holder).take() {
                open_failed(this.clone(), other, func);
            }
            false
        }
    }
}

fn redirect_open(this: Arc<ClientInner>, func: OpenCb) {
    let joined = {
        let mut data = lock(&this.data);
        let location = data.status.location.clone();
        trace!(location = %location, "redirect");
        match data.option.url.clone() {
            Some(url) => match url.join(&location) {
                Ok(next) => {
                    data.option.url = Some(next);
                    true
                }
                Err(_) => false,
            },
            None => false,
        }
    };
    if joined {
        open_done(this, func);
    } else {
        open_failed(this, State::Http(HttpState::RedirectFailed), func);
    }
}

/// Install filters per the response, stash post-head bytes, and hand the
/// opened exchange to the caller.
fn deliver_open(this: Arc<ClientInner>, leftover: Bytes, func: OpenCb) {
    let installed: Result<Status, State> = (|| {
        let mut data = lock(&this.data);
        let data = &mut *data;
        let mut leftover_used = false;
        if data.status.bchunked {
            let chunked = FilterStream::new(
                Upstream::Sock(data.sstream.clone()),
                Box::new(ChunkedFilter::new()),
            );
            if !leftover.is_empty() {
                if chunked.push(&leftover).is_err() {
                    return Err(State::Http(HttpState::UnknownError));
                }
                leftover_used = true;
            }
            data.current = Current::Filter(chunked);
            data.status.bseeked = false;
        }
        if (data.status.bgzip || data.status.bdeflate) && data.option.bunzip {
            let filter: Box<dyn Filter> = if data.status.bgzip {
                Box::new(InflateFilter::gzip())
            } else {
                Box::new(InflateFilter::zlib())
            };
            let upstream = match data.current {
                Current::Sock => Upstream::Sock(data.sstream.clone()),
                Current::Filter(ref chain) => Upstream::Filter(chain.clone()),
            };
            let inflate = FilterStream::new(upstream, filter);
            if data.status.content_size > 0 {
                inflate.limit(data.status.content_size as u64);
            }
            if !leftover_used && !leftover.is_empty() {
                if inflate.push(&leftover).is_err() {
                    return Err(State::Http(HttpState::UnknownError));
                }
                leftover_used = true;
            }
            data.current = Current::Filter(inflate);
            data.status.bseeked = false;
        }
        if !leftover_used && !leftover.is_empty() {
            data.cache_data.extend_from_slice(&leftover);
        }
        // status.state keeps the class parsed from the status line, so a
        // non-followed redirect or a 204 is visible to the caller
        let alive = data.status.balived;
        data.sstream.set_keep_alive(alive);
        Ok(data.status.clone())
    })();
    match installed {
        Ok(status) => {
            this.state.store(OPENED, Ordering::SeqCst);
            trace!(code = status.code, "opened");
            func(State::Ok, status);
        }
        Err(state) => open_failed(this, state, func),
    }
}

/// Close whatever is half-open and deliver the failure; the status carries
/// the terminal cause before the callback sees it.
fn open_failed(this: Arc<ClientInner>, state: State, func: OpenCb) {
    debug!(%state, "open failed");
    let (sstream, transfer) = {
        let mut data = lock(&this.data);
        (data.sstream.clone(), data.transfer.take())
    };
    if let Some(transfer) = transfer {
        transfer.dispose();
    }
    let again = this.clone();
    sstream.clos(move |_| {
        let status = {
            let mut data = lock(&again.data);
            data.current = Current::Sock;
            data.content_read = 0;
            data.status.state = state;
            data.status.clone()
        };
        again.state.store(CLOSED, Ordering::SeqCst);
        func(state, status);
    });
}

fn client_read<F>(this: Arc<ClientInner>, delay: u64, size: usize, mut func: F) -> bool
where
    F: FnMut(State, Bytes) -> bool + Send + 'static,
{
    let size = if size == 0 { DEFAULT_READ } else { size };
    let (current, sstream) = {
        let data = lock(&this.data);
        (data.current.clone(), data.sstream.clone())
    };
    let again = this.clone();
    let wrapped = move |state: State, payload: Bytes| -> bool {
        if again.state.load(Ordering::SeqCst) == KILLING {
            func(State::Killed, Bytes::new());
            return false;
        }
        match state {
            State::Ok => {
                let done = {
                    let mut data = lock(&again.data);
                    data.content_read += payload.len() as u64;
                    // filters mark their own end of body
                    matches!(data.current, Current::Sock)
                        && data.status.content_size >= 0
                        && data.content_read >= data.status.content_size as u64
                };
                let more = func(State::Ok, payload);
                if more && done {
                    func(State::Closed, Bytes::new());
                    return false;
                }
                more
            }
            other => {
                func(other, Bytes::new());
                false
            }
        }
    };
    match current {
        Current::Sock => sstream.read_after(delay, size, wrapped),
        Current::Filter(chain) => {
            if delay > 0 {
                let mut deferred = Some((chain, wrapped));
                this.aicp.timer().post(delay, false, move |killed| {
                    if let Some((chain, wrapped)) = deferred.take() {
                        if !killed {
                            chain.read(size, wrapped);
                        }
                    }
                });
                true
            } else {
                chain.read(size, wrapped)
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .finish()
    }
}
