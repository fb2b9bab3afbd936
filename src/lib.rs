//! # aicp
//!
//! A proactor-style asynchronous I/O completion runtime.
//!
//! Callers register *completion handles* ([`Aico`]) for sockets, files or
//! bare tasks on a shared engine ([`Aicp`]), then post typed I/O requests
//! ([`Aice`]) against them. Worker threads drive the OS readiness backend,
//! issue the actual I/O and invoke the request's callback with the filled
//! result and a terminal [`State`].
//!
//! On top of the core engine the crate ships:
//!
//! - an async stream pipeline ([`stream`]) with chunked-transfer and
//!   inflate filters,
//! - an async TLS bridge ([`ssl`]) that suspends and resumes a synchronous
//!   TLS engine across socket completions,
//! - an async HTTP/1 client ([`client`]) with keep-alive, redirects,
//!   chunked and gzip/deflate response bodies, ranges and POST streaming.
//!
//! The engine is explicitly multi-consumer: any number of threads may call
//! [`Aicp::run`], and posts are thread-safe. Per handle and direction at
//! most one request is in flight, so callbacks observe a single-threaded
//! view of their own handle while the pool stays parallel.
//!
//! # Optional features
//!
//! - `rustls`: provides [`ssl::RustlsEngine`], a [`ssl::SslEngine`]
//!   implementation backed by `rustls`.

pub use crate::aice::{Aice, AiceCode, AiceOp};
pub use crate::aico::{Aico, AicoKind, TimeoutKind};
pub use crate::error::{Error, Result};
pub use crate::proactor::Aicp;
pub use crate::state::{HttpState, SslState, State};

mod aice;
mod aico;
mod clock;
mod error;
mod proactor;
mod state;

pub mod client;
pub mod ssl;
pub mod stream;
pub mod timer;
