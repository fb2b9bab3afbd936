//! The rustls-backed engine.
//!
//! `rustls::ClientConnection` is exactly the synchronous non-blocking shape
//! the bridge consumes: `read_tls`/`write_tls` exchange ciphertext through
//! any `io::Read`/`io::Write`, here the bridge's [`Bio`], and
//! `process_new_packets` advances the state machine.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::sync::Arc;

use tracing::debug;

use super::{Bio, EngineFactory, Progress, SslEngine, SslIo};
use crate::state::SslState;

/// A [`SslEngine`] over a rustls client connection.
pub struct RustlsEngine {
    conn: rustls::ClientConnection,
}

impl RustlsEngine {
    /// A client engine for `server_name` with the given configuration.
    pub fn new(config: Arc<rustls::ClientConfig>, server_name: &str) -> io::Result<RustlsEngine> {
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let conn = rustls::ClientConnection::new(config, name)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(RustlsEngine { conn })
    }

    /// An [`EngineFactory`] producing one engine per server name.
    pub fn factory(config: Arc<rustls::ClientConfig>) -> EngineFactory {
        Arc::new(move |server_name| {
            RustlsEngine::new(config.clone(), server_name)
                .map(|engine| Box::new(engine) as Box<dyn SslEngine>)
        })
    }

    /// Flush pending ciphertext into the BIO. Writing into the BIO never
    /// blocks, so this always drains completely.
    fn flush_tls(&mut self, bio: &mut Bio) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(bio)?;
        }
        Ok(())
    }

    /// Pull ciphertext from the BIO into the connection.
    ///
    /// `Ok(true)` made progress, `Ok(false)` would block.
    fn pump_tls(&mut self, bio: &mut Bio) -> io::Result<bool> {
        match self.conn.read_tls(bio) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tls transport closed",
            )),
            Ok(_) => {
                self.conn.process_new_packets().map_err(|err| {
                    debug!("tls packet error: {}", err);
                    io::Error::new(io::ErrorKind::InvalidData, err)
                })?;
                Ok(true)
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl SslEngine for RustlsEngine {
    fn open_try(&mut self, bio: &mut Bio) -> Progress {
        loop {
            if self.flush_tls(bio).is_err() {
                return Progress::Failed(SslState::Failed);
            }
            if !self.conn.is_handshaking() {
                return Progress::Ok;
            }
            match self.pump_tls(bio) {
                Ok(true) => continue,
                Ok(false) => return Progress::WantRead,
                Err(_) => return Progress::Failed(SslState::Failed),
            }
        }
    }

    fn read(&mut self, bio: &mut Bio, buf: &mut [u8]) -> SslIo {
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return SslIo::Closed,
                Ok(n) => return SslIo::Done(n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if self.flush_tls(bio).is_err() {
                        return SslIo::Failed(SslState::Failed);
                    }
                    match self.pump_tls(bio) {
                        Ok(true) => continue,
                        Ok(false) => return SslIo::WantRead,
                        Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                            return SslIo::Closed;
                        }
                        Err(_) => return SslIo::Failed(SslState::Failed),
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return SslIo::Closed;
                }
                Err(err) => {
                    debug!("tls read error: {}", err);
                    return SslIo::Failed(SslState::Failed);
                }
            }
        }
    }

    fn writ(&mut self, bio: &mut Bio, data: &[u8]) -> SslIo {
        let n = match self.conn.writer().write(data) {
            Ok(n) => n,
            Err(err) => {
                debug!("tls write error: {}", err);
                return SslIo::Failed(SslState::Failed);
            }
        };
        if self.flush_tls(bio).is_err() {
            return SslIo::Failed(SslState::Failed);
        }
        SslIo::Done(n)
    }

    fn clos_try(&mut self, bio: &mut Bio) -> Progress {
        self.conn.send_close_notify();
        if self.flush_tls(bio).is_err() {
            return Progress::Failed(SslState::Failed);
        }
        Progress::Ok
    }
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}
