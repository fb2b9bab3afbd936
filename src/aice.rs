//! The typed I/O request/event record.
//!
//! An [`Aice`] is one posted operation plus its eventual result: the op
//! discriminant and payload live in [`AiceOp`], the outcome in
//! [`Aice::state`]. Buffers are owned: a receive allocates into a
//! `BytesMut` handed back through the completed record, a send consumes a
//! `Bytes`, so nothing borrowed crosses a suspension.

use std::fs::File;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use crate::aico::Aico;
use crate::state::State;

/// The operation discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiceCode {
    /// Accept a client on a listening socket.
    Acpt,
    /// Connect a TCP socket.
    Conn,
    /// Receive on a TCP socket.
    Recv,
    /// Send on a TCP socket.
    Send,
    /// Receive a UDP datagram, filling the peer address.
    Urecv,
    /// Send a UDP datagram to a peer address.
    Usend,
    /// Scatter-receive on a TCP socket.
    Recvv,
    /// Gather-send on a TCP socket.
    Sendv,
    /// Scatter-receive a UDP datagram.
    Urecvv,
    /// Gather-send a UDP datagram.
    Usendv,
    /// Copy file bytes to a socket.
    Sendf,
    /// Read a file at an explicit offset.
    Read,
    /// Write a file at an explicit offset.
    Writ,
    /// Scatter-read a file at an explicit offset.
    Readv,
    /// Gather-write a file at an explicit offset.
    Writv,
    /// Flush file data.
    Fsync,
    /// Run a bare callback, optionally after a delay.
    Runtask,
    /// Close the handle.
    Clos,
}

/// The op payload: inputs when posted, out-fields when completed.
#[derive(Debug)]
pub enum AiceOp {
    /// Accept: carries the newly registered client handle and peer address
    /// on completion.
    Acpt {
        /// The accepted client handle.
        aico: Option<Aico>,
        /// The client's address.
        addr: Option<SocketAddr>,
    },
    /// Connect to the given address.
    Conn {
        /// The peer address.
        addr: SocketAddr,
    },
    /// Receive up to the buffer's capacity.
    Recv {
        /// The receive buffer, filled up to `real`.
        data: BytesMut,
        /// Bytes actually received.
        real: usize,
    },
    /// Send the buffer.
    Send {
        /// The bytes to send.
        data: Bytes,
        /// Bytes actually sent.
        real: usize,
    },
    /// Receive one datagram.
    Urecv {
        /// The receive buffer, filled up to `real`.
        data: BytesMut,
        /// Bytes actually received.
        real: usize,
        /// The datagram's peer address.
        addr: Option<SocketAddr>,
    },
    /// Send one datagram to `addr`.
    Usend {
        /// The peer address.
        addr: SocketAddr,
        /// The bytes to send.
        data: Bytes,
        /// Bytes actually sent.
        real: usize,
    },
    /// Scatter-receive into the buffer list.
    Recvv {
        /// The buffers, filled in order up to `real` total bytes.
        list: Vec<BytesMut>,
        /// Bytes actually received.
        real: usize,
    },
    /// Gather-send the buffer list.
    Sendv {
        /// The buffers to send in order.
        list: Vec<Bytes>,
        /// Bytes actually sent.
        real: usize,
    },
    /// Scatter-receive one datagram.
    Urecvv {
        /// The buffers, filled in order up to `real` total bytes.
        list: Vec<BytesMut>,
        /// Bytes actually received.
        real: usize,
        /// The datagram's peer address.
        addr: Option<SocketAddr>,
    },
    /// Gather-send one datagram to `addr`.
    Usendv {
        /// The peer address.
        addr: SocketAddr,
        /// The buffers sent as a single datagram.
        list: Vec<Bytes>,
        /// Bytes actually sent.
        real: usize,
    },
    /// Copy `size` file bytes starting at `seek` to the socket; `size` of
    /// zero means until end of file.
    Sendf {
        /// The source file.
        file: File,
        /// Starting offset.
        seek: u64,
        /// Byte budget, zero for until-EOF.
        size: u64,
        /// Bytes actually copied.
        real: u64,
    },
    /// Read the file at `seek`.
    Read {
        /// Starting offset.
        seek: u64,
        /// The read buffer, filled up to `real`.
        data: BytesMut,
        /// Bytes actually read.
        real: usize,
    },
    /// Write the file at `seek`.
    Writ {
        /// Starting offset.
        seek: u64,
        /// The bytes to write.
        data: Bytes,
        /// Bytes actually written.
        real: usize,
    },
    /// Scatter-read the file at `seek`.
    Readv {
        /// Starting offset.
        seek: u64,
        /// The buffers, filled in order.
        list: Vec<BytesMut>,
        /// Bytes actually read.
        real: usize,
    },
    /// Gather-write the file at `seek`.
    Writv {
        /// Starting offset.
        seek: u64,
        /// The buffers written in order.
        list: Vec<Bytes>,
        /// Bytes actually written.
        real: usize,
    },
    /// Flush file data and metadata.
    Fsync,
    /// Fire a callback after `delay` milliseconds.
    Runtask {
        /// Absolute due time on the runtime clock.
        when: u64,
        /// The requested delay.
        delay: u64,
    },
    /// Close the handle's resource.
    Clos,
}

impl AiceOp {
    /// The discriminant for this payload.
    pub fn code(&self) -> AiceCode {
        match *self {
            AiceOp::Acpt { .. } => AiceCode::Acpt,
            AiceOp::Conn { .. } => AiceCode::Conn,
            AiceOp::Recv { .. } => AiceCode::Recv,
            AiceOp::Send { .. } => AiceCode::Send,
            AiceOp::Urecv { .. } => AiceCode::Urecv,
            AiceOp::Usend { .. } => AiceCode::Usend,
            AiceOp::Recvv { .. } => AiceCode::Recvv,
            AiceOp::Sendv { .. } => AiceCode::Sendv,
            AiceOp::Urecvv { .. } => AiceCode::Urecvv,
            AiceOp::Usendv { .. } => AiceCode::Usendv,
            AiceOp::Sendf { .. } => AiceCode::Sendf,
            AiceOp::Read { .. } => AiceCode::Read,
            AiceOp::Writ { .. } => AiceCode::Writ,
            AiceOp::Readv { .. } => AiceCode::Readv,
            AiceOp::Writv { .. } => AiceCode::Writv,
            AiceOp::Fsync => AiceCode::Fsync,
            AiceOp::Runtask { .. } => AiceCode::Runtask,
            AiceOp::Clos => AiceCode::Clos,
        }
    }

    /// Whether this op completes through the send direction of a socket.
    pub(crate) fn is_send_dir(&self) -> bool {
        matches!(
            self.code(),
            AiceCode::Conn
                | AiceCode::Send
                | AiceCode::Usend
                | AiceCode::Sendv
                | AiceCode::Usendv
                | AiceCode::Sendf
        )
    }
}

/// One posted op plus its result, handed to the callback at completion.
#[derive(Debug)]
pub struct Aice {
    /// The terminal state.
    pub state: State,
    /// The handle the op was posted on.
    pub aico: Aico,
    /// The op payload with its out-fields filled.
    pub op: AiceOp,
}

impl Aice {
    pub(crate) fn new(aico: Aico, op: AiceOp) -> Aice {
        Aice {
            state: State::Pending,
            aico,
            op,
        }
    }

    /// The op discriminant.
    pub fn code(&self) -> AiceCode {
        self.op.code()
    }

    /// Bytes actually moved, for the data-carrying ops.
    pub fn real(&self) -> usize {
        match self.op {
            AiceOp::Recv { real, .. }
            | AiceOp::Send { real, .. }
            | AiceOp::Urecv { real, .. }
            | AiceOp::Usend { real, .. }
            | AiceOp::Recvv { real, .. }
            | AiceOp::Sendv { real, .. }
            | AiceOp::Urecvv { real, .. }
            | AiceOp::Usendv { real, .. }
            | AiceOp::Read { real, .. }
            | AiceOp::Writ { real, .. }
            | AiceOp::Readv { real, .. }
            | AiceOp::Writv { real, .. } => real,
            AiceOp::Sendf { real, .. } => real as usize,
            _ => 0,
        }
    }

    /// The filled receive buffer, for `recv`/`urecv`/`read` completions.
    pub fn data(&self) -> Option<&BytesMut> {
        match self.op {
            AiceOp::Recv { ref data, .. }
            | AiceOp::Urecv { ref data, .. }
            | AiceOp::Read { ref data, .. } => Some(data),
            _ => None,
        }
    }

    /// Take the filled receive buffer out of the record.
    pub fn take_data(&mut self) -> Option<BytesMut> {
        match self.op {
            AiceOp::Recv { ref mut data, .. }
            | AiceOp::Urecv { ref mut data, .. }
            | AiceOp::Read { ref mut data, .. } => Some(std::mem::take(data)),
            _ => None,
        }
    }

    /// The peer address, for `urecv`/`urecvv`/`acpt` completions.
    pub fn peer(&self) -> Option<SocketAddr> {
        match self.op {
            AiceOp::Urecv { addr, .. }
            | AiceOp::Urecvv { addr, .. }
            | AiceOp::Acpt { addr, .. } => addr,
            _ => None,
        }
    }

    /// Take the accepted client handle out of an `acpt` completion.
    pub fn take_accepted(&mut self) -> Option<Aico> {
        match self.op {
            AiceOp::Acpt { ref mut aico, .. } => aico.take(),
            _ => None,
        }
    }
}

/// The completion callback: returning `false` is advisory and stops any
/// internal re-arming loops (e.g. a continuing accept), nothing else.
pub(crate) type AiceFunc = Box<dyn FnOnce(Aice) -> bool + Send>;
