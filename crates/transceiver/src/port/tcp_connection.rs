//! A single TCP byte stream, either accepted by a [`super::tcp_listener`] or
//! opened by [`crate::Transceiver::add_tcp_client`].
//!
//! Mirrors the state machine of the connection object this design is built
//! on: a connection starts `Opened`, becomes either `Accepted` (it arrived
//! through a listener, and is connected by construction) or `Connecting` (it
//! is dialing out, and the connect result arrives asynchronously), settles
//! into `Connected`, and eventually `Closing` then `Closed`. A failed
//! outbound connect goes to `Error` instead of `Connected`.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tracing::{event, Level};

use crate::address::Address;
use crate::buffer::{BufferPool, RcBuffer};
use crate::collaborators::ConnNotifier;
use crate::error::{Error, Result};
use crate::port::{Port, PortId, PortKind, PortState};
use crate::util::once_event::OnceEvent;

/// The outcome of an outbound connect attempt, reported at most once via
/// [`ConnNotifier::notify_connected`]. Ordered so that `None < Connected` and
/// `None < Error`: it only ever moves forward, never back to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectStatus {
    None,
    Connected,
    Error,
}

const STATUS_NONE: u8 = 0;
const STATUS_CONNECTED: u8 = 1;
const STATUS_ERROR: u8 = 2;

impl ConnectStatus {
    fn to_u8(self) -> u8 {
        match self {
            ConnectStatus::None => STATUS_NONE,
            ConnectStatus::Connected => STATUS_CONNECTED,
            ConnectStatus::Error => STATUS_ERROR,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            STATUS_CONNECTED => ConnectStatus::Connected,
            STATUS_ERROR => ConnectStatus::Error,
            _ => ConnectStatus::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Opened,
    Accepted,
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
}

pub(crate) struct TcpConnectionState {
    id: PortId,
    stream: mio::net::TcpStream,
    local: Address,
    remote: Address,
    state: ConnState,
    connect_status: ConnectStatus,
    /// Mirrors `connect_status`, shared with the [`TcpConnection`] handle so
    /// `connected()` is a lock-free snapshot read from any thread, bypassing
    /// the task queue the way the spec's own `connected()`/`read()`/
    /// `address()` exemptions do.
    connect_status_shared: Arc<AtomicU8>,
    notifier: Option<Arc<dyn ConnNotifier>>,
    notify_connected_once: OnceEvent,
    notify_closed_once: OnceEvent,
    read_pool: Arc<dyn BufferPool>,
    inbound: Arc<SegQueue<RcBuffer>>,
    outbound: VecDeque<u8>,
}

impl TcpConnectionState {
    /// Wraps a stream already connected by `accept()`.
    pub(crate) fn accepted(
        id: PortId,
        stream: mio::net::TcpStream,
        local: Address,
        remote: Address,
        read_pool: Arc<dyn BufferPool>,
    ) -> Self {
        Self {
            id,
            stream,
            local,
            remote,
            state: ConnState::Accepted,
            connect_status: ConnectStatus::None,
            connect_status_shared: Arc::new(AtomicU8::new(STATUS_NONE)),
            notifier: None,
            notify_connected_once: OnceEvent::new(),
            notify_closed_once: OnceEvent::new(),
            read_pool,
            inbound: Arc::new(SegQueue::new()),
            outbound: VecDeque::new(),
        }
    }

    /// Wraps a stream returned by a non-blocking `connect()`, whose result
    /// resolves later on the first writable readiness event.
    pub(crate) fn connecting(
        id: PortId,
        stream: mio::net::TcpStream,
        local: Address,
        remote: Address,
        read_pool: Arc<dyn BufferPool>,
        notifier: Arc<dyn ConnNotifier>,
    ) -> Self {
        Self {
            id,
            stream,
            local,
            remote,
            state: ConnState::Connecting,
            connect_status: ConnectStatus::None,
            connect_status_shared: Arc::new(AtomicU8::new(STATUS_NONE)),
            notifier: Some(notifier),
            notify_connected_once: OnceEvent::new(),
            notify_closed_once: OnceEvent::new(),
            read_pool,
            inbound: Arc::new(SegQueue::new()),
            outbound: VecDeque::new(),
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }

    /// Slab insertion assigns the real [`PortId`] only after construction;
    /// callers patch it in immediately afterwards.
    pub(crate) fn set_id(&mut self, id: PortId) {
        self.id = id;
    }

    pub(crate) fn inbound_queue(&self) -> Arc<SegQueue<RcBuffer>> {
        Arc::clone(&self.inbound)
    }

    pub(crate) fn connect_status(&self) -> ConnectStatus {
        self.connect_status
    }

    /// A clone of the atomic backing [`TcpConnection::connected`] — handed to
    /// the public handle at construction so it can read the connect status
    /// without going through the loop thread.
    pub(crate) fn connect_status_handle(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.connect_status_shared)
    }

    pub(crate) fn remote_address(&self) -> Address {
        self.remote
    }

    /// Attaches the notifier an acceptor handed back from
    /// [`crate::ConnAcceptor::accept`], and delivers the one-shot
    /// `notify_connected` an accepted connection owes (it is connected by
    /// construction, so there is no async connect to wait on).
    pub(crate) fn set_notifier(&mut self, notifier: Arc<dyn ConnNotifier>) {
        self.notifier = Some(notifier);
        if self.connect_status == ConnectStatus::None {
            self.connect_status = ConnectStatus::Connected;
            self.connect_status_shared
                .store(ConnectStatus::Connected.to_u8(), Ordering::Release);
        }
        self.notify_connected(Ok(()));
    }

    fn notify_connected(&mut self, result: Result<()>) {
        let notifier = self.notifier.clone();
        self.notify_connected_once.fire_once(|| {
            if let Some(notifier) = notifier {
                notifier.notify_connected(result);
            }
        });
    }

    fn notify_readable(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.notify_readable();
        }
    }

    fn notify_writable(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.notify_writable();
        }
    }

    fn notify_closed(&mut self) {
        let notifier = self.notifier.clone();
        self.notify_closed_once.fire_once(|| {
            if let Some(notifier) = notifier {
                notifier.closed();
            }
        });
    }

    pub(crate) fn on_readable(&mut self, _id: PortId) {
        if !matches!(self.state, ConnState::Connected | ConnState::Accepted) {
            return;
        }
        // An accepted connection is connected by construction; normalize to
        // `Connected` the first time we actually touch the stream.
        self.state = ConnState::Connected;

        loop {
            let mut buf = self.read_pool.acquire();
            match self.stream.read(buf.as_mut_slice()) {
                Ok(0) => {
                    self.begin_close();
                    break;
                }
                Ok(n) => {
                    self.inbound.push(buf.freeze(n));
                    self.notify_readable();
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    event!(Level::WARN, port = %self.id, error = %err, "tcp read failed");
                    self.fail(err);
                    break;
                }
            }
        }
    }

    pub(crate) fn on_writable(&mut self, _id: PortId) {
        match self.state {
            ConnState::Connecting => match self.stream.take_error() {
                Ok(None) => {
                    self.state = ConnState::Connected;
                    self.connect_status = ConnectStatus::Connected;
                    self.connect_status_shared
                        .store(ConnectStatus::Connected.to_u8(), Ordering::Release);
                    self.notify_connected(Ok(()));
                }
                Ok(Some(err)) => {
                    self.state = ConnState::Error;
                    self.connect_status = ConnectStatus::Error;
                    self.connect_status_shared
                        .store(ConnectStatus::Error.to_u8(), Ordering::Release);
                    self.notify_connected(Err(Error::Io(err)));
                }
                Err(err) => {
                    self.state = ConnState::Error;
                    self.connect_status = ConnectStatus::Error;
                    self.connect_status_shared
                        .store(ConnectStatus::Error.to_u8(), Ordering::Release);
                    self.notify_connected(Err(Error::Io(err)));
                }
            },
            ConnState::Connected => self.flush_outbound(),
            _ => {}
        }
    }

    fn flush_outbound(&mut self) {
        while !self.outbound.is_empty() {
            let chunk: Vec<u8> = self.outbound.iter().copied().collect();
            match self.stream.write(&chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.outbound.drain(..n);
                    self.notify_writable();
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    event!(Level::WARN, port = %self.id, error = %err, "tcp write failed");
                    self.fail(err);
                    break;
                }
            }
        }
    }

    /// Enqueues `data` for sending. Per this implementation's write policy, a
    /// failed write fails the connection outright rather than being retried.
    /// Fails with [`Error::PortClosed`] if the connection is not in a state
    /// that accepts writes (closing, closed, or erroring out).
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.state != ConnState::Connected && self.state != ConnState::Accepted {
            return Err(Error::PortClosed);
        }
        self.outbound.extend(data.iter().copied());
        self.flush_outbound();
        Ok(())
    }

    fn fail(&mut self, err: std::io::Error) {
        self.state = ConnState::Error;
        if self.connect_status == ConnectStatus::None {
            self.connect_status = ConnectStatus::Error;
            self.connect_status_shared
                .store(ConnectStatus::Error.to_u8(), Ordering::Release);
            self.notify_connected(Err(Error::Io(err)));
        }
        self.notify_closed();
    }

    fn begin_close(&mut self) {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return;
        }
        self.state = ConnState::Closing;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.state = ConnState::Closed;
        self.notify_closed();
    }
}

impl Port for TcpConnectionState {
    fn id(&self) -> PortId {
        self.id
    }

    fn kind(&self) -> PortKind {
        PortKind::TcpConnection
    }

    fn bind_address(&self) -> Address {
        self.local
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnState::Opened | ConnState::Accepted | ConnState::Connecting | ConnState::Connected
        )
    }

    fn async_close(&mut self) {
        self.begin_close();
    }
}

impl std::fmt::Debug for TcpConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnectionState")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("remote", &self.remote)
            .finish()
    }
}

/// The thread-safe handle to a TCP connection, returned by
/// [`crate::Transceiver::add_tcp_client`] and handed to a
/// [`crate::ConnAcceptor`] on accept.
#[derive(Clone)]
pub struct TcpConnection {
    pub(crate) id: PortId,
    pub(crate) local: Address,
    pub(crate) remote: Address,
    pub(crate) handle: crate::reactor::LoopHandle,
    pub(crate) inbound: Arc<SegQueue<RcBuffer>>,
    pub(crate) connect_status: Arc<AtomicU8>,
}

impl TcpConnection {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn remote_address(&self) -> Address {
        self.remote
    }

    /// Pops the oldest chunk of bytes received so far, if any. Non-blocking.
    pub fn try_read(&self) -> Option<RcBuffer> {
        self.inbound.pop()
    }

    /// Whether the connection has completed its connect handshake
    /// successfully. Callable from any thread without going through the loop
    /// thread's task queue, same as [`TcpConnection::try_read`],
    /// [`TcpConnection::local_address`], and [`TcpConnection::remote_address`].
    pub fn connected(&self) -> bool {
        ConnectStatus::from_u8(self.connect_status.load(Ordering::Acquire)) == ConnectStatus::Connected
    }

    /// Queues `data` to be written. See the write-failure note on the
    /// internal state: a failing write fails the connection rather than
    /// retrying. Fails with [`Error::PortClosed`] if the connection has
    /// already transitioned out of `Connected`/`Accepted` by the time the
    /// loop thread processes this task — tasks enqueued against a closing
    /// or closed connection do not silently succeed.
    pub fn write(&self, data: Vec<u8>) -> Result<()> {
        let id = self.id;
        crate::reactor::call(&self.handle, move |reactor, reply| {
            let result = match reactor.ports.get(id.slab_key()) {
                Some(rc) => match &mut *rc.borrow_mut() {
                    crate::reactor::PortSlot::TcpConnection(state) => state.write(&data),
                    _ => Err(Error::PortClosed),
                },
                None => Err(Error::PortClosed),
            };
            let _ = reply.send(result);
        })
    }

    pub fn async_close(&self) -> Result<()> {
        let id = self.id;
        self.handle.submit(Box::new(move |reactor| {
            if let Some(rc) = reactor.ports.get(id.slab_key()) {
                if let crate::reactor::PortSlot::TcpConnection(state) = &mut *rc.borrow_mut() {
                    state.async_close();
                }
            }
        }))
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_status_is_ordered_none_below_settled() {
        assert!(ConnectStatus::None < ConnectStatus::Connected);
        assert!(ConnectStatus::None < ConnectStatus::Error);
    }
}
