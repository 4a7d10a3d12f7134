//! A bound, listening TCP socket that accepts inbound connections.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tracing::{event, Level};

use crate::address::Address;
use crate::buffer::BufferPool;
use crate::collaborators::ConnAcceptor;
use crate::error::{Error, Result};
use crate::port::tcp_connection::TcpConnectionState;
use crate::port::{Port, PortId, PortKind, PortState};
use crate::reactor::{PortSlot, Reactor};

pub(crate) struct TcpListenerState {
    id: PortId,
    listener: mio::net::TcpListener,
    local: Address,
    acceptor: Arc<dyn ConnAcceptor>,
    read_pool: Arc<dyn BufferPool>,
    state: PortState,
    /// Accepted children still registered with the reactor. Pruned lazily
    /// (on the next accept) rather than eagerly on every child close, since
    /// children close far more often than the listener itself does.
    children: Vec<PortId>,
}

/// Binds a listening socket for `addr`, retrying without `IPV6_ONLY` turned
/// on only when the kernel rejects it outright (some platforms don't support
/// toggling it at all, in which case the default — usually dual-stack — is
/// kept).
pub(crate) fn bind_dual_stack(addr: SocketAddr, backlog: u32) -> Result<mio::net::TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::Io)?;

    if addr.is_ipv6() {
        match socket.set_only_v6(false) {
            Ok(()) => {}
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc_einval) if libc_einval == 22 /* EINVAL */
                ) || err.kind() == std::io::ErrorKind::Unsupported =>
            {
                event!(Level::DEBUG, "platform does not support toggling IPV6_ONLY; keeping default");
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }

    socket.set_reuse_address(true).map_err(Error::Io)?;
    socket.set_nonblocking(true).map_err(Error::Io)?;
    socket
        .bind(&addr.into())
        .map_err(|err| Error::from_bind_failure(err, Address::from_socket_addr(addr)))?;
    socket.listen(backlog as i32).map_err(Error::Io)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(std_listener))
}

impl TcpListenerState {
    pub(crate) fn new(
        id: PortId,
        listener: mio::net::TcpListener,
        local: Address,
        acceptor: Arc<dyn ConnAcceptor>,
        read_pool: Arc<dyn BufferPool>,
    ) -> Self {
        Self {
            id,
            listener,
            local,
            acceptor,
            read_pool,
            state: PortState::Open,
            children: Vec::new(),
        }
    }

    pub(crate) fn listener_mut(&mut self) -> &mut mio::net::TcpListener {
        &mut self.listener
    }

    pub(crate) fn set_id(&mut self, id: PortId) {
        self.id = id;
    }

    /// Accepts every pending connection, consulting the acceptor and
    /// registering each accepted stream as a new port, until the kernel
    /// reports `WouldBlock`. A failure to open or register one candidate does
    /// not stop the listener from accepting the rest.
    pub(crate) fn on_readable(&mut self, reactor: &mut Reactor, _id: PortId) {
        if self.state != PortState::Open {
            return;
        }

        self.children.retain(|id| reactor.ports.contains(id.slab_key()));

        loop {
            match self.listener.accept() {
                Ok((stream, remote_addr)) => {
                    let remote = Address::from_socket_addr(remote_addr);
                    self.register_accepted(reactor, stream, remote);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    event!(Level::WARN, port = %self.id, error = %err, "tcp accept failed");
                    break;
                }
            }
        }
    }

    fn register_accepted(&mut self, reactor: &mut Reactor, stream: mio::net::TcpStream, remote: Address) {
        let local = stream
            .local_addr()
            .map(Address::from_socket_addr)
            .unwrap_or(self.local);

        let conn_state = TcpConnectionState::accepted(
            // placeholder id, patched via `set_id` once the slab assigns a real one
            PortId::default(),
            stream,
            local,
            remote,
            Arc::clone(&self.read_pool),
        );

        let key = reactor.ports.insert(PortSlot::TcpConnection(conn_state));
        let id = PortId::from_slab_key(key);

        let (inbound, connect_status) = if let Some(rc) = reactor.ports.get(key) {
            let mut slot = rc.borrow_mut();
            let PortSlot::TcpConnection(state) = &mut *slot else {
                return;
            };
            state.set_id(id);
            if let Err(err) = reactor.reregister_readable_writable(state.stream_mut(), id) {
                event!(Level::WARN, port = %id, error = %err, "failed to register accepted connection");
                drop(slot);
                reactor.remove(key);
                return;
            }
            (state.inbound_queue(), state.connect_status_handle())
        } else {
            return;
        };

        let conn = crate::port::tcp_connection::TcpConnection {
            id,
            local,
            remote,
            handle: reactor.loop_handle(),
            inbound,
            connect_status,
        };

        match self.acceptor.accept(conn) {
            Some(notifier) => {
                if let Some(rc) = reactor.ports.get(key) {
                    if let PortSlot::TcpConnection(state) = &mut *rc.borrow_mut() {
                        state.set_notifier(notifier);
                    }
                }
                self.children.push(id);
            }
            None => {
                if let Some(rc) = reactor.ports.get(key) {
                    if let PortSlot::TcpConnection(state) = &mut *rc.borrow_mut() {
                        state.async_close();
                    }
                }
                reactor.remove(key);
            }
        }
    }

    /// Closes every still-registered child connection and removes it from
    /// the reactor, then marks this listener closed. Mirrors the shared
    /// `async_close` pattern but additionally cascades to accepted
    /// connections, since the listener — not the reactor — owns their
    /// lifetime.
    pub(crate) fn close_with_children(&mut self, reactor: &mut Reactor) {
        if self.state == PortState::Closed {
            return;
        }
        self.state = PortState::Closing;
        for child in self.children.drain(..) {
            if let Some(rc) = reactor.ports.get(child.slab_key()) {
                if let PortSlot::TcpConnection(state) = &mut *rc.borrow_mut() {
                    state.async_close();
                }
                reactor.remove(child.slab_key());
            }
        }
        self.state = PortState::Closed;
    }
}

impl Port for TcpListenerState {
    fn id(&self) -> PortId {
        self.id
    }

    fn kind(&self) -> PortKind {
        PortKind::TcpListener
    }

    fn bind_address(&self) -> Address {
        self.local
    }

    fn is_open(&self) -> bool {
        self.state == PortState::Open
    }

    fn async_close(&mut self) {
        if self.state == PortState::Closed {
            return;
        }
        self.state = PortState::Closing;
        self.state = PortState::Closed;
    }
}

/// The thread-safe handle to a listening TCP server port.
#[derive(Clone)]
pub struct TcpListenerHandle {
    pub(crate) id: PortId,
    pub(crate) local: Address,
    pub(crate) handle: crate::reactor::LoopHandle,
}

impl TcpListenerHandle {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn bind_address(&self) -> Address {
        self.local
    }

    /// Closes this listener and every connection it has accepted, then
    /// removes it from the transceiver. Equivalent to
    /// [`crate::Transceiver::remove_port`] called with this listener's id.
    pub fn async_close(&self) -> Result<()> {
        let id = self.id;
        self.handle.submit(Box::new(move |reactor| {
            if let Some(rc) = reactor.ports.get(id.slab_key()) {
                if let PortSlot::TcpListener(state) = &mut *rc.borrow_mut() {
                    state.close_with_children(reactor);
                }
            }
            reactor.remove(id.slab_key());
        }))
    }
}
