//! The public entry point: a background event loop plus the operations used
//! to add and remove ports on it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use socket2::{Domain, Socket, Type};
use tracing::{event, Level};

use crate::address::Address;
use crate::buffer::{BufferPool, DefaultBufferPool, DefaultPacketPool, PacketPool};
use crate::collaborators::{ConnAcceptor, ConnNotifier, PacketWriter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::port::tcp_connection::TcpConnectionState;
use crate::port::tcp_listener::{self, TcpListenerHandle, TcpListenerState};
use crate::port::udp_receiver::{UdpReceiver, UdpReceiverState};
use crate::port::udp_sender::{UdpSender, UdpSenderState};
use crate::port::PortId;
use crate::reactor::{call, LoopHandle, PortSlot, ReactorInit};

fn bind_udp_dual_stack(addr: SocketAddr) -> Result<mio::net::UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, None).map_err(Error::Io)?;

    if addr.is_ipv6() {
        if let Err(err) = socket.set_only_v6(false) {
            if err.kind() != std::io::ErrorKind::Unsupported {
                event!(Level::DEBUG, error = %err, "could not clear IPV6_ONLY; keeping default");
            }
        }
    }

    // Deliberately no `SO_REUSEADDR`: this implementation treats binding an
    // address that is already bound as an error (`udp_bind_addrinuse`), and
    // enabling it risks silently letting two receivers share one port on
    // some platforms instead.
    socket.set_nonblocking(true).map_err(Error::Io)?;
    socket
        .bind(&addr.into())
        .map_err(|err| Error::from_bind_failure(err, Address::from_socket_addr(addr)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(mio::net::UdpSocket::from_std(std_socket))
}

/// A network transport core: one background event loop thread multiplexing
/// UDP and TCP ports, and a thread-safe handle used to manage them.
///
/// Dropping a `Transceiver` asks the loop thread to close every remaining
/// port and stop, then blocks until it has actually exited — the same
/// "ask, then join" shutdown shape used for the worker threads elsewhere in
/// this codebase, just without a Windows completion port underneath it.
pub struct Transceiver {
    handle: LoopHandle,
    config: Config,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Transceiver {
    pub fn new(config: Config) -> Result<Self> {
        let (init, handle) = ReactorInit::new(config.clone())?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("transceiver-loop".into())
            .spawn(move || {
                let mut reactor = init.into_reactor();

                #[cfg(feature = "core-pinning")]
                if let Some(core_index) = reactor.config().pin_to_core {
                    if let Some(core_ids) = core_affinity::get_core_ids() {
                        if let Some(core_id) = core_ids.get(core_index) {
                            core_affinity::set_for_current(*core_id);
                        } else {
                            event!(Level::WARN, core_index, "requested core index out of range");
                        }
                    }
                }

                reactor.run(|| thread_stop.load(Ordering::Acquire));
            })
            .map_err(|err| Error::LoopInit(std::io::Error::new(std::io::ErrorKind::Other, err)))?;

        Ok(Self {
            handle,
            config,
            stop,
            thread: Some(thread),
        })
    }

    /// The number of ports currently open. Ports that have self-closed (e.g.
    /// a TCP peer hanging up) are evicted by the reactor as part of
    /// dispatching their last event, so this is equivalent to counting
    /// `open_ports` in the spec's two-list model.
    pub fn num_ports(&self) -> Result<usize> {
        use crate::port::Port;

        call(&self.handle, |reactor, reply| {
            let count = reactor
                .ports
                .iter()
                .filter(|(_, slot)| match &*slot.borrow() {
                    PortSlot::UdpReceiver(s) => s.is_open(),
                    PortSlot::UdpSender(s) => s.is_open(),
                    PortSlot::TcpListener(s) => s.is_open(),
                    PortSlot::TcpConnection(s) => s.is_open(),
                })
                .count();
            let _ = reply.send(Ok(count));
        })
    }

    /// Binds a UDP socket and starts delivering received datagrams to
    /// `writer`, using `pool` to obtain buffers (or a default pool sized to
    /// [`Config::max_udp_packet_size`] if `pool` is `None`).
    pub fn add_udp_receiver(
        &self,
        addr: Address,
        writer: Arc<dyn PacketWriter>,
        pool: Option<Arc<dyn PacketPool>>,
    ) -> Result<UdpReceiver> {
        let pool = pool.unwrap_or_else(|| Arc::new(DefaultPacketPool::new(self.config.max_udp_packet_size)));
        let socket = bind_udp_dual_stack(addr.to_socket_addr())?;
        let local = socket
            .local_addr()
            .map(Address::from_socket_addr)
            .unwrap_or(addr);

        let handle = self.handle.clone();
        let id = call(&self.handle, move |reactor, reply| {
            let state = UdpReceiverState::new(PortId::default(), socket, local, writer, pool);
            let key = reactor.ports.insert(PortSlot::UdpReceiver(state));
            let id = PortId::from_slab_key(key);

            let result = (|| -> Result<()> {
                let rc = reactor.ports.get(key).expect("just inserted");
                let mut slot = rc.borrow_mut();
                let PortSlot::UdpReceiver(state) = &mut *slot else {
                    unreachable!()
                };
                state.set_id(id);
                reactor.register_readable(state.socket_mut(), id)
            })();

            let _ = reply.send(result.map(|_| id));
        })?;

        Ok(UdpReceiver { id, local, handle })
    }

    /// Binds a UDP socket usable to send datagrams to arbitrary destinations.
    pub fn add_udp_sender(&self, addr: Address) -> Result<UdpSender> {
        let socket = bind_udp_dual_stack(addr.to_socket_addr())?;
        let local = socket
            .local_addr()
            .map(Address::from_socket_addr)
            .unwrap_or(addr);

        let handle = self.handle.clone();
        let id = call(&self.handle, move |reactor, reply| {
            let state = UdpSenderState::new(PortId::default(), socket, local);
            let key = reactor.ports.insert(PortSlot::UdpSender(state));
            let id = PortId::from_slab_key(key);

            let result = (|| -> Result<()> {
                let rc = reactor.ports.get(key).expect("just inserted");
                let mut slot = rc.borrow_mut();
                let PortSlot::UdpSender(state) = &mut *slot else {
                    unreachable!()
                };
                state.set_id(id);
                reactor.reregister_readable_writable(state.socket_mut(), id)
            })();

            let _ = reply.send(result.map(|_| id));
        })?;

        Ok(UdpSender { id, local, handle })
    }

    /// Binds and starts listening on a TCP socket, handing accepted
    /// connections to `acceptor`.
    pub fn add_tcp_server(
        &self,
        addr: Address,
        acceptor: Arc<dyn ConnAcceptor>,
        read_pool: Option<Arc<dyn BufferPool>>,
    ) -> Result<TcpListenerHandle> {
        let read_pool =
            read_pool.unwrap_or_else(|| Arc::new(DefaultBufferPool::new(self.config.tcp_read_chunk_size)));
        let backlog = self.config.tcp_backlog;
        let listener = tcp_listener::bind_dual_stack(addr.to_socket_addr(), backlog)?;
        let local = listener
            .local_addr()
            .map(Address::from_socket_addr)
            .unwrap_or(addr);

        let handle = self.handle.clone();
        let id = call(&self.handle, move |reactor, reply| {
            let state = TcpListenerState::new(PortId::default(), listener, local, acceptor, read_pool);
            let key = reactor.ports.insert(PortSlot::TcpListener(state));
            let id = PortId::from_slab_key(key);

            let result = (|| -> Result<()> {
                let rc = reactor.ports.get(key).expect("just inserted");
                let mut slot = rc.borrow_mut();
                let PortSlot::TcpListener(state) = &mut *slot else {
                    unreachable!()
                };
                state.set_id(id);
                reactor.register_readable(state.listener_mut(), id)
            })();

            let _ = reply.send(result.map(|_| id));
        })?;

        Ok(TcpListenerHandle { id, local, handle })
    }

    /// Starts an outbound TCP connection. The connect result (success or
    /// failure) is reported exactly once, asynchronously, via
    /// `notifier.connected`; this call itself only reports whether the
    /// connection attempt could be started.
    pub fn add_tcp_client(
        &self,
        remote: Address,
        notifier: Arc<dyn ConnNotifier>,
        read_pool: Option<Arc<dyn BufferPool>>,
    ) -> Result<crate::port::tcp_connection::TcpConnection> {
        let read_pool =
            read_pool.unwrap_or_else(|| Arc::new(DefaultBufferPool::new(self.config.tcp_read_chunk_size)));
        let stream = mio::net::TcpStream::connect(remote.to_socket_addr()).map_err(Error::Io)?;
        let local = stream
            .local_addr()
            .map(Address::from_socket_addr)
            .unwrap_or(remote);

        let handle = self.handle.clone();
        let inner_handle = handle.clone();
        let (id, inbound, connect_status) = call(&self.handle, move |reactor, reply| {
            let state =
                TcpConnectionState::connecting(PortId::default(), stream, local, remote, read_pool, notifier);
            let key = reactor.ports.insert(PortSlot::TcpConnection(state));
            let id = PortId::from_slab_key(key);

            let result = (|| -> Result<(
                Arc<crossbeam::queue::SegQueue<crate::buffer::RcBuffer>>,
                Arc<std::sync::atomic::AtomicU8>,
            )> {
                let rc = reactor.ports.get(key).expect("just inserted");
                let mut slot = rc.borrow_mut();
                let PortSlot::TcpConnection(state) = &mut *slot else {
                    unreachable!()
                };
                state.set_id(id);
                reactor.reregister_readable_writable(state.stream_mut(), id)?;
                Ok((state.inbound_queue(), state.connect_status_handle()))
            })();

            let _ = reply.send(result.map(|(inbound, connect_status)| (id, inbound, connect_status)));
        })?;

        Ok(crate::port::tcp_connection::TcpConnection {
            id,
            local,
            remote,
            handle: inner_handle,
            inbound,
            connect_status,
        })
    }

    /// Removes a port, waiting for its close to complete. A no-op if the
    /// port does not exist. If the port is already `Closing`, this still
    /// waits for the close rather than erroring.
    pub fn remove_port(&self, id: PortId) -> Result<()> {
        use crate::port::Port;

        call(&self.handle, move |reactor, reply| {
            if let Some(rc) = reactor.ports.get(id.slab_key()) {
                let is_listener = matches!(&*rc.borrow(), PortSlot::TcpListener(_));
                if is_listener {
                    if let PortSlot::TcpListener(s) = &mut *rc.borrow_mut() {
                        s.close_with_children(reactor);
                    }
                } else {
                    match &mut *rc.borrow_mut() {
                        PortSlot::UdpReceiver(s) => s.async_close(),
                        PortSlot::UdpSender(s) => s.async_close(),
                        PortSlot::TcpListener(_) => unreachable!(),
                        PortSlot::TcpConnection(s) => s.async_close(),
                    }
                }
                reactor.remove(id.slab_key());
            }
            let _ = reply.send(Ok(()));
        })
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        // Close every remaining port before the loop thread stops, so
        // collaborators still see an orderly teardown instead of sockets
        // disappearing out from under them.
        let _ = call::<()>(&self.handle, |reactor, reply| {
            use crate::port::Port;

            let keys: Vec<_> = reactor.ports.iter().map(|(key, _)| key).collect();
            for key in keys {
                // A listener's children may already be in `keys` (iteration
                // order is insertion order, listeners are inserted before
                // anything they accept) — closing the listener first, via
                // `close_with_children`, evicts them early, and the
                // subsequent `reactor.remove` for their own key below is then
                // simply a no-op.
                if let Some(rc) = reactor.ports.get(key) {
                    let is_listener = matches!(&*rc.borrow(), PortSlot::TcpListener(_));
                    if is_listener {
                        if let PortSlot::TcpListener(s) = &mut *rc.borrow_mut() {
                            s.close_with_children(reactor);
                        }
                    } else {
                        match &mut *rc.borrow_mut() {
                            PortSlot::UdpReceiver(s) => s.async_close(),
                            PortSlot::UdpSender(s) => s.async_close(),
                            PortSlot::TcpListener(_) => unreachable!(),
                            PortSlot::TcpConnection(s) => s.async_close(),
                        }
                    }
                }
                reactor.remove(key);
            }
            let _ = reply.send(Ok(()));
        });

        self.stop.store(true, Ordering::Release);
        // Submitting always wakes the poller, so the loop observes `stop`
        // on its very next iteration instead of waiting out a poll timeout.
        let _ = self.handle.submit(Box::new(|_reactor| {}));

        if let Some(thread) = self.thread.take() {
            if let Err(panic) = thread.join() {
                event!(Level::ERROR, ?panic, "transceiver event loop thread panicked");
            }
        }
    }
}
