//! A bound UDP socket that delivers received datagrams to a collaborator.

use std::sync::Arc;

use tracing::{event, Level};

use crate::address::Address;
use crate::buffer::{Packet, PacketPool};
use crate::collaborators::PacketWriter;
use crate::error::Result;
use crate::port::{Port, PortId, PortKind, PortState};

pub(crate) struct UdpReceiverState {
    id: PortId,
    socket: mio::net::UdpSocket,
    local: Address,
    writer: Arc<dyn PacketWriter>,
    pool: Arc<dyn PacketPool>,
    state: PortState,
}

impl UdpReceiverState {
    pub(crate) fn new(
        id: PortId,
        socket: mio::net::UdpSocket,
        local: Address,
        writer: Arc<dyn PacketWriter>,
        pool: Arc<dyn PacketPool>,
    ) -> Self {
        Self {
            id,
            socket,
            local,
            writer,
            pool,
            state: PortState::Open,
        }
    }

    pub(crate) fn socket_mut(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.socket
    }

    pub(crate) fn set_id(&mut self, id: PortId) {
        self.id = id;
    }

    /// Drains every datagram currently queued on the socket, handing each one
    /// to the writer, until the kernel reports `WouldBlock`.
    pub(crate) fn on_readable(&mut self, _id: PortId) {
        if self.state != PortState::Open {
            return;
        }

        loop {
            let mut buf = self.pool.acquire();
            match self.socket.recv_from(buf.as_mut_slice()) {
                Ok((len, from)) => {
                    let packet = Packet::new(Address::from_socket_addr(from), self.local, buf.freeze(len));
                    if !self.writer.write(packet) {
                        event!(Level::WARN, port = %self.id, "packet writer rejected a datagram; dropped");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    event!(Level::WARN, port = %self.id, error = %err, "udp receive failed");
                    break;
                }
            }
        }
    }
}

impl Port for UdpReceiverState {
    fn id(&self) -> PortId {
        self.id
    }

    fn kind(&self) -> PortKind {
        PortKind::UdpReceiver
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
        // No separate close-completion callback to await for a UDP socket;
        // the `Closing` state is instantaneous but still observed, matching
        // the monotonic `Open -> Closing -> Closed` lifecycle every port kind
        // shares.
        self.state = PortState::Closing;
        self.state = PortState::Closed;
    }
}

/// The thread-safe handle returned to callers for a UDP receiver port.
///
/// Receiving is entirely push-based (via the [`PacketWriter`] supplied at
/// construction); this handle only exposes identity and teardown.
#[derive(Clone)]
pub struct UdpReceiver {
    pub(crate) id: PortId,
    pub(crate) local: Address,
    pub(crate) handle: crate::reactor::LoopHandle,
}

impl UdpReceiver {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn bind_address(&self) -> Address {
        self.local
    }

    pub fn async_close(&self) -> Result<()> {
        let id = self.id;
        self.handle.submit(Box::new(move |reactor| {
            if let Some(rc) = reactor.ports.get(id.slab_key()) {
                if let crate::reactor::PortSlot::UdpReceiver(state) = &mut *rc.borrow_mut() {
                    state.async_close();
                }
            }
        }))
    }
}
