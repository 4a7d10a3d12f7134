//! A bound UDP socket used to send datagrams to arbitrary destinations.

use std::collections::VecDeque;

use tracing::{event, Level};

use crate::address::Address;
use crate::buffer::RcBuffer;
use crate::error::Result;
use crate::port::{Port, PortId, PortKind, PortState};

pub(crate) struct UdpSenderState {
    id: PortId,
    socket: mio::net::UdpSocket,
    local: Address,
    state: PortState,
    /// Datagrams that hit `WouldBlock` on send, retried once the socket
    /// reports writable again. Unbounded: backpressure for UDP is a policy
    /// decision for the caller, not something this port enforces.
    pending: VecDeque<(Address, RcBuffer)>,
}

impl UdpSenderState {
    pub(crate) fn new(id: PortId, socket: mio::net::UdpSocket, local: Address) -> Self {
        Self {
            id,
            socket,
            local,
            state: PortState::Open,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn socket_mut(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.socket
    }

    pub(crate) fn set_id(&mut self, id: PortId) {
        self.id = id;
    }

    fn try_send(&mut self, dst: Address, payload: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(payload, dst.to_socket_addr()).map(|_| ())
    }

    /// Queues (or, if the socket has no backlog, sends immediately)
    /// `payload` to `dst`.
    pub(crate) fn send(&mut self, dst: Address, payload: RcBuffer) {
        if self.state != PortState::Open {
            return;
        }

        if self.pending.is_empty() {
            match self.try_send(dst, payload.as_slice()) {
                Ok(()) => return,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    event!(Level::WARN, port = %self.id, error = %err, "udp send failed");
                    return;
                }
            }
        }

        self.pending.push_back((dst, payload));
    }

    pub(crate) fn on_writable(&mut self, _id: PortId) {
        while let Some((dst, payload)) = self.pending.pop_front() {
            match self.try_send(dst, payload.as_slice()) {
                Ok(()) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.pending.push_front((dst, payload));
                    break;
                }
                Err(err) => {
                    event!(Level::WARN, port = %self.id, error = %err, "udp send failed");
                    continue;
                }
            }
        }
    }
}

impl Port for UdpSenderState {
    fn id(&self) -> PortId {
        self.id
    }

    fn kind(&self) -> PortKind {
        PortKind::UdpSender
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
        self.pending.clear();
        self.state = PortState::Closed;
    }
}

/// The thread-safe handle to a UDP sender port.
#[derive(Clone)]
pub struct UdpSender {
    pub(crate) id: PortId,
    pub(crate) local: Address,
    pub(crate) handle: crate::reactor::LoopHandle,
}

impl UdpSender {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn bind_address(&self) -> Address {
        self.local
    }

    /// Sends `payload` to `dst`. Fire-and-forget: delivery failures are
    /// logged on the loop thread and do not propagate back to the caller, in
    /// keeping with UDP's unreliable-delivery contract.
    pub fn send(&self, dst: Address, payload: RcBuffer) -> Result<()> {
        let id = self.id;
        self.handle.submit(Box::new(move |reactor| {
            if let Some(rc) = reactor.ports.get(id.slab_key()) {
                if let crate::reactor::PortSlot::UdpSender(state) = &mut *rc.borrow_mut() {
                    state.send(dst, payload);
                }
            }
        }))
    }

    pub fn async_close(&self) -> Result<()> {
        let id = self.id;
        self.handle.submit(Box::new(move |reactor| {
            if let Some(rc) = reactor.ports.get(id.slab_key()) {
                if let crate::reactor::PortSlot::UdpSender(state) = &mut *rc.borrow_mut() {
                    state.async_close();
                }
            }
        }))
    }
}
