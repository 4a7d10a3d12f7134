//! Port types: the four kinds of endpoint a [`crate::Transceiver`] can hold.
//!
//! A "port" is the crate's name for anything registered with the reactor that
//! owns an OS socket: a UDP receiver, a UDP sender, a TCP listener, or a TCP
//! connection. They share an identity ([`PortId`]) and a minimal capability
//! contract ([`Port`]); the rest of their behavior is specific to the kind.

pub mod tcp_connection;
pub mod tcp_listener;
pub mod udp_receiver;
pub mod udp_sender;

use std::fmt;

use crate::address::Address;
use crate::util::slab_rc::SlabKey;

/// Stable identity of a port within a transceiver. Doubles as the `mio`
/// readiness token used to route poll events back to the right port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(SlabKey);

impl PortId {
    pub(crate) fn from_slab_key(key: SlabKey) -> Self {
        Self(key)
    }

    pub(crate) fn slab_key(&self) -> SlabKey {
        self.0
    }

    pub(crate) fn token(&self) -> mio::Token {
        mio::Token(self.0.index())
    }
}

impl Default for PortId {
    /// A placeholder id for a port object that has not yet been inserted
    /// into the reactor's slab. Callers patch in the real id (via the
    /// kind-specific `set_id`) immediately after insertion.
    fn default() -> Self {
        Self(SlabKey::default())
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0.index())
    }
}

/// Which of the four port kinds a [`Port`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    UdpReceiver,
    UdpSender,
    TcpListener,
    TcpConnection,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortKind::UdpReceiver => "udp_receiver",
            PortKind::UdpSender => "udp_sender",
            PortKind::TcpListener => "tcp_listener",
            PortKind::TcpConnection => "tcp_connection",
        };
        f.write_str(s)
    }
}

/// The coarse open/closing/closed lifecycle shared by every port kind.
/// [`tcp_connection::TcpConnection`] layers a richer state machine for the
/// connect/accept handshake on top of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Open,
    Closing,
    Closed,
}

/// Capabilities common to every port kind, used by the reactor and by
/// [`crate::Transceiver::remove_port`] without needing to know which kind a
/// given port is.
pub trait Port {
    fn id(&self) -> PortId;
    fn kind(&self) -> PortKind;

    /// The local address this port is bound to.
    fn bind_address(&self) -> Address;

    /// Whether the port is still usable for I/O (i.e. not `Closing` or
    /// `Closed`).
    fn is_open(&self) -> bool;

    /// Begins an orderly close. Idempotent: calling it on a port that is
    /// already `Closing` or `Closed` has no effect. The port is not actually
    /// removed from the reactor until the close completes (see
    /// [`crate::Transceiver::remove_port`]).
    fn async_close(&mut self);
}
