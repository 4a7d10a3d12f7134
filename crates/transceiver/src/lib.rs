//! Network transport core for a real-time audio streaming system.
//!
//! The crate multiplexes UDP datagram flows and TCP byte streams over a single
//! cooperative event loop (the [`Transceiver`]), while exposing a thread-safe
//! command interface to pipeline producers and consumers living on other
//! threads. See the module docs on [`Transceiver`] for the full contract.

mod address;
mod buffer;
mod collaborators;
mod config;
mod error;
mod port;
mod reactor;
mod transceiver;
mod util;

pub use address::{Address, Family};
pub use buffer::{BufferPool, DefaultBufferPool, DefaultPacketPool, Packet, PacketPool, PoolBuf, RcBuffer};
pub use collaborators::{ConnAcceptor, ConnNotifier, PacketWriter};
pub use config::Config;
pub use error::{Error, Result};
pub use port::tcp_connection::{ConnectStatus, TcpConnection};
pub use port::tcp_listener::TcpListenerHandle;
pub use port::udp_receiver::UdpReceiver;
pub use port::udp_sender::UdpSender;
pub use port::{PortId, PortKind};
pub use transceiver::Transceiver;
