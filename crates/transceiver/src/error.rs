use thiserror::Error;

/// The result type used throughout the transceiver crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the transport core.
///
/// Variants map onto the error kinds the core distinguishes: argument errors
/// (caller passed something invalid), resource errors (the OS refused a
/// bind/listen/connect/accept), protocol errors (the port was used in a way
/// its state does not allow) and network errors (a live connection failed).
#[derive(Debug, Error)]
pub enum Error {
    /// The OS reported a failure for a bind, listen, connect, accept, read or
    /// write call.
    #[error("I/O operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// `add_udp_receiver`/`add_udp_sender`/`add_tcp_server` was called with an
    /// address that is already bound by this transceiver.
    #[error("address already in use: {0}")]
    AddressInUse(crate::Address),

    /// A multicast interface was requested on a non-multicast address, or its
    /// family did not match the address family.
    #[error("address is not eligible for a multicast interface: {0}")]
    NotMulticast(crate::Address),

    /// The IP family of two related addresses does not match (e.g. sending an
    /// IPv6 packet from a socket bound to an IPv4 address).
    #[error("address family mismatch")]
    FamilyMismatch,

    /// An operation was attempted on a port that has already transitioned to
    /// `Closing` or `Closed`.
    #[error("port is closing or already closed")]
    PortClosed,

    /// `Address::new` was given a string that parses as neither IPv4 nor
    /// IPv6, or a port outside `[0, 65535]`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The background event loop failed to initialize; the transceiver is not
    /// usable.
    #[error("event loop failed to start: {0}")]
    LoopInit(std::io::Error),

    /// The event loop thread is gone (it panicked or was already joined),
    /// so no further commands can be serviced.
    #[error("transceiver event loop is no longer running")]
    LoopGone,
}

impl Error {
    /// Maps a bind failure to [`Error::AddressInUse`] when the OS reports the
    /// address is already taken, else passes the underlying error through as
    /// [`Error::Io`].
    pub(crate) fn from_bind_failure(err: std::io::Error, addr: crate::Address) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            Error::AddressInUse(addr)
        } else {
            Error::Io(err)
        }
    }
}
