//! External collaborator traits.
//!
//! The transport core does not decide what happens to received data or newly
//! accepted connections — it reports them to collaborators supplied by the
//! caller. These traits are the seams: something upstream implements them to
//! plug the transceiver into the rest of a pipeline.

use std::sync::Arc;

use crate::buffer::Packet;
use crate::error::Result;
use crate::port::tcp_connection::TcpConnection;

/// Receives datagrams read off a [`crate::port::udp_receiver::UdpReceiver`].
///
/// Called from the event loop thread; implementations must not block and
/// must not panic. Returns whether the packet was accepted; on `false` the
/// caller logs the failure and drops the packet.
pub trait PacketWriter: Send + Sync {
    fn write(&self, packet: Packet) -> bool;
}

/// Decides whether to admit an inbound TCP connection, and supplies the
/// notifier that will observe it from then on.
///
/// Called on the loop thread once a connection has already been accepted and
/// registered with the transceiver. Returning `None` causes the connection to
/// be closed immediately without affecting the listener's ability to accept
/// further connections; returning a notifier transfers observation rights to
/// it.
pub trait ConnAcceptor: Send + Sync {
    fn accept(&self, conn: TcpConnection) -> Option<Arc<dyn ConnNotifier>>;
}

/// Notified of lifecycle events on a single TCP connection: whether an
/// outbound connect completed, when inbound bytes arrive, and when a queued
/// write finishes.
///
/// The connection holds exactly one `ConnNotifier`, handed to it at `accept`
/// or `connect` time. All three callbacks run on the loop thread and must not
/// block; `notify_connected` is delivered at most once and always precedes
/// any `notify_readable` for the same connection.
pub trait ConnNotifier: Send + Sync {
    /// Called exactly once for a client connection, when the connect attempt
    /// resolves — successfully or not. Never called for server-side (accepted)
    /// connections, which are connected by construction.
    fn notify_connected(&self, result: Result<()>);

    /// Called each time new inbound bytes have been appended to the
    /// connection's stream and are available via [`TcpConnection::try_read`].
    fn notify_readable(&self) {}

    /// Called on each write submitted via [`TcpConnection::write`] that
    /// actually reaches the socket.
    fn notify_writable(&self) {}

    /// Called exactly once, when the connection has fully closed and its
    /// resources have been released. Not part of the original notifier
    /// contract, but convenient for collaborators that want to stop tracking
    /// a connection without polling `connected()`.
    fn closed(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Family};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct RecordingNotifier {
        connected_called: AtomicBool,
        closed_called: AtomicBool,
        result: Mutex<Option<Result<()>>>,
    }

    impl ConnNotifier for RecordingNotifier {
        fn notify_connected(&self, result: Result<()>) {
            self.connected_called.store(true, Ordering::SeqCst);
            *self.result.lock().unwrap() = Some(result);
        }

        fn closed(&self) {
            self.closed_called.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn default_notify_readable_and_writable_are_no_ops() {
        struct SilentNotifier;
        impl ConnNotifier for SilentNotifier {
            fn notify_connected(&self, _result: Result<()>) {}
        }

        let notifier = SilentNotifier;
        notifier.notify_readable();
        notifier.notify_writable();
    }

    #[test]
    fn acceptor_returning_none_is_a_valid_contract() {
        struct RejectingAcceptor;
        impl ConnAcceptor for RejectingAcceptor {
            fn accept(&self, _conn: TcpConnection) -> Option<Arc<dyn ConnNotifier>> {
                None
            }
        }

        // Compiles and is callable; behavior is exercised end-to-end in the
        // integration tests, which have a real socket to construct a
        // `TcpConnection` from.
        let _acceptor: Arc<dyn ConnAcceptor> = Arc::new(RejectingAcceptor);
        let _ = Address::new(Family::Auto, "127.0.0.1", 9000).unwrap();
    }

    #[test]
    fn notifier_records_connected_and_closed() {
        let notifier = RecordingNotifier {
            connected_called: AtomicBool::new(false),
            closed_called: AtomicBool::new(false),
            result: Mutex::new(None),
        };

        notifier.notify_connected(Ok(()));
        notifier.closed();

        assert!(notifier.connected_called.load(Ordering::SeqCst));
        assert!(notifier.closed_called.load(Ordering::SeqCst));
        assert!(notifier.result.lock().unwrap().take().unwrap().is_ok());
    }
}
