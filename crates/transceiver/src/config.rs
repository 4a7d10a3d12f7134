//! Runtime configuration for a [`crate::Transceiver`].

/// Tuning knobs for a transceiver instance.
///
/// `Config` is plain data passed by value at construction time; there is no
/// global or file-backed configuration source — callers that want one (env
/// vars, a config file) build a `Config` from it themselves.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backlog passed to `listen()` for TCP server ports.
    pub tcp_backlog: u32,

    /// Size, in bytes, of the buffer used for each individual TCP `read()`
    /// call. Unlike UDP datagrams this does not bound message size, only the
    /// chunking of the underlying byte stream.
    pub tcp_read_chunk_size: usize,

    /// Maximum UDP datagram payload size; also the capacity of buffers handed
    /// out by the default packet pool.
    pub max_udp_packet_size: usize,

    /// If set, the event loop thread is pinned to this CPU core index on
    /// platforms where the `core-pinning` feature is enabled. Ignored
    /// otherwise.
    pub pin_to_core: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_backlog: 128,
            tcp_read_chunk_size: 64 * 1024,
            max_udp_packet_size: 2048,
            pin_to_core: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.tcp_backlog, 128);
        assert_eq!(config.tcp_read_chunk_size, 64 * 1024);
        assert_eq!(config.max_udp_packet_size, 2048);
        assert_eq!(config.pin_to_core, None);
    }
}
