//! Configuration types for the endpoint.

use std::time::Duration;

/// Endpoint configuration.
///
/// Controls queue depths, flow control, RNR backoff and the receive-side
/// buffer watchdog.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum number of in-flight application TX operations.
    /// Default: 256
    pub tx_size: usize,
    /// Maximum number of in-flight application RX operations.
    /// Default: 256
    pub rx_size: usize,
    /// Maximum IO-vector segments per operation.
    /// Default: 4
    pub iov_limit: usize,
    /// Cap on the NIC MTU. The effective MTU is the smaller of this and the
    /// transport's own MTU.
    /// Default: 16384
    pub mtu_cap: usize,
    /// Number of packet-buffer slots allocated per pool chunk.
    /// Default: 256
    pub pkt_pool_chunk_size: usize,
    /// Maximum chunks per packet pool.
    /// Default: 4
    pub pkt_pool_max_chunks: usize,
    /// Maximum NIC completions drained per progress tick.
    /// Default: 50
    pub cq_read_size: usize,
    /// Maximum SHM completions drained per progress tick.
    /// Default: 50
    pub shm_cq_read_size: usize,
    /// Maximum outstanding TX packets posted to the NIC.
    /// Default: 256
    pub max_outstanding_tx: usize,
    /// Maximum outstanding TX packets posted to the SHM transport.
    /// Default: 256
    pub shm_max_outstanding_tx: usize,
    /// Initial per-peer transmit credit balance, in packets.
    /// Default: 64
    pub peer_tx_credits: u32,
    /// Floor for the per-transfer credit request of long messages.
    /// Default: 4
    pub tx_min_credits: u32,
    /// Cap on the byte window granted by one CTS.
    /// Default: 128 packets worth of payload
    pub cts_max_window_pkts: u32,
    /// Initial RNR backoff quiet period.
    /// Default: 1ms
    pub rnr_backoff_initial: Duration,
    /// Cap on the RNR backoff quiet period.
    /// Default: 100ms
    pub rnr_backoff_max: Duration,
    /// Watchdog interval after which an exhausted receive-side data buffer
    /// account is forcibly reset.
    /// Default: 5s
    pub available_data_bufs_timeout: Duration,
    /// Minimum message size for the long-read protocol when the transport
    /// and peer support one-sided read.
    /// Default: 1 MiB
    pub read_min_size: usize,
    /// Default threshold below which a multi-receive buffer is retired.
    /// Default: mtu-derived at enable time when left as 0.
    pub min_multi_recv: usize,
    /// Post application receive buffers directly to the NIC instead of
    /// matching in software. Restricts the endpoint to eager-size messages.
    /// Default: false
    pub zero_copy_rx: bool,
    /// Capacity of a bound completion queue.
    /// Default: 1024
    pub cq_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            tx_size: 256,
            rx_size: 256,
            iov_limit: 4,
            mtu_cap: 16384,
            pkt_pool_chunk_size: 256,
            pkt_pool_max_chunks: 4,
            cq_read_size: 50,
            shm_cq_read_size: 50,
            max_outstanding_tx: 256,
            shm_max_outstanding_tx: 256,
            peer_tx_credits: 64,
            tx_min_credits: 4,
            cts_max_window_pkts: 128,
            rnr_backoff_initial: Duration::from_millis(1),
            rnr_backoff_max: Duration::from_millis(100),
            available_data_bufs_timeout: Duration::from_secs(5),
            read_min_size: 1 << 20,
            min_multi_recv: 0,
            zero_copy_rx: false,
            cq_size: 1024,
        }
    }
}

impl EndpointConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TX queue depth.
    pub fn with_tx_size(mut self, tx_size: usize) -> Self {
        self.tx_size = tx_size;
        self
    }

    /// Set the RX queue depth.
    pub fn with_rx_size(mut self, rx_size: usize) -> Self {
        self.rx_size = rx_size;
        self
    }

    /// Set the MTU cap.
    pub fn with_mtu_cap(mut self, mtu_cap: usize) -> Self {
        self.mtu_cap = mtu_cap;
        self
    }

    /// Set the packet pool chunk size.
    pub fn with_pkt_pool_chunk_size(mut self, n: usize) -> Self {
        self.pkt_pool_chunk_size = n;
        self
    }

    /// Set the maximum outstanding NIC TX packets.
    pub fn with_max_outstanding_tx(mut self, n: usize) -> Self {
        self.max_outstanding_tx = n;
        self
    }

    /// Set the initial per-peer credit balance.
    pub fn with_peer_tx_credits(mut self, credits: u32) -> Self {
        self.peer_tx_credits = credits;
        self
    }

    /// Set the minimum per-transfer credit request.
    pub fn with_tx_min_credits(mut self, credits: u32) -> Self {
        self.tx_min_credits = credits;
        self
    }

    /// Set the RNR backoff bounds.
    pub fn with_rnr_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.rnr_backoff_initial = initial;
        self.rnr_backoff_max = max;
        self
    }

    /// Set the long-read protocol threshold.
    pub fn with_read_min_size(mut self, size: usize) -> Self {
        self.read_min_size = size;
        self
    }

    /// Enable or disable zero-copy receive mode.
    pub fn with_zero_copy_rx(mut self, enable: bool) -> Self {
        self.zero_copy_rx = enable;
        self
    }

    /// Set the data-buffer watchdog timeout.
    pub fn with_available_data_bufs_timeout(mut self, timeout: Duration) -> Self {
        self.available_data_bufs_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let cfg = EndpointConfig::default()
            .with_tx_size(16)
            .with_rx_size(32)
            .with_peer_tx_credits(8)
            .with_tx_min_credits(2)
            .with_read_min_size(4096);

        assert_eq!(cfg.tx_size, 16);
        assert_eq!(cfg.rx_size, 32);
        assert_eq!(cfg.peer_tx_credits, 8);
        assert_eq!(cfg.tx_min_credits, 2);
        assert_eq!(cfg.read_min_size, 4096);
    }
}
