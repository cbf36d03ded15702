//! Per-peer state: handshake progress, flow-control credits, outstanding
//! packet accounting and RNR backoff.

use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::av::Addr;
use crate::packet::PktId;

bitflags! {
    /// Peer condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeerFlags: u32 {
        /// A handshake send is queued for retry.
        const HANDSHAKE_QUEUED = 1 << 0;
        /// Our handshake reached the transport.
        const HANDSHAKE_SENT = 1 << 1;
        /// The peer's handshake arrived; `features` is valid.
        const HANDSHAKE_RECEIVED = 1 << 2;
        /// The peer is in an RNR quiet period.
        const IN_BACKOFF = 1 << 3;
    }
}

/// Exponential RNR backoff window.
#[derive(Debug, Clone, Copy)]
pub struct RnrBackoff {
    begin: Option<Instant>,
    wait: Duration,
}

impl RnrBackoff {
    fn new() -> Self {
        Self {
            begin: None,
            wait: Duration::ZERO,
        }
    }

    /// Arm the backoff timer, doubling the quiet period up to `max` on
    /// repeated RNR.
    pub fn arm(&mut self, now: Instant, initial: Duration, max: Duration) {
        self.wait = if self.wait.is_zero() {
            initial
        } else {
            (self.wait * 2).min(max)
        };
        self.begin = Some(now);
    }

    /// Whether the quiet period has elapsed.
    pub fn expired(&self, now: Instant) -> bool {
        match self.begin {
            Some(begin) => now.duration_since(begin) >= self.wait,
            None => true,
        }
    }

    /// Deadline of the current quiet period.
    pub fn deadline(&self) -> Option<Instant> {
        self.begin.map(|b| b + self.wait)
    }

    /// Forget the deadline but keep the window so the next RNR doubles it.
    pub fn disarm(&mut self) {
        self.begin = None;
    }

    /// Reset the window after successful traffic.
    pub fn reset(&mut self) {
        self.begin = None;
        self.wait = Duration::ZERO;
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

/// Per-remote-address record.
pub struct Peer {
    pub addr: Addr,
    pub flags: PeerFlags,
    /// Extra-feature bitmask learned from the peer's handshake.
    pub features: u64,
    /// Transmit-credit balance, in packets.
    pub tx_credits: u32,
    /// Outstanding TX packets posted to the NIC for this peer.
    pub nic_outstanding_tx_ops: u32,
    /// Outstanding TX packets posted to the SHM transport for this peer.
    pub shm_outstanding_tx_ops: u32,
    /// Outstanding TX packets, used to invalidate completions on removal.
    pub outstanding_tx_pkts: Vec<PktId>,
    pub backoff: RnrBackoff,
}

impl Peer {
    pub fn new(addr: Addr, initial_credits: u32) -> Self {
        Self {
            addr,
            flags: PeerFlags::empty(),
            features: 0,
            tx_credits: initial_credits,
            nic_outstanding_tx_ops: 0,
            shm_outstanding_tx_ops: 0,
            outstanding_tx_pkts: Vec::new(),
            backoff: RnrBackoff::new(),
        }
    }

    #[inline]
    pub fn in_backoff(&self) -> bool {
        self.flags.contains(PeerFlags::IN_BACKOFF)
    }

    /// Whether a handshake still needs to be sent or retried.
    #[inline]
    pub fn needs_handshake(&self) -> bool {
        !self
            .flags
            .intersects(PeerFlags::HANDSHAKE_SENT | PeerFlags::HANDSHAKE_QUEUED)
    }

    /// Enter the RNR quiet period.
    pub fn enter_backoff(&mut self, now: Instant, initial: Duration, max: Duration) {
        self.backoff.arm(now, initial, max);
        self.flags.insert(PeerFlags::IN_BACKOFF);
    }

    /// Leave the quiet period once the deadline passed.
    pub fn leave_backoff(&mut self) {
        self.backoff.disarm();
        self.flags.remove(PeerFlags::IN_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first_rnr(Duration::ZERO, Duration::from_millis(1))]
    #[case::doubles(Duration::from_millis(1), Duration::from_millis(2))]
    #[case::doubles_again(Duration::from_millis(4), Duration::from_millis(8))]
    #[case::capped(Duration::from_millis(80), Duration::from_millis(100))]
    #[case::stays_capped(Duration::from_millis(100), Duration::from_millis(100))]
    fn test_backoff_window(#[case] current: Duration, #[case] expected: Duration) {
        let mut backoff = RnrBackoff {
            begin: None,
            wait: current,
        };
        backoff.arm(
            Instant::now(),
            Duration::from_millis(1),
            Duration::from_millis(100),
        );
        assert_eq!(backoff.wait(), expected);
    }

    #[test]
    fn test_backoff_expiry() {
        let mut backoff = RnrBackoff::new();
        let start = Instant::now();
        assert!(backoff.expired(start));

        backoff.arm(start, Duration::from_millis(5), Duration::from_millis(100));
        assert!(!backoff.expired(start));
        assert!(backoff.expired(start + Duration::from_millis(5)));
    }

    #[test]
    fn test_peer_backoff_flag() {
        let mut peer = Peer::new(Addr(0), 64);
        assert!(!peer.in_backoff());

        let now = Instant::now();
        peer.enter_backoff(now, Duration::from_millis(1), Duration::from_millis(100));
        assert!(peer.in_backoff());

        peer.leave_backoff();
        assert!(!peer.in_backoff());
        // Window survives so the next RNR doubles it.
        assert_eq!(peer.backoff.wait(), Duration::from_millis(1));
    }
}
