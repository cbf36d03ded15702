//! The progress engine: one cooperative tick invoked under the endpoint
//! lock.

use std::time::Instant;

use tracing::warn;

use crate::av::Addr;
use crate::entry::{CtrlType, EntryFlags, RxState, TxEntry, TxState};
use crate::ep::EndpointInner;
use crate::error::Error;
use crate::packet::{Owner, PktId, PoolKind};
use crate::peer::PeerFlags;
use crate::read::ReadState;
use crate::transport::{ReadDesc, TransportId};

impl EndpointInner {
    pub(crate) fn tx_entry_ref(&self, owner: Owner) -> Option<&TxEntry> {
        match owner {
            Owner::Tx(i) => self.tx_entries.get(i),
            Owner::ReadRsp(i) => self.readrsp_tx_entries.get(i),
            _ => None,
        }
    }

    fn peer_in_backoff(&self, addr: Addr) -> bool {
        self.av_ref().peer(addr).map(|p| p.in_backoff()).unwrap_or(false)
    }

    /// One full progress tick. Order matters: completions are drained
    /// before buffers are replenished, and queued work is re-driven before
    /// fresh data is posted.
    pub(crate) fn progress_internal(&mut self) {
        let now = Instant::now();

        self.check_available_data_bufs_timer(now);

        self.drain_nic_cq();

        if self.shm.is_some() {
            self.drain_shm_cq();
        }

        self.progress_post_internal_rx_pkts();

        self.check_peer_backoff_timer(now);

        if self.progress_handshakes().is_err() {
            return;
        }
        if self.progress_queued_rnr().is_err() {
            return;
        }
        if self.progress_queued_ctrl().is_err() {
            return;
        }
        if self.progress_pending_data().is_err() {
            return;
        }
        if self.progress_pending_reads().is_err() {
            return;
        }

        self.flush_transports();
    }

    /// Safety valve: if the receive-side data buffer account stays
    /// exhausted past the watchdog interval, force it back to the
    /// configured chunk count. Loud on purpose; this signals an accounting
    /// leak, not a normal condition.
    fn check_available_data_bufs_timer(&mut self, now: Instant) {
        if self.nic_rx_pkts.pool.chunk_count() == 0 || self.available_data_bufs != 0 {
            return;
        }
        let Some(ts) = self.available_data_bufs_ts else {
            self.available_data_bufs_ts = Some(now);
            return;
        };
        if now.duration_since(ts) >= self.cfg.available_data_bufs_timeout {
            self.available_data_bufs = self.nic_rx_pkts.pool.chunk_slots();
            self.available_data_bufs_ts = None;
            warn!("reset available buffers for large message receives");
        }
    }

    /// Replenish internal receive buffers, growing the RX-side pools on the
    /// first ever tick so the first-touch cost is paid once, here, and not
    /// during endpoint construction.
    fn progress_post_internal_rx_pkts(&mut self) {
        if self.cfg.zero_copy_rx {
            // The first tick still grows the RX-side pools and funds the
            // data-buffer account: tagged receives and control traffic
            // bypass the zero-copy path and flow through internal buffers
            // and CTS windows as usual.
            if self.nic_rx_pkts.pool.chunk_count() == 0 {
                if let Err(e) = self.grow_rx_pools() {
                    let errno = e.errno();
                    self.write_eq_error(errno, -errno);
                    return;
                }
                self.available_data_bufs = self.nic_rx_pkts.pool.chunk_slots();
            }
            // With application buffers posted directly, keep exactly one
            // internal buffer up only when nothing else is posted, so
            // control packets can still land.
            if self.nic_rx_pkts_posted == 0 && self.nic_rx_pkts_to_post == 0 {
                self.nic_rx_pkts_to_post = 1;
            } else if self.nic_rx_pkts_posted > 0 && self.nic_rx_pkts_to_post > 0 {
                self.nic_rx_pkts_to_post = 0;
            }
        } else if self.nic_rx_pkts_posted == 0 && self.nic_rx_pkts_to_post == 0 {
            if let Err(e) = self.grow_rx_pools() {
                let errno = e.errno();
                self.write_eq_error(errno, -errno);
                return;
            }
            self.nic_rx_pkts_to_post = self.nic_rx_pkts.pool.chunk_slots();
            self.available_data_bufs = self.nic_rx_pkts.pool.chunk_slots();
            if let Some(shm_rx) = &self.shm_rx_pkts {
                self.shm_rx_pkts_to_post = shm_rx.pool.chunk_slots();
            }
        }

        let n = std::mem::take(&mut self.nic_rx_pkts_to_post);
        if n > 0 {
            if let Err(e) = self.bulk_post_internal_recv(n, TransportId::Nic) {
                if !matches!(e, Error::Again) {
                    let errno = e.errno();
                    self.write_eq_error(errno, -errno);
                }
            }
        }
        if self.shm.is_some() {
            let n = std::mem::take(&mut self.shm_rx_pkts_to_post);
            if n > 0 {
                if let Err(e) = self.bulk_post_internal_recv(n, TransportId::Shm) {
                    if !matches!(e, Error::Again) {
                        let errno = e.errno();
                        self.write_eq_error(errno, -errno);
                    }
                }
            }
        }
    }

    fn grow_rx_pools(&mut self) -> crate::error::Result<()> {
        self.nic_rx_pkts.pool.grow()?;
        if let Some(shm_rx) = &mut self.shm_rx_pkts {
            shm_rx.pool.grow()?;
        }
        self.unexp_pkts.pool.grow()?;
        Ok(())
    }

    /// Release peers whose RNR quiet period has elapsed.
    fn check_peer_backoff_timer(&mut self, now: Instant) {
        if self.peer_backoff_list.is_empty() {
            return;
        }
        let addrs = std::mem::take(&mut self.peer_backoff_list);
        for addr in addrs {
            let keep = match self.av_mut().peer_mut(addr) {
                Some(peer) => {
                    if peer.backoff.expired(now) {
                        peer.leave_backoff();
                        false
                    } else {
                        true
                    }
                }
                None => false,
            };
            if keep {
                self.peer_backoff_list.push(addr);
            }
        }
    }

    /// Retry handshakes whose first send failed. `Error::Again` pauses the
    /// loop until the next tick; any other failure is fatal to the
    /// endpoint.
    fn progress_handshakes(&mut self) -> Result<(), ()> {
        let mut i = 0;
        while i < self.handshake_queued_peers.len() {
            let addr = self.handshake_queued_peers[i];
            if self.peer_in_backoff(addr) {
                i += 1;
                continue;
            }
            match self.post_handshake(addr) {
                Ok(()) => {
                    self.handshake_queued_peers.remove(i);
                    if let Some(peer) = self.av_mut().peer_mut(addr) {
                        peer.flags.remove(PeerFlags::HANDSHAKE_QUEUED);
                        peer.flags.insert(PeerFlags::HANDSHAKE_SENT);
                    }
                }
                Err(Error::Again) => break,
                Err(e) => {
                    warn!(?addr, error = %e, "failed to post handshake");
                    let errno = e.errno();
                    self.write_eq_error(errno, -errno);
                    return Err(());
                }
            }
        }
        Ok(())
    }

    /// Replay RNR-queued packets, receive side first, preserving enqueue
    /// order within each entry.
    fn progress_queued_rnr(&mut self) -> Result<(), ()> {
        let rx_ids: Vec<usize> = self.rx_queued_rnr_list.iter().copied().collect();
        for rx_id in rx_ids {
            let Some(rx) = self.rx_entries.get(rx_id) else {
                self.rx_queued_rnr_list.retain(|&i| i != rx_id);
                continue;
            };
            debug_assert!(rx.flags.contains(EntryFlags::QUEUED_RNR));
            debug_assert!(!rx.queued_pkts.is_empty());
            if self.peer_in_backoff(rx.addr) {
                continue;
            }

            match self.send_queued_pkts(Owner::Rx(rx_id)) {
                Ok(()) => {
                    self.rx_queued_rnr_list.retain(|&i| i != rx_id);
                    let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                    rx.flags.remove(EntryFlags::QUEUED_RNR);
                    self.maybe_release_rx(rx_id);
                }
                Err(Error::Again) => break,
                Err(e) => {
                    let errno = e.errno();
                    self.write_rx_error(rx_id, errno, -errno);
                    return Err(());
                }
            }
        }

        let owners: Vec<Owner> = self.tx_queued_rnr_list.iter().copied().collect();
        for owner in owners {
            let Some(tx) = self.tx_entry_ref(owner) else {
                self.tx_queued_rnr_list.retain(|&o| o != owner);
                continue;
            };
            debug_assert!(tx.flags.contains(EntryFlags::QUEUED_RNR));
            if self.peer_in_backoff(tx.addr) {
                continue;
            }

            match self.send_queued_pkts(owner) {
                Ok(()) => {
                    self.tx_queued_rnr_list.retain(|&o| o != owner);
                    match owner {
                        Owner::Tx(i) => {
                            self.tx_entries
                                .get_mut(i)
                                .expect("live tx entry")
                                .flags
                                .remove(EntryFlags::QUEUED_RNR);
                        }
                        Owner::ReadRsp(i) => {
                            self.readrsp_tx_entries
                                .get_mut(i)
                                .expect("live readrsp entry")
                                .flags
                                .remove(EntryFlags::QUEUED_RNR);
                        }
                        _ => {}
                    }
                }
                Err(Error::Again) => break,
                Err(e) => {
                    let errno = e.errno();
                    match owner {
                        Owner::ReadRsp(_) => self.release_tx_entry(owner),
                        _ => self.write_tx_error(owner, errno, -errno),
                    }
                    return Err(());
                }
            }
        }
        Ok(())
    }

    /// Re-post queued control packets, receive side first, in insertion
    /// order.
    fn progress_queued_ctrl(&mut self) -> Result<(), ()> {
        let rx_ids: Vec<usize> = self.rx_queued_ctrl_list.iter().copied().collect();
        for rx_id in rx_ids {
            let Some(rx) = self.rx_entries.get(rx_id) else {
                self.rx_queued_ctrl_list.retain(|&i| i != rx_id);
                continue;
            };
            debug_assert_eq!(rx.state, RxState::QueuedCtrl);
            let ctrl = rx.queued_ctrl.expect("queued ctrl type");
            if self.peer_in_backoff(rx.addr) {
                continue;
            }

            match self.post_rx_ctrl(rx_id, ctrl) {
                Ok(()) => {
                    self.rx_queued_ctrl_list.retain(|&i| i != rx_id);
                    let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                    rx.queued_ctrl = None;
                    rx.state = RxState::Recv;
                    self.maybe_release_rx(rx_id);
                }
                Err(Error::Again) => break,
                Err(e) => {
                    let errno = e.errno();
                    self.write_rx_error(rx_id, errno, -errno);
                    return Err(());
                }
            }
        }

        let tx_ids: Vec<usize> = self.tx_queued_ctrl_list.iter().copied().collect();
        for tx_id in tx_ids {
            let Some(tx) = self.tx_entries.get(tx_id) else {
                self.tx_queued_ctrl_list.retain(|&i| i != tx_id);
                continue;
            };
            debug_assert_eq!(tx.state, TxState::QueuedCtrl);
            debug_assert_eq!(tx.queued_ctrl, Some(CtrlType::Req));
            if self.peer_in_backoff(tx.addr) {
                continue;
            }

            match self.post_req(tx_id) {
                Ok(()) => {
                    self.tx_queued_ctrl_list.retain(|&i| i != tx_id);
                    let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                    tx.queued_ctrl = None;
                    if tx.state == TxState::QueuedCtrl {
                        tx.state = TxState::Req;
                    }
                }
                Err(Error::Again) => break,
                Err(e) => {
                    let errno = e.errno();
                    self.write_tx_error(Owner::Tx(tx_id), errno, -errno);
                    return Err(());
                }
            }
        }
        Ok(())
    }

    /// Post data packets for entries with window until the outstanding-ops
    /// quota is reached, batching with more-to-come except on the last.
    fn progress_pending_data(&mut self) -> Result<(), ()> {
        let owners: Vec<Owner> = self.tx_pending_list.iter().copied().collect();
        'outer: for owner in owners {
            let Some(tx) = self.tx_entry_ref(owner) else {
                self.tx_pending_list.retain(|&o| o != owner);
                continue;
            };
            let addr = tx.addr;
            if tx.window == 0 || self.peer_in_backoff(addr) {
                continue;
            }

            let local = self
                .av_ref()
                .entry(addr)
                .map(|e| e.is_local() && self.shm.is_some())
                .unwrap_or(false);

            loop {
                let window = match self.tx_entry_ref(owner) {
                    Some(tx) => tx.window,
                    None => break,
                };
                if window == 0 {
                    break;
                }
                let (used, quota) = if local {
                    (self.shm_outstanding_tx, self.cfg.shm_max_outstanding_tx)
                } else {
                    (self.nic_outstanding_tx, self.cfg.max_outstanding_tx)
                };
                // The transport TX queue is full; nothing more can be done
                // this tick.
                if used >= quota {
                    break 'outer;
                }
                if self.peer_in_backoff(addr) {
                    break;
                }

                let more = quota - used > 1 && window > self.max_data_payload;
                match self.post_data(owner, more) {
                    Ok(()) => {}
                    Err(Error::Again) => break 'outer,
                    Err(e) => {
                        let errno = e.errno();
                        match owner {
                            Owner::ReadRsp(_) => self.release_tx_entry(owner),
                            _ => self.write_tx_error(owner, errno, -errno),
                        }
                        return Err(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Submit pending one-sided reads; each advances to SUBMITTED.
    fn progress_pending_reads(&mut self) -> Result<(), ()> {
        let ids: Vec<usize> = self.read_pending_list.iter().copied().collect();
        for read_id in ids {
            let Some(read) = self.read_entries.get(read_id) else {
                self.read_pending_list.retain(|&i| i != read_id);
                continue;
            };
            debug_assert_eq!(read.state, ReadState::Pending);
            let addr = read.addr;
            if self.peer_in_backoff(addr) {
                continue;
            }
            if self.nic_outstanding_tx >= self.cfg.max_outstanding_tx {
                break;
            }

            match self.post_read_entry(read_id) {
                Ok(()) => {
                    self.read_pending_list.retain(|&i| i != read_id);
                    self.read_entries
                        .get_mut(read_id)
                        .expect("live read entry")
                        .state = ReadState::Submitted;
                    self.nic_outstanding_tx += 1;
                    if let Some(peer) = self.av_mut().peer_mut(addr) {
                        peer.nic_outstanding_tx_ops += 1;
                    }
                }
                Err(Error::Again) => break,
                Err(e) => {
                    let errno = e.errno();
                    let owner = self.read_entries.get(read_id).map(|r| r.owner);
                    self.read_pending_list.retain(|&i| i != read_id);
                    self.read_entries.remove(read_id);
                    match owner {
                        Some(Owner::Tx(_)) => {
                            self.write_tx_error(owner.unwrap(), errno, -errno)
                        }
                        Some(Owner::Rx(rx_id)) => self.write_rx_error(rx_id, errno, -errno),
                        _ => {}
                    }
                    return Err(());
                }
            }
        }
        Ok(())
    }

    fn post_read_entry(&mut self, read_id: usize) -> crate::error::Result<()> {
        let dest = {
            let read = self.read_entries.get(read_id).expect("live read entry");
            self.av_ref()
                .entry(read.addr)
                .ok_or(Error::AddrNotAvail)?
                .nic_addr
        };
        let read = self.read_entries.get(read_id).expect("live read entry");
        let rd = ReadDesc {
            iov: &read.iov,
            desc: &read.desc,
            dest,
            remote: &read.remote,
            token: PktId {
                kind: PoolKind::ReadCtx,
                slot: read_id as u32,
            }
            .token(),
        };
        self.nic.post_read(&rd)
    }
}
