//! The endpoint: ownership of pools and transports, lifecycle, and the
//! application submission paths.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use slab::Slab;
use tracing::{debug, warn};

use crate::av::{Addr, AddressVector, EpAddr};
use crate::config::EndpointConfig;
use crate::cq::{BindFlags, CompQueue, Counter, EventQueue};
use crate::entry::{
    AtomicInfo, CqErrEntry, CtrlType, EntryFlags, OpFlags, OpKind, RxEntry, RxState, TxEntry,
    TxState, ERR_CANCELED,
};
use crate::error::{Error, Result};
use crate::packet::{
    max_hdr_size, AtomicKind, AtomicOp, DataHdr, Owner, PktId, PktSet, PoolKind,
    FEATURE_CONSTANT_HDR_LEN, FEATURE_DELIVERY_COMPLETE, FEATURE_RDMA_READ,
};
use crate::pool::{EntryPool, PktPool};
use crate::read::ReadEntry;
use crate::transport::{
    total_iov_len, Access, IoSeg, MemoryRegistrar, MrDesc, RmaSeg, SrcId, Transport,
};

/// Endpoint lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EpState {
    Created,
    Enabled,
    Closed,
}

/// A receive posted directly from an application buffer (zero-copy mode).
pub(crate) struct UserPkt {
    pub rx_id: usize,
    pub addr: u64,
    pub capacity: usize,
}

/// Point-in-time counters for observability and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointStats {
    pub nic_outstanding_tx: usize,
    pub shm_outstanding_tx: usize,
    pub nic_rx_pkts_posted: usize,
    pub tx_entries_in_use: usize,
    pub rx_entries_in_use: usize,
    pub readrsp_entries_in_use: usize,
    pub read_entries_in_use: usize,
    pub nic_tx_pkts_in_use: usize,
    pub nic_rx_pkts_in_use: usize,
    pub unexp_pkts_in_use: usize,
    pub available_data_bufs: usize,
    pub nic_rx_pool_chunks: usize,
}

pub(crate) struct EndpointInner {
    pub cfg: EndpointConfig,
    pub state: EpState,
    pub nic: Box<dyn Transport>,
    pub shm: Option<Box<dyn Transport>>,
    pub registrar: Arc<dyn MemoryRegistrar>,
    pub av: Option<AddressVector>,

    pub tx_cq: Option<Arc<CompQueue>>,
    pub rx_cq: Option<Arc<CompQueue>>,
    pub tx_cntr: Option<Arc<Counter>>,
    pub rx_cntr: Option<Arc<Counter>>,
    pub eq: Option<Arc<EventQueue>>,

    pub tx_entries: EntryPool<TxEntry>,
    pub rx_entries: EntryPool<RxEntry>,
    /// Responder streams for emulated reads; separate so application sends
    /// cannot starve read responses.
    pub readrsp_tx_entries: EntryPool<TxEntry>,
    pub read_entries: EntryPool<ReadEntry>,

    pub nic_tx_pkts: PktSet,
    pub nic_rx_pkts: PktSet,
    pub shm_tx_pkts: Option<PktSet>,
    pub shm_rx_pkts: Option<PktSet>,
    pub unexp_pkts: PktSet,
    pub user_pkts: Slab<UserPkt>,

    pub rx_list: VecDeque<usize>,
    pub rx_tagged_list: VecDeque<usize>,
    pub rx_unexp_list: VecDeque<usize>,
    pub rx_unexp_tagged_list: VecDeque<usize>,
    pub rx_queued_rnr_list: VecDeque<usize>,
    pub rx_queued_ctrl_list: VecDeque<usize>,
    pub tx_queued_rnr_list: VecDeque<Owner>,
    pub tx_queued_ctrl_list: VecDeque<usize>,
    pub tx_pending_list: VecDeque<Owner>,
    pub read_pending_list: VecDeque<usize>,
    pub handshake_queued_peers: VecDeque<Addr>,
    pub peer_backoff_list: Vec<Addr>,

    pub mtu: usize,
    pub max_data_payload: usize,
    pub msg_prefix: usize,
    pub min_multi_recv: usize,
    pub extra_features: u64,
    pub shm_name: Option<String>,

    pub nic_outstanding_tx: usize,
    pub shm_outstanding_tx: usize,
    pub nic_rx_pkts_posted: usize,
    pub nic_rx_pkts_to_post: usize,
    pub shm_rx_pkts_posted: usize,
    pub shm_rx_pkts_to_post: usize,
    pub available_data_bufs: usize,
    pub available_data_bufs_ts: Option<Instant>,
    pub nic_more_pending: bool,
    pub shm_more_pending: bool,
}

/// Reliable datagram messaging endpoint.
///
/// One coarse lock serializes the progress loop against application
/// submissions; every public entry point holds it for the full call.
pub struct Endpoint {
    inner: Mutex<EndpointInner>,
}

impl Endpoint {
    /// Create an endpoint over a NIC transport and an optional node-local
    /// shared-memory transport.
    pub fn new(
        cfg: EndpointConfig,
        nic: Box<dyn Transport>,
        shm: Option<Box<dyn Transport>>,
        registrar: Arc<dyn MemoryRegistrar>,
    ) -> Result<Self> {
        if cfg.iov_limit == 0 || cfg.tx_size == 0 || cfg.rx_size == 0 {
            return Err(Error::InvalidConfig("queue sizes must be non-zero".into()));
        }

        let mtu = nic.mtu().min(cfg.mtu_cap);
        if mtu <= max_hdr_size() {
            return Err(Error::InvalidConfig("MTU too small for packet headers".into()));
        }
        let max_data_payload = mtu - DataHdr::SIZE;

        let mk_registered = |access| {
            PktPool::new(
                mtu,
                cfg.pkt_pool_chunk_size,
                cfg.pkt_pool_max_chunks,
                Some(registrar.clone()),
                access,
            )
        };
        let mk_plain = || {
            PktPool::new(
                mtu,
                cfg.pkt_pool_chunk_size,
                cfg.pkt_pool_max_chunks,
                None,
                Access::empty(),
            )
        };

        let nic_tx_pkts = PktSet::new(PoolKind::NicTx, mk_registered(Access::SEND));
        let nic_rx_pkts = PktSet::new(PoolKind::NicRx, mk_registered(Access::RECV));
        let (shm_tx_pkts, shm_rx_pkts) = if shm.is_some() {
            (
                Some(PktSet::new(PoolKind::ShmTx, mk_plain())),
                Some(PktSet::new(PoolKind::ShmRx, mk_plain())),
            )
        } else {
            (None, None)
        };
        let unexp_pkts = PktSet::new(PoolKind::Unexp, mk_plain());

        let inner = EndpointInner {
            tx_entries: EntryPool::new(cfg.tx_size),
            rx_entries: EntryPool::new(cfg.rx_size),
            readrsp_tx_entries: EntryPool::new(cfg.rx_size),
            read_entries: EntryPool::new(cfg.tx_size + cfg.rx_size),
            nic_tx_pkts,
            nic_rx_pkts,
            shm_tx_pkts,
            shm_rx_pkts,
            unexp_pkts,
            user_pkts: Slab::new(),
            av: None,
            tx_cq: None,
            rx_cq: None,
            tx_cntr: None,
            rx_cntr: None,
            eq: None,
            rx_list: VecDeque::new(),
            rx_tagged_list: VecDeque::new(),
            rx_unexp_list: VecDeque::new(),
            rx_unexp_tagged_list: VecDeque::new(),
            rx_queued_rnr_list: VecDeque::new(),
            rx_queued_ctrl_list: VecDeque::new(),
            tx_queued_rnr_list: VecDeque::new(),
            tx_queued_ctrl_list: VecDeque::new(),
            tx_pending_list: VecDeque::new(),
            read_pending_list: VecDeque::new(),
            handshake_queued_peers: VecDeque::new(),
            peer_backoff_list: Vec::new(),
            mtu,
            max_data_payload,
            msg_prefix: max_hdr_size(),
            min_multi_recv: if cfg.min_multi_recv > 0 {
                cfg.min_multi_recv
            } else {
                mtu - max_hdr_size()
            },
            extra_features: 0,
            shm_name: None,
            nic_outstanding_tx: 0,
            shm_outstanding_tx: 0,
            nic_rx_pkts_posted: 0,
            nic_rx_pkts_to_post: 0,
            shm_rx_pkts_posted: 0,
            shm_rx_pkts_to_post: 0,
            available_data_bufs: 0,
            available_data_bufs_ts: None,
            nic_more_pending: false,
            shm_more_pending: false,
            state: EpState::Created,
            nic,
            shm,
            registrar,
            cfg,
        };

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Bind the address vector. Required before [`Endpoint::enable`].
    pub fn bind_av(&self, av: AddressVector) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        if ep.av.is_some() {
            return Err(Error::InvalidState("address vector already bound"));
        }
        ep.av = Some(av);
        Ok(())
    }

    /// Bind a completion queue for one or both directions.
    pub fn bind_cq(&self, cq: Arc<CompQueue>, flags: BindFlags) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("bind flags"));
        }
        let mut ep = self.inner.lock().unwrap();
        if flags.contains(BindFlags::TRANSMIT) {
            ep.tx_cq = Some(cq.clone());
        }
        if flags.contains(BindFlags::RECV) {
            ep.rx_cq = Some(cq);
        }
        Ok(())
    }

    /// Bind a completion counter for one or both directions.
    pub fn bind_cntr(&self, cntr: Arc<Counter>, flags: BindFlags) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("bind flags"));
        }
        let mut ep = self.inner.lock().unwrap();
        if flags.contains(BindFlags::TRANSMIT) {
            ep.tx_cntr = Some(cntr.clone());
        }
        if flags.contains(BindFlags::RECV) {
            ep.rx_cntr = Some(cntr);
        }
        Ok(())
    }

    /// Bind the event queue for entry-less error reporting.
    pub fn bind_eq(&self, eq: Arc<EventQueue>) -> Result<()> {
        self.inner.lock().unwrap().eq = Some(eq);
        Ok(())
    }

    /// Enable the endpoint: declare protocol features, read back the raw NIC
    /// address and derive the shared-memory endpoint name from it.
    pub fn enable(&self) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        if ep.state != EpState::Created {
            return Err(Error::InvalidState("endpoint already enabled or closed"));
        }
        if ep.av.is_none() {
            return Err(Error::NotBound("address vector"));
        }

        let mut features = FEATURE_DELIVERY_COMPLETE;
        if ep.nic.supports_read() {
            features |= FEATURE_RDMA_READ;
        }
        if ep.cfg.zero_copy_rx {
            // Zero copy receive requires the packet header length to remain
            // constant, so application data lands at a fixed offset.
            features |= FEATURE_CONSTANT_HDR_LEN;
        }
        ep.extra_features = features;

        let raw = ep.nic.local_addr();
        if ep.shm.is_some() {
            let name = raw.to_smr_name();
            debug!(shm_name = %name, "derived shm endpoint name");
            ep.shm_name = Some(name);
        }

        ep.state = EpState::Enabled;
        Ok(())
    }

    /// Insert a peer into the bound address vector.
    pub fn insert_addr(
        &self,
        ep_addr: EpAddr,
        nic_addr: u64,
        src: SrcId,
        shm_addr: Option<u64>,
    ) -> Result<Addr> {
        let mut ep = self.inner.lock().unwrap();
        let credits = ep.cfg.peer_tx_credits;
        let av = ep.av.as_mut().ok_or(Error::NotBound("address vector"))?;
        Ok(av.insert(ep_addr, nic_addr, src, shm_addr, credits))
    }

    /// Remove a peer, invalidating completions of its in-flight packets.
    pub fn remove_addr(&self, addr: Addr) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.remove_peer(addr)
    }

    /// Send a message.
    ///
    /// # Safety
    /// Every IO segment must stay valid until the operation's completion is
    /// drained from the bound CQ.
    pub unsafe fn send(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        data: u64,
        context: u64,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_tx(OpKind::Msg, iov, desc, addr, 0, data, context, OpFlags::empty())
    }

    /// Send a message, requesting completion only after delivery at the
    /// receiver.
    ///
    /// # Safety
    /// See [`Endpoint::send`].
    pub unsafe fn send_flags(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        data: u64,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_tx(OpKind::Msg, iov, desc, addr, 0, data, context, flags)
    }

    /// Send a tagged message.
    ///
    /// # Safety
    /// See [`Endpoint::send`].
    pub unsafe fn send_tagged(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        tag: u64,
        data: u64,
        context: u64,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_tx(OpKind::Tagged, iov, desc, addr, tag, data, context, OpFlags::empty())
    }

    /// Post a receive. `addr` may be [`Addr::UNSPEC`] for a wildcard source.
    ///
    /// # Safety
    /// See [`Endpoint::send`].
    pub unsafe fn recv(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_rx(OpKind::Msg, iov, desc, addr, 0, u64::MAX, context, flags)
    }

    /// Post a tagged receive.
    ///
    /// # Safety
    /// See [`Endpoint::send`].
    pub unsafe fn recv_tagged(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_rx(
            OpKind::Tagged,
            iov,
            desc,
            addr,
            tag,
            ignore,
            context,
            OpFlags::empty(),
        )
    }

    /// RMA write into remote memory.
    ///
    /// # Safety
    /// See [`Endpoint::send`]; the remote segments must name writable
    /// registered memory at the target.
    pub unsafe fn write(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        rma: &[RmaSeg],
        data: u64,
        context: u64,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_write(iov, desc, addr, rma, data, context)
    }

    /// RMA read from remote memory.
    ///
    /// # Safety
    /// See [`Endpoint::send`]; the remote segments must name readable
    /// registered memory at the target.
    pub unsafe fn read(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        rma: &[RmaSeg],
        context: u64,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_read(iov, desc, addr, rma, context)
    }

    /// Atomic operation on a remote 64-bit word.
    ///
    /// # Safety
    /// See [`Endpoint::send`].
    pub unsafe fn atomic(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        rma: RmaSeg,
        op: AtomicOp,
        context: u64,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_atomic(OpKind::Atomic, iov, desc, addr, rma, op, &[], &[], context)
    }

    /// Atomic fetch: apply `op` remotely and return the previous value into
    /// `result`.
    ///
    /// # Safety
    /// See [`Endpoint::send`].
    pub unsafe fn fetch_atomic(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        rma: RmaSeg,
        op: AtomicOp,
        result: &[IoSeg],
        context: u64,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_atomic(
            OpKind::AtomicFetch,
            iov,
            desc,
            addr,
            rma,
            op,
            &[],
            result,
            context,
        )
    }

    /// Atomic compare-and-swap on a remote 64-bit word.
    ///
    /// # Safety
    /// See [`Endpoint::send`].
    pub unsafe fn compare_atomic(
        &self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        rma: RmaSeg,
        compare: &[IoSeg],
        result: &[IoSeg],
        context: u64,
    ) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        ep.submit_atomic(
            OpKind::AtomicCompare,
            iov,
            desc,
            addr,
            rma,
            AtomicOp::CompareSwap,
            compare,
            result,
            context,
        )
    }

    /// Cancel a posted receive by its context pointer.
    pub fn cancel(&self, context: u64) -> Result<()> {
        let mut ep = self.inner.lock().unwrap();
        if ep.cancel_recv_in(context, true)? {
            return Ok(());
        }
        ep.cancel_recv_in(context, false)?;
        Ok(())
    }

    /// Get the multi-receive retirement threshold.
    pub fn min_multi_recv(&self) -> usize {
        self.inner.lock().unwrap().min_multi_recv
    }

    /// Set the multi-receive retirement threshold.
    pub fn set_min_multi_recv(&self, size: usize) {
        self.inner.lock().unwrap().min_multi_recv = size;
    }

    /// Run one progress tick: drain CQs, replenish receives, expire
    /// backoffs, retry queued work, post pending data and flush.
    pub fn progress(&self) {
        let mut ep = self.inner.lock().unwrap();
        if ep.state == EpState::Enabled {
            ep.progress_internal();
        }
    }

    /// Effective MTU.
    pub fn mtu(&self) -> usize {
        self.inner.lock().unwrap().mtu
    }

    /// Largest payload carried by one data packet.
    pub fn max_data_payload(&self) -> usize {
        self.inner.lock().unwrap().max_data_payload
    }

    /// Shared-memory endpoint name derived at enable time.
    pub fn shm_name(&self) -> Option<String> {
        self.inner.lock().unwrap().shm_name.clone()
    }

    /// Snapshot of internal counters.
    pub fn stats(&self) -> EndpointStats {
        self.inner.lock().unwrap().stats_snapshot()
    }

    /// Close the endpoint, warning about every orphaned entry and tearing
    /// down all pools. Returns the post-teardown counters.
    pub fn close(self) -> Result<EndpointStats> {
        let mut ep = self.inner.lock().unwrap();
        ep.close_internal();
        Ok(ep.stats_snapshot())
    }
}

impl EndpointInner {
    pub(crate) fn av_ref(&self) -> &AddressVector {
        self.av.as_ref().expect("address vector bound")
    }

    pub(crate) fn av_mut(&mut self) -> &mut AddressVector {
        self.av.as_mut().expect("address vector bound")
    }

    fn check_submit(&self, iov: &[IoSeg], addr: Addr) -> Result<()> {
        if self.state != EpState::Enabled {
            return Err(Error::InvalidState("endpoint not enabled"));
        }
        if iov.len() > self.cfg.iov_limit {
            return Err(Error::IovLimitExceeded {
                count: iov.len(),
                limit: self.cfg.iov_limit,
            });
        }
        if !addr.is_unspec() && self.av_ref().peer(addr).is_none() {
            return Err(Error::AddrNotAvail);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_tx(
        &mut self,
        op: OpKind,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        tag: u64,
        data: u64,
        context: u64,
        op_flags: OpFlags,
    ) -> Result<()> {
        self.check_submit(iov, addr)?;
        if addr.is_unspec() {
            return Err(Error::AddrNotAvail);
        }

        let tx = TxEntry::new(op, addr, iov, desc, tag, data, context, op_flags);
        let tx_id = self.tx_entries.insert(tx).ok_or(Error::Again)?;
        self.start_tx(tx_id)
    }

    fn start_tx(&mut self, tx_id: usize) -> Result<()> {
        if let Err(e) = self.select_protocol(tx_id) {
            self.release_tx_entry(Owner::Tx(tx_id));
            return Err(e);
        }
        if let Err(e) = self.start_req(tx_id) {
            self.release_tx_entry(Owner::Tx(tx_id));
            return Err(e);
        }
        Ok(())
    }

    /// Attempt the initial request packet; transient back-pressure moves the
    /// entry onto the ctrl-retry queue instead of surfacing an error.
    pub(crate) fn start_req(&mut self, tx_id: usize) -> Result<()> {
        match self.post_req(tx_id) {
            Ok(()) => Ok(()),
            Err(Error::Again) => {
                let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.state = TxState::QueuedCtrl;
                tx.queued_ctrl = Some(CtrlType::Req);
                self.tx_queued_ctrl_list.push_back(tx_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn submit_write(
        &mut self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        rma: &[RmaSeg],
        data: u64,
        context: u64,
    ) -> Result<()> {
        self.check_submit(iov, addr)?;
        if addr.is_unspec() {
            return Err(Error::AddrNotAvail);
        }
        let rma_len: u64 = rma.iter().map(|s| s.len).sum();
        if (rma_len as usize) < total_iov_len(iov) {
            return Err(Error::InvalidArg("remote segments shorter than source"));
        }

        let mut tx = TxEntry::new(
            OpKind::Write,
            addr,
            iov,
            desc,
            0,
            data,
            context,
            OpFlags::empty(),
        );
        tx.rma = rma.to_vec();
        let tx_id = self.tx_entries.insert(tx).ok_or(Error::Again)?;
        self.start_tx(tx_id)
    }

    pub(crate) fn submit_read(
        &mut self,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        rma: &[RmaSeg],
        context: u64,
    ) -> Result<()> {
        self.check_submit(iov, addr)?;
        if addr.is_unspec() {
            return Err(Error::AddrNotAvail);
        }

        let use_direct = self.nic.supports_read() && {
            let peer = self.av_ref().peer(addr).expect("checked above");
            peer.features & FEATURE_RDMA_READ != 0
        };

        if use_direct {
            // One-sided read through the read engine.
            let tx = TxEntry::new(
                OpKind::ReadReq,
                addr,
                iov,
                desc,
                0,
                0,
                context,
                OpFlags::empty(),
            );
            let tx_id = self.tx_entries.insert(tx).ok_or(Error::Again)?;
            let read = ReadEntry::new(
                addr,
                Owner::Tx(tx_id),
                iov.to_vec(),
                desc.to_vec(),
                rma.to_vec(),
                total_iov_len(iov),
            );
            match self.read_entries.insert(read) {
                Some(read_id) => {
                    self.read_pending_list.push_back(read_id);
                    Ok(())
                }
                None => {
                    self.release_tx_entry(Owner::Tx(tx_id));
                    Err(Error::Again)
                }
            }
        } else {
            // Emulated: ask the target to stream the data back.
            let mut rx = RxEntry::new(
                OpKind::ReadReq,
                addr,
                iov,
                desc,
                0,
                0,
                context,
                OpFlags::empty(),
            );
            rx.state = RxState::Recv;
            rx.remote = rma.to_vec();
            rx.total_len = total_iov_len(iov);
            let rx_id = self.rx_entries.insert(rx).ok_or(Error::Again)?;
            // post_rx_ctrl_or_queue fails the entry itself on hard errors.
            self.post_rx_ctrl_or_queue(rx_id, CtrlType::ReadReq)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_atomic(
        &mut self,
        op: OpKind,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        rma: RmaSeg,
        atomic_op: AtomicOp,
        compare: &[IoSeg],
        result: &[IoSeg],
        context: u64,
    ) -> Result<()> {
        self.check_submit(iov, addr)?;
        if addr.is_unspec() {
            return Err(Error::AddrNotAvail);
        }
        if total_iov_len(iov) != 8 {
            return Err(Error::InvalidArg("atomic operand must be 8 bytes"));
        }
        if op == OpKind::AtomicCompare && total_iov_len(compare) != 8 {
            return Err(Error::InvalidArg("atomic comparand must be 8 bytes"));
        }
        if op != OpKind::Atomic && total_iov_len(result) != 8 {
            return Err(Error::InvalidArg("atomic result buffer must be 8 bytes"));
        }

        let kind = match op {
            OpKind::Atomic => AtomicKind::Plain,
            OpKind::AtomicFetch => AtomicKind::Fetch,
            OpKind::AtomicCompare => AtomicKind::Compare,
            _ => return Err(Error::InvalidArg("atomic op kind")),
        };

        // Operand (and comparand) are staged into the packet at post time;
        // stash the comparand alongside the operand iov.
        let mut full_iov = iov.to_vec();
        full_iov.extend_from_slice(compare);

        let mut tx = TxEntry::new(op, addr, &full_iov, desc, 0, 0, context, OpFlags::empty());
        // The comparand travels with the operand but is not part of the
        // user-visible transfer length.
        tx.cq_entry.len = total_iov_len(iov);
        tx.atomic = Some(AtomicInfo {
            op: atomic_op,
            kind,
            rma,
            result_iov: result.to_vec(),
        });
        let tx_id = self.tx_entries.insert(tx).ok_or(Error::Again)?;
        self.start_tx(tx_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_rx(
        &mut self,
        op: OpKind,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        addr: Addr,
        tag: u64,
        ignore: u64,
        context: u64,
        op_flags: OpFlags,
    ) -> Result<()> {
        self.check_submit(iov, addr)?;

        let rx = RxEntry::new(op, addr, iov, desc, tag, ignore, context, op_flags);
        let rx_id = self.rx_entries.insert(rx).ok_or(Error::Again)?;

        if self.cfg.zero_copy_rx && op == OpKind::Msg {
            if let Err(e) = self.post_user_recv(rx_id) {
                self.release_rx_entry(rx_id);
                return Err(e);
            }
            return Ok(());
        }

        if op_flags.contains(OpFlags::MULTI_RECV) && op == OpKind::Msg {
            self.rx_list.push_back(rx_id);
            self.drain_unexp_into_parent(rx_id);
            return Ok(());
        }

        // Check the unexpected lists first; a stored arrival wins over the
        // posted-receive lists.
        if let Some(unexp_id) = self.match_unexp(rx_id) {
            self.claim_unexp(rx_id, unexp_id);
            return Ok(());
        }

        if op == OpKind::Tagged {
            self.rx_tagged_list.push_back(rx_id);
        } else {
            self.rx_list.push_back(rx_id);
        }
        Ok(())
    }

    /// Cancel the first receive on one list whose context matches.
    /// Returns `true` when a match was found.
    pub(crate) fn cancel_recv_in(&mut self, context: u64, tagged: bool) -> Result<bool> {
        let list = if tagged {
            &self.rx_tagged_list
        } else {
            &self.rx_list
        };
        let pos = list.iter().position(|&id| {
            self.rx_entries
                .get(id)
                .map(|rx| rx.cq_entry.context == context)
                .unwrap_or(false)
        });
        let Some(pos) = pos else {
            return Ok(false);
        };

        let rx_id = if tagged {
            self.rx_tagged_list.remove(pos).unwrap()
        } else {
            self.rx_list.remove(pos).unwrap()
        };

        let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
        rx.flags.insert(EntryFlags::RECV_CANCEL);

        let is_parent = rx.flags.contains(EntryFlags::MULTI_RECV_POSTED);
        let consumers_outstanding = !rx.multi_recv_consumers.is_empty();
        let err_entry = CqErrEntry {
            context: rx.cq_entry.context,
            flags: rx.cq_entry.flags
                | if is_parent {
                    crate::entry::CompFlags::MULTI_RECV
                } else {
                    crate::entry::CompFlags::empty()
                },
            len: 0,
            tag: rx.tag,
            err: ERR_CANCELED,
            prov_errno: -ERR_CANCELED,
        };
        let state = rx.state;

        if is_parent && consumers_outstanding {
            // Defer the final multi-receive completion until the last
            // consumer finishes; the parent is already off the list so no
            // new consumers are carved.
            return Ok(true);
        }

        if let Some(rx_cq) = &self.rx_cq {
            rx_cq.write_err(err_entry);
        }

        match state {
            RxState::Init | RxState::Unexp | RxState::Matched => {
                self.release_rx_entry(rx_id);
            }
            // Entries already receiving are suppressed, not released;
            // subsequent arrivals are discarded via RECV_CANCEL.
            _ => {}
        }
        Ok(true)
    }

    pub(crate) fn remove_peer(&mut self, addr: Addr) -> Result<()> {
        let entry = self
            .av_mut()
            .remove(addr)
            .ok_or(Error::AddrNotAvail)?;
        // Invalidate in-flight packets so their completions are ignored.
        for pkt in &entry.peer.outstanding_tx_pkts {
            if let Some(meta) = self.try_pkt_meta_mut(*pkt) {
                meta.addr = None;
                meta.owner = Owner::None;
            }
        }
        Ok(())
    }

    /// Write a user TX error completion and terminate the entry.
    pub(crate) fn write_tx_error(&mut self, owner: Owner, err: i32, prov_errno: i32) {
        if let Owner::Tx(tx_id) = owner {
            if let Some(tx) = self.tx_entries.get(tx_id) {
                let err_entry = CqErrEntry {
                    context: tx.cq_entry.context,
                    flags: tx.cq_entry.flags,
                    len: tx.cq_entry.len,
                    tag: tx.tag,
                    err,
                    prov_errno,
                };
                if let Some(cq) = &self.tx_cq {
                    cq.write_err(err_entry);
                }
            }
        }
        self.release_tx_entry(owner);
    }

    /// Write a user RX error completion and terminate the entry.
    pub(crate) fn write_rx_error(&mut self, rx_id: usize, err: i32, prov_errno: i32) {
        if let Some(rx) = self.rx_entries.get(rx_id) {
            let err_entry = CqErrEntry {
                context: rx.cq_entry.context,
                flags: rx.cq_entry.flags,
                len: rx.bytes_received,
                tag: rx.tag,
                err,
                prov_errno,
            };
            if let Some(cq) = &self.rx_cq {
                cq.write_err(err_entry);
            }
        }
        self.release_rx_entry(rx_id);
    }

    /// Entry-less error: written to the event queue.
    pub(crate) fn write_eq_error(&mut self, err: i32, prov_errno: i32) {
        if let Some(eq) = &self.eq {
            eq.write_err(err, prov_errno);
        } else {
            warn!(err, prov_errno, "endpoint error with no event queue bound");
        }
    }

    /// Release a TX entry back to its pool, dropping queued packets,
    /// provider registrations and list memberships.
    pub(crate) fn release_tx_entry(&mut self, owner: Owner) {
        let (tx_id, is_readrsp) = match owner {
            Owner::Tx(i) => (i, false),
            Owner::ReadRsp(i) => (i, true),
            _ => return,
        };
        let pool_has = if is_readrsp {
            self.readrsp_tx_entries.contains(tx_id)
        } else {
            self.tx_entries.contains(tx_id)
        };
        if !pool_has {
            return;
        }

        let mut entry = if is_readrsp {
            self.readrsp_tx_entries.remove(tx_id)
        } else {
            self.tx_entries.remove(tx_id)
        };

        while let Some(pkt) = entry.queued_pkts.pop_front() {
            self.release_pkt(pkt);
        }
        for mr in entry.mr.iter_mut() {
            if let Some(handle) = mr.take() {
                self.registrar.release(handle);
            }
        }

        // Return unconsumed credits and clear stale owner back-pointers on
        // in-flight packets.
        if let Some(peer) = self.av.as_mut().and_then(|av| av.peer_mut(entry.addr)) {
            if !is_readrsp {
                peer.tx_credits += entry.credit_request;
            }
            let pkts: Vec<PktId> = peer.outstanding_tx_pkts.clone();
            for pkt in pkts {
                if let Some(meta) = self.try_pkt_meta_mut(pkt) {
                    if meta.owner == owner {
                        meta.owner = Owner::None;
                    }
                }
            }
        }

        self.tx_pending_list.retain(|&o| o != owner);
        self.tx_queued_rnr_list.retain(|&o| o != owner);
        if !is_readrsp {
            self.tx_queued_ctrl_list.retain(|&i| i != tx_id);
        }
    }

    /// Release an RX entry back to its pool. Multi-receive consumers notify
    /// their parent on the way out.
    pub(crate) fn release_rx_entry(&mut self, rx_id: usize) {
        if !self.rx_entries.contains(rx_id) {
            return;
        }
        let mut entry = self.rx_entries.remove(rx_id);
        let parent = entry.multi_recv_parent.take();

        while let Some(pkt) = entry.queued_pkts.pop_front() {
            self.release_pkt(pkt);
        }
        if let Some(pkt) = entry.unexp_pkt.take() {
            self.release_pkt(pkt);
        }
        if let Some(peer) = self.av.as_mut().and_then(|av| av.peer_mut(entry.addr)) {
            let pkts: Vec<PktId> = peer.outstanding_tx_pkts.clone();
            for pkt in pkts {
                if let Some(meta) = self.try_pkt_meta_mut(pkt) {
                    if meta.owner == Owner::Rx(rx_id) {
                        meta.owner = Owner::None;
                    }
                }
            }
        }

        self.rx_list.retain(|&i| i != rx_id);
        self.rx_tagged_list.retain(|&i| i != rx_id);
        self.rx_unexp_list.retain(|&i| i != rx_id);
        self.rx_unexp_tagged_list.retain(|&i| i != rx_id);
        self.rx_queued_rnr_list.retain(|&i| i != rx_id);
        self.rx_queued_ctrl_list.retain(|&i| i != rx_id);

        if let Some(parent_id) = parent {
            self.consumer_released(parent_id, rx_id);
        }
    }

    pub(crate) fn stats_snapshot(&self) -> EndpointStats {
        EndpointStats {
            nic_outstanding_tx: self.nic_outstanding_tx,
            shm_outstanding_tx: self.shm_outstanding_tx,
            nic_rx_pkts_posted: self.nic_rx_pkts_posted,
            tx_entries_in_use: self.tx_entries.in_use(),
            rx_entries_in_use: self.rx_entries.in_use(),
            readrsp_entries_in_use: self.readrsp_tx_entries.in_use(),
            read_entries_in_use: self.read_entries.in_use(),
            nic_tx_pkts_in_use: self.nic_tx_pkts.pool.in_use(),
            nic_rx_pkts_in_use: self.nic_rx_pkts.pool.in_use(),
            unexp_pkts_in_use: self.unexp_pkts.pool.in_use(),
            available_data_bufs: self.available_data_bufs,
            nic_rx_pool_chunks: self.nic_rx_pkts.pool.chunk_count(),
        }
    }

    fn close_internal(&mut self) {
        self.state = EpState::Closed;

        for &rx_id in self
            .rx_unexp_list
            .iter()
            .chain(self.rx_unexp_tagged_list.iter())
        {
            warn!(rx_id, "closing endpoint with unmatched unexpected rx entry");
        }
        for &rx_id in self.rx_queued_rnr_list.iter() {
            warn!(rx_id, "closing endpoint with RNR-queued rx entry");
        }
        for &rx_id in self.rx_queued_ctrl_list.iter() {
            warn!(rx_id, "closing endpoint with ctrl-queued rx entry");
        }
        for owner in self.tx_queued_rnr_list.iter() {
            warn!(?owner, "closing endpoint with RNR-queued tx entry");
        }
        for &tx_id in self.tx_queued_ctrl_list.iter() {
            warn!(tx_id, "closing endpoint with ctrl-queued tx entry");
        }

        for rx_id in self.rx_entries.indices() {
            warn!(rx_id, "closing endpoint with unreleased rx entry");
            self.release_rx_entry(rx_id);
        }
        for tx_id in self.tx_entries.indices() {
            warn!(tx_id, "closing endpoint with unreleased tx entry");
            self.release_tx_entry(Owner::Tx(tx_id));
        }
        for tx_id in self.readrsp_tx_entries.indices() {
            warn!(tx_id, "closing endpoint with unreleased read-response entry");
            self.release_tx_entry(Owner::ReadRsp(tx_id));
        }
        for read_id in self.read_entries.indices() {
            warn!(read_id, "closing endpoint with unreleased read entry");
            self.read_entries.remove(read_id);
        }

        let user_ids: Vec<usize> = self.user_pkts.iter().map(|(i, _)| i).collect();
        for slot in user_ids {
            warn!(slot, "closing endpoint with posted user receive buffer");
            self.user_pkts.remove(slot);
        }

        assert_eq!(self.tx_entries.in_use(), 0);
        assert_eq!(self.rx_entries.in_use(), 0);
        assert_eq!(self.readrsp_tx_entries.in_use(), 0);
        assert_eq!(self.read_entries.in_use(), 0);

        // Slots still out are packets posted to (or in flight on) the
        // transports being torn down; reclaim them with the pools.
        let mut reclaim = |name: &str, set: &mut PktSet| {
            let in_use = set.pool.in_use();
            if in_use > 0 {
                warn!(pool = name, in_use, "reclaiming packets at close");
                set.pool.reset();
            }
        };
        reclaim("nic tx", &mut self.nic_tx_pkts);
        reclaim("nic rx", &mut self.nic_rx_pkts);
        if let Some(set) = self.shm_tx_pkts.as_mut() {
            reclaim("shm tx", set);
        }
        if let Some(set) = self.shm_rx_pkts.as_mut() {
            reclaim("shm rx", set);
        }
        reclaim("unexpected", &mut self.unexp_pkts);
    }
}
