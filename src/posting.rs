//! Posting layer: converts transfer entries into packets and hands them to
//! the NIC or the shared-memory transport, with more-to-come batching.

use std::time::Instant;

use tracing::warn;

use crate::av::Addr;
use crate::entry::{copy_from_iov, CtrlType, EntryFlags, OpKind, Protocol, RxState, TxState};
use crate::ep::{EndpointInner, UserPkt};
use crate::error::{Error, Result};
use crate::packet::{
    write_rma_segs, AtomicHdr, AtomicKind, AtomicRspHdr, CtsHdr, DataHdr, EagerHdr, EorHdr,
    HandshakeHdr, LongReadHdr, LongReqHdr, NackHdr, Owner, PktId, PktMeta, PktSet, PoolKind,
    ReadReqHdr, ReceiptHdr, WireRmaSeg, WriteHdr, HDR_FLAG_DELIVERY_COMPLETE, HDR_FLAG_RMA,
    HDR_FLAG_TAGGED, FEATURE_CONSTANT_HDR_LEN, FEATURE_RDMA_READ,
};
use crate::transport::{Access, IoSeg, MrDesc, RecvDesc, RmaSeg, SendDesc, TransportId};

impl EndpointInner {
    pub(crate) fn pkt_set(&self, kind: PoolKind) -> &PktSet {
        match kind {
            PoolKind::NicTx => &self.nic_tx_pkts,
            PoolKind::NicRx => &self.nic_rx_pkts,
            PoolKind::ShmTx => self.shm_tx_pkts.as_ref().expect("shm enabled"),
            PoolKind::ShmRx => self.shm_rx_pkts.as_ref().expect("shm enabled"),
            PoolKind::Unexp => &self.unexp_pkts,
            _ => panic!("not a pool-backed packet"),
        }
    }

    pub(crate) fn pkt_set_mut(&mut self, kind: PoolKind) -> &mut PktSet {
        match kind {
            PoolKind::NicTx => &mut self.nic_tx_pkts,
            PoolKind::NicRx => &mut self.nic_rx_pkts,
            PoolKind::ShmTx => self.shm_tx_pkts.as_mut().expect("shm enabled"),
            PoolKind::ShmRx => self.shm_rx_pkts.as_mut().expect("shm enabled"),
            PoolKind::Unexp => &mut self.unexp_pkts,
            _ => panic!("not a pool-backed packet"),
        }
    }

    pub(crate) fn pkt_meta(&self, id: PktId) -> PktMeta {
        *self.pkt_set(id.kind).meta(id.slot)
    }

    pub(crate) fn try_pkt_meta_mut(&mut self, id: PktId) -> Option<&mut PktMeta> {
        match id.kind {
            PoolKind::User | PoolKind::ReadCtx => None,
            _ => Some(self.pkt_set_mut(id.kind).meta_mut(id.slot)),
        }
    }

    pub(crate) fn release_pkt(&mut self, id: PktId) {
        match id.kind {
            PoolKind::User => {
                if self.user_pkts.contains(id.slot as usize) {
                    self.user_pkts.remove(id.slot as usize);
                }
            }
            PoolKind::ReadCtx => {}
            _ => self.pkt_set_mut(id.kind).release(id.slot),
        }
    }

    /// Allocate a TX packet from the pool matching the peer's locality.
    pub(crate) fn alloc_tx_pkt(&mut self, addr: Addr) -> Result<PktId> {
        let local = self
            .av_ref()
            .entry(addr)
            .map(|e| e.is_local())
            .unwrap_or(false);
        let set = if local && self.shm_tx_pkts.is_some() {
            self.shm_tx_pkts.as_mut().unwrap()
        } else {
            &mut self.nic_tx_pkts
        };
        set.alloc().ok_or(Error::Again)
    }

    /// Post one packet to its transport. On success the packet is linked
    /// into the peer's outstanding list and the counters are bumped.
    pub(crate) fn send_pkt(&mut self, id: PktId, more: bool) -> Result<()> {
        let meta = self.pkt_meta(id);
        let addr = meta.addr.ok_or(Error::AddrNotAvail)?;
        let entry = self.av_ref().entry(addr).ok_or(Error::AddrNotAvail)?;

        let (dest, transport) = match id.kind {
            PoolKind::NicTx => (entry.nic_addr, TransportId::Nic),
            PoolKind::ShmTx => (
                entry.shm_addr.expect("shm packet for non-local peer"),
                TransportId::Shm,
            ),
            _ => return Err(Error::InvalidArg("packet not from a TX pool")),
        };

        let set = self.pkt_set(id.kind);
        let seg = IoSeg::new(set.pool.slot_addr(id.slot), meta.len);
        let desc = set.pool.slot_desc(id.slot);

        let sd = SendDesc {
            iov: &[seg],
            desc: &[desc],
            dest,
            token: id.token(),
            more,
        };
        match transport {
            TransportId::Nic => self.nic.post_send(&sd)?,
            TransportId::Shm => self.shm.as_mut().expect("shm enabled").post_send(&sd)?,
        }

        match transport {
            TransportId::Nic => self.nic_more_pending = more,
            TransportId::Shm => self.shm_more_pending = more,
        }
        self.record_tx_op_submitted(id);
        Ok(())
    }

    fn record_tx_op_submitted(&mut self, id: PktId) {
        let meta = self.pkt_meta(id);
        if let Some(addr) = meta.addr {
            if let Some(peer) = self.av_mut().peer_mut(addr) {
                peer.outstanding_tx_pkts.push(id);
                match id.kind {
                    PoolKind::NicTx => peer.nic_outstanding_tx_ops += 1,
                    PoolKind::ShmTx => peer.shm_outstanding_tx_ops += 1,
                    _ => {}
                }
            }
        }
        match id.kind {
            PoolKind::NicTx => self.nic_outstanding_tx += 1,
            PoolKind::ShmTx => self.shm_outstanding_tx += 1,
            _ => {}
        }
        self.owner_outstanding_add(meta.owner, 1);
    }

    /// Undo the submitted accounting when a completion (or error) for the
    /// packet arrives. Separate from releasing the buffer: an RNR'd packet
    /// is retained for retransmission.
    pub(crate) fn record_tx_op_completed(&mut self, id: PktId) {
        let meta = self.pkt_meta(id);
        if let Some(addr) = meta.addr {
            if let Some(peer) = self.av_mut().peer_mut(addr) {
                peer.outstanding_tx_pkts.retain(|&p| p != id);
                match id.kind {
                    PoolKind::NicTx => peer.nic_outstanding_tx_ops -= 1,
                    PoolKind::ShmTx => peer.shm_outstanding_tx_ops -= 1,
                    _ => {}
                }
            }
        }
        match id.kind {
            PoolKind::NicTx => self.nic_outstanding_tx -= 1,
            PoolKind::ShmTx => self.shm_outstanding_tx -= 1,
            _ => {}
        }
        self.owner_outstanding_add(meta.owner, -1);
    }

    fn owner_outstanding_add(&mut self, owner: Owner, delta: i32) {
        let count = match owner {
            Owner::Tx(i) => self.tx_entries.get_mut(i).map(|e| &mut e.pkts_outstanding),
            Owner::ReadRsp(i) => self
                .readrsp_tx_entries
                .get_mut(i)
                .map(|e| &mut e.pkts_outstanding),
            Owner::Rx(i) => self.rx_entries.get_mut(i).map(|e| &mut e.pkts_outstanding),
            _ => None,
        };
        if let Some(count) = count {
            *count = count.wrapping_add_signed(delta);
        }
    }

    /// Post the first-contact handshake advertising our extra features.
    pub(crate) fn post_handshake(&mut self, addr: Addr) -> Result<()> {
        let pkt = self.alloc_tx_pkt(addr)?;
        let features = self.extra_features;
        {
            let set = self.pkt_set_mut(pkt.kind);
            HandshakeHdr::new(features).write_to(&mut set.pool.slot_mut(pkt.slot)[..]);
            let meta = set.meta_mut(pkt.slot);
            meta.len = HandshakeHdr::SIZE;
            meta.addr = Some(addr);
            meta.owner = Owner::None;
        }
        self.send_pkt(pkt, false).map_err(|e| {
            self.release_pkt(pkt);
            e
        })
    }

    /// Post one provider-owned packet buffer as a wildcard receive.
    pub(crate) fn post_internal_recv(&mut self, transport: TransportId, more: bool) -> Result<()> {
        let set = match transport {
            TransportId::Nic => &mut self.nic_rx_pkts,
            TransportId::Shm => self.shm_rx_pkts.as_mut().ok_or(Error::OpNotSupported)?,
        };
        let id = set.alloc().ok_or(Error::Again)?;
        let seg = IoSeg::new(set.pool.slot_addr(id.slot), set.pool.slot_size());
        let desc = set.pool.slot_desc(id.slot);

        let rd = RecvDesc {
            iov: &[seg],
            desc: &[desc],
            token: id.token(),
            more,
        };
        let res = match transport {
            TransportId::Nic => self.nic.post_recv(&rd),
            TransportId::Shm => self.shm.as_mut().expect("shm enabled").post_recv(&rd),
        };
        match res {
            Ok(()) => {
                match transport {
                    TransportId::Nic => self.nic_rx_pkts_posted += 1,
                    TransportId::Shm => self.shm_rx_pkts_posted += 1,
                }
                Ok(())
            }
            Err(e) => {
                self.release_pkt(id);
                warn!(error = %e, ?transport, "failed to post internal receive buffer");
                Err(e)
            }
        }
    }

    /// Post `n` internal receives, flagging all but the last with
    /// more-to-come so the transport can defer its doorbell.
    pub(crate) fn bulk_post_internal_recv(&mut self, n: usize, transport: TransportId) -> Result<()> {
        for i in 0..n {
            self.post_internal_recv(transport, i + 1 < n)?;
        }
        Ok(())
    }

    /// Post the application's own buffer as the receive target; incoming
    /// data lands with no extra copy, with the packet header in the
    /// buffer's prefix region.
    pub(crate) fn post_user_recv(&mut self, rx_id: usize) -> Result<()> {
        let (seg, desc) = {
            let rx = self.rx_entries.get(rx_id).expect("live rx entry");
            if rx.iov.len() != 1 {
                return Err(Error::InvalidArg("zero-copy receive needs one segment"));
            }
            if rx.iov[0].len < self.msg_prefix {
                return Err(Error::InvalidArg("buffer smaller than message prefix"));
            }
            (rx.iov[0], rx.desc[0])
        };

        let slot = self.user_pkts.insert(UserPkt {
            rx_id,
            addr: seg.addr,
            capacity: seg.len,
        });
        let id = PktId {
            kind: PoolKind::User,
            slot: slot as u32,
        };

        let rd = RecvDesc {
            iov: &[seg],
            desc: &[desc],
            token: id.token(),
            more: false,
        };
        match self.nic.post_recv(&rd) {
            Ok(()) => {
                self.nic_rx_pkts_posted += 1;
                let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                rx.state = RxState::Matched;
                Ok(())
            }
            Err(e) => {
                self.user_pkts.remove(slot);
                warn!(error = %e, "failed to post user receive buffer");
                Err(e)
            }
        }
    }

    fn queued_pkts_front(&mut self, owner: Owner) -> Option<PktId> {
        match owner {
            Owner::Tx(i) => self.tx_entries.get_mut(i)?.queued_pkts.pop_front(),
            Owner::ReadRsp(i) => self.readrsp_tx_entries.get_mut(i)?.queued_pkts.pop_front(),
            Owner::Rx(i) => self.rx_entries.get_mut(i)?.queued_pkts.pop_front(),
            _ => None,
        }
    }

    fn queued_pkts_push_front(&mut self, owner: Owner, pkt: PktId) {
        match owner {
            Owner::Tx(i) => self
                .tx_entries
                .get_mut(i)
                .expect("live tx entry")
                .queued_pkts
                .push_front(pkt),
            Owner::ReadRsp(i) => self
                .readrsp_tx_entries
                .get_mut(i)
                .expect("live readrsp entry")
                .queued_pkts
                .push_front(pkt),
            Owner::Rx(i) => self
                .rx_entries
                .get_mut(i)
                .expect("live rx entry")
                .queued_pkts
                .push_front(pkt),
            _ => {}
        }
    }

    /// Replay an entry's RNR-queued packets in order. `Error::Again` leaves
    /// the remainder queued for the next progress tick.
    pub(crate) fn send_queued_pkts(&mut self, owner: Owner) -> Result<()> {
        while let Some(pkt) = self.queued_pkts_front(owner) {
            let addr = self.pkt_meta(pkt).addr;
            let Some(addr) = addr else {
                // Peer was removed; drop the retained packet.
                self.release_pkt(pkt);
                continue;
            };
            // The shm transport has no receiver-not-ready condition; a
            // packet queued while the peer flipped to the local path is
            // stale.
            let local = self
                .av_ref()
                .entry(addr)
                .map(|e| e.is_local())
                .unwrap_or(false);
            if local && pkt.kind == PoolKind::NicTx && self.shm.is_some() {
                self.release_pkt(pkt);
                continue;
            }

            match self.send_pkt(pkt, false) {
                Ok(()) => {}
                Err(Error::Again) => {
                    self.queued_pkts_push_front(owner, pkt);
                    return Err(Error::Again);
                }
                Err(e) => {
                    self.release_pkt(pkt);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Select the wire protocol for a TX entry as a function of its length,
    /// the peer's negotiated features and the transport capabilities.
    pub(crate) fn select_protocol(&mut self, tx_id: usize) -> Result<()> {
        let (op, total_len, seg_count, addr) = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            (tx.op, tx.total_len, tx.rma.len(), tx.addr)
        };
        let peer_features = self
            .av_ref()
            .peer(addr)
            .map(|p| p.features)
            .unwrap_or(0);

        let eager_max = self.mtu - EagerHdr::SIZE;
        let protocol = match op {
            OpKind::Msg | OpKind::Tagged => {
                if total_len <= eager_max {
                    Protocol::Eager
                } else if op == OpKind::Msg
                    && peer_features & FEATURE_CONSTANT_HDR_LEN != 0
                {
                    // The peer posts application buffers directly and only
                    // accepts single-packet untagged messages into them.
                    return Err(Error::MessageTooLarge {
                        size: total_len,
                        max: eager_max,
                    });
                } else if self.nic.supports_read()
                    && peer_features & FEATURE_RDMA_READ != 0
                    && total_len >= self.cfg.read_min_size
                {
                    Protocol::LongRead
                } else {
                    Protocol::LongCts
                }
            }
            OpKind::Write => {
                let overhead = WriteHdr::SIZE + seg_count * WireRmaSeg::SIZE;
                if total_len + overhead <= self.mtu {
                    Protocol::Write
                } else {
                    Protocol::LongCts
                }
            }
            OpKind::Atomic | OpKind::AtomicFetch | OpKind::AtomicCompare => {
                if AtomicHdr::SIZE + total_len > self.mtu {
                    return Err(Error::MessageTooLarge {
                        size: total_len,
                        max: self.mtu - AtomicHdr::SIZE,
                    });
                }
                Protocol::Atomic
            }
            OpKind::ReadReq | OpKind::ReadRsp => {
                return Err(Error::InvalidArg("read ops do not use request protocols"))
            }
        };
        self.tx_entries.get_mut(tx_id).expect("live tx entry").protocol = Some(protocol);
        Ok(())
    }

    /// Divide the peer's credits among its outstanding transfers and claim
    /// the request for this long message.
    pub(crate) fn set_tx_credit_request(&mut self, tx_id: usize) -> Result<()> {
        let (addr, total_len) = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            if tx.credit_request > 0 {
                return Ok(());
            }
            (tx.addr, tx.total_len)
        };
        let max_data_payload = self.max_data_payload;
        let tx_min_credits = self.cfg.tx_min_credits;

        let peer = self.av_mut().peer_mut(addr).ok_or(Error::AddrNotAvail)?;
        let outstanding = peer.nic_outstanding_tx_ops + 1;
        let mut request = (peer.tx_credits.div_ceil(outstanding))
            .min(total_len.div_ceil(max_data_payload) as u32);
        request = request.max(tx_min_credits);
        if peer.tx_credits >= request {
            peer.tx_credits -= request;
        }

        self.tx_entries.get_mut(tx_id).expect("live tx entry").credit_request = request;
        if request == 0 {
            return Err(Error::Again);
        }
        Ok(())
    }

    /// Build and post the initial request packet for a TX entry.
    pub(crate) fn post_req(&mut self, tx_id: usize) -> Result<()> {
        let protocol = self
            .tx_entries
            .get(tx_id)
            .expect("live tx entry")
            .protocol
            .expect("protocol selected");

        match protocol {
            Protocol::Eager => self.post_eager_req(tx_id),
            Protocol::LongCts => self.post_longcts_req(tx_id),
            Protocol::LongRead => self.post_longread_req(tx_id),
            Protocol::Write => self.post_write_req(tx_id),
            Protocol::Atomic => self.post_atomic_req(tx_id),
        }
    }

    fn tx_hdr_flags(&self, tx_id: usize) -> u16 {
        let tx = self.tx_entries.get(tx_id).expect("live tx entry");
        let mut flags = 0;
        if tx.op == OpKind::Tagged {
            flags |= HDR_FLAG_TAGGED;
        }
        if tx.flags.contains(EntryFlags::DELIVERY_COMPLETE) {
            flags |= HDR_FLAG_DELIVERY_COMPLETE;
        }
        flags
    }

    fn post_eager_req(&mut self, tx_id: usize) -> Result<()> {
        let (addr, total_len, data, tag, iov, dc) = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            (
                tx.addr,
                tx.total_len,
                tx.cq_entry.data,
                tx.tag,
                tx.iov.clone(),
                tx.flags.contains(EntryFlags::DELIVERY_COMPLETE),
            )
        };
        let flags = self.tx_hdr_flags(tx_id);

        let pkt = self.alloc_tx_pkt(addr)?;
        {
            let set = self.pkt_set_mut(pkt.kind);
            let buf = set.pool.slot_mut(pkt.slot);
            EagerHdr::new(flags, tx_id as u32, total_len as u32, data, tag).write_to(buf);
            if total_len > 0 {
                unsafe {
                    copy_from_iov(&iov, 0, &mut buf[EagerHdr::SIZE..EagerHdr::SIZE + total_len]);
                }
            }
            let meta = set.meta_mut(pkt.slot);
            meta.len = EagerHdr::SIZE + total_len;
            meta.addr = Some(addr);
            meta.owner = Owner::Tx(tx_id);
            meta.ack_len = if dc { 0 } else { total_len as u32 };
        }

        match self.send_pkt(pkt, false) {
            Ok(()) => {
                let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.bytes_sent = total_len;
                tx.state = TxState::Send;
                Ok(())
            }
            Err(e) => {
                self.release_pkt(pkt);
                Err(e)
            }
        }
    }

    fn post_longcts_req(&mut self, tx_id: usize) -> Result<()> {
        self.set_tx_credit_request(tx_id)?;

        let (addr, total_len, data, tag, credit_request, rma, is_write) = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            (
                tx.addr,
                tx.total_len,
                tx.cq_entry.data,
                tx.tag,
                tx.credit_request,
                tx.rma.clone(),
                tx.op == OpKind::Write,
            )
        };
        let mut flags = self.tx_hdr_flags(tx_id);
        if is_write {
            flags |= HDR_FLAG_RMA;
        }

        let pkt = self.alloc_tx_pkt(addr)?;
        {
            let set = self.pkt_set_mut(pkt.kind);
            let buf = set.pool.slot_mut(pkt.slot);
            LongReqHdr::new(
                flags,
                tx_id as u32,
                credit_request,
                rma.len() as u32,
                total_len as u64,
                data,
                tag,
            )
            .write_to(buf);
            let seg_bytes = write_rma_segs(&mut buf[LongReqHdr::SIZE..], &rma);
            let meta = set.meta_mut(pkt.slot);
            meta.len = LongReqHdr::SIZE + seg_bytes;
            meta.addr = Some(addr);
            meta.owner = Owner::Tx(tx_id);
        }

        self.send_pkt(pkt, false).map_err(|e| {
            self.release_pkt(pkt);
            e
        })
    }

    fn post_longread_req(&mut self, tx_id: usize) -> Result<()> {
        // The long-read path requires registered source segments; fall back
        // to the CTS protocol when registration fails.
        if let Err(e) = self.register_tx_iov(tx_id, Access::REMOTE_READ) {
            warn!(tx_id, error = %e, "long-read registration failed, falling back");
            self.tx_entries
                .get_mut(tx_id)
                .expect("live tx entry")
                .protocol = Some(Protocol::LongCts);
            return self.post_longcts_req(tx_id);
        }

        let (addr, total_len, data, tag, segs) = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            let mut segs = Vec::with_capacity(tx.iov.len());
            for (i, seg) in tx.iov.iter().enumerate() {
                let key = tx.mr[i]
                    .map(|h| self.registrar.descriptor(h).0)
                    .or(tx.desc[i].map(|d| d.0))
                    .unwrap_or(0);
                segs.push(RmaSeg {
                    addr: seg.addr,
                    len: seg.len as u64,
                    key,
                });
            }
            (tx.addr, tx.total_len, tx.cq_entry.data, tx.tag, segs)
        };
        let flags = self.tx_hdr_flags(tx_id);

        let pkt = self.alloc_tx_pkt(addr)?;
        {
            let set = self.pkt_set_mut(pkt.kind);
            let buf = set.pool.slot_mut(pkt.slot);
            LongReadHdr::new(
                flags,
                tx_id as u32,
                segs.len() as u32,
                total_len as u64,
                data,
                tag,
            )
            .write_to(buf);
            let seg_bytes = write_rma_segs(&mut buf[LongReadHdr::SIZE..], &segs);
            let meta = set.meta_mut(pkt.slot);
            meta.len = LongReadHdr::SIZE + seg_bytes;
            meta.addr = Some(addr);
            meta.owner = Owner::Tx(tx_id);
        }

        match self.send_pkt(pkt, false) {
            Ok(()) => {
                let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.bytes_sent = total_len;
                tx.state = TxState::Send;
                Ok(())
            }
            Err(e) => {
                self.release_pkt(pkt);
                Err(e)
            }
        }
    }

    fn post_write_req(&mut self, tx_id: usize) -> Result<()> {
        let (addr, total_len, data, iov, rma, dc) = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            (
                tx.addr,
                tx.total_len,
                tx.cq_entry.data,
                tx.iov.clone(),
                tx.rma.clone(),
                tx.flags.contains(EntryFlags::DELIVERY_COMPLETE),
            )
        };
        let flags = self.tx_hdr_flags(tx_id);

        let pkt = self.alloc_tx_pkt(addr)?;
        {
            let set = self.pkt_set_mut(pkt.kind);
            let buf = set.pool.slot_mut(pkt.slot);
            WriteHdr::new(flags, tx_id as u32, total_len as u32, rma.len() as u32, data)
                .write_to(buf);
            let mut off = WriteHdr::SIZE;
            off += write_rma_segs(&mut buf[off..], &rma);
            if total_len > 0 {
                unsafe {
                    copy_from_iov(&iov, 0, &mut buf[off..off + total_len]);
                }
            }
            let meta = set.meta_mut(pkt.slot);
            meta.len = off + total_len;
            meta.addr = Some(addr);
            meta.owner = Owner::Tx(tx_id);
            meta.ack_len = if dc { 0 } else { total_len as u32 };
        }

        match self.send_pkt(pkt, false) {
            Ok(()) => {
                let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.bytes_sent = total_len;
                tx.state = TxState::Send;
                Ok(())
            }
            Err(e) => {
                self.release_pkt(pkt);
                Err(e)
            }
        }
    }

    fn post_atomic_req(&mut self, tx_id: usize) -> Result<()> {
        let (addr, total_len, iov, info) = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            (
                tx.addr,
                tx.total_len,
                tx.iov.clone(),
                tx.atomic.clone().expect("atomic info"),
            )
        };

        let pkt = self.alloc_tx_pkt(addr)?;
        {
            let set = self.pkt_set_mut(pkt.kind);
            let buf = set.pool.slot_mut(pkt.slot);
            AtomicHdr::new(
                tx_id as u32,
                info.op,
                info.kind,
                info.rma.addr,
                info.rma.key,
            )
            .write_to(buf);
            unsafe {
                copy_from_iov(&iov, 0, &mut buf[AtomicHdr::SIZE..AtomicHdr::SIZE + total_len]);
            }
            let meta = set.meta_mut(pkt.slot);
            meta.len = AtomicHdr::SIZE + total_len;
            meta.addr = Some(addr);
            meta.owner = Owner::Tx(tx_id);
            // Fetch and compare kinds complete on the response packet.
            meta.ack_len = if info.kind == AtomicKind::Plain {
                total_len as u32
            } else {
                0
            };
        }

        match self.send_pkt(pkt, false) {
            Ok(()) => {
                let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.bytes_sent = total_len;
                tx.state = TxState::Send;
                Ok(())
            }
            Err(e) => {
                self.release_pkt(pkt);
                Err(e)
            }
        }
    }

    /// Create provider registrations for the segments of a TX entry that
    /// have no user-supplied descriptor.
    fn register_tx_iov(&mut self, tx_id: usize, access: Access) -> Result<()> {
        let segs: Vec<(usize, IoSeg)> = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            tx.iov
                .iter()
                .enumerate()
                .skip(tx.iov_mr_start)
                .filter(|(i, _)| tx.desc[*i].is_none() && tx.mr[*i].is_none())
                .map(|(i, seg)| (i, *seg))
                .collect()
        };
        for (i, seg) in segs {
            let handle = self.registrar.register(seg.addr, seg.len, access)?;
            let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
            tx.mr[i] = Some(handle);
        }
        Ok(())
    }

    /// Post one data packet for a long transfer, consuming window.
    pub(crate) fn post_data(&mut self, owner: Owner, more: bool) -> Result<()> {
        let (addr, rx_id, offset, len, iov, dc) = {
            let tx = match owner {
                Owner::Tx(i) => self.tx_entries.get(i),
                Owner::ReadRsp(i) => self.readrsp_tx_entries.get(i),
                _ => None,
            }
            .expect("live tx entry");
            let len = tx
                .window
                .min(self.max_data_payload)
                .min(tx.total_len - tx.bytes_sent);
            (
                tx.addr,
                tx.peer_rx_id.expect("CTS seen before data"),
                tx.bytes_sent,
                len,
                tx.iov.clone(),
                tx.flags.contains(EntryFlags::DELIVERY_COMPLETE),
            )
        };

        let pkt = self.alloc_tx_pkt(addr)?;
        {
            let set = self.pkt_set_mut(pkt.kind);
            let buf = set.pool.slot_mut(pkt.slot);
            DataHdr::new(rx_id, len as u32, offset as u64).write_to(buf);
            unsafe {
                copy_from_iov(&iov, offset, &mut buf[DataHdr::SIZE..DataHdr::SIZE + len]);
            }
            let meta = set.meta_mut(pkt.slot);
            meta.len = DataHdr::SIZE + len;
            meta.addr = Some(addr);
            meta.owner = owner;
            meta.ack_len = if dc { 0 } else { len as u32 };
        }

        match self.send_pkt(pkt, more) {
            Ok(()) => {
                let tx = match owner {
                    Owner::Tx(i) => self.tx_entries.get_mut(i),
                    Owner::ReadRsp(i) => self.readrsp_tx_entries.get_mut(i),
                    _ => None,
                }
                .expect("live tx entry");
                tx.bytes_sent += len;
                tx.window -= len;
                tx.state = TxState::Send;
                Ok(())
            }
            Err(e) => {
                self.release_pkt(pkt);
                Err(e)
            }
        }
    }

    /// Post a control packet owned by an RX entry.
    pub(crate) fn post_rx_ctrl(&mut self, rx_id: usize, ctrl: CtrlType) -> Result<()> {
        let (addr, tx_id, remote, total_len, atomic_rsp) = {
            let rx = self.rx_entries.get(rx_id).expect("live rx entry");
            (
                rx.addr,
                rx.tx_id,
                rx.remote.clone(),
                rx.total_len,
                rx.atomic_rsp,
            )
        };

        // CTS window sizing happens before the packet is built so a zero
        // grant can back off without consuming a buffer.
        let cts_window = if ctrl == CtrlType::Cts {
            let rx = self.rx_entries.get(rx_id).expect("live rx entry");
            let remaining = total_len - rx.bytes_granted;
            let pkts_avail = (self.cfg.cts_max_window_pkts as usize).min(self.available_data_bufs);
            let window = remaining.min(pkts_avail * self.max_data_payload);
            if window == 0 {
                return Err(Error::Again);
            }
            window
        } else {
            0
        };

        let pkt = self.alloc_tx_pkt(addr)?;
        {
            let set = self.pkt_set_mut(pkt.kind);
            let buf = set.pool.slot_mut(pkt.slot);
            let len = match ctrl {
                CtrlType::Cts => {
                    CtsHdr::new(tx_id.expect("sender id known"), rx_id as u32, cts_window as u64)
                        .write_to(buf);
                    CtsHdr::SIZE
                }
                CtrlType::Eor => {
                    EorHdr::new(tx_id.expect("sender id known"), rx_id as u32).write_to(buf);
                    EorHdr::SIZE
                }
                CtrlType::Receipt => {
                    ReceiptHdr::new(tx_id.expect("sender id known")).write_to(buf);
                    ReceiptHdr::SIZE
                }
                CtrlType::ReadReq => {
                    ReadReqHdr::new(rx_id as u32, remote.len() as u32, total_len as u64)
                        .write_to(buf);
                    ReadReqHdr::SIZE + write_rma_segs(&mut buf[ReadReqHdr::SIZE..], &remote)
                }
                CtrlType::AtomicRsp => {
                    AtomicRspHdr::new(tx_id.expect("sender id known")).write_to(buf);
                    let value = atomic_rsp.expect("stashed atomic response");
                    buf[AtomicRspHdr::SIZE..AtomicRspHdr::SIZE + 8]
                        .copy_from_slice(&value.to_le_bytes());
                    AtomicRspHdr::SIZE + 8
                }
                CtrlType::Nack => {
                    NackHdr::new(tx_id.expect("sender id known")).write_to(buf);
                    NackHdr::SIZE
                }
                CtrlType::Req => unreachable!("Req is a TX-entry control"),
            };
            let meta = set.meta_mut(pkt.slot);
            meta.len = len;
            meta.addr = Some(addr);
            meta.owner = Owner::Rx(rx_id);
        }

        match self.send_pkt(pkt, false) {
            Ok(()) => {
                if ctrl == CtrlType::Cts {
                    let max_data_payload = self.max_data_payload;
                    let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                    rx.bytes_granted += cts_window;
                    let bufs = cts_window.div_ceil(max_data_payload);
                    self.available_data_bufs = self.available_data_bufs.saturating_sub(bufs);
                    if self.available_data_bufs == 0 && self.available_data_bufs_ts.is_none() {
                        self.available_data_bufs_ts = Some(Instant::now());
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.release_pkt(pkt);
                Err(e)
            }
        }
    }

    /// Post an RX control packet, queueing the entry for retry on transient
    /// back-pressure and failing it on anything else.
    pub(crate) fn post_rx_ctrl_or_queue(&mut self, rx_id: usize, ctrl: CtrlType) -> Result<()> {
        match self.post_rx_ctrl(rx_id, ctrl) {
            Ok(()) => Ok(()),
            Err(Error::Again) => {
                let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                if rx.queued_ctrl.is_none() {
                    rx.queued_ctrl = Some(ctrl);
                    rx.state = RxState::QueuedCtrl;
                    self.rx_queued_ctrl_list.push_back(rx_id);
                }
                Ok(())
            }
            Err(e) => {
                let errno = e.errno();
                self.write_rx_error(rx_id, errno, -errno);
                Err(e)
            }
        }
    }

    /// Force out anything batched behind a more-to-come flag.
    pub(crate) fn flush_transports(&mut self) {
        if self.nic_more_pending {
            self.nic.flush();
            self.nic_more_pending = false;
        }
        if self.shm_more_pending {
            if let Some(shm) = self.shm.as_mut() {
                shm.flush();
            }
            self.shm_more_pending = false;
        }
    }
}
