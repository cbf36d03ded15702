//! Completion processing and per-packet-type handlers.
//!
//! Drains the transport completion queues and advances the owning transfer
//! entries. RNR errors requeue work; anything else becomes a user-visible
//! error completion.

use std::time::Instant;

use tracing::{debug, warn};

use crate::av::Addr;
use crate::entry::{
    copy_to_iov, CompFlags, CqErrEntry, CtrlType, EntryFlags, OpKind, RxEntry, RxState, TxEntry,
    TxState,
};
use crate::ep::EndpointInner;
use crate::error::{Error, Result};
use crate::packet::{
    peek_type, read_rma_segs, AtomicHdr, AtomicKind, AtomicOp, AtomicRspHdr, CtsHdr, DataHdr,
    EagerHdr, EorHdr, HandshakeHdr, LongReadHdr, LongReqHdr, NackHdr, Owner, PktId, PktType,
    PoolKind, ReadReqHdr, ReceiptHdr, WireRmaSeg, WriteHdr, HDR_FLAG_DELIVERY_COMPLETE,
    HDR_FLAG_RMA, HDR_FLAG_TAGGED,
};
use crate::peer::PeerFlags;
use crate::read::ReadEntry;
use crate::transport::{CompErr, CompOp, Completion, IoSeg, TransportId};

/// Error completion code for truncated receives.
const ERR_TRUNC: i32 = 90;

impl EndpointInner {
    /// Drain the NIC completion queue, bounded by `cq_read_size`.
    pub(crate) fn drain_nic_cq(&mut self) {
        let max = self.cfg.cq_read_size;
        let mut comps = Vec::with_capacity(max);
        self.nic.poll_cq(max, &mut comps);
        for comp in comps {
            self.dispatch_completion(comp, TransportId::Nic);
        }
        while let Some(err) = self.nic.poll_err() {
            self.dispatch_error(err, TransportId::Nic);
        }
    }

    /// Drain the SHM completion queue, bounded by `shm_cq_read_size`.
    pub(crate) fn drain_shm_cq(&mut self) {
        let max = self.cfg.shm_cq_read_size;
        let mut comps = Vec::with_capacity(max);
        if let Some(shm) = self.shm.as_mut() {
            shm.poll_cq(max, &mut comps);
        }
        for comp in comps {
            self.dispatch_completion(comp, TransportId::Shm);
        }
        while let Some(err) = self.shm.as_mut().and_then(|t| t.poll_err()) {
            self.dispatch_error(err, TransportId::Shm);
        }
    }

    fn dispatch_completion(&mut self, comp: Completion, transport: TransportId) {
        let id = match PktId::from_token(comp.token) {
            Ok(id) => id,
            Err(_) => {
                warn!(token = comp.token, "completion with unknown token");
                return;
            }
        };
        match comp.op {
            CompOp::Send => self.handle_send_completion(id),
            CompOp::Recv => {
                // The SHM address space is disjoint from the NIC's; both
                // resolve to endpoint-level addresses before dispatch.
                let src = comp.src.and_then(|s| match transport {
                    TransportId::Nic => self.av_ref().addr_from_src(s),
                    TransportId::Shm => self.av_ref().addr_from_shm(s.node),
                });
                self.handle_recv_completion(id, comp.len, src, transport);
            }
            CompOp::Read => self.handle_read_completion(id),
        }
    }

    fn dispatch_error(&mut self, err: CompErr, transport: TransportId) {
        let id = match PktId::from_token(err.token) {
            Ok(id) => id,
            Err(_) => {
                warn!(token = err.token, "error completion with unknown token");
                return;
            }
        };
        match err.op {
            CompOp::Send => self.handle_send_error(id, err),
            CompOp::Recv => self.handle_recv_error(id, err, transport),
            CompOp::Read => self.handle_read_error(id, err),
        }
    }

    fn handle_send_completion(&mut self, id: PktId) {
        let meta = self.pkt_meta(id);
        self.record_tx_op_completed(id);
        self.release_pkt(id);

        match meta.owner {
            Owner::Tx(tx_id) if self.tx_entries.contains(tx_id) => {
                let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.bytes_acked += meta.ack_len as usize;
                self.try_finish_tx(tx_id);
            }
            Owner::ReadRsp(tx_id) if self.readrsp_tx_entries.contains(tx_id) => {
                self.try_finish_readrsp(tx_id);
            }
            Owner::Rx(rx_id) if self.rx_entries.contains(rx_id) => {
                self.maybe_release_rx(rx_id);
            }
            _ => {}
        }
    }

    fn handle_send_error(&mut self, id: PktId, err: CompErr) {
        let meta = self.pkt_meta(id);
        self.record_tx_op_completed(id);

        if !err.rnr {
            self.release_pkt(id);
            match meta.owner {
                Owner::Tx(_) => self.write_tx_error(meta.owner, err.prov_errno, err.prov_errno),
                Owner::ReadRsp(_) => self.release_tx_entry(meta.owner),
                Owner::Rx(rx_id) => self.write_rx_error(rx_id, err.prov_errno, err.prov_errno),
                _ => self.write_eq_error(err.prov_errno, err.prov_errno),
            }
            return;
        }

        // Receiver-not-ready: retain the packet, park the owner on the RNR
        // retry queue and put the peer into its quiet period.
        let Some(addr) = meta.addr else {
            self.release_pkt(id);
            return;
        };
        self.peer_enter_backoff(addr);

        match meta.owner {
            Owner::Tx(tx_id) if self.tx_entries.contains(tx_id) => {
                let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.queued_pkts.push_back(id);
                if !tx.flags.contains(EntryFlags::QUEUED_RNR) {
                    tx.flags.insert(EntryFlags::QUEUED_RNR);
                    self.tx_queued_rnr_list.push_back(meta.owner);
                }
            }
            Owner::ReadRsp(tx_id) if self.readrsp_tx_entries.contains(tx_id) => {
                let tx = self
                    .readrsp_tx_entries
                    .get_mut(tx_id)
                    .expect("live readrsp entry");
                tx.queued_pkts.push_back(id);
                if !tx.flags.contains(EntryFlags::QUEUED_RNR) {
                    tx.flags.insert(EntryFlags::QUEUED_RNR);
                    self.tx_queued_rnr_list.push_back(meta.owner);
                }
            }
            Owner::Rx(rx_id) if self.rx_entries.contains(rx_id) => {
                let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                rx.queued_pkts.push_back(id);
                if !rx.flags.contains(EntryFlags::QUEUED_RNR) {
                    rx.flags.insert(EntryFlags::QUEUED_RNR);
                    self.rx_queued_rnr_list.push_back(rx_id);
                }
            }
            _ => {
                // A handshake hit RNR; requeue the handshake itself.
                self.release_pkt(id);
                let requeue = self
                    .av_mut()
                    .peer_mut(addr)
                    .map(|peer| {
                        peer.flags.remove(PeerFlags::HANDSHAKE_SENT);
                        if peer.flags.contains(PeerFlags::HANDSHAKE_QUEUED) {
                            false
                        } else {
                            peer.flags.insert(PeerFlags::HANDSHAKE_QUEUED);
                            true
                        }
                    })
                    .unwrap_or(false);
                if requeue {
                    self.handshake_queued_peers.push_back(addr);
                }
            }
        }
    }

    pub(crate) fn peer_enter_backoff(&mut self, addr: Addr) {
        let initial = self.cfg.rnr_backoff_initial;
        let max = self.cfg.rnr_backoff_max;
        let entered = self
            .av_mut()
            .peer_mut(addr)
            .map(|peer| {
                let was_in_backoff = peer.in_backoff();
                peer.enter_backoff(Instant::now(), initial, max);
                !was_in_backoff
            })
            .unwrap_or(false);
        if entered {
            self.peer_backoff_list.push(addr);
        }
    }

    fn handle_recv_completion(
        &mut self,
        id: PktId,
        len: usize,
        src: Option<Addr>,
        transport: TransportId,
    ) {
        match transport {
            TransportId::Nic => self.nic_rx_pkts_posted -= 1,
            TransportId::Shm => self.shm_rx_pkts_posted -= 1,
        }

        if id.kind == PoolKind::User {
            self.handle_user_recv(id, len, src);
            return;
        }

        // The buffer is read through a raw view so handlers can borrow the
        // endpoint mutably; the slot is not released or reused until after
        // processing.
        let base = {
            let set = self.pkt_set(id.kind);
            set.pool.slot_addr(id.slot)
        };
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(base as *const u8, len) };

        if let Err(e) = self.process_rx_pkt(buf, src) {
            debug!(error = %e, "dropped malformed or unroutable packet");
        }

        self.release_pkt(id);
        match transport {
            TransportId::Nic => self.nic_rx_pkts_to_post += 1,
            TransportId::Shm => self.shm_rx_pkts_to_post += 1,
        }
    }

    /// Zero-copy receive: the wire packet landed in the application buffer;
    /// only eager payloads are supported in this mode.
    fn handle_user_recv(&mut self, id: PktId, len: usize, src: Option<Addr>) {
        if !self.user_pkts.contains(id.slot as usize) {
            return;
        }
        let user = self.user_pkts.remove(id.slot as usize);
        let rx_id = user.rx_id;
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(user.addr as *const u8, len) };

        let hdr = match peek_type(buf) {
            Ok(PktType::Eager) => match EagerHdr::read_from(buf) {
                Ok(hdr) => hdr,
                Err(e) => {
                    warn!(error = %e, "malformed eager packet in zero-copy receive buffer");
                    self.write_rx_error(rx_id, e.errno(), -e.errno());
                    return;
                }
            },
            Ok(other) => {
                // Only eager payloads fit the constant-header layout. Reject
                // the request so the sender's entry terminates rather than
                // waiting for an acknowledgment that will never come.
                warn!(pkt_type = ?other, "unsupported packet in zero-copy receive buffer");
                if let Some(addr) = src {
                    self.queue_handshake_if_needed(addr);
                    if let Some(tx_id) = sender_tx_id(other, buf) {
                        self.send_target_ack(addr, tx_id, CtrlType::Nack, None);
                    }
                }
                let errno = Error::OpNotSupported.errno();
                self.write_rx_error(rx_id, errno, -errno);
                return;
            }
            Err(e) => {
                warn!(error = %e, "invalid packet in zero-copy receive buffer");
                self.write_rx_error(rx_id, e.errno(), -e.errno());
                return;
            }
        };

        if let Some(addr) = src {
            self.queue_handshake_if_needed(addr);
            if let Some(rx) = self.rx_entries.get_mut(rx_id) {
                rx.addr = addr;
            }
        }

        let payload_len = hdr.msg_len as usize;
        if let Some(rx) = self.rx_entries.get_mut(rx_id) {
            rx.state = RxState::Recv;
            rx.total_len = payload_len;
            rx.bytes_received = payload_len;
            rx.tx_id = Some(hdr.tx_id);
            rx.cq_entry.data = hdr.data;
            rx.cq_entry.tag = hdr.tag;
            rx.cq_entry.len = payload_len;
            if hdr.flags & HDR_FLAG_DELIVERY_COMPLETE != 0 {
                rx.flags.insert(EntryFlags::DELIVERY_COMPLETE);
            }
        }
        self.finish_rx_message(rx_id, false);
    }

    fn process_rx_pkt(&mut self, buf: &[u8], src: Option<Addr>) -> Result<()> {
        let typ = peek_type(buf)?;

        if let Some(addr) = src {
            if typ != PktType::Handshake {
                self.queue_handshake_if_needed(addr);
            }
        }

        match typ {
            PktType::Handshake => {
                let hdr = HandshakeHdr::read_from(buf)?;
                if let Some(addr) = src {
                    if let Some(peer) = self.av_mut().peer_mut(addr) {
                        peer.features = hdr.features;
                        peer.flags.insert(PeerFlags::HANDSHAKE_RECEIVED);
                    }
                }
                Ok(())
            }
            PktType::Eager => {
                let addr = src.ok_or(Error::AddrNotAvail)?;
                let hdr = EagerHdr::read_from(buf)?;
                let payload_end = EagerHdr::SIZE + hdr.msg_len as usize;
                if buf.len() < payload_end {
                    return Err(Error::InvalidPacket);
                }
                self.handle_eager(addr, hdr, buf)
            }
            PktType::LongReq => {
                let addr = src.ok_or(Error::AddrNotAvail)?;
                let hdr = LongReqHdr::read_from(buf)?;
                let segs = read_rma_segs(&buf[LongReqHdr::SIZE..], hdr.seg_count as usize)?;
                self.handle_longreq(addr, hdr, segs)
            }
            PktType::LongRead => {
                let addr = src.ok_or(Error::AddrNotAvail)?;
                let hdr = LongReadHdr::read_from(buf)?;
                let segs = read_rma_segs(&buf[LongReadHdr::SIZE..], hdr.seg_count as usize)?;
                self.handle_longread(addr, hdr, segs);
                Ok(())
            }
            PktType::Cts => {
                let hdr = CtsHdr::read_from(buf)?;
                self.handle_cts(hdr);
                Ok(())
            }
            PktType::Data => {
                let hdr = DataHdr::read_from(buf)?;
                let payload_end = DataHdr::SIZE + hdr.seg_len as usize;
                if buf.len() < payload_end {
                    return Err(Error::InvalidPacket);
                }
                self.handle_data(hdr, &buf[DataHdr::SIZE..payload_end]);
                Ok(())
            }
            PktType::Eor => {
                let hdr = EorHdr::read_from(buf)?;
                self.handle_tx_ack(hdr.tx_id as usize);
                Ok(())
            }
            PktType::Receipt => {
                let hdr = ReceiptHdr::read_from(buf)?;
                self.handle_tx_ack(hdr.tx_id as usize);
                Ok(())
            }
            PktType::ReadReq => {
                let addr = src.ok_or(Error::AddrNotAvail)?;
                let hdr = ReadReqHdr::read_from(buf)?;
                let segs = read_rma_segs(&buf[ReadReqHdr::SIZE..], hdr.seg_count as usize)?;
                self.handle_readreq(addr, hdr, segs);
                Ok(())
            }
            PktType::Write => {
                let addr = src.ok_or(Error::AddrNotAvail)?;
                let hdr = WriteHdr::read_from(buf)?;
                let seg_bytes = hdr.seg_count as usize * WireRmaSeg::SIZE;
                let segs = read_rma_segs(&buf[WriteHdr::SIZE..], hdr.seg_count as usize)?;
                let payload_start = WriteHdr::SIZE + seg_bytes;
                let payload_end = payload_start + hdr.msg_len as usize;
                if buf.len() < payload_end {
                    return Err(Error::InvalidPacket);
                }
                self.handle_write(addr, hdr, segs, &buf[payload_start..payload_end]);
                Ok(())
            }
            PktType::Atomic => {
                let addr = src.ok_or(Error::AddrNotAvail)?;
                let hdr = AtomicHdr::read_from(buf)?;
                self.handle_atomic(addr, hdr, &buf[AtomicHdr::SIZE..])
            }
            PktType::AtomicRsp => {
                let hdr = AtomicRspHdr::read_from(buf)?;
                if buf.len() < AtomicRspHdr::SIZE + 8 {
                    return Err(Error::InvalidPacket);
                }
                self.handle_atomicrsp(hdr, &buf[AtomicRspHdr::SIZE..AtomicRspHdr::SIZE + 8]);
                Ok(())
            }
            PktType::Nack => {
                let hdr = NackHdr::read_from(buf)?;
                self.handle_nack(hdr);
                Ok(())
            }
        }
    }

    pub(crate) fn queue_handshake_if_needed(&mut self, addr: Addr) {
        let queue = self
            .av_mut()
            .peer_mut(addr)
            .map(|peer| {
                if peer.needs_handshake() {
                    peer.flags.insert(PeerFlags::HANDSHAKE_QUEUED);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if queue {
            self.handshake_queued_peers.push_back(addr);
        }
    }

    // =========================================================================
    // Matching
    // =========================================================================

    /// Find a posted receive for an incoming message, carving a consumer
    /// from a multi-receive parent when one is at the head of the queue.
    fn match_posted(
        &mut self,
        src: Addr,
        tag: u64,
        tagged: bool,
        msg_len: usize,
    ) -> Option<usize> {
        let candidates: Vec<usize> = if tagged {
            self.rx_tagged_list.iter().copied().collect()
        } else {
            self.rx_list.iter().copied().collect()
        };

        for rx_id in candidates {
            let (is_match, is_parent) = match self.rx_entries.get(rx_id) {
                Some(rx) => (
                    rx.matches(src, tag),
                    rx.flags.contains(EntryFlags::MULTI_RECV_POSTED),
                ),
                None => continue,
            };
            if !is_match {
                continue;
            }

            if is_parent {
                let remaining = {
                    let rx = self.rx_entries.get(rx_id).expect("live rx entry");
                    rx.capacity() - rx.multi_recv_offset
                };
                if msg_len > remaining {
                    self.retire_multi_recv_parent(rx_id, None);
                    continue;
                }
                match self.carve_consumer(rx_id, src, msg_len) {
                    Some(consumer) => return Some(consumer),
                    None => return None,
                }
            }

            if tagged {
                self.rx_tagged_list.retain(|&i| i != rx_id);
            } else {
                self.rx_list.retain(|&i| i != rx_id);
            }
            return Some(rx_id);
        }
        None
    }

    /// Feed stored unexpected arrivals into a freshly posted multi-receive
    /// parent, carving one consumer per message.
    pub(crate) fn drain_unexp_into_parent(&mut self, parent_id: usize) {
        loop {
            if !self.rx_list.contains(&parent_id) {
                break;
            }
            let Some(unexp_id) = self.match_unexp(parent_id) else {
                break;
            };
            let (src, msg_len) = {
                let unexp = self.rx_entries.get(unexp_id).expect("live rx entry");
                (unexp.addr, unexp.total_len)
            };
            let remaining = {
                let parent = self.rx_entries.get(parent_id).expect("live rx entry");
                parent.capacity() - parent.multi_recv_offset
            };
            if msg_len > remaining {
                self.retire_multi_recv_parent(parent_id, None);
                break;
            }
            let Some(consumer) = self.carve_consumer(parent_id, src, msg_len) else {
                break;
            };
            self.claim_unexp(consumer, unexp_id);
        }
    }

    /// Carve a consumer child from a multi-receive parent.
    fn carve_consumer(&mut self, parent_id: usize, src: Addr, msg_len: usize) -> Option<usize> {
        let (iov, context, offset) = {
            let parent = self.rx_entries.get(parent_id).expect("live rx entry");
            (
                sub_iov(&parent.iov, parent.multi_recv_offset, msg_len),
                parent.cq_entry.context,
                parent.multi_recv_offset,
            )
        };

        let mut consumer = RxEntry::new(
            OpKind::Msg,
            src,
            &iov,
            &[],
            0,
            u64::MAX,
            context,
            crate::entry::OpFlags::empty(),
        );
        consumer.flags.insert(EntryFlags::MULTI_RECV_CONSUMER);
        consumer.multi_recv_parent = Some(parent_id);
        consumer.state = RxState::Matched;

        let consumer_id = match self.rx_entries.insert(consumer) {
            Some(id) => id,
            None => {
                warn!("rx entry pool exhausted while carving multi-recv consumer");
                return None;
            }
        };

        let retire = {
            let parent = self.rx_entries.get_mut(parent_id).expect("live rx entry");
            parent.multi_recv_offset = offset + msg_len;
            parent.multi_recv_consumers.push(consumer_id);
            parent.capacity() - parent.multi_recv_offset < self.min_multi_recv
        };
        if retire {
            self.retire_multi_recv_parent(parent_id, Some(consumer_id));
        }
        Some(consumer_id)
    }

    /// Take a multi-receive parent out of service. The buffer-released
    /// signal (`MULTI_RECV` completion flag) rides the last consumer, or a
    /// standalone completion when there is none.
    fn retire_multi_recv_parent(&mut self, parent_id: usize, last_consumer: Option<usize>) {
        self.rx_list.retain(|&i| i != parent_id);

        if let Some(consumer_id) = last_consumer {
            if let Some(consumer) = self.rx_entries.get_mut(consumer_id) {
                consumer.cq_entry.flags |= CompFlags::MULTI_RECV;
            }
            return;
        }

        let has_consumers = {
            let parent = self.rx_entries.get(parent_id).expect("live rx entry");
            !parent.multi_recv_consumers.is_empty()
        };
        if has_consumers {
            // Flag the most recent outstanding consumer instead.
            let last = *self
                .rx_entries
                .get(parent_id)
                .expect("live rx entry")
                .multi_recv_consumers
                .last()
                .unwrap();
            if let Some(consumer) = self.rx_entries.get_mut(last) {
                consumer.cq_entry.flags |= CompFlags::MULTI_RECV;
            }
        } else {
            let parent = self.rx_entries.get_mut(parent_id).expect("live rx entry");
            parent.flags.insert(EntryFlags::COMPLETED);
            let mut entry = parent.cq_entry;
            entry.flags |= CompFlags::MULTI_RECV;
            entry.len = 0;
            if let Some(cq) = &self.rx_cq {
                cq.write(entry);
            }
            self.release_rx_entry(parent_id);
        }
    }

    /// Match a newly posted receive against the unexpected lists.
    pub(crate) fn match_unexp(&mut self, posted_id: usize) -> Option<usize> {
        let tagged = {
            let posted = self.rx_entries.get(posted_id).expect("live rx entry");
            posted.op == OpKind::Tagged
        };

        let list: Vec<usize> = if tagged {
            self.rx_unexp_tagged_list.iter().copied().collect()
        } else {
            self.rx_unexp_list.iter().copied().collect()
        };

        for unexp_id in list {
            let matched = {
                let posted = self.rx_entries.get(posted_id).expect("live rx entry");
                self.rx_entries
                    .get(unexp_id)
                    .map(|u| posted.matches(u.addr, u.tag))
                    .unwrap_or(false)
            };
            if matched {
                return Some(unexp_id);
            }
        }
        None
    }

    /// Merge a stored unexpected arrival into a posted receive and resume
    /// its protocol.
    pub(crate) fn claim_unexp(&mut self, posted_id: usize, unexp_id: usize) {
        self.rx_unexp_list.retain(|&i| i != unexp_id);
        self.rx_unexp_tagged_list.retain(|&i| i != unexp_id);

        let mut unexp = self.rx_entries.remove(unexp_id);
        let unexp_pkt = unexp.unexp_pkt.take();
        {
            let posted = self.rx_entries.get_mut(posted_id).expect("live rx entry");
            posted.addr = unexp.addr;
            posted.total_len = unexp.total_len;
            posted.tx_id = unexp.tx_id;
            posted.remote = std::mem::take(&mut unexp.remote);
            posted.cq_entry.data = unexp.cq_entry.data;
            posted.cq_entry.tag = unexp.tag;
            posted.state = RxState::Matched;
            if unexp.flags.contains(EntryFlags::DELIVERY_COMPLETE) {
                posted.flags.insert(EntryFlags::DELIVERY_COMPLETE);
            }
        }

        if let Some(pkt) = unexp_pkt {
            // Eager: replay the stored packet's payload.
            let (base, len) = {
                let set = self.pkt_set(pkt.kind);
                (set.pool.slot_addr(pkt.slot), set.meta(pkt.slot).len)
            };
            let buf: &[u8] = unsafe { std::slice::from_raw_parts(base as *const u8, len) };
            if let Ok(hdr) = EagerHdr::read_from(buf) {
                let payload = &buf[EagerHdr::SIZE..EagerHdr::SIZE + hdr.msg_len as usize];
                self.deliver_eager_payload(posted_id, payload);
            }
            self.release_pkt(pkt);
            return;
        }

        let has_remote = !self
            .rx_entries
            .get(posted_id)
            .expect("live rx entry")
            .remote
            .is_empty();
        if has_remote {
            self.start_long_read(posted_id);
        } else {
            let rx = self.rx_entries.get_mut(posted_id).expect("live rx entry");
            rx.state = RxState::Recv;
            let _ = self.post_rx_ctrl_or_queue(posted_id, CtrlType::Cts);
        }
    }

    // =========================================================================
    // Message handlers
    // =========================================================================

    fn handle_eager(&mut self, addr: Addr, hdr: EagerHdr, buf: &[u8]) -> Result<()> {
        let tagged = hdr.flags & HDR_FLAG_TAGGED != 0;
        let payload = &buf[EagerHdr::SIZE..EagerHdr::SIZE + hdr.msg_len as usize];

        match self.match_posted(addr, hdr.tag, tagged, payload.len()) {
            Some(rx_id) => {
                {
                    let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                    rx.addr = addr;
                    rx.total_len = payload.len();
                    rx.tx_id = Some(hdr.tx_id);
                    rx.cq_entry.data = hdr.data;
                    rx.cq_entry.tag = hdr.tag;
                    rx.state = RxState::Recv;
                    if hdr.flags & HDR_FLAG_DELIVERY_COMPLETE != 0 {
                        rx.flags.insert(EntryFlags::DELIVERY_COMPLETE);
                    }
                }
                self.deliver_eager_payload(rx_id, payload);
                Ok(())
            }
            None => self.store_unexp(addr, hdr, tagged, buf),
        }
    }

    fn deliver_eager_payload(&mut self, rx_id: usize, payload: &[u8]) {
        let copied = {
            let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
            rx.state = RxState::Recv;
            let copied = if rx.flags.contains(EntryFlags::RECV_CANCEL) {
                0
            } else {
                unsafe { copy_to_iov(&rx.iov, 0, payload) }
            };
            rx.bytes_received = payload.len();
            copied
        };
        let truncated = copied < payload.len();
        self.finish_rx_message(rx_id, truncated);
    }

    fn store_unexp(&mut self, addr: Addr, hdr: EagerHdr, tagged: bool, buf: &[u8]) -> Result<()> {
        let pkt = match self.unexp_pkts.alloc() {
            Some(pkt) => pkt,
            None => {
                warn!("unexpected packet pool exhausted, dropping message");
                return Err(Error::Again);
            }
        };
        {
            let set = self.pkt_set_mut(pkt.kind);
            set.pool.slot_mut(pkt.slot)[..buf.len()].copy_from_slice(buf);
            let meta = set.meta_mut(pkt.slot);
            meta.len = buf.len();
            meta.addr = Some(addr);
        }

        let op = if tagged { OpKind::Tagged } else { OpKind::Msg };
        let mut rx = RxEntry::new(op, addr, &[], &[], hdr.tag, 0, 0, crate::entry::OpFlags::empty());
        rx.state = RxState::Unexp;
        rx.total_len = hdr.msg_len as usize;
        rx.tx_id = Some(hdr.tx_id);
        rx.unexp_pkt = Some(pkt);
        rx.cq_entry.data = hdr.data;
        if hdr.flags & HDR_FLAG_DELIVERY_COMPLETE != 0 {
            rx.flags.insert(EntryFlags::DELIVERY_COMPLETE);
        }

        match self.rx_entries.insert(rx) {
            Some(rx_id) => {
                if tagged {
                    self.rx_unexp_tagged_list.push_back(rx_id);
                } else {
                    self.rx_unexp_list.push_back(rx_id);
                }
                Ok(())
            }
            None => {
                self.release_pkt(pkt);
                warn!("rx entry pool exhausted, dropping unexpected message");
                Err(Error::Again)
            }
        }
    }

    fn handle_longreq(
        &mut self,
        addr: Addr,
        hdr: LongReqHdr,
        segs: Vec<crate::transport::RmaSeg>,
    ) -> Result<()> {
        if hdr.flags & HDR_FLAG_RMA != 0 {
            // Long RMA write: the wire segments name our local target memory.
            let iov: Vec<IoSeg> = segs
                .iter()
                .map(|s| IoSeg::new(s.addr, s.len as usize))
                .collect();
            let mut rx = RxEntry::new(
                OpKind::Write,
                addr,
                &iov,
                &[],
                0,
                0,
                0,
                crate::entry::OpFlags::empty(),
            );
            rx.state = RxState::Recv;
            rx.total_len = hdr.total_len as usize;
            rx.tx_id = Some(hdr.tx_id);
            rx.cq_entry.data = hdr.data;
            if hdr.flags & HDR_FLAG_DELIVERY_COMPLETE != 0 {
                rx.flags.insert(EntryFlags::DELIVERY_COMPLETE);
            }
            let rx_id = self.rx_entries.insert(rx).ok_or(Error::Again)?;
            let _ = self.post_rx_ctrl_or_queue(rx_id, CtrlType::Cts);
            return Ok(());
        }

        let tagged = hdr.flags & HDR_FLAG_TAGGED != 0;
        if self.cfg.zero_copy_rx && !tagged {
            // Untagged receives bypass software matching in zero-copy mode;
            // this request can never match. Reject it so the sender gets a
            // terminal completion.
            self.send_target_ack(addr, hdr.tx_id, CtrlType::Nack, None);
            return Ok(());
        }
        match self.match_posted(addr, hdr.tag, tagged, hdr.total_len as usize) {
            Some(rx_id) => {
                {
                    let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                    rx.addr = addr;
                    rx.total_len = hdr.total_len as usize;
                    rx.tx_id = Some(hdr.tx_id);
                    rx.cq_entry.data = hdr.data;
                    rx.cq_entry.tag = hdr.tag;
                    rx.state = RxState::Recv;
                    if hdr.flags & HDR_FLAG_DELIVERY_COMPLETE != 0 {
                        rx.flags.insert(EntryFlags::DELIVERY_COMPLETE);
                    }
                }
                let _ = self.post_rx_ctrl_or_queue(rx_id, CtrlType::Cts);
                Ok(())
            }
            None => {
                let op = if tagged { OpKind::Tagged } else { OpKind::Msg };
                let mut rx =
                    RxEntry::new(op, addr, &[], &[], hdr.tag, 0, 0, crate::entry::OpFlags::empty());
                rx.state = RxState::Unexp;
                rx.total_len = hdr.total_len as usize;
                rx.tx_id = Some(hdr.tx_id);
                rx.cq_entry.data = hdr.data;
                if hdr.flags & HDR_FLAG_DELIVERY_COMPLETE != 0 {
                    rx.flags.insert(EntryFlags::DELIVERY_COMPLETE);
                }
                let rx_id = self.rx_entries.insert(rx).ok_or(Error::Again)?;
                if tagged {
                    self.rx_unexp_tagged_list.push_back(rx_id);
                } else {
                    self.rx_unexp_list.push_back(rx_id);
                }
                Ok(())
            }
        }
    }

    fn handle_longread(&mut self, addr: Addr, hdr: LongReadHdr, segs: Vec<crate::transport::RmaSeg>) {
        let tagged = hdr.flags & HDR_FLAG_TAGGED != 0;
        if self.cfg.zero_copy_rx && !tagged {
            self.send_target_ack(addr, hdr.tx_id, CtrlType::Nack, None);
            return;
        }
        match self.match_posted(addr, hdr.tag, tagged, hdr.total_len as usize) {
            Some(rx_id) => {
                {
                    let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                    rx.addr = addr;
                    rx.total_len = hdr.total_len as usize;
                    rx.tx_id = Some(hdr.tx_id);
                    rx.remote = segs;
                    rx.cq_entry.data = hdr.data;
                    rx.cq_entry.tag = hdr.tag;
                    rx.state = RxState::Recv;
                }
                self.start_long_read(rx_id);
            }
            None => {
                let op = if tagged { OpKind::Tagged } else { OpKind::Msg };
                let mut rx =
                    RxEntry::new(op, addr, &[], &[], hdr.tag, 0, 0, crate::entry::OpFlags::empty());
                rx.state = RxState::Unexp;
                rx.total_len = hdr.total_len as usize;
                rx.tx_id = Some(hdr.tx_id);
                rx.remote = segs;
                rx.cq_entry.data = hdr.data;
                match self.rx_entries.insert(rx) {
                    Some(rx_id) => {
                        if tagged {
                            self.rx_unexp_tagged_list.push_back(rx_id);
                        } else {
                            self.rx_unexp_list.push_back(rx_id);
                        }
                    }
                    None => warn!("rx entry pool exhausted, dropping long-read request"),
                }
            }
        }
    }

    /// Hand a matched long-read receive to the read engine.
    pub(crate) fn start_long_read(&mut self, rx_id: usize) {
        let read = {
            let rx = self.rx_entries.get(rx_id).expect("live rx entry");
            ReadEntry::new(
                rx.addr,
                Owner::Rx(rx_id),
                rx.iov.clone(),
                rx.desc.clone(),
                rx.remote.clone(),
                rx.total_len,
            )
        };
        match self.read_entries.insert(read) {
            Some(read_id) => self.read_pending_list.push_back(read_id),
            None => {
                warn!(rx_id, "read entry pool exhausted");
                self.write_rx_error(rx_id, Error::Again.errno(), -Error::Again.errno());
            }
        }
    }

    fn handle_cts(&mut self, hdr: CtsHdr) {
        let tx_id = hdr.tx_id as usize;
        if !self.tx_entries.contains(tx_id) {
            return;
        }
        let push = {
            let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
            tx.peer_rx_id = Some(hdr.rx_id);
            tx.window += hdr.window as usize;
            if tx.state != TxState::Send {
                tx.state = TxState::Send;
                true
            } else {
                false
            }
        };
        if push {
            self.tx_pending_list.push_back(Owner::Tx(tx_id));
        }
    }

    fn handle_data(&mut self, hdr: DataHdr, payload: &[u8]) {
        let rx_id = hdr.rx_id as usize;
        if !self.rx_entries.contains(rx_id) {
            return;
        }

        // Return the data-buffer credit consumed when the window was
        // granted. Emulated-read streams never grant, so no credit moves.
        let granted = self
            .rx_entries
            .get(rx_id)
            .map(|rx| rx.bytes_granted > 0)
            .unwrap_or(false);
        if granted {
            let cap = self.nic_rx_pkts.pool.chunk_slots();
            self.available_data_bufs = (self.available_data_bufs + 1).min(cap);
            self.available_data_bufs_ts = None;
        }

        let (done, exhausted, truncated) = {
            let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
            let copied = if rx.flags.contains(EntryFlags::RECV_CANCEL) {
                payload.len()
            } else {
                unsafe { copy_to_iov(&rx.iov, hdr.seg_offset as usize, payload) }
            };
            rx.bytes_received += payload.len();
            (
                rx.bytes_received >= rx.total_len,
                // Only CTS-driven transfers grant windows; read-response
                // streams pace themselves.
                rx.bytes_granted > 0
                    && rx.bytes_received >= rx.bytes_granted
                    && rx.bytes_received < rx.total_len,
                copied < payload.len() && !rx.flags.contains(EntryFlags::RECV_CANCEL),
            )
        };

        if done {
            self.finish_rx_message(rx_id, truncated);
        } else if exhausted {
            let _ = self.post_rx_ctrl_or_queue(rx_id, CtrlType::Cts);
        }
    }

    /// Acknowledgment that completes a TX entry: EOR or RECEIPT.
    fn handle_tx_ack(&mut self, tx_id: usize) {
        if !self.tx_entries.contains(tx_id) {
            return;
        }
        let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
        tx.bytes_acked = tx.total_len;
        self.try_finish_tx(tx_id);
    }

    fn handle_readreq(&mut self, addr: Addr, hdr: ReadReqHdr, segs: Vec<crate::transport::RmaSeg>) {
        let iov: Vec<IoSeg> = segs
            .iter()
            .map(|s| IoSeg::new(s.addr, s.len as usize))
            .collect();
        let mut tx = TxEntry::new(
            OpKind::ReadRsp,
            addr,
            &iov,
            &[],
            0,
            0,
            0,
            crate::entry::OpFlags::empty(),
        );
        tx.peer_rx_id = Some(hdr.rx_id);
        tx.total_len = hdr.total_len as usize;
        tx.window = hdr.total_len as usize;
        tx.state = TxState::Send;

        match self.readrsp_tx_entries.insert(tx) {
            Some(id) => self.tx_pending_list.push_back(Owner::ReadRsp(id)),
            None => {
                warn!("read-response entry pool exhausted");
                self.write_eq_error(Error::Again.errno(), -Error::Again.errno());
            }
        }
    }

    fn handle_write(
        &mut self,
        addr: Addr,
        hdr: WriteHdr,
        segs: Vec<crate::transport::RmaSeg>,
        payload: &[u8],
    ) {
        let iov: Vec<IoSeg> = segs
            .iter()
            .map(|s| IoSeg::new(s.addr, s.len as usize))
            .collect();
        unsafe {
            copy_to_iov(&iov, 0, payload);
        }

        if hdr.flags & HDR_FLAG_DELIVERY_COMPLETE != 0 {
            self.send_target_ack(addr, hdr.tx_id, CtrlType::Receipt, None);
        }
    }

    fn handle_atomic(&mut self, addr: Addr, hdr: AtomicHdr, payload: &[u8]) -> Result<()> {
        let op = AtomicOp::try_from(hdr.op)?;
        let kind = AtomicKind::try_from(hdr.kind)?;
        if payload.len() < 8 || (kind == AtomicKind::Compare && payload.len() < 16) {
            return Err(Error::InvalidPacket);
        }

        let operand = u64::from_le_bytes(payload[..8].try_into().unwrap());
        let target = hdr.addr as *mut u64;
        let old = unsafe { target.read_unaligned() };
        let new = match op {
            AtomicOp::Sum => old.wrapping_add(operand),
            AtomicOp::Min => old.min(operand),
            AtomicOp::Max => old.max(operand),
            AtomicOp::Swap => operand,
            AtomicOp::CompareSwap => {
                let comparand = u64::from_le_bytes(payload[8..16].try_into().unwrap());
                if old == comparand {
                    operand
                } else {
                    old
                }
            }
        };
        unsafe { target.write_unaligned(new) };

        match kind {
            AtomicKind::Plain => {
                if hdr.flags & HDR_FLAG_DELIVERY_COMPLETE != 0 {
                    self.send_target_ack(addr, hdr.tx_id, CtrlType::Receipt, None);
                }
            }
            AtomicKind::Fetch | AtomicKind::Compare => {
                self.send_target_ack(addr, hdr.tx_id, CtrlType::AtomicRsp, Some(old));
            }
        }
        Ok(())
    }

    /// Ack an RMA/atomic request via a transient RX entry so the control
    /// packet participates in RNR retry like everything else.
    fn send_target_ack(
        &mut self,
        addr: Addr,
        tx_id: u32,
        ctrl: CtrlType,
        atomic_rsp: Option<u64>,
    ) {
        let mut rx = RxEntry::new(
            OpKind::Write,
            addr,
            &[],
            &[],
            0,
            0,
            0,
            crate::entry::OpFlags::empty(),
        );
        rx.tx_id = Some(tx_id);
        rx.atomic_rsp = atomic_rsp;
        rx.state = RxState::Recv;
        // No user completion for the target side of these ops.
        rx.flags.insert(EntryFlags::COMPLETED);

        match self.rx_entries.insert(rx) {
            Some(rx_id) => {
                let _ = self.post_rx_ctrl_or_queue(rx_id, ctrl);
                self.maybe_release_rx(rx_id);
            }
            None => warn!("rx entry pool exhausted, dropping target acknowledgment"),
        }
    }

    /// The receiver refused the request; terminate the entry with an error
    /// completion.
    fn handle_nack(&mut self, hdr: NackHdr) {
        let tx_id = hdr.tx_id as usize;
        if !self.tx_entries.contains(tx_id) {
            return;
        }
        let errno = Error::OpNotSupported.errno();
        self.write_tx_error(Owner::Tx(tx_id), errno, -errno);
    }

    fn handle_atomicrsp(&mut self, hdr: AtomicRspHdr, payload: &[u8]) {
        let tx_id = hdr.tx_id as usize;
        if !self.tx_entries.contains(tx_id) {
            return;
        }
        let result_iov = {
            let tx = self.tx_entries.get(tx_id).expect("live tx entry");
            tx.atomic.as_ref().map(|a| a.result_iov.clone())
        };
        if let Some(iov) = result_iov {
            unsafe {
                copy_to_iov(&iov, 0, payload);
            }
        }
        self.handle_tx_ack(tx_id);
    }

    // =========================================================================
    // Completion writing and entry retirement
    // =========================================================================

    /// Finish the data phase of a receive: receipt, completion, release.
    pub(crate) fn finish_rx_message(&mut self, rx_id: usize, truncated: bool) {
        let (wants_receipt, len, capacity) = {
            let rx = self.rx_entries.get(rx_id).expect("live rx entry");
            (
                rx.flags.contains(EntryFlags::DELIVERY_COMPLETE) && rx.tx_id.is_some(),
                rx.total_len,
                rx.capacity(),
            )
        };

        if wants_receipt {
            let _ = self.post_rx_ctrl_or_queue(rx_id, CtrlType::Receipt);
        }
        if !self.rx_entries.contains(rx_id) {
            // The ctrl path failed the entry.
            return;
        }

        if truncated {
            let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
            if !rx.flags.contains(EntryFlags::COMPLETED) {
                rx.flags.insert(EntryFlags::COMPLETED);
                if !rx.flags.contains(EntryFlags::RECV_CANCEL) {
                    let err = CqErrEntry {
                        context: rx.cq_entry.context,
                        flags: rx.cq_entry.flags,
                        len: capacity,
                        tag: rx.cq_entry.tag,
                        err: ERR_TRUNC,
                        prov_errno: -ERR_TRUNC,
                    };
                    if let Some(cq) = &self.rx_cq {
                        cq.write_err(err);
                    }
                }
            }
        } else {
            let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
            rx.cq_entry.len = len.min(capacity);
            self.write_rx_completion(rx_id);
        }
        self.maybe_release_rx(rx_id);
    }

    /// Write the user RX completion once, unless suppressed by cancel.
    pub(crate) fn write_rx_completion(&mut self, rx_id: usize) {
        let entry = {
            let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
            if rx.flags.contains(EntryFlags::COMPLETED) {
                return;
            }
            rx.flags.insert(EntryFlags::COMPLETED);
            if rx.flags.contains(EntryFlags::RECV_CANCEL) {
                return;
            }
            if rx.op == OpKind::Write {
                // Remote-write targets produce no user completion.
                return;
            }
            rx.cq_entry
        };
        if let Some(cq) = &self.rx_cq {
            cq.write(entry);
        }
        if let Some(cntr) = &self.rx_cntr {
            cntr.add(1);
        }
    }

    /// Release an RX entry once its completion is written and every control
    /// packet it owns has drained.
    pub(crate) fn maybe_release_rx(&mut self, rx_id: usize) {
        let ready = {
            let Some(rx) = self.rx_entries.get(rx_id) else {
                return;
            };
            rx.flags.contains(EntryFlags::COMPLETED)
                && rx.pkts_outstanding == 0
                && rx.queued_pkts.is_empty()
                && rx.queued_ctrl.is_none()
        };
        if ready {
            self.release_rx_entry(rx_id);
        }
    }

    /// Bookkeeping when a multi-receive consumer is released.
    pub(crate) fn consumer_released(&mut self, parent_id: usize, consumer_id: usize) {
        let Some(parent) = self.rx_entries.get_mut(parent_id) else {
            return;
        };
        parent.multi_recv_consumers.retain(|&c| c != consumer_id);
        let retired = !self.rx_list.contains(&parent_id);
        let drained = {
            let parent = self.rx_entries.get(parent_id).expect("live rx entry");
            parent.multi_recv_consumers.is_empty()
        };
        if retired && drained {
            let cancelled = {
                let parent = self.rx_entries.get(parent_id).expect("live rx entry");
                parent.flags.contains(EntryFlags::RECV_CANCEL)
            };
            if cancelled {
                // Deferred final multi-receive completion for a cancelled
                // parent.
                let parent = self.rx_entries.get(parent_id).expect("live rx entry");
                let err = CqErrEntry {
                    context: parent.cq_entry.context,
                    flags: parent.cq_entry.flags | CompFlags::MULTI_RECV,
                    len: 0,
                    tag: parent.tag,
                    err: crate::entry::ERR_CANCELED,
                    prov_errno: -crate::entry::ERR_CANCELED,
                };
                if let Some(cq) = &self.rx_cq {
                    cq.write_err(err);
                }
            }
            self.release_rx_entry(parent_id);
        }
    }

    /// Write the user TX completion and retire the entry once every byte is
    /// acknowledged and every owned packet has completed.
    pub(crate) fn try_finish_tx(&mut self, tx_id: usize) {
        let ready = {
            let Some(tx) = self.tx_entries.get(tx_id) else {
                return;
            };
            !tx.flags.contains(EntryFlags::COMPLETED)
                && tx.is_finished()
                && tx.queued_ctrl.is_none()
        };
        if !ready {
            return;
        }

        let entry = {
            let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
            tx.flags.insert(EntryFlags::COMPLETED);
            tx.cq_entry
        };
        if let Some(cq) = &self.tx_cq {
            cq.write(entry);
        }
        if let Some(cntr) = &self.tx_cntr {
            cntr.add(1);
        }
        self.release_tx_entry(Owner::Tx(tx_id));
    }

    /// Retire a read-response stream once fully sent.
    pub(crate) fn try_finish_readrsp(&mut self, tx_id: usize) {
        let done = {
            let Some(tx) = self.readrsp_tx_entries.get(tx_id) else {
                return;
            };
            tx.bytes_sent >= tx.total_len
                && tx.pkts_outstanding == 0
                && tx.queued_pkts.is_empty()
        };
        if done {
            self.release_tx_entry(Owner::ReadRsp(tx_id));
        }
    }

    // =========================================================================
    // Read engine completions
    // =========================================================================

    fn handle_read_completion(&mut self, id: PktId) {
        if id.kind != PoolKind::ReadCtx {
            warn!("read completion with a non-read token");
            return;
        }
        let read_id = id.slot as usize;
        if !self.read_entries.contains(read_id) {
            return;
        }
        let read = self.read_entries.remove(read_id);
        self.nic_outstanding_tx -= 1;
        if let Some(peer) = self.av_mut().peer_mut(read.addr) {
            peer.nic_outstanding_tx_ops -= 1;
        }

        match read.owner {
            Owner::Tx(tx_id) => {
                if let Some(tx) = self.tx_entries.get_mut(tx_id) {
                    tx.bytes_sent = tx.total_len;
                    tx.bytes_acked = tx.total_len;
                    self.try_finish_tx(tx_id);
                }
            }
            Owner::Rx(rx_id) => {
                if self.rx_entries.contains(rx_id) {
                    {
                        let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                        rx.bytes_received = rx.total_len;
                    }
                    // The sender holds its entry until our end-of-read.
                    let _ = self.post_rx_ctrl_or_queue(rx_id, CtrlType::Eor);
                    if self.rx_entries.contains(rx_id) {
                        let (len, cap) = {
                            let rx = self.rx_entries.get(rx_id).expect("live rx entry");
                            (rx.total_len, rx.capacity())
                        };
                        let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                        rx.cq_entry.len = len.min(cap);
                        self.write_rx_completion(rx_id);
                        self.maybe_release_rx(rx_id);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_read_error(&mut self, id: PktId, err: CompErr) {
        if id.kind != PoolKind::ReadCtx || !self.read_entries.contains(id.slot as usize) {
            return;
        }
        let read = self.read_entries.remove(id.slot as usize);
        self.nic_outstanding_tx -= 1;
        if let Some(peer) = self.av_mut().peer_mut(read.addr) {
            peer.nic_outstanding_tx_ops -= 1;
        }
        match read.owner {
            Owner::Tx(_) => self.write_tx_error(read.owner, err.prov_errno, err.prov_errno),
            Owner::Rx(rx_id) => self.write_rx_error(rx_id, err.prov_errno, err.prov_errno),
            _ => {}
        }
    }

    fn handle_recv_error(&mut self, id: PktId, err: CompErr, transport: TransportId) {
        match transport {
            TransportId::Nic => self.nic_rx_pkts_posted -= 1,
            TransportId::Shm => self.shm_rx_pkts_posted -= 1,
        }
        if id.kind == PoolKind::User {
            if self.user_pkts.contains(id.slot as usize) {
                let user = self.user_pkts.remove(id.slot as usize);
                self.write_rx_error(user.rx_id, err.prov_errno, err.prov_errno);
            }
            return;
        }
        self.release_pkt(id);
        self.write_eq_error(err.prov_errno, err.prov_errno);
    }
}

/// Sender-side entry index carried by a request packet, when it has one.
fn sender_tx_id(typ: PktType, buf: &[u8]) -> Option<u32> {
    match typ {
        PktType::LongReq => LongReqHdr::read_from(buf).ok().map(|h| h.tx_id),
        PktType::LongRead => LongReadHdr::read_from(buf).ok().map(|h| h.tx_id),
        PktType::Write => WriteHdr::read_from(buf).ok().map(|h| h.tx_id),
        PktType::Atomic => AtomicHdr::read_from(buf).ok().map(|h| h.tx_id),
        _ => None,
    }
}

/// Slice an IO vector: the segments covering `[offset, offset + len)`.
fn sub_iov(iov: &[IoSeg], offset: usize, len: usize) -> Vec<IoSeg> {
    let (mut index, mut seg_off) = crate::entry::iov_seek(iov, offset);
    let mut out = Vec::new();
    let mut remaining = len;
    while remaining > 0 && index < iov.len() {
        let seg = &iov[index];
        let n = (seg.len - seg_off).min(remaining);
        out.push(IoSeg::new(seg.addr + seg_off as u64, n));
        remaining -= n;
        index += 1;
        seg_off = 0;
    }
    out
}
