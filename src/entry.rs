//! Transfer entries: the per-operation state machines.
//!
//! A `TxEntry` or `RxEntry` describes one logical application-level
//! operation from submission to the terminal user completion. Entries live
//! in bounded pools; their stable slot index is the compact identifier
//! carried in packet headers.

use std::collections::VecDeque;

use bitflags::bitflags;

use crate::av::Addr;
use crate::packet::{AtomicKind, AtomicOp, PktId};
use crate::transport::{total_iov_len, IoSeg, MrDesc, MrHandle, RmaSeg};

/// Operation kind of a transfer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Msg,
    Tagged,
    Write,
    ReadReq,
    /// Internal: target-side response stream for an emulated read.
    ReadRsp,
    Atomic,
    AtomicFetch,
    AtomicCompare,
}

/// Wire protocol selected for a TX entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Eager,
    LongCts,
    LongRead,
    Write,
    Atomic,
}

/// Control packet kinds an entry may queue for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlType {
    /// The operation's initial request packet.
    Req,
    Cts,
    Eor,
    Receipt,
    ReadReq,
    AtomicRsp,
    Nack,
}

/// TX entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Created; no data-bearing packet handed to the transport yet.
    Req,
    /// A control packet could not be posted and is queued for retry.
    QueuedCtrl,
    /// At least one data-bearing packet reached the transport.
    Send,
}

/// RX entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Init,
    /// Created from an unexpected packet; not yet matched.
    Unexp,
    /// Matched with a posted receive; IO vector known.
    Matched,
    /// Data is flowing.
    Recv,
    /// A control packet could not be posted and is queued for retry.
    QueuedCtrl,
}

bitflags! {
    /// Transfer-entry condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// On the peer's RNR retry queue; `queued_pkts` is non-empty.
        const QUEUED_RNR = 1 << 0;
        /// Cancelled mid-receive; arrivals are sunk, no completion written.
        const RECV_CANCEL = 1 << 1;
        /// Multi-receive parent buffer posted by the application.
        const MULTI_RECV_POSTED = 1 << 2;
        /// Consumer carved from a multi-receive parent.
        const MULTI_RECV_CONSUMER = 1 << 3;
        /// Completion waits for a receipt from the receiver.
        const DELIVERY_COMPLETE = 1 << 4;
        /// The user-visible completion has been written.
        const COMPLETED = 1 << 5;
    }
}

bitflags! {
    /// Flags supplied by the application with a submission.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u64 {
        const MULTI_RECV = 1 << 0;
        const DELIVERY_COMPLETE = 1 << 1;
    }
}

bitflags! {
    /// Flags identifying the operation in a user completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompFlags: u64 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const MSG = 1 << 2;
        const TAGGED = 1 << 3;
        const RMA = 1 << 4;
        const READ = 1 << 5;
        const WRITE = 1 << 6;
        const REMOTE_READ = 1 << 7;
        const REMOTE_WRITE = 1 << 8;
        const ATOMIC = 1 << 9;
        const MULTI_RECV = 1 << 10;
    }
}

/// Descriptor delivered to the user on completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct CqEntry {
    pub context: u64,
    pub flags: CompFlags,
    pub len: usize,
    /// First-segment address, zero for empty transfers.
    pub buf: u64,
    pub data: u64,
    pub tag: u64,
}

/// Error descriptor delivered to the user.
#[derive(Debug, Clone, Copy)]
pub struct CqErrEntry {
    pub context: u64,
    pub flags: CompFlags,
    pub len: usize,
    pub tag: u64,
    pub err: i32,
    pub prov_errno: i32,
}

/// Error code written for cancelled operations.
pub const ERR_CANCELED: i32 = 125;

/// Atomic operation details carried by a TX entry.
#[derive(Debug, Clone)]
pub struct AtomicInfo {
    pub op: AtomicOp,
    pub kind: AtomicKind,
    pub rma: RmaSeg,
    /// Destination for the fetched value (fetch and compare kinds).
    pub result_iov: Vec<IoSeg>,
}

/// One outbound operation.
pub struct TxEntry {
    pub op: OpKind,
    pub addr: Addr,
    pub state: TxState,
    pub flags: EntryFlags,
    pub protocol: Option<Protocol>,
    pub iov: Vec<IoSeg>,
    /// User-supplied descriptors, parallel to `iov`.
    pub desc: Vec<Option<MrDesc>>,
    /// Provider-created registrations, parallel to `iov`.
    pub mr: Vec<Option<MrHandle>>,
    /// First segment covered by provider-created registrations.
    pub iov_mr_start: usize,
    pub total_len: usize,
    pub bytes_sent: usize,
    pub bytes_acked: usize,
    /// Flow-control credit for long protocols, in bytes.
    pub window: usize,
    pub iov_index: usize,
    pub iov_offset: usize,
    pub credit_request: u32,
    /// Receiver-side RX entry index learned from the first CTS (or from a
    /// read request, for responder streams).
    pub peer_rx_id: Option<u32>,
    pub tag: u64,
    /// Remote target segments for RMA operations.
    pub rma: Vec<RmaSeg>,
    pub atomic: Option<AtomicInfo>,
    /// Packets awaiting (re)send after RNR.
    pub queued_pkts: VecDeque<PktId>,
    pub queued_ctrl: Option<CtrlType>,
    /// Packets handed to a transport and not yet completed.
    pub pkts_outstanding: u32,
    pub cq_entry: CqEntry,
}

impl TxEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op: OpKind,
        addr: Addr,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        tag: u64,
        data: u64,
        context: u64,
        op_flags: OpFlags,
    ) -> Self {
        let total_len = total_iov_len(iov);
        let mut desc_vec = vec![None; iov.len()];
        desc_vec[..desc.len()].copy_from_slice(desc);

        let cq_flags = match op {
            OpKind::Msg => CompFlags::SEND | CompFlags::MSG,
            OpKind::Tagged => CompFlags::SEND | CompFlags::MSG | CompFlags::TAGGED,
            OpKind::Write => CompFlags::RMA | CompFlags::WRITE,
            OpKind::ReadReq => CompFlags::RMA | CompFlags::READ,
            OpKind::ReadRsp => CompFlags::empty(),
            OpKind::Atomic => CompFlags::WRITE | CompFlags::ATOMIC,
            OpKind::AtomicFetch | OpKind::AtomicCompare => {
                CompFlags::READ | CompFlags::ATOMIC
            }
        };

        let mut flags = EntryFlags::empty();
        if op_flags.contains(OpFlags::DELIVERY_COMPLETE) {
            flags |= EntryFlags::DELIVERY_COMPLETE;
        }

        Self {
            op,
            addr,
            state: TxState::Req,
            flags,
            protocol: None,
            iov: iov.to_vec(),
            desc: desc_vec,
            mr: vec![None; iov.len()],
            iov_mr_start: 0,
            total_len,
            bytes_sent: 0,
            bytes_acked: 0,
            window: 0,
            iov_index: 0,
            iov_offset: 0,
            credit_request: 0,
            peer_rx_id: None,
            tag,
            rma: Vec::new(),
            atomic: None,
            queued_pkts: VecDeque::new(),
            queued_ctrl: None,
            pkts_outstanding: 0,
            cq_entry: CqEntry {
                context,
                flags: cq_flags,
                len: total_len,
                buf: if total_len > 0 { iov[0].addr } else { 0 },
                data,
                tag,
            },
        }
    }

    /// Set the IO-vector cursor from `bytes_sent`.
    pub fn seek_cursor(&mut self) {
        let (index, offset) = iov_seek(&self.iov, self.bytes_sent);
        self.iov_index = index;
        self.iov_offset = offset;
        self.iov_mr_start = index;
    }

    /// Whether every byte has been acknowledged and every owned packet has
    /// completed.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.bytes_acked >= self.total_len
            && self.pkts_outstanding == 0
            && self.queued_pkts.is_empty()
    }
}

/// One posted or matched receive.
pub struct RxEntry {
    pub op: OpKind,
    /// `Addr::UNSPEC` until matched when the source was wildcard.
    pub addr: Addr,
    pub state: RxState,
    pub flags: EntryFlags,
    pub iov: Vec<IoSeg>,
    pub desc: Vec<Option<MrDesc>>,
    /// Expected message length; known once matched.
    pub total_len: usize,
    pub bytes_received: usize,
    /// Bytes covered by CTS windows granted so far (long protocols).
    pub bytes_granted: usize,
    pub tag: u64,
    pub ignore: u64,
    /// Sender-side TX entry index, echoed in CTS/EOR/RECEIPT.
    pub tx_id: Option<u32>,
    /// Stored packet for entries created from an unexpected arrival.
    pub unexp_pkt: Option<PktId>,
    /// Parent entry for multi-receive consumers.
    pub multi_recv_parent: Option<usize>,
    /// Outstanding consumer children of a multi-receive parent.
    pub multi_recv_consumers: Vec<usize>,
    /// Next carve offset within a multi-receive parent buffer.
    pub multi_recv_offset: usize,
    /// Sender segments to pull for the long-read protocol.
    pub remote: Vec<RmaSeg>,
    /// Fetched value retained until the atomic response can be posted.
    pub atomic_rsp: Option<u64>,
    pub queued_pkts: VecDeque<PktId>,
    pub queued_ctrl: Option<CtrlType>,
    pub pkts_outstanding: u32,
    pub cq_entry: CqEntry,
}

impl RxEntry {
    pub fn new(
        op: OpKind,
        addr: Addr,
        iov: &[IoSeg],
        desc: &[Option<MrDesc>],
        tag: u64,
        ignore: u64,
        context: u64,
        op_flags: OpFlags,
    ) -> Self {
        let cq_flags = match op {
            OpKind::Msg => CompFlags::RECV | CompFlags::MSG,
            OpKind::Tagged => CompFlags::RECV | CompFlags::MSG | CompFlags::TAGGED,
            OpKind::Write => CompFlags::REMOTE_WRITE | CompFlags::RMA,
            OpKind::ReadReq => CompFlags::RMA | CompFlags::READ,
            OpKind::ReadRsp => CompFlags::REMOTE_READ | CompFlags::RMA,
            OpKind::Atomic => CompFlags::REMOTE_WRITE | CompFlags::ATOMIC,
            OpKind::AtomicFetch | OpKind::AtomicCompare => {
                CompFlags::REMOTE_READ | CompFlags::ATOMIC
            }
        };

        let mut desc_vec = vec![None; iov.len()];
        desc_vec[..desc.len()].copy_from_slice(desc);

        let mut flags = EntryFlags::empty();
        if op_flags.contains(OpFlags::MULTI_RECV) {
            flags |= EntryFlags::MULTI_RECV_POSTED;
        }

        Self {
            op,
            addr,
            state: RxState::Init,
            flags,
            iov: iov.to_vec(),
            desc: desc_vec,
            total_len: total_iov_len(iov),
            bytes_received: 0,
            bytes_granted: 0,
            tag,
            ignore,
            tx_id: None,
            unexp_pkt: None,
            multi_recv_parent: None,
            multi_recv_consumers: Vec::new(),
            multi_recv_offset: 0,
            remote: Vec::new(),
            atomic_rsp: None,
            queued_pkts: VecDeque::new(),
            queued_ctrl: None,
            pkts_outstanding: 0,
            cq_entry: CqEntry {
                context,
                flags: cq_flags,
                len: 0,
                buf: if !iov.is_empty() { iov[0].addr } else { 0 },
                data: 0,
                tag,
            },
        }
    }

    /// Tag/address match test for incoming messages.
    pub fn matches(&self, src: Addr, tag: u64) -> bool {
        (self.addr.is_unspec() || self.addr == src) && ((self.tag ^ tag) & !self.ignore) == 0
    }

    /// Capacity left in the IO vector.
    #[inline]
    pub fn capacity(&self) -> usize {
        total_iov_len(&self.iov)
    }
}

/// Translate a flat byte offset into an `(index, offset)` IO-vector cursor.
pub fn iov_seek(iov: &[IoSeg], mut bytes: usize) -> (usize, usize) {
    for (index, seg) in iov.iter().enumerate() {
        if bytes < seg.len {
            return (index, bytes);
        }
        bytes -= seg.len;
    }
    (iov.len(), 0)
}

/// Copy `dst.len()` bytes starting at flat offset `offset` out of the IO
/// vector. Returns the number of bytes copied.
///
/// # Safety
/// Every segment address must be valid for reads of its length.
pub unsafe fn copy_from_iov(iov: &[IoSeg], offset: usize, dst: &mut [u8]) -> usize {
    let (mut index, mut seg_off) = iov_seek(iov, offset);
    let mut copied = 0;
    while copied < dst.len() && index < iov.len() {
        let seg = &iov[index];
        let n = (seg.len - seg_off).min(dst.len() - copied);
        unsafe {
            std::ptr::copy_nonoverlapping(
                (seg.addr as *const u8).add(seg_off),
                dst.as_mut_ptr().add(copied),
                n,
            );
        }
        copied += n;
        index += 1;
        seg_off = 0;
    }
    copied
}

/// Copy `src` into the IO vector starting at flat offset `offset`. Returns
/// the number of bytes copied (clipped to the vector's capacity).
///
/// # Safety
/// Every segment address must be valid for writes of its length.
pub unsafe fn copy_to_iov(iov: &[IoSeg], offset: usize, src: &[u8]) -> usize {
    let (mut index, mut seg_off) = iov_seek(iov, offset);
    let mut copied = 0;
    while copied < src.len() && index < iov.len() {
        let seg = &iov[index];
        let n = (seg.len - seg_off).min(src.len() - copied);
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                (seg.addr as *mut u8).add(seg_off),
                n,
            );
        }
        copied += n;
        index += 1;
        seg_off = 0;
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iov_seek() {
        let iov = [IoSeg::new(0, 10), IoSeg::new(0, 20), IoSeg::new(0, 5)];
        assert_eq!(iov_seek(&iov, 0), (0, 0));
        assert_eq!(iov_seek(&iov, 9), (0, 9));
        assert_eq!(iov_seek(&iov, 10), (1, 0));
        assert_eq!(iov_seek(&iov, 29), (1, 19));
        assert_eq!(iov_seek(&iov, 34), (2, 4));
        assert_eq!(iov_seek(&iov, 35), (3, 0));
    }

    #[test]
    fn test_iov_copy_roundtrip() {
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        let iov = [IoSeg::from_slice(&a), IoSeg::from_slice(&b)];
        // Keep the backing buffers alive past the raw-pointer uses.
        let payload: Vec<u8> = (0u8..24).collect();

        let written = unsafe { copy_to_iov(&iov, 4, &payload) };
        assert_eq!(written, 24);

        let mut out = vec![0u8; 24];
        let read = unsafe { copy_from_iov(&iov, 4, &mut out) };
        assert_eq!(read, 24);
        assert_eq!(out, payload);

        a.clear();
        b.clear();
    }

    #[test]
    fn test_tx_entry_invariant_on_init() {
        let buf = vec![7u8; 100];
        let iov = [IoSeg::from_slice(&buf)];
        let tx = TxEntry::new(
            OpKind::Msg,
            Addr(0),
            &iov,
            &[],
            0,
            0,
            0x1234,
            OpFlags::empty(),
        );

        assert_eq!(tx.state, TxState::Req);
        assert!(tx.bytes_acked <= tx.bytes_sent && tx.bytes_sent <= tx.total_len);
        assert_eq!(tx.total_len, 100);
        assert_eq!(tx.cq_entry.context, 0x1234);
        assert!(tx.cq_entry.flags.contains(CompFlags::SEND | CompFlags::MSG));
    }

    #[test]
    fn test_rx_matching() {
        let rx = RxEntry::new(
            OpKind::Tagged,
            Addr(3),
            &[],
            &[],
            0xAB00,
            0x00FF,
            0,
            OpFlags::empty(),
        );

        assert!(rx.matches(Addr(3), 0xAB00));
        assert!(rx.matches(Addr(3), 0xAB42)); // ignored bits differ
        assert!(!rx.matches(Addr(3), 0xAC00));
        assert!(!rx.matches(Addr(4), 0xAB00));

        let wild = RxEntry::new(
            OpKind::Msg,
            Addr::UNSPEC,
            &[],
            &[],
            0,
            u64::MAX,
            0,
            OpFlags::empty(),
        );
        assert!(wild.matches(Addr(9), 0xFFFF));
    }
}
