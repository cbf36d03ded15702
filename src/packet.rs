//! Packet entries and the wire protocol headers.
//!
//! Every packet buffer lives in one of the endpoint's pools (or is carved
//! from a user buffer in zero-copy receive mode); the pool kind plus slot
//! index forms a compact packet identifier that rides through the transport
//! as the 64-bit work-request token.

use crate::av::Addr;
use crate::error::{Error, Result};
use crate::pool::PktPool;
use crate::transport::RmaSeg;

/// Magic byte marking a valid packet header.
pub const PKT_MAGIC: u8 = 0xD7;

/// Extra-feature bits advertised in a handshake.
pub const FEATURE_RDMA_READ: u64 = 1 << 0;
pub const FEATURE_DELIVERY_COMPLETE: u64 = 1 << 1;
pub const FEATURE_CONSTANT_HDR_LEN: u64 = 1 << 2;

/// Header flag: the message carries a tag.
pub const HDR_FLAG_TAGGED: u16 = 1 << 0;
/// Header flag: the sender asks for a receipt on delivery.
pub const HDR_FLAG_DELIVERY_COMPLETE: u16 = 1 << 1;
/// Header flag: the request targets remote memory (long write).
pub const HDR_FLAG_RMA: u16 = 1 << 2;

/// Wire packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// First-contact control packet carrying protocol features.
    Handshake = 1,
    /// Whole message in one packet.
    Eager = 2,
    /// Long-message request; receiver answers with CTS windows.
    LongReq = 3,
    /// Clear-to-send window grant.
    Cts = 4,
    /// One data segment of a long transfer.
    Data = 5,
    /// End-of-read notification from the reading side.
    Eor = 6,
    /// Delivery receipt.
    Receipt = 7,
    /// RMA read request serviced by the target streaming data back.
    ReadReq = 8,
    /// Eager RMA write.
    Write = 9,
    /// Atomic operation.
    Atomic = 10,
    /// Atomic fetch/compare response.
    AtomicRsp = 11,
    /// Long-message request served by the receiver reading from the sender.
    LongRead = 12,
    /// Receiver-side rejection of a request it cannot service; terminates
    /// the sender's entry with an error completion.
    Nack = 13,
}

impl TryFrom<u8> for PktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PktType::Handshake),
            2 => Ok(PktType::Eager),
            3 => Ok(PktType::LongReq),
            4 => Ok(PktType::Cts),
            5 => Ok(PktType::Data),
            6 => Ok(PktType::Eor),
            7 => Ok(PktType::Receipt),
            8 => Ok(PktType::ReadReq),
            9 => Ok(PktType::Write),
            10 => Ok(PktType::Atomic),
            11 => Ok(PktType::AtomicRsp),
            12 => Ok(PktType::LongRead),
            13 => Ok(PktType::Nack),
            other => Err(Error::InvalidPacketType(other)),
        }
    }
}

macro_rules! wire_hdr {
    ($name:ident) => {
        impl $name {
            pub const SIZE: usize = std::mem::size_of::<$name>();

            /// Serialize into the front of `buf`.
            #[inline]
            pub fn write_to(&self, buf: &mut [u8]) {
                assert!(buf.len() >= Self::SIZE);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self as *const Self as *const u8,
                        buf.as_mut_ptr(),
                        Self::SIZE,
                    );
                }
            }

            /// Deserialize from the front of `buf`.
            #[inline]
            pub fn read_from(buf: &[u8]) -> Result<Self> {
                if buf.len() < Self::SIZE {
                    return Err(Error::InvalidPacket);
                }
                let mut hdr = std::mem::MaybeUninit::<Self>::uninit();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        buf.as_ptr(),
                        hdr.as_mut_ptr() as *mut u8,
                        Self::SIZE,
                    );
                    Ok(hdr.assume_init())
                }
            }
        }
    };
}

/// Peek the type of an incoming packet, validating the magic byte.
pub fn peek_type(buf: &[u8]) -> Result<PktType> {
    if buf.len() < 2 {
        return Err(Error::InvalidPacket);
    }
    if buf[0] != PKT_MAGIC {
        return Err(Error::InvalidMagic {
            expected: PKT_MAGIC,
            got: buf[0],
        });
    }
    PktType::try_from(buf[1])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct HandshakeHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub features: u64,
}
wire_hdr!(HandshakeHdr);

impl HandshakeHdr {
    pub fn new(features: u64) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Handshake as u8,
            flags: 0,
            features,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct EagerHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    /// Sender-side TX entry index, echoed in receipts.
    pub tx_id: u32,
    pub msg_len: u32,
    pub data: u64,
    pub tag: u64,
}
wire_hdr!(EagerHdr);

impl EagerHdr {
    pub fn new(flags: u16, tx_id: u32, msg_len: u32, data: u64, tag: u64) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Eager as u8,
            flags,
            tx_id,
            msg_len,
            data,
            tag,
        }
    }
}

/// Long-message request. For long RMA writes (`HDR_FLAG_RMA`) it is followed
/// by `seg_count` wire RMA segments describing the target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct LongReqHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
    pub credit_request: u32,
    pub seg_count: u32,
    pub total_len: u64,
    pub data: u64,
    pub tag: u64,
}
wire_hdr!(LongReqHdr);

impl LongReqHdr {
    pub fn new(
        flags: u16,
        tx_id: u32,
        credit_request: u32,
        seg_count: u32,
        total_len: u64,
        data: u64,
        tag: u64,
    ) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::LongReq as u8,
            flags,
            tx_id,
            credit_request,
            seg_count,
            total_len,
            data,
            tag,
        }
    }
}

/// Long-read request: the receiver pulls the payload from the sender's
/// registered segments, then sends an EOR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct LongReadHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
    pub seg_count: u32,
    pub total_len: u64,
    pub data: u64,
    pub tag: u64,
}
wire_hdr!(LongReadHdr);

impl LongReadHdr {
    pub fn new(
        flags: u16,
        tx_id: u32,
        seg_count: u32,
        total_len: u64,
        data: u64,
        tag: u64,
    ) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::LongRead as u8,
            flags,
            tx_id,
            seg_count,
            total_len,
            data,
            tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct CtsHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
    /// Receiver-side RX entry index for subsequent DATA packets.
    pub rx_id: u32,
    pub window: u64,
}
wire_hdr!(CtsHdr);

impl CtsHdr {
    pub fn new(tx_id: u32, rx_id: u32, window: u64) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Cts as u8,
            flags: 0,
            tx_id,
            rx_id,
            window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct DataHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub rx_id: u32,
    pub seg_len: u32,
    pub seg_offset: u64,
}
wire_hdr!(DataHdr);

impl DataHdr {
    pub fn new(rx_id: u32, seg_len: u32, seg_offset: u64) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Data as u8,
            flags: 0,
            rx_id,
            seg_len,
            seg_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct EorHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
    pub rx_id: u32,
}
wire_hdr!(EorHdr);

impl EorHdr {
    pub fn new(tx_id: u32, rx_id: u32) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Eor as u8,
            flags: 0,
            tx_id,
            rx_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct ReceiptHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
}
wire_hdr!(ReceiptHdr);

impl ReceiptHdr {
    pub fn new(tx_id: u32) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Receipt as u8,
            flags: 0,
            tx_id,
        }
    }
}

/// Emulated RMA read request: followed by `seg_count` wire RMA segments the
/// target streams back as DATA packets addressed to `rx_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct ReadReqHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub rx_id: u32,
    pub seg_count: u32,
    pub total_len: u64,
}
wire_hdr!(ReadReqHdr);

impl ReadReqHdr {
    pub fn new(rx_id: u32, seg_count: u32, total_len: u64) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::ReadReq as u8,
            flags: 0,
            rx_id,
            seg_count,
            total_len,
        }
    }
}

/// Eager RMA write: followed by `seg_count` wire RMA segments and the
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct WriteHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
    pub msg_len: u32,
    pub seg_count: u32,
    pub data: u64,
}
wire_hdr!(WriteHdr);

impl WriteHdr {
    pub fn new(flags: u16, tx_id: u32, msg_len: u32, seg_count: u32, data: u64) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Write as u8,
            flags,
            tx_id,
            msg_len,
            seg_count,
            data,
        }
    }
}

/// Atomic operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomicOp {
    Sum = 0,
    Min = 1,
    Max = 2,
    Swap = 3,
    CompareSwap = 4,
}

impl TryFrom<u8> for AtomicOp {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AtomicOp::Sum),
            1 => Ok(AtomicOp::Min),
            2 => Ok(AtomicOp::Max),
            3 => Ok(AtomicOp::Swap),
            4 => Ok(AtomicOp::CompareSwap),
            other => Err(Error::InvalidPacketType(other)),
        }
    }
}

/// Atomic request kind: plain, fetch, or compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomicKind {
    Plain = 0,
    Fetch = 1,
    Compare = 2,
}

impl TryFrom<u8> for AtomicKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AtomicKind::Plain),
            1 => Ok(AtomicKind::Fetch),
            2 => Ok(AtomicKind::Compare),
            other => Err(Error::InvalidPacketType(other)),
        }
    }
}

/// Atomic request on a single 64-bit word; the operand (and comparand for
/// compare-swap) follow as payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct AtomicHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
    pub op: u8,
    pub kind: u8,
    pub pad: [u8; 2],
    pub addr: u64,
    pub key: u64,
}
wire_hdr!(AtomicHdr);

impl AtomicHdr {
    pub fn new(tx_id: u32, op: AtomicOp, kind: AtomicKind, addr: u64, key: u64) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Atomic as u8,
            flags: 0,
            tx_id,
            op: op as u8,
            kind: kind as u8,
            pad: [0; 2],
            addr,
            key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct AtomicRspHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
}
wire_hdr!(AtomicRspHdr);

impl AtomicRspHdr {
    pub fn new(tx_id: u32) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::AtomicRsp as u8,
            flags: 0,
            tx_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct NackHdr {
    pub magic: u8,
    pub typ: u8,
    pub flags: u16,
    pub tx_id: u32,
}
wire_hdr!(NackHdr);

impl NackHdr {
    pub fn new(tx_id: u32) -> Self {
        Self {
            magic: PKT_MAGIC,
            typ: PktType::Nack as u8,
            flags: 0,
            tx_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct WireRmaSeg {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}
wire_hdr!(WireRmaSeg);

/// Append RMA segments after a header; returns bytes written.
pub fn write_rma_segs(buf: &mut [u8], segs: &[RmaSeg]) -> usize {
    let mut off = 0;
    for seg in segs {
        WireRmaSeg {
            addr: seg.addr,
            len: seg.len,
            key: seg.key,
        }
        .write_to(&mut buf[off..]);
        off += WireRmaSeg::SIZE;
    }
    off
}

/// Read `count` RMA segments from the front of `buf`.
pub fn read_rma_segs(buf: &[u8], count: usize) -> Result<Vec<RmaSeg>> {
    if buf.len() < count * WireRmaSeg::SIZE {
        return Err(Error::InvalidPacket);
    }
    let mut segs = Vec::with_capacity(count);
    for i in 0..count {
        let wire = WireRmaSeg::read_from(&buf[i * WireRmaSeg::SIZE..])?;
        segs.push(RmaSeg {
            addr: wire.addr,
            len: wire.len,
            key: wire.key,
        });
    }
    Ok(segs)
}

/// Largest fixed header; the zero-copy receive prefix reserves this much.
pub fn max_hdr_size() -> usize {
    LongReqHdr::SIZE
        .max(LongReadHdr::SIZE)
        .max(EagerHdr::SIZE)
        .max(AtomicHdr::SIZE)
        .max(WriteHdr::SIZE)
}

// =============================================================================
// Packet entries
// =============================================================================

/// Which pool a packet buffer was allocated from. Dispatch between the NIC
/// and SHM transports keys off this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolKind {
    NicTx = 0,
    NicRx = 1,
    ShmTx = 2,
    ShmRx = 3,
    /// Copies of unexpected packets; never posted to hardware.
    Unexp = 4,
    /// Carved from an application buffer (zero-copy receive).
    User = 5,
    /// One-sided read context, not a packet buffer.
    ReadCtx = 6,
}

impl PoolKind {
    /// Transport this pool posts to, if any.
    pub fn transport(&self) -> Option<crate::transport::TransportId> {
        match self {
            PoolKind::NicTx | PoolKind::NicRx | PoolKind::User => {
                Some(crate::transport::TransportId::Nic)
            }
            PoolKind::ShmTx | PoolKind::ShmRx => Some(crate::transport::TransportId::Shm),
            PoolKind::Unexp | PoolKind::ReadCtx => None,
        }
    }
}

/// Compact packet identifier: pool kind plus slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktId {
    pub kind: PoolKind,
    pub slot: u32,
}

impl PktId {
    /// Encode into a transport work-request token.
    #[inline]
    pub fn token(&self) -> u64 {
        ((self.kind as u64) << 32) | self.slot as u64
    }

    /// Decode from a transport work-request token.
    pub fn from_token(token: u64) -> Result<Self> {
        let kind = match token >> 32 {
            0 => PoolKind::NicTx,
            1 => PoolKind::NicRx,
            2 => PoolKind::ShmTx,
            3 => PoolKind::ShmRx,
            4 => PoolKind::Unexp,
            5 => PoolKind::User,
            6 => PoolKind::ReadCtx,
            _ => return Err(Error::InvalidPacket),
        };
        Ok(Self {
            kind,
            slot: token as u32,
        })
    }
}

/// Weak back-reference from a packet to its owning transfer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Owner {
    #[default]
    None,
    Tx(usize),
    Rx(usize),
    Read(usize),
    /// Responder stream of an emulated read; lives in its own pool.
    ReadRsp(usize),
}

/// Per-packet bookkeeping kept alongside the pool slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PktMeta {
    /// Valid bytes in the buffer.
    pub len: usize,
    /// Destination (TX) or resolved source (RX).
    pub addr: Option<Addr>,
    pub owner: Owner,
    /// Bytes of user payload acknowledged when this packet's send completes.
    pub ack_len: u32,
}

/// A packet pool plus the per-slot metadata.
pub(crate) struct PktSet {
    pub kind: PoolKind,
    pub pool: PktPool,
    meta: Vec<PktMeta>,
}

impl PktSet {
    pub fn new(kind: PoolKind, pool: PktPool) -> Self {
        Self {
            kind,
            pool,
            meta: Vec::new(),
        }
    }

    pub fn alloc(&mut self) -> Option<PktId> {
        let slot = self.pool.acquire()?;
        if self.meta.len() < self.pool.capacity() {
            self.meta.resize(self.pool.capacity(), PktMeta::default());
        }
        self.meta[slot as usize] = PktMeta::default();
        Some(PktId {
            kind: self.kind,
            slot,
        })
    }

    pub fn release(&mut self, slot: u32) {
        self.meta[slot as usize] = PktMeta::default();
        self.pool.release(slot);
    }

    #[inline]
    pub fn meta(&self, slot: u32) -> &PktMeta {
        &self.meta[slot as usize]
    }

    #[inline]
    pub fn meta_mut(&mut self, slot: u32) -> &mut PktMeta {
        &mut self.meta[slot as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdr_sizes_stable() {
        assert_eq!(HandshakeHdr::SIZE, 12);
        assert_eq!(EagerHdr::SIZE, 28);
        assert_eq!(CtsHdr::SIZE, 20);
        assert_eq!(DataHdr::SIZE, 20);
        assert_eq!(EorHdr::SIZE, 12);
        assert_eq!(ReceiptHdr::SIZE, 8);
        assert_eq!(NackHdr::SIZE, 8);
        assert_eq!(WireRmaSeg::SIZE, 24);
    }

    #[test]
    fn test_eager_roundtrip() {
        let hdr = EagerHdr::new(HDR_FLAG_TAGGED, 7, 4096, 0xDEAD, 0xBEEF);
        let mut buf = [0u8; 64];
        hdr.write_to(&mut buf);

        assert_eq!(peek_type(&buf).unwrap(), PktType::Eager);
        let back = EagerHdr::read_from(&buf).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn test_peek_rejects_bad_magic() {
        let mut buf = [0u8; EagerHdr::SIZE];
        EagerHdr::new(0, 0, 0, 0, 0).write_to(&mut buf);
        buf[0] = 0x00;
        assert!(matches!(
            peek_type(&buf),
            Err(Error::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_rma_seg_roundtrip() {
        let segs = [
            RmaSeg {
                addr: 0x1000,
                len: 512,
                key: 9,
            },
            RmaSeg {
                addr: 0x2000,
                len: 128,
                key: 10,
            },
        ];
        let mut buf = [0u8; 128];
        let n = write_rma_segs(&mut buf, &segs);
        assert_eq!(n, 2 * WireRmaSeg::SIZE);

        let back = read_rma_segs(&buf, 2).unwrap();
        assert_eq!(back, segs);
    }

    #[test]
    fn test_pkt_token_roundtrip() {
        for kind in [
            PoolKind::NicTx,
            PoolKind::NicRx,
            PoolKind::ShmTx,
            PoolKind::ShmRx,
            PoolKind::Unexp,
            PoolKind::User,
            PoolKind::ReadCtx,
        ] {
            let id = PktId { kind, slot: 12345 };
            assert_eq!(PktId::from_token(id.token()).unwrap(), id);
        }
    }
}
