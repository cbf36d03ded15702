//! Transport and memory-registration boundaries.
//!
//! The endpoint core is written against these traits so the progress engine
//! can be driven by any unreliable datagram transport: the NIC, a
//! shared-memory channel, or a simulated transport in tests.

use bitflags::bitflags;

use crate::av::EpAddr;
use crate::error::{Error, Result};

/// One segment of a local IO vector.
///
/// Addresses are raw for DMA-style submission; the caller guarantees the
/// memory stays valid until the matching completion is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSeg {
    /// Virtual address of the segment.
    pub addr: u64,
    /// Segment length in bytes.
    pub len: usize,
}

impl IoSeg {
    /// Create a segment from a raw address and length.
    pub fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }

    /// Create a segment covering a byte slice.
    pub fn from_slice(buf: &[u8]) -> Self {
        Self {
            addr: buf.as_ptr() as u64,
            len: buf.len(),
        }
    }
}

/// Total byte length of an IO vector.
pub fn total_iov_len(iov: &[IoSeg]) -> usize {
    iov.iter().map(|seg| seg.len).sum()
}

/// One segment of a remote (RMA target) IO vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaSeg {
    /// Remote virtual address.
    pub addr: u64,
    /// Segment length in bytes.
    pub len: u64,
    /// Protection key for the remote registration.
    pub key: u64,
}

/// Opaque NIC descriptor for a registered memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MrDesc(pub u64);

/// Handle to a live memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle(pub u64);

bitflags! {
    /// Access rights requested when registering memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const REMOTE_READ = 1 << 4;
        const REMOTE_WRITE = 1 << 5;
    }
}

/// Memory registration collaborator.
///
/// Registration is chunk-granular for packet pools and segment-granular for
/// long-message user buffers.
pub trait MemoryRegistrar: Send + Sync {
    /// Register a memory region and return a handle to it.
    fn register(&self, addr: u64, len: usize, access: Access) -> Result<MrHandle>;

    /// Release a registration.
    fn release(&self, handle: MrHandle);

    /// NIC descriptor for a registration.
    fn descriptor(&self, handle: MrHandle) -> MrDesc;

    /// Shared-memory transport view of the same registration.
    fn shm_descriptor(&self, handle: MrHandle) -> MrDesc {
        self.descriptor(handle)
    }
}

/// A registrar for transports that do not require registration.
pub struct NoopRegistrar;

impl MemoryRegistrar for NoopRegistrar {
    fn register(&self, addr: u64, _len: usize, _access: Access) -> Result<MrHandle> {
        Ok(MrHandle(addr))
    }

    fn release(&self, _handle: MrHandle) {}

    fn descriptor(&self, handle: MrHandle) -> MrDesc {
        MrDesc(handle.0)
    }
}

/// Which lower transport a packet or counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportId {
    Nic,
    Shm,
}

/// Source identifier supplied by the transport with a receive completion.
///
/// For the NIC this is the address-handle/LID plus source QP number; the
/// shared-memory transport reports its own address space in `node` with
/// `qp` zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrcId {
    pub node: u64,
    pub qp: u64,
}

/// Completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Send,
    Recv,
    Read,
}

/// A successful completion drained from a transport CQ.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Token supplied at post time; identifies the packet or read context.
    pub token: u64,
    pub op: CompOp,
    /// Bytes transferred (receive and read completions).
    pub len: usize,
    /// Source identifier for receive completions.
    pub src: Option<SrcId>,
}

/// An error completion drained from a transport error CQ.
#[derive(Debug, Clone, Copy)]
pub struct CompErr {
    pub token: u64,
    pub op: CompOp,
    /// Receiver-not-ready back-pressure; transient and retryable.
    pub rnr: bool,
    /// Provider error code for non-RNR failures.
    pub prov_errno: i32,
}

/// Send work request.
pub struct SendDesc<'a> {
    pub iov: &'a [IoSeg],
    pub desc: &'a [Option<MrDesc>],
    /// Transport-level destination address.
    pub dest: u64,
    pub token: u64,
    /// More submissions follow; the transport may defer its doorbell.
    pub more: bool,
}

/// Receive work request. Receives are always wildcard; sender matching is
/// done above the transport.
pub struct RecvDesc<'a> {
    pub iov: &'a [IoSeg],
    pub desc: &'a [Option<MrDesc>],
    pub token: u64,
    pub more: bool,
}

/// One-sided read work request.
pub struct ReadDesc<'a> {
    pub iov: &'a [IoSeg],
    pub desc: &'a [Option<MrDesc>],
    pub dest: u64,
    pub remote: &'a [RmaSeg],
    pub token: u64,
}

/// Unreliable datagram transport boundary.
///
/// Post calls may fail with [`Error::Again`] under transient back-pressure;
/// the core requeues and retries from the progress engine. RNR is reported
/// asynchronously through [`Transport::poll_err`].
pub trait Transport: Send {
    /// Maximum packet size.
    fn mtu(&self) -> usize;

    /// Raw address of this transport endpoint.
    fn local_addr(&self) -> EpAddr;

    /// Post a send work request.
    fn post_send(&mut self, desc: &SendDesc<'_>) -> Result<()>;

    /// Post a receive work request.
    fn post_recv(&mut self, desc: &RecvDesc<'_>) -> Result<()>;

    /// Post a one-sided read.
    fn post_read(&mut self, _desc: &ReadDesc<'_>) -> Result<()> {
        Err(Error::OpNotSupported)
    }

    /// Whether one-sided read is available.
    fn supports_read(&self) -> bool {
        false
    }

    /// Drain up to `max` completions into `out`, returning the count.
    fn poll_cq(&mut self, max: usize, out: &mut Vec<Completion>) -> usize;

    /// Drain one error completion, if any.
    fn poll_err(&mut self) -> Option<CompErr>;

    /// Flush work requests batched behind "more to come" posts.
    fn flush(&mut self);
}
