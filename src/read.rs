//! Read-engine interface: one-sided read contexts driven by the progress
//! loop.

use crate::av::Addr;
use crate::packet::Owner;
use crate::transport::{IoSeg, MrDesc, RmaSeg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting on `read_pending_list` for the progress engine.
    Pending,
    /// Handed to the transport; waiting for the read completion.
    Submitted,
}

/// One outstanding one-sided read on behalf of a transfer entry.
pub struct ReadEntry {
    pub addr: Addr,
    /// Entry this read serves: a TX entry for an application RMA read, an
    /// RX entry for the long-read message protocol.
    pub owner: Owner,
    /// Local destination segments.
    pub iov: Vec<IoSeg>,
    pub desc: Vec<Option<MrDesc>>,
    /// Remote source segments.
    pub remote: Vec<RmaSeg>,
    pub total_len: usize,
    pub state: ReadState,
}

impl ReadEntry {
    pub fn new(
        addr: Addr,
        owner: Owner,
        iov: Vec<IoSeg>,
        desc: Vec<Option<MrDesc>>,
        remote: Vec<RmaSeg>,
        total_len: usize,
    ) -> Self {
        Self {
            addr,
            owner,
            iov,
            desc,
            remote,
            total_len,
            state: ReadState::Pending,
        }
    }
}
