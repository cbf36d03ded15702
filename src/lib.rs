//! # rdmsg - reliable datagram messaging over unreliable NIC datagrams
//!
//! This crate implements a reliable, connectionless messaging endpoint on
//! top of a fixed-MTU unreliable datagram transport (an RDMA-capable NIC),
//! with an optional shared-memory fast path for node-local peers. It
//! presents message, tagged-message, one-sided RMA and atomic operations to
//! the application while the transport below provides only unreliable
//! datagrams, receiver-not-ready back-pressure and completion
//! notifications.
//!
//! ## Features
//!
//! - **Multi-protocol transfers**: eager single-packet, windowed long
//!   messages with clear-to-send credit, and long messages via one-sided
//!   read when the transport and peer support it
//! - **Credit-based flow control** with per-peer RNR backoff
//! - **Dual-path dispatch**: one endpoint, two transports, selected per
//!   packet by the peer's locality
//! - **Single-threaded progress engine** driven by the application
//!
//! ## Usage
//!
//! ```ignore
//! use rdmsg::{AddressVector, CompQueue, Endpoint, EndpointConfig, IoSeg};
//!
//! let ep = Endpoint::new(config, nic, None, registrar)?;
//! ep.bind_av(AddressVector::new())?;
//! ep.bind_cq(cq.clone(), BindFlags::TRANSMIT | BindFlags::RECV)?;
//! ep.enable()?;
//!
//! let peer = ep.insert_addr(peer_raw_addr, peer_nic_addr, peer_src, None)?;
//! unsafe { ep.send(&[IoSeg::from_slice(&buf)], &[], peer, 0, CTX)? };
//! loop {
//!     ep.progress();
//!     if cq.read(1, &mut completions) > 0 {
//!         break;
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`pool`]: packet-buffer and transfer-entry pools
//! - [`av`]: address vector and peer resolution
//! - [`peer`]: per-peer credits, counters and RNR backoff
//! - [`entry`]: `TxEntry`/`RxEntry` transfer state machines
//! - [`packet`]: packet identifiers and wire headers
//! - [`transport`]: the transport and memory-registration boundaries
//! - [`cq`]: user-visible completion queue, counter and event queue
//! - [`read`]: one-sided read contexts
//! - [`ep`]: the endpoint itself; the posting layer, completion processing
//!   and the progress engine live in private sibling modules

pub mod av;
mod codec;
pub mod config;
pub mod cq;
pub mod entry;
pub mod ep;
pub mod error;
pub mod packet;
pub mod peer;
pub mod pool;
mod posting;
mod progress;
pub mod read;
pub mod transport;

pub use av::{Addr, AddressVector, EpAddr};
pub use config::EndpointConfig;
pub use cq::{BindFlags, CompQueue, Counter, EventQueue};
pub use entry::{CompFlags, CqEntry, CqErrEntry, OpFlags, ERR_CANCELED};
pub use ep::{Endpoint, EndpointStats};
pub use error::{Error, Result};
pub use packet::AtomicOp;
pub use transport::{
    Access, CompErr, CompOp, Completion, IoSeg, MemoryRegistrar, MrDesc, MrHandle, NoopRegistrar,
    ReadDesc, RecvDesc, RmaSeg, SendDesc, SrcId, Transport, TransportId,
};
