//! Address vector: peer resolution for the endpoint.
//!
//! Maps opaque endpoint-level addresses to per-peer state, translates
//! NIC-supplied source identifiers and shared-memory addresses back to
//! endpoint-level addresses, and records the per-peer transport addressing
//! needed to post sends.

use rustc_hash::FxHashMap;

use crate::peer::Peer;
use crate::transport::SrcId;

/// Raw address of an endpoint: 16-byte GID plus queue-pair number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpAddr {
    pub gid: [u8; 16],
    pub qpn: u16,
}

impl EpAddr {
    /// Encode a shared-memory endpoint name from the raw address.
    pub fn to_smr_name(&self) -> String {
        let mut name = String::with_capacity(38);
        for b in &self.gid {
            name.push_str(&format!("{:02x}", b));
        }
        name.push('_');
        name.push_str(&format!("{:04x}", self.qpn));
        name
    }
}

/// Opaque endpoint-level address handed back by the address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr(pub u64);

impl Addr {
    /// Wildcard address: match any sender.
    pub const UNSPEC: Addr = Addr(u64::MAX);

    #[inline]
    pub fn is_unspec(&self) -> bool {
        *self == Addr::UNSPEC
    }
}

/// One resolved peer.
pub struct AvEntry {
    pub ep_addr: EpAddr,
    /// NIC transport destination address.
    pub nic_addr: u64,
    /// SHM transport destination address, when the peer is node-local.
    pub shm_addr: Option<u64>,
    pub peer: Peer,
}

impl AvEntry {
    /// Whether the node-local fast path applies to this peer.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.shm_addr.is_some()
    }
}

/// Address vector.
#[derive(Default)]
pub struct AddressVector {
    entries: Vec<Option<AvEntry>>,
    src_map: FxHashMap<SrcId, u64>,
    shm_map: FxHashMap<u64, u64>,
}

impl AddressVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer. `src` is the identifier the NIC will report on receive
    /// completions from this peer; `shm_addr` is set for node-local peers.
    pub fn insert(
        &mut self,
        ep_addr: EpAddr,
        nic_addr: u64,
        src: SrcId,
        shm_addr: Option<u64>,
        initial_credits: u32,
    ) -> Addr {
        let index = self.entries.len() as u64;
        let addr = Addr(index);
        self.entries.push(Some(AvEntry {
            ep_addr,
            nic_addr,
            shm_addr,
            peer: Peer::new(addr, initial_credits),
        }));
        self.src_map.insert(src, index);
        if let Some(shm) = shm_addr {
            self.shm_map.insert(shm, index);
        }
        addr
    }

    /// Remove a peer, invalidating its address.
    pub fn remove(&mut self, addr: Addr) -> Option<AvEntry> {
        let entry = self.entries.get_mut(addr.0 as usize)?.take()?;
        self.src_map.retain(|_, v| *v != addr.0);
        if let Some(shm) = entry.shm_addr {
            self.shm_map.remove(&shm);
        }
        Some(entry)
    }

    pub fn entry(&self, addr: Addr) -> Option<&AvEntry> {
        self.entries.get(addr.0 as usize)?.as_ref()
    }

    pub fn entry_mut(&mut self, addr: Addr) -> Option<&mut AvEntry> {
        self.entries.get_mut(addr.0 as usize)?.as_mut()
    }

    /// Resolve a peer from an endpoint-level address.
    pub fn peer(&self, addr: Addr) -> Option<&Peer> {
        self.entry(addr).map(|e| &e.peer)
    }

    pub fn peer_mut(&mut self, addr: Addr) -> Option<&mut Peer> {
        self.entry_mut(addr).map(|e| &mut e.peer)
    }

    /// Resolve an endpoint-level address from a NIC source identifier.
    pub fn addr_from_src(&self, src: SrcId) -> Option<Addr> {
        self.src_map.get(&src).map(|&i| Addr(i))
    }

    /// Translate a SHM transport address to an endpoint-level address.
    pub fn addr_from_shm(&self, shm_addr: u64) -> Option<Addr> {
        self.shm_map.get(&shm_addr).map(|&i| Addr(i))
    }

    /// Iterate over live peer addresses.
    pub fn addrs(&self) -> Vec<Addr> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| Addr(i as u64)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep_addr(tag: u8) -> EpAddr {
        EpAddr {
            gid: [tag; 16],
            qpn: tag as u16,
        }
    }

    #[test]
    fn test_av_lookup_paths() {
        let mut av = AddressVector::new();
        let src = SrcId { node: 7, qp: 3 };
        let addr = av.insert(ep_addr(1), 42, src, Some(9), 64);

        assert_eq!(av.addr_from_src(src), Some(addr));
        assert_eq!(av.addr_from_shm(9), Some(addr));
        assert!(av.entry(addr).unwrap().is_local());
        assert_eq!(av.peer(addr).unwrap().tx_credits, 64);
    }

    #[test]
    fn test_av_remove_invalidates() {
        let mut av = AddressVector::new();
        let src = SrcId { node: 1, qp: 1 };
        let addr = av.insert(ep_addr(2), 0, src, None, 8);

        assert!(av.remove(addr).is_some());
        assert!(av.peer(addr).is_none());
        assert_eq!(av.addr_from_src(src), None);
    }

    #[test]
    fn test_smr_name_encoding() {
        let name = ep_addr(0xAB).to_smr_name();
        assert_eq!(name.len(), 32 + 1 + 4);
        assert!(name.ends_with("_00ab"));
    }
}
