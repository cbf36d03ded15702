//! Fixed-capacity pools for packet buffers and transfer entries.
//!
//! Packet pools allocate chunk-wise so NIC registration cost is amortized
//! over a whole chunk; chunks are only allocated through explicit
//! [`PktPool::grow`] or lazily on first exhaustion, never at construction.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::Arc;

use slab::Slab;
use tracing::warn;

use crate::error::{Error, Result};
use crate::transport::{Access, MemoryRegistrar, MrDesc, MrHandle};

/// Alignment for packet buffers.
pub const PKT_BUF_ALIGN: usize = 64;

struct Chunk {
    ptr: *mut u8,
    layout: Layout,
    mr: Option<MrHandle>,
    desc: Option<MrDesc>,
}

// Chunks are only reachable through the owning pool.
unsafe impl Send for Chunk {}

/// A chunked pool of fixed-size packet buffers with stable slot indices.
pub struct PktPool {
    slot_size: usize,
    chunk_slots: usize,
    max_chunks: usize,
    chunks: Vec<Chunk>,
    free: Vec<u32>,
    in_use: usize,
    registrar: Option<Arc<dyn MemoryRegistrar>>,
    access: Access,
}

impl PktPool {
    /// Create an empty pool. `registrar` is `Some` for hardware-addressable
    /// pools; registration happens per chunk at grow time.
    pub fn new(
        slot_size: usize,
        chunk_slots: usize,
        max_chunks: usize,
        registrar: Option<Arc<dyn MemoryRegistrar>>,
        access: Access,
    ) -> Self {
        assert!(slot_size > 0 && chunk_slots > 0 && max_chunks > 0);
        Self {
            slot_size,
            chunk_slots,
            max_chunks,
            chunks: Vec::new(),
            free: Vec::new(),
            in_use: 0,
            registrar,
            access,
        }
    }

    /// Allocate one additional chunk, registering it if the pool is
    /// hardware-addressable.
    pub fn grow(&mut self) -> Result<()> {
        if self.chunks.len() >= self.max_chunks {
            return Err(Error::Again);
        }

        let layout = Layout::from_size_align(self.slot_size * self.chunk_slots, PKT_BUF_ALIGN)
            .map_err(|_| Error::InvalidConfig("invalid packet pool layout".into()))?;
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "failed to allocate packet pool chunk",
            )));
        }

        let (mr, desc) = match &self.registrar {
            Some(reg) => match reg.register(ptr as u64, layout.size(), self.access) {
                Ok(handle) => (Some(handle), Some(reg.descriptor(handle))),
                Err(e) => {
                    unsafe { dealloc(ptr, layout) };
                    return Err(e);
                }
            },
            None => (None, None),
        };

        let base = (self.chunks.len() * self.chunk_slots) as u32;
        self.chunks.push(Chunk {
            ptr,
            layout,
            mr,
            desc,
        });
        for i in (0..self.chunk_slots as u32).rev() {
            self.free.push(base + i);
        }
        Ok(())
    }

    /// Acquire a slot, growing the pool by one chunk if exhausted and below
    /// the chunk limit.
    pub fn acquire(&mut self) -> Option<u32> {
        if self.free.is_empty() && self.chunks.len() < self.max_chunks {
            if let Err(e) = self.grow() {
                warn!(error = %e, "packet pool grow failed");
                return None;
            }
        }
        let slot = self.free.pop()?;
        self.in_use += 1;
        Some(slot)
    }

    /// Release a slot back to the pool.
    pub fn release(&mut self, slot: u32) {
        debug_assert!((slot as usize) < self.capacity());
        debug_assert!(!self.free.contains(&slot));
        self.in_use -= 1;
        self.free.push(slot);
    }

    /// Address of a slot, usable in a scatter-gather element.
    #[inline]
    pub fn slot_addr(&self, slot: u32) -> u64 {
        let (chunk, offset) = self.locate(slot);
        unsafe { self.chunks[chunk].ptr.add(offset) as u64 }
    }

    /// NIC descriptor for a slot's chunk, if registered.
    #[inline]
    pub fn slot_desc(&self, slot: u32) -> Option<MrDesc> {
        let (chunk, _) = self.locate(slot);
        self.chunks[chunk].desc
    }

    /// Borrow a slot's buffer.
    #[inline]
    pub fn slot(&self, slot: u32) -> &[u8] {
        let (chunk, offset) = self.locate(slot);
        unsafe {
            std::slice::from_raw_parts(self.chunks[chunk].ptr.add(offset), self.slot_size)
        }
    }

    /// Mutably borrow a slot's buffer.
    #[inline]
    pub fn slot_mut(&mut self, slot: u32) -> &mut [u8] {
        let (chunk, offset) = self.locate(slot);
        unsafe {
            std::slice::from_raw_parts_mut(self.chunks[chunk].ptr.add(offset), self.slot_size)
        }
    }

    #[inline]
    fn locate(&self, slot: u32) -> (usize, usize) {
        let slot = slot as usize;
        debug_assert!(slot < self.capacity());
        (
            slot / self.chunk_slots,
            (slot % self.chunk_slots) * self.slot_size,
        )
    }

    /// Size of each slot.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots currently backed by memory.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_slots
    }

    /// Slots per chunk.
    #[inline]
    pub fn chunk_slots(&self) -> usize {
        self.chunk_slots
    }

    /// Number of allocated chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of slots currently acquired.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Forcibly return every slot to the free list. Only valid when the
    /// outstanding users are being torn down with the pool.
    pub fn reset(&mut self) {
        self.free.clear();
        for slot in (0..self.capacity() as u32).rev() {
            self.free.push(slot);
        }
        self.in_use = 0;
    }
}

impl Drop for PktPool {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            if let (Some(reg), Some(mr)) = (&self.registrar, chunk.mr) {
                reg.release(mr);
            }
            unsafe { dealloc(chunk.ptr, chunk.layout) };
        }
    }
}

/// A bounded pool of transfer-entry objects with stable slot indices.
///
/// The slot index doubles as the entry's compact identifier in packet
/// headers.
pub struct EntryPool<T> {
    slab: Slab<T>,
    capacity: usize,
}

impl<T> EntryPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert an entry, returning its stable index, or `None` when the pool
    /// is exhausted.
    pub fn insert(&mut self, entry: T) -> Option<usize> {
        if self.slab.len() >= self.capacity {
            return None;
        }
        Some(self.slab.insert(entry))
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slab.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slab.get_mut(index)
    }

    /// Remove an entry, returning its slot to the pool.
    pub fn remove(&mut self, index: usize) -> T {
        self.slab.remove(index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.slab.contains(index)
    }

    /// Number of live entries.
    pub fn in_use(&self) -> usize {
        self.slab.len()
    }

    /// Iterate over live entries with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slab.iter()
    }

    /// Indices of all live entries.
    pub fn indices(&self) -> Vec<usize> {
        self.slab.iter().map(|(i, _)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NoopRegistrar;

    #[test]
    fn test_pkt_pool_lazy_alloc() {
        let mut pool = PktPool::new(1024, 8, 2, None, Access::SEND);
        assert_eq!(pool.capacity(), 0);

        let slot = pool.acquire().unwrap();
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.slot(slot).len(), 1024);

        pool.release(slot);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pkt_pool_exhaustion_grows_to_limit() {
        let mut pool = PktPool::new(64, 2, 2, None, Access::SEND);
        let mut slots = Vec::new();
        for _ in 0..4 {
            slots.push(pool.acquire().unwrap());
        }
        assert_eq!(pool.chunk_count(), 2);
        assert!(pool.acquire().is_none());

        for slot in slots {
            pool.release(slot);
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pkt_pool_slot_alignment() {
        let mut pool = PktPool::new(128, 4, 1, None, Access::SEND);
        let slot = pool.acquire().unwrap();
        assert_eq!(pool.slot_addr(slot) as usize % PKT_BUF_ALIGN, 0);
        pool.release(slot);
    }

    #[test]
    fn test_pkt_pool_registered_chunks() {
        let reg: Arc<dyn MemoryRegistrar> = Arc::new(NoopRegistrar);
        let mut pool = PktPool::new(256, 4, 1, Some(reg), Access::SEND | Access::RECV);
        let slot = pool.acquire().unwrap();
        assert!(pool.slot_desc(slot).is_some());
        pool.release(slot);
    }

    #[test]
    fn test_entry_pool_capacity() {
        let mut pool: EntryPool<u32> = EntryPool::new(2);
        let a = pool.insert(10).unwrap();
        let b = pool.insert(20).unwrap();
        assert!(pool.insert(30).is_none());

        assert_eq!(*pool.get(a).unwrap(), 10);
        pool.remove(a);
        assert_eq!(pool.in_use(), 1);

        let c = pool.insert(30).unwrap();
        assert_eq!(*pool.get(c).unwrap(), 30);
        assert_eq!(*pool.get(b).unwrap(), 20);
    }
}
