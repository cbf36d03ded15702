//! User-visible completion objects: completion queue, counter and event
//! queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;
use tracing::warn;

use crate::entry::{CqEntry, CqErrEntry};

bitflags! {
    /// Direction selector used when binding a CQ or counter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindFlags: u32 {
        const TRANSMIT = 1 << 0;
        const RECV = 1 << 1;
    }
}

/// Bounded completion queue shared between the endpoint and the
/// application.
pub struct CompQueue {
    capacity: usize,
    entries: Mutex<VecDeque<CqEntry>>,
    errors: Mutex<VecDeque<CqErrEntry>>,
    overruns: AtomicU64,
}

impl CompQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
            errors: Mutex::new(VecDeque::new()),
            overruns: AtomicU64::new(0),
        }
    }

    /// Drain up to `max` completions into `out`, returning the count.
    pub fn read(&self, max: usize, out: &mut Vec<CqEntry>) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let n = max.min(entries.len());
        out.extend(entries.drain(..n));
        n
    }

    /// Drain one error completion, if any.
    pub fn read_err(&self) -> Option<CqErrEntry> {
        self.errors.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completions dropped because the queue was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub(crate) fn write(&self, entry: CqEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            warn!(context = entry.context, "completion queue overrun, dropping entry");
            return;
        }
        entries.push_back(entry);
    }

    pub(crate) fn write_err(&self, entry: CqErrEntry) {
        self.errors.lock().unwrap().push_back(entry);
    }
}

/// Monotonic completion counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub(crate) fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
}

/// Entry-less error report written to the event queue.
#[derive(Debug, Clone, Copy)]
pub struct EqErrEntry {
    pub err: i32,
    pub prov_errno: i32,
}

/// Event queue for errors that cannot be attributed to a transfer entry.
#[derive(Default)]
pub struct EventQueue {
    errors: Mutex<VecDeque<EqErrEntry>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_err(&self) -> Option<EqErrEntry> {
        self.errors.lock().unwrap().pop_front()
    }

    pub(crate) fn write_err(&self, err: i32, prov_errno: i32) {
        self.errors
            .lock()
            .unwrap()
            .push_back(EqErrEntry { err, prov_errno });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CompFlags;

    #[test]
    fn test_cq_read_order() {
        let cq = CompQueue::new(8);
        for i in 0..3 {
            cq.write(CqEntry {
                context: i,
                flags: CompFlags::SEND,
                len: 0,
                buf: 0,
                data: 0,
                tag: 0,
            });
        }

        let mut out = Vec::new();
        assert_eq!(cq.read(2, &mut out), 2);
        assert_eq!(out[0].context, 0);
        assert_eq!(out[1].context, 1);
        assert_eq!(cq.len(), 1);
    }

    #[test]
    fn test_cq_overrun_counted() {
        let cq = CompQueue::new(1);
        cq.write(CqEntry::default());
        cq.write(CqEntry::default());
        assert_eq!(cq.len(), 1);
        assert_eq!(cq.overruns(), 1);
    }

    #[test]
    fn test_eq_errors() {
        let eq = EventQueue::new();
        assert!(eq.read_err().is_none());
        eq.write_err(5, -5);
        let e = eq.read_err().unwrap();
        assert_eq!(e.err, 5);
    }
}
