use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use super::sleeplock::SleepLock;

/// Block number carried by a slot that was never assigned to a bucket
pub const UNASSIGNED: u32 = u32::MAX;

/// End of a bucket member list
pub(crate) const NIL: usize = usize::MAX;

/// Handle to one buffer slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufId(pub(crate) usize);

/// One slot of the buffer pool.
///
/// Identity, reference count, timestamp and list link are only written
/// while holding the lock of the bucket the slot belongs to (the
/// coordination lock covers slots that belong to none yet). They are
/// atomics so the slot can be shared; relaxed ordering suffices because
/// the bucket lock orders every access.
pub(crate) struct Buf {
    dev: AtomicU32,
    blockno: AtomicU32,
    valid: AtomicBool,
    refcnt: AtomicU32,
    /// Logical time of the last release that dropped refcnt to zero
    timestamp: AtomicU64,
    next: AtomicUsize,
    pub(crate) data: SleepLock<Box<[u8]>>,
}

impl Buf {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(UNASSIGNED),
            valid: AtomicBool::new(false),
            refcnt: AtomicU32::new(0),
            timestamp: AtomicU64::new(0),
            next: AtomicUsize::new(NIL),
            data: SleepLock::new(vec![0u8; block_size].into_boxed_slice()),
        }
    }

    pub(crate) fn dev(&self) -> u32 {
        self.dev.load(Ordering::Relaxed)
    }

    pub(crate) fn blockno(&self) -> u32 {
        self.blockno.load(Ordering::Relaxed)
    }

    pub(crate) fn is_assigned(&self) -> bool {
        self.blockno() != UNASSIGNED
    }

    pub(crate) fn holds(&self, dev: u32, blockno: u32) -> bool {
        self.dev() == dev && self.blockno() == blockno
    }

    /// Repurpose the slot for another block. Payload becomes invalid.
    pub(crate) fn assign(&self, dev: u32, blockno: u32) {
        self.dev.store(dev, Ordering::Relaxed);
        self.blockno.store(blockno, Ordering::Relaxed);
        self.valid.store(false, Ordering::Relaxed);
        self.refcnt.store(1, Ordering::Relaxed);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    pub(crate) fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference, returning the new count, or `None` on underflow
    pub(crate) fn dec_ref(&self) -> Option<u32> {
        let refcnt = self.refcnt();
        let refcnt = refcnt.checked_sub(1)?;
        self.refcnt.store(refcnt, Ordering::Relaxed);
        Some(refcnt)
    }

    pub(crate) fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub(crate) fn stamp(&self, tick: u64) {
        self.timestamp.store(tick, Ordering::Relaxed);
    }

    pub(crate) fn next(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, next: usize) {
        self.next.store(next, Ordering::Relaxed);
    }
}

/// Member list of one hash bucket, linked through the slots' `next` field.
///
/// Only reachable through the bucket's lock, so holding `&mut BucketList`
/// is proof the caller may relink its members.
pub(crate) struct BucketList {
    head: usize,
}

impl BucketList {
    pub(crate) const fn new() -> Self {
        Self { head: NIL }
    }

    pub(crate) fn iter<'a>(&self, bufs: &'a [Buf]) -> BucketIter<'a> {
        BucketIter {
            bufs,
            cur: self.head,
        }
    }

    pub(crate) fn push_front(&mut self, id: usize, bufs: &[Buf]) {
        bufs[id].set_next(self.head);
        self.head = id;
    }

    /// Unlink `id`, locating its predecessor by following the links.
    /// Returns false if `id` is not a member.
    pub(crate) fn unlink(&mut self, id: usize, bufs: &[Buf]) -> bool {
        let mut prev = NIL;
        let mut cur = self.head;

        while cur != NIL {
            if cur == id {
                let next = bufs[cur].next();
                if prev == NIL {
                    self.head = next;
                } else {
                    bufs[prev].set_next(next);
                }
                bufs[cur].set_next(NIL);
                return true;
            }
            prev = cur;
            cur = bufs[cur].next();
        }

        false
    }

    /// Unreferenced member with the oldest release time; the first one
    /// found wins ties.
    pub(crate) fn lru(&self, bufs: &[Buf]) -> Option<(usize, u64)> {
        let mut best: Option<(usize, u64)> = None;
        for id in self.iter(bufs) {
            let buf = &bufs[id];
            if buf.refcnt() != 0 {
                continue;
            }
            let ts = buf.timestamp();
            if best.is_none_or(|(_, min)| ts < min) {
                best = Some((id, ts));
            }
        }
        best
    }
}

pub(crate) struct BucketIter<'a> {
    bufs: &'a [Buf],
    cur: usize,
}

impl Iterator for BucketIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == NIL {
            return None;
        }
        let id = self.cur;
        self.cur = self.bufs[id].next();
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> Vec<Buf> {
        (0..n).map(|_| Buf::new(16)).collect()
    }

    #[test]
    fn test_fresh_slot_is_unassigned() {
        let buf = Buf::new(16);
        assert!(!buf.is_assigned());
        assert!(!buf.is_valid());
        assert_eq!(buf.refcnt(), 0);
        assert_eq!(buf.next(), NIL);
    }

    #[test]
    fn test_push_and_iterate() {
        let bufs = pool(4);
        let mut list = BucketList::new();
        list.push_front(2, &bufs);
        list.push_front(0, &bufs);
        list.push_front(3, &bufs);

        let members: Vec<usize> = list.iter(&bufs).collect();
        assert_eq!(members, vec![3, 0, 2]);
    }

    #[test]
    fn test_unlink_head_middle_tail() {
        let bufs = pool(5);
        let mut list = BucketList::new();
        for id in [4, 3, 2, 1, 0] {
            list.push_front(id, &bufs);
        }

        assert!(list.unlink(2, &bufs));
        assert_eq!(list.iter(&bufs).collect::<Vec<_>>(), vec![0, 1, 3, 4]);

        assert!(list.unlink(0, &bufs));
        assert_eq!(list.iter(&bufs).collect::<Vec<_>>(), vec![1, 3, 4]);

        assert!(list.unlink(4, &bufs));
        assert_eq!(list.iter(&bufs).collect::<Vec<_>>(), vec![1, 3]);

        // Not a member any more
        assert!(!list.unlink(4, &bufs));
        assert_eq!(bufs[4].next(), NIL);
    }

    #[test]
    fn test_lru_skips_referenced_and_keeps_first_tie() {
        let bufs = pool(4);
        let mut list = BucketList::new();
        for id in [3, 2, 1, 0] {
            list.push_front(id, &bufs);
        }

        bufs[0].assign(1, 0);
        bufs[0].stamp(1);
        bufs[1].stamp(5);
        bufs[2].stamp(5);
        bufs[3].stamp(9);

        // Slot 0 has the oldest stamp but is referenced
        assert_eq!(list.lru(&bufs), Some((1, 5)));

        for id in 1..4 {
            bufs[id].inc_ref();
        }
        assert_eq!(list.lru(&bufs), None);
    }

    #[test]
    fn test_dec_ref_underflow() {
        let buf = Buf::new(16);
        buf.inc_ref();
        assert_eq!(buf.dec_ref(), Some(0));
        assert_eq!(buf.dec_ref(), None);
        assert_eq!(buf.refcnt(), 0);
    }
}
