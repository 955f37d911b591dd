use std::sync::atomic::{AtomicUsize, Ordering};

/// End of a free list
pub(crate) const NIL: usize = usize::MAX;

/// Next-frame links for every frame of the pool, indexed by frame number.
///
/// A link is only read or written by whoever holds the lock of the list
/// the frame is on, which orders every access.
pub(crate) struct Links(Box<[AtomicUsize]>);

impl Links {
    pub(crate) fn new(frames: usize) -> Self {
        Self((0..frames).map(|_| AtomicUsize::new(NIL)).collect())
    }

    pub(crate) fn next(&self, frame: usize) -> usize {
        self.0[frame].load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, frame: usize, next: usize) {
        self.0[frame].store(next, Ordering::Relaxed);
    }
}

/// One core's LIFO stack of free frames with its tracked length.
pub(crate) struct FreeList {
    head: usize,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: NIL, len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == NIL
    }

    pub(crate) fn push(&mut self, frame: usize, links: &Links) {
        links.set_next(frame, self.head);
        self.head = frame;
        self.len += 1;
    }

    pub(crate) fn pop(&mut self, links: &Links) -> Option<usize> {
        let frame = self.take_head(links)?;
        self.len -= 1;
        Some(frame)
    }

    /// Number of frames actually linked, walking the whole list
    pub(crate) fn count(&self, links: &Links) -> usize {
        let mut len = 0;
        let mut cur = self.head;
        while cur != NIL {
            len += 1;
            cur = links.next(cur);
        }
        len
    }

    /// Move the front half of `donor` onto this (empty) list and hand out
    /// one frame of it.
    ///
    /// The split point is found in one pass: a fast cursor moves two links
    /// per step, a slow one moves one. Everything from the donor's head up
    /// to and including the slow cursor changes hands. A donor of `n`
    /// frames keeps `n/2 - 1` when `n` is even and `n/2` when odd; this
    /// list keeps `n/2` after the frame handed out. A single-frame donor
    /// gives up that frame directly.
    pub(crate) fn steal_half(&mut self, donor: &mut FreeList, links: &Links) -> Option<usize> {
        debug_assert!(self.is_empty());

        let head = donor.head;
        if head == NIL {
            return None;
        }

        let mut slow = head;
        let mut fast = head;
        while fast != NIL && links.next(fast) != NIL {
            fast = links.next(links.next(fast));
            slow = links.next(slow);
        }

        if slow == head {
            donor.head = NIL;
            donor.len = 0;
            self.head = NIL;
            self.len = 0;
            links.set_next(head, NIL);
            return Some(head);
        }

        let n = donor.len;
        if n < 2 {
            panic!("steal: donor tracks {n} frames but holds at least two");
        }

        self.head = head;
        donor.head = links.next(slow);
        links.set_next(slow, NIL);

        if n % 2 == 0 {
            donor.len = n / 2 - 1;
            self.len = n / 2;
        } else {
            donor.len = n / 2;
            self.len = n / 2;
        }

        // The handed-out frame is already excluded from `self.len`
        self.take_head(links)
    }

    fn take_head(&mut self, links: &Links) -> Option<usize> {
        if self.head == NIL {
            return None;
        }
        let frame = self.head;
        self.head = links.next(frame);
        links.set_next(frame, NIL);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// List holding frames `0..n` with frame 0 on top
    fn list_of(n: usize, links: &Links) -> FreeList {
        let mut list = FreeList::new();
        for frame in (0..n).rev() {
            list.push(frame, links);
        }
        list
    }

    fn frames(list: &FreeList, links: &Links) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = list.head;
        while cur != NIL {
            out.push(cur);
            cur = links.next(cur);
        }
        out
    }

    #[test]
    fn test_push_pop_is_lifo() {
        let links = Links::new(4);
        let mut list = FreeList::new();
        list.push(1, &links);
        list.push(3, &links);
        assert_eq!(list.len(), 2);

        assert_eq!(list.pop(&links), Some(3));
        assert_eq!(list.pop(&links), Some(1));
        assert_eq!(list.pop(&links), None);
        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
    }

    #[test]
    fn test_steal_even_donor() {
        let links = Links::new(10);
        let mut donor = list_of(10, &links);
        let mut local = FreeList::new();

        let frame = local.steal_half(&mut donor, &links);
        assert_eq!(frame, Some(0));
        assert_eq!(frames(&local, &links), vec![1, 2, 3, 4, 5]);
        assert_eq!(frames(&donor, &links), vec![6, 7, 8, 9]);
        assert_eq!(local.len(), 5);
        assert_eq!(donor.len(), 4);
        assert_eq!(local.count(&links), local.len());
        assert_eq!(donor.count(&links), donor.len());
    }

    #[test]
    fn test_steal_odd_donor() {
        let links = Links::new(9);
        let mut donor = list_of(9, &links);
        let mut local = FreeList::new();

        assert_eq!(local.steal_half(&mut donor, &links), Some(0));
        assert_eq!(frames(&local, &links), vec![1, 2, 3, 4]);
        assert_eq!(frames(&donor, &links), vec![5, 6, 7, 8]);
        assert_eq!(local.len(), 4);
        assert_eq!(donor.len(), 4);
    }

    #[test]
    fn test_steal_conserves_small_counts() {
        for n in 1..=17 {
            let links = Links::new(n);
            let mut donor = list_of(n, &links);
            let mut local = FreeList::new();

            assert!(local.steal_half(&mut donor, &links).is_some());
            assert_eq!(local.len() + donor.len() + 1, n, "n = {n}");
            assert_eq!(local.count(&links), local.len(), "n = {n}");
            assert_eq!(donor.count(&links), donor.len(), "n = {n}");
        }
    }

    #[test]
    fn test_steal_single_frame() {
        let links = Links::new(3);
        let mut donor = FreeList::new();
        donor.push(2, &links);
        let mut local = FreeList::new();

        assert_eq!(local.steal_half(&mut donor, &links), Some(2));
        assert!(donor.is_empty());
        assert!(local.is_empty());
        assert_eq!(donor.len(), 0);
        assert_eq!(local.len(), 0);
    }

    #[test]
    fn test_steal_from_empty() {
        let links = Links::new(1);
        let mut donor = FreeList::new();
        let mut local = FreeList::new();
        assert_eq!(local.steal_half(&mut donor, &links), None);
    }
}
