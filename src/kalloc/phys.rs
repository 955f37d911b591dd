use std::fmt;

/// Size of one physical frame in bytes
pub const PAGE_SIZE: usize = 4096;

/// Physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn page_round_up(self) -> Self {
        let mask = PAGE_SIZE as u64 - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Half-open span of physical memory `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

impl PhysRange {
    pub const fn new(start: PhysAddr, end: PhysAddr) -> Self {
        Self { start, end }
    }

    /// First whole page inside the range
    pub const fn first_page(&self) -> PhysAddr {
        self.start.page_round_up()
    }

    /// Number of whole pages inside the range
    pub fn page_count(&self) -> usize {
        let first = self.first_page().as_u64();
        let end = self.end.as_u64();
        if end <= first {
            return 0;
        }
        ((end - first) / PAGE_SIZE as u64) as usize
    }

    /// Every whole page inside the range, lowest first
    pub fn pages(&self) -> impl Iterator<Item = PhysAddr> {
        let first = self.first_page();
        (0..self.page_count() as u64).map(move |i| first.add(i * PAGE_SIZE as u64))
    }

    /// Whether the whole page starting at `addr` lies inside the range
    pub fn contains_page(&self, addr: PhysAddr) -> bool {
        addr.is_page_aligned()
            && addr >= self.first_page()
            && addr.as_u64() + PAGE_SIZE as u64 <= self.end.as_u64()
    }
}

/// Backing store standing in for the physical pages of a [`PhysRange`].
///
/// Each page sits behind its own lock so the allocator can scribble on a
/// free page while its owner is elsewhere.
pub struct PhysMemory {
    range: PhysRange,
    pages: Box<[spin::Mutex<Box<[u8]>>]>,
}

impl PhysMemory {
    pub fn new(range: PhysRange) -> Self {
        let pages = (0..range.page_count())
            .map(|_| spin::Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
            .collect();
        Self { range, pages }
    }

    pub fn range(&self) -> PhysRange {
        self.range
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Frame number of a page inside the range
    pub fn index_of(&self, addr: PhysAddr) -> Option<usize> {
        if !self.range.contains_page(addr) {
            return None;
        }
        let offset = addr.as_u64() - self.range.first_page().as_u64();
        Some((offset / PAGE_SIZE as u64) as usize)
    }

    pub fn addr_of(&self, index: usize) -> PhysAddr {
        self.range
            .first_page()
            .add((index * PAGE_SIZE) as u64)
    }

    /// Bytes of the page at `addr`
    pub fn page(&self, addr: PhysAddr) -> Option<spin::MutexGuard<'_, Box<[u8]>>> {
        let index = self.index_of(addr)?;
        Some(self.pages[index].lock())
    }

    pub(crate) fn fill(&self, index: usize, byte: u8) {
        self.pages[index].lock().fill(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert!(PhysAddr::new(0x8000_0000).is_page_aligned());
        assert!(!PhysAddr::new(0x8000_0001).is_page_aligned());
        assert_eq!(PhysAddr::new(4097).page_round_up(), PhysAddr::new(8192));
        assert_eq!(PhysAddr::new(8192).page_round_up(), PhysAddr::new(8192));
        assert_eq!(PhysAddr::new(0x1000).to_string(), "0x1000");
    }

    #[test]
    fn test_range_skips_partial_pages() {
        // Starts mid-page and ends mid-page
        let range = PhysRange::new(PhysAddr::new(100), PhysAddr::new(3 * 4096 + 5));
        assert_eq!(range.page_count(), 2);
        let pages: Vec<u64> = range.pages().map(PhysAddr::as_u64).collect();
        assert_eq!(pages, vec![4096, 8192]);

        assert!(range.contains_page(PhysAddr::new(8192)));
        assert!(!range.contains_page(PhysAddr::new(0)));
        assert!(!range.contains_page(PhysAddr::new(3 * 4096)));
        assert!(!range.contains_page(PhysAddr::new(4097)));
    }

    #[test]
    fn test_empty_range() {
        let range = PhysRange::new(PhysAddr::new(4096), PhysAddr::new(4096));
        assert_eq!(range.page_count(), 0);
        assert_eq!(range.pages().count(), 0);

        let inverted = PhysRange::new(PhysAddr::new(8192), PhysAddr::new(4096));
        assert_eq!(inverted.page_count(), 0);
    }

    #[test]
    fn test_memory_indexing() {
        let range = PhysRange::new(PhysAddr::new(0x10_0000), PhysAddr::new(0x10_4000));
        let memory = PhysMemory::new(range);
        assert_eq!(memory.page_count(), 4);
        assert_eq!(memory.index_of(PhysAddr::new(0x10_2000)), Some(2));
        assert_eq!(memory.index_of(PhysAddr::new(0x10_4000)), None);
        assert_eq!(memory.addr_of(3), PhysAddr::new(0x10_3000));

        memory.fill(1, 0x5a);
        let page = memory.page(PhysAddr::new(0x10_1000)).unwrap();
        assert!(page.iter().all(|&b| b == 0x5a));
    }
}
