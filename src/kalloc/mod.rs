//! Physical page allocator.
//!
//! Allocates whole 4096-byte frames out of one fixed physical range. Every
//! core owns a free list behind its own spinlock; a core that runs dry
//! steals the front half of the longest list of another core.
//!
//! Locks are always taken in ascending core order, so two cores stealing
//! from each other at the same time cannot deadlock.

mod freelist;
mod phys;


pub use phys::{PAGE_SIZE, PhysAddr, PhysMemory, PhysRange};

use log::{debug, error, info, trace};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use freelist::{FreeList, Links};

/// Index of a core
pub type CpuId = usize;

/// Written over a frame when it is freed, to catch dangling references
pub const FREE_JUNK: u8 = 0x01;

/// Written over a frame when it is handed out, to catch reads of
/// uninitialized memory
pub const ALLOC_JUNK: u8 = 0x05;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocStats {
    /// Local exhaustions satisfied from another core
    pub steals: u64,
    /// Local exhaustions with nothing left anywhere
    pub failed_steals: u64,
}

pub struct FrameAllocator {
    memory: PhysMemory,
    links: Links,
    cpus: Box<[spin::Mutex<FreeList>]>,
    steals: AtomicU64,
    failed_steals: AtomicU64,
}

impl FrameAllocator {
    /// Allocator managing `range` for `ncpu` cores. All lists start empty;
    /// see [`seed`](Self::seed).
    pub fn new(range: PhysRange, ncpu: usize) -> Self {
        let memory = PhysMemory::new(range);
        let links = Links::new(memory.page_count());
        let cpus = (0..ncpu).map(|_| spin::Mutex::new(FreeList::new())).collect();

        Self {
            memory,
            links,
            cpus,
            steals: AtomicU64::new(0),
            failed_steals: AtomicU64::new(0),
        }
    }

    /// Free every whole page of `range` onto `cpu`'s list.
    pub fn seed(&self, cpu: CpuId, range: PhysRange) {
        let mut pages = 0;
        for addr in range.pages() {
            self.release(cpu, addr);
            pages += 1;
        }
        info!(
            "seeded {pages} frames [{}, {}) on cpu {cpu}",
            range.first_page(),
            range.end
        );
    }

    /// Allocate one frame for `cpu`, stealing from other cores if its own
    /// list is empty. `None` when no core has a free frame.
    pub fn obtain(&self, cpu: CpuId) -> Option<PhysAddr> {
        let mut local = self.cpu(cpu, "obtain").lock();
        let popped = local.pop(&self.links);
        drop(local);

        let frame = match popped {
            Some(frame) => {
                trace!("cpu {cpu}: local frame {frame}");
                frame
            }
            None => self.steal(cpu)?,
        };

        self.memory.fill(frame, ALLOC_JUNK);
        Some(self.memory.addr_of(frame))
    }

    /// Return a frame to `cpu`'s list.
    ///
    /// # Panics
    ///
    /// If `addr` is not page aligned or outside the managed range.
    pub fn release(&self, cpu: CpuId, addr: PhysAddr) {
        if !addr.is_page_aligned() {
            error!("release: {addr} is not page aligned");
            panic!("release: {addr} is not page aligned");
        }
        let Some(frame) = self.memory.index_of(addr) else {
            let range = self.memory.range();
            error!("release: {addr} outside [{}, {})", range.first_page(), range.end);
            panic!("release: {addr} outside [{}, {})", range.first_page(), range.end);
        };

        self.memory.fill(frame, FREE_JUNK);

        let mut list = self.cpu(cpu, "release").lock();
        list.push(frame, &self.links);
    }

    /// Tracked number of free frames on `cpu`
    pub fn free_count(&self, cpu: CpuId) -> usize {
        self.cpu(cpu, "free_count").lock().len()
    }

    /// Tracked number of free frames on all cores
    pub fn total_free(&self) -> usize {
        self.cpus.iter().map(|list| list.lock().len()).sum()
    }

    /// Verify that every core's tracked count matches its list.
    ///
    /// # Panics
    ///
    /// On the first core whose count disagrees.
    pub fn check_lengths(&self) {
        for (cpu, lock) in self.cpus.iter().enumerate() {
            let list = lock.lock();
            let real = list.count(&self.links);
            if real != list.len() {
                error!("cpu {cpu}: real {real}, tracked {}", list.len());
                panic!(
                    "check_lengths: cpu {cpu} tracks {} frames but holds {real}",
                    list.len()
                );
            }
        }
    }

    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    pub fn memory(&self) -> &PhysMemory {
        &self.memory
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            steals: self.steals.load(Ordering::Relaxed),
            failed_steals: self.failed_steals.load(Ordering::Relaxed),
        }
    }

    fn cpu(&self, cpu: CpuId, op: &str) -> &spin::Mutex<FreeList> {
        match self.cpus.get(cpu) {
            Some(list) => list,
            None => {
                error!("{op}: no cpu {cpu}");
                panic!("{op}: no cpu {cpu}");
            }
        }
    }

    /// Refill `cpu` from the core with the most free frames.
    ///
    /// `None` only once a scan finds every other core empty.
    fn steal(&self, cpu: CpuId) -> Option<usize> {
        loop {
            let Some((donor, donor_list)) = self.pick_donor(cpu) else {
                self.failed_steals.fetch_add(1, Ordering::Relaxed);
                debug!("cpu {cpu}: no free frames anywhere");
                return None;
            };

            match self.take_from(cpu, donor, donor_list) {
                Steal::Taken(frame) => return Some(frame),
                Steal::Drained => {
                    debug!("cpu {cpu}: donor cpu {donor} drained before the steal, rescanning");
                }
            }
        }
    }

    /// The other core with the longest list, still locked.
    fn pick_donor(&self, cpu: CpuId) -> Option<(CpuId, spin::MutexGuard<'_, FreeList>)> {
        // Keep only the best candidate locked; later cores have higher
        // indices, so the scan itself respects the lock order.
        let mut best: Option<(CpuId, spin::MutexGuard<'_, FreeList>)> = None;
        for (other, lock) in self.cpus.iter().enumerate() {
            if other == cpu {
                continue;
            }
            let list = lock.lock();
            let longest = best.as_ref().map_or(0, |(_, b)| b.len());
            if list.len() > longest {
                best = Some((other, list));
            }
        }
        best
    }

    /// Lock `cpu` and `donor` in ascending order and split the donor's
    /// list. A donor above `cpu` is unlocked and re-taken after `cpu`, so
    /// it may have drained by then.
    fn take_from(
        &self,
        cpu: CpuId,
        donor: CpuId,
        donor_list: spin::MutexGuard<'_, FreeList>,
    ) -> Steal {
        let (mut local, mut donor_list) = if donor < cpu {
            (self.cpus[cpu].lock(), donor_list)
        } else {
            drop(donor_list);
            let local = self.cpus[cpu].lock();
            (local, self.cpus[donor].lock())
        };

        // Our list was open while we scanned
        if let Some(frame) = local.pop(&self.links) {
            return Steal::Taken(frame);
        }

        let before = donor_list.len();
        let Some(frame) = local.steal_half(&mut donor_list, &self.links) else {
            return Steal::Drained;
        };
        let after = donor_list.len();
        drop(donor_list);

        self.steals.fetch_add(1, Ordering::Relaxed);
        debug!(
            "cpu {cpu}: stole {} frames from cpu {donor}, {after} left there",
            before - after
        );
        Steal::Taken(frame)
    }
}

enum Steal {
    Taken(usize),
    /// The donor emptied between selection and split
    Drained,
}
