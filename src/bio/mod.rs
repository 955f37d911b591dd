//! Buffer cache.
//!
//! A fixed pool of block buffers shared by every core. Lookups are sharded
//! over hash buckets keyed by block number, each behind its own spinlock.
//! A miss first recycles the least recently released buffer of its own
//! bucket; only when the bucket has none does it take the coordination
//! lock and steal the least recently released buffer of the whole pool.
//!
//! Interface:
//! * [`BufferCache::acquire`] returns a locked buffer holding the block.
//! * [`BufferCache::commit`] writes a changed buffer back to the device.
//! * [`BufferCache::release`] gives the buffer back; dropping the guard
//!   does the same.
//! * [`BufferCache::pin`] / [`BufferCache::unpin`] keep a buffer resident
//!   without holding its lock.

mod buf;
mod sleeplock;


pub use buf::{BufId, UNASSIGNED};
pub use sleeplock::{SleepLock, SleepLockGuard};

use log::{debug, error, trace};
use serde::Serialize;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::{BlockDevice, DeviceResult};
use crate::param::Params;
use buf::{Buf, BucketList};

/// Counters describing how lookups were satisfied
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses served by recycling a buffer of the same bucket
    pub local_reuse: u64,
    /// Misses served by a slot that had never been used
    pub first_use: u64,
    /// Misses served by moving a buffer out of another bucket
    pub relocations: u64,
    pub device_reads: u64,
    pub device_writes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    local_reuse: AtomicU64,
    first_use: AtomicU64,
    relocations: AtomicU64,
    device_reads: AtomicU64,
    device_writes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    bufs: Box<[Buf]>,
    buckets: Box<[spin::Mutex<BucketList>]>,
    /// Serializes victim searches that cross bucket boundaries
    evict_lock: spin::Mutex<()>,
    /// Logical clock stamped on buffers when their last reference goes
    ticks: AtomicU64,
    counters: Counters,
}

impl BufferCache {
    /// Build the pool described by `params` on top of `device`.
    ///
    /// Every slot starts unassigned and belongs to no bucket.
    pub fn new(params: &Params, device: Arc<dyn BlockDevice>) -> Self {
        let bufs = (0..params.nbuf)
            .map(|_| Buf::new(device.block_size()))
            .collect();
        let buckets = (0..params.nbucket)
            .map(|_| spin::Mutex::new(BucketList::new()))
            .collect();

        debug!(
            "buffer cache: {} buffers of {} bytes in {} buckets",
            params.nbuf,
            device.block_size(),
            params.nbucket
        );

        Self {
            device,
            bufs,
            buckets,
            evict_lock: spin::Mutex::new(()),
            ticks: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Return a locked buffer with the contents of `blockno` on `dev`.
    ///
    /// Blocks while another caller holds the buffer. The block is read
    /// from the device only if the buffer does not already hold it.
    pub fn acquire(&self, dev: u32, blockno: u32) -> DeviceResult<BufGuard<'_>> {
        let id = self.get(dev, blockno);
        let buf = &self.bufs[id];
        let mut guard = BufGuard {
            cache: self,
            id,
            data: ManuallyDrop::new(buf.data.lock()),
        };

        if !buf.is_valid() {
            // On failure the guard drops and the buffer stays invalid
            self.device.read_block(dev, blockno, &mut guard.data)?;
            buf.set_valid();
            bump(&self.counters.device_reads);
        }

        Ok(guard)
    }

    /// Write the buffer's contents to the device. Caller must hold it.
    pub fn commit(&self, guard: &BufGuard<'_>) -> DeviceResult<()> {
        if !guard.data.holding() {
            error!("commit: buffer {} is not held by the caller", guard.id);
            panic!("commit: buffer {} is not held by the caller", guard.id);
        }

        let buf = &self.bufs[guard.id];
        self.device
            .write_block(buf.dev(), buf.blockno(), &guard.data)?;
        bump(&self.counters.device_writes);
        Ok(())
    }

    /// Unlock a held buffer and drop the caller's reference.
    pub fn release(&self, guard: BufGuard<'_>) {
        if !guard.data.holding() {
            error!("release: buffer {} is not held by the caller", guard.id);
            panic!("release: buffer {} is not held by the caller", guard.id);
        }
        drop(guard);
    }

    /// Take an extra reference so the buffer cannot be recycled.
    ///
    /// The buffer must already be referenced, typically by the caller's
    /// own guard.
    pub fn pin(&self, id: BufId) {
        let buf = &self.bufs[id.0];
        let bucket = self.lock_bucket_of(id.0, "pin");
        if buf.refcnt() == 0 {
            drop(bucket);
            error!("pin: buffer {} is not referenced", id.0);
            panic!("pin: buffer {} is not referenced", id.0);
        }
        buf.inc_ref();
        drop(bucket);
    }

    /// Drop a reference taken by [`pin`](Self::pin).
    pub fn unpin(&self, id: BufId) {
        let buf = &self.bufs[id.0];
        let bucket = self.lock_bucket_of(id.0, "unpin");
        if buf.dec_ref().is_none() {
            drop(bucket);
            error!("unpin: buffer {} reference count underflow", id.0);
            panic!("unpin: buffer {} reference count underflow", id.0);
        }
    }

    /// Buffer currently holding `blockno` on `dev`, without referencing it
    pub fn lookup(&self, dev: u32, blockno: u32) -> Option<BufId> {
        let bucket = self.buckets[self.hash(blockno)].lock();
        bucket
            .iter(&self.bufs)
            .find(|&id| self.bufs[id].holds(dev, blockno))
            .map(BufId)
    }

    pub fn refcnt(&self, id: BufId) -> u32 {
        self.bufs[id.0].refcnt()
    }

    /// Logical time of the buffer's last full release
    pub fn timestamp(&self, id: BufId) -> u64 {
        self.bufs[id.0].timestamp()
    }

    /// (device, block number) the buffer was last assigned
    pub fn identity(&self, id: BufId) -> Option<(u32, u32)> {
        let buf = &self.bufs[id.0];
        buf.is_assigned().then(|| (buf.dev(), buf.blockno()))
    }

    /// Bucket the buffer is linked into, if it was ever used
    pub fn bucket_of(&self, id: BufId) -> Option<usize> {
        let buf = &self.bufs[id.0];
        buf.is_assigned().then(|| self.hash(buf.blockno()))
    }

    /// Members of one bucket in list order
    pub fn bucket_members(&self, bucket: usize) -> Vec<BufId> {
        let list = self.buckets[bucket].lock();
        list.iter(&self.bufs).map(BufId).collect()
    }

    pub fn nbuf(&self) -> usize {
        self.bufs.len()
    }

    pub fn nbucket(&self) -> usize {
        self.buckets.len()
    }

    /// Current value of the logical clock
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            local_reuse: c.local_reuse.load(Ordering::Relaxed),
            first_use: c.first_use.load(Ordering::Relaxed),
            relocations: c.relocations.load(Ordering::Relaxed),
            device_reads: c.device_reads.load(Ordering::Relaxed),
            device_writes: c.device_writes.load(Ordering::Relaxed),
        }
    }

    fn hash(&self, blockno: u32) -> usize {
        blockno as usize % self.buckets.len()
    }

    /// Lock the bucket the buffer is linked into.
    ///
    /// An unreferenced buffer may be relocated between reading its block
    /// number and taking the lock, so membership is checked under the lock
    /// and the lookup retried until it holds.
    fn lock_bucket_of(&self, id: usize, op: &str) -> spin::MutexGuard<'_, BucketList> {
        let buf = &self.bufs[id];
        loop {
            if !buf.is_assigned() {
                error!("{op}: buffer {id} was never assigned");
                panic!("{op}: buffer {id} was never assigned");
            }
            let bucket = self.buckets[self.hash(buf.blockno())].lock();
            if bucket.iter(&self.bufs).any(|member| member == id) {
                return bucket;
            }
            trace!("{op}: buffer {id} moved while locking its bucket");
        }
    }

    /// Find or claim the slot for (dev, blockno) and take a reference on
    /// it. The slot is not locked on return.
    fn get(&self, dev: u32, blockno: u32) -> usize {
        if blockno == UNASSIGNED {
            error!("acquire: block number {blockno:#x} is reserved");
            panic!("acquire: block number {blockno:#x} is reserved");
        }

        let idx = self.hash(blockno);
        let mut bucket = self.buckets[idx].lock();

        if let Some(id) = self.hit(&bucket, dev, blockno) {
            return id;
        }

        if let Some((id, _)) = bucket.lru(&self.bufs) {
            self.bufs[id].assign(dev, blockno);
            bump(&self.counters.misses);
            bump(&self.counters.local_reuse);
            trace!("bucket {idx}: reusing buffer {id} for ({dev}, {blockno})");
            return id;
        }

        // Retake the bucket under the coordination lock; whoever holds it
        // is the only thread allowed to hold two bucket locks.
        drop(bucket);
        let evict = self.evict_lock.lock();
        bucket = self.buckets[idx].lock();

        // The bucket was open in between; someone may have cached the
        // block or released a member meanwhile.
        if let Some(id) = self.hit(&bucket, dev, blockno) {
            return id;
        }
        let id = match bucket.lru(&self.bufs) {
            Some((id, _)) => {
                bump(&self.counters.local_reuse);
                id
            }
            None => self.steal_victim(idx, &mut bucket, dev, blockno),
        };
        bump(&self.counters.misses);

        // Assigned before the coordination lock goes, so no other search
        // can still see the slot as free
        self.bufs[id].assign(dev, blockno);
        drop(evict);
        drop(bucket);
        id
    }

    /// Cached lookup under the bucket lock. A hit takes its reference
    /// before the lock is dropped.
    fn hit(&self, bucket: &BucketList, dev: u32, blockno: u32) -> Option<usize> {
        let id = bucket
            .iter(&self.bufs)
            .find(|&id| self.bufs[id].holds(dev, blockno))?;
        self.bufs[id].inc_ref();
        bump(&self.counters.hits);
        trace!("hit ({dev}, {blockno}) in buffer {id}");
        Some(id)
    }

    /// Pick the least recently released buffer of the whole pool and link
    /// it into bucket `idx`. Requires the coordination lock.
    fn steal_victim(&self, idx: usize, target: &mut BucketList, dev: u32, blockno: u32) -> usize {
        // Never-used slots carry the zero timestamp, older than any release
        if let Some(id) = self.bufs.iter().position(|buf| !buf.is_assigned()) {
            target.push_front(id, &self.bufs);
            bump(&self.counters.first_use);
            debug!("bucket {idx}: first use of buffer {id}");
            return id;
        }

        // Hold at most the current best bucket's lock while scanning
        let mut best: Option<(spin::MutexGuard<'_, BucketList>, usize, u64)> = None;
        for (b, lock) in self.buckets.iter().enumerate() {
            if b == idx {
                continue;
            }
            let list = lock.lock();
            if let Some((id, ts)) = list.lru(&self.bufs)
                && best.as_ref().is_none_or(|&(_, _, min)| ts < min)
            {
                best = Some((list, id, ts));
            }
        }

        let Some((mut source, id, _)) = best else {
            error!("acquire: no unreferenced buffer for ({dev}, {blockno})");
            panic!("acquire: no unreferenced buffer for ({dev}, {blockno})");
        };

        let from = self.hash(self.bufs[id].blockno());
        if !source.unlink(id, &self.bufs) {
            error!("acquire: buffer {id} missing from bucket {from}");
            panic!("acquire: buffer {id} missing from bucket {from}");
        }
        drop(source);

        target.push_front(id, &self.bufs);
        bump(&self.counters.relocations);
        debug!("moved buffer {id} from bucket {from} to bucket {idx}");
        id
    }

    /// Drop one reference; the last one stamps the release time.
    fn unref(&self, id: usize) {
        let buf = &self.bufs[id];
        let bucket = self.lock_bucket_of(id, "release");
        match buf.dec_ref() {
            Some(0) => buf.stamp(self.ticks.fetch_add(1, Ordering::Relaxed) + 1),
            Some(_) => {}
            None => {
                drop(bucket);
                error!("release: buffer {id} reference count underflow");
                panic!("release: buffer {id} reference count underflow");
            }
        }
    }
}

/// A buffer returned by [`BufferCache::acquire`], locked by the caller.
///
/// Dereferences to the block payload.
pub struct BufGuard<'a> {
    cache: &'a BufferCache,
    id: usize,
    data: ManuallyDrop<SleepLockGuard<'a, Box<[u8]>>>,
}

impl BufGuard<'_> {
    pub fn id(&self) -> BufId {
        BufId(self.id)
    }

    pub fn dev(&self) -> u32 {
        self.cache.bufs[self.id].dev()
    }

    pub fn blockno(&self) -> u32 {
        self.cache.bufs[self.id].blockno()
    }

    /// Whether the calling thread holds this buffer
    pub fn holding(&self) -> bool {
        self.data.holding()
    }
}

impl Deref for BufGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // Unlock first, then give the reference back under the bucket lock
        // Safety: `data` is never touched again after this
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.unref(self.id);
    }
}
