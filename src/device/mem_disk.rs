use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use super::{BlockDevice, DeviceError, DeviceResult};

/// RAM-backed block device.
///
/// Blocks that were never written read back as zeros. Every transfer is
/// counted per block so callers can tell how often the device was touched.
pub struct MemDisk {
    block_size: usize,
    blocks: Mutex<AHashMap<(u32, u32), Box<[u8]>>>,
    reads: Mutex<AHashMap<(u32, u32), u64>>,
    total_reads: AtomicU64,
    total_writes: AtomicU64,
    /// Artificial latency added to every read
    read_delay: Option<Duration>,
    offline: AtomicBool,
}

impl MemDisk {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: Mutex::new(AHashMap::new()),
            reads: Mutex::new(AHashMap::new()),
            total_reads: AtomicU64::new(0),
            total_writes: AtomicU64::new(0),
            read_delay: None,
            offline: AtomicBool::new(false),
        }
    }

    /// Make every read sleep for `delay`, widening race windows
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// While offline every transfer fails with [`DeviceError::Offline`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Number of reads issued for one block
    pub fn reads_of(&self, dev: u32, blockno: u32) -> u64 {
        self.reads.lock().get(&(dev, blockno)).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> u64 {
        self.total_reads.load(Ordering::Relaxed)
    }

    pub fn total_writes(&self) -> u64 {
        self.total_writes.load(Ordering::Relaxed)
    }

    /// Current on-device bytes of a block, bypassing the counters
    pub fn peek(&self, dev: u32, blockno: u32) -> Vec<u8> {
        self.blocks
            .lock()
            .get(&(dev, blockno))
            .map(|b| b.to_vec())
            .unwrap_or_else(|| vec![0u8; self.block_size])
    }

    /// Overwrite a block directly, bypassing the counters
    pub fn poke(&self, dev: u32, blockno: u32, data: &[u8]) -> DeviceResult<()> {
        self.check_len(data.len())?;
        self.blocks.lock().insert((dev, blockno), data.into());
        Ok(())
    }

    fn check_online(&self, dev: u32) -> DeviceResult<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(DeviceError::Offline(dev));
        }
        Ok(())
    }
}

impl BlockDevice for MemDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]) -> DeviceResult<()> {
        self.check_len(buf.len())?;
        self.check_online(dev)?;

        if let Some(delay) = self.read_delay {
            thread::sleep(delay);
        }

        match self.blocks.lock().get(&(dev, blockno)) {
            Some(block) => buf.copy_from_slice(block),
            None => buf.fill(0),
        }

        *self.reads.lock().entry((dev, blockno)).or_insert(0) += 1;
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]) -> DeviceResult<()> {
        self.check_len(buf.len())?;
        self.check_online(dev)?;

        self.blocks.lock().insert((dev, blockno), buf.into());
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
