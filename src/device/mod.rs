//! Block-device collaborators for the buffer cache.
//!
//! The cache never interprets block contents; it only moves whole blocks
//! between its slots and a [`BlockDevice`] with synchronous reads and writes.

mod error;
mod file_disk;
mod mem_disk;

pub use error::{DeviceError, DeviceResult};
pub use file_disk::FileDisk;
pub use mem_disk::MemDisk;

/// Synchronous block transport addressed by (device, block number).
pub trait BlockDevice: Send + Sync {
    /// Size in bytes of every block on every device
    fn block_size(&self) -> usize;

    /// Fill `buf` with the contents of `blockno` on `dev`
    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]) -> DeviceResult<()>;

    /// Persist `buf` as the contents of `blockno` on `dev`
    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]) -> DeviceResult<()>;

    /// Check a caller buffer against the device block size
    fn check_len(&self, len: usize) -> DeviceResult<()> {
        if len != self.block_size() {
            return Err(DeviceError::InvalidBlockSize {
                expected: self.block_size(),
                actual: len,
            });
        }
        Ok(())
    }
}
