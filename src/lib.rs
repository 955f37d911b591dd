pub mod bio;
pub mod device;
pub mod kalloc;
pub mod kernel;
pub mod param;

pub use bio::{BufGuard, BufId, BufferCache, CacheStats, SleepLock, SleepLockGuard};
pub use device::{BlockDevice, DeviceError, DeviceResult, FileDisk, MemDisk};
pub use kalloc::{
    ALLOC_JUNK, AllocStats, CpuId, FREE_JUNK, FrameAllocator, PAGE_SIZE, PhysAddr, PhysMemory,
    PhysRange,
};
pub use kernel::{BOOT_CPU, Kernel, KernelError, KernelResult};
pub use param::{ParamError, ParamResult, Params};
