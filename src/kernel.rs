use log::info;
use std::sync::Arc;
use thiserror::Error;

use crate::bio::BufferCache;
use crate::device::{BlockDevice, DeviceError};
use crate::kalloc::FrameAllocator;
use crate::param::{ParamError, Params};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Parameter error: {0}")]
    Param(#[from] ParamError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Device block size {actual} does not match configured {expected}")]
    BlockSizeMismatch { expected: usize, actual: usize },
}

pub type KernelResult<T> = Result<T, KernelError>;

/// The buffer cache and the frame allocator, built once at boot.
pub struct Kernel {
    params: Params,
    pub bcache: BufferCache,
    pub kmem: FrameAllocator,
}

/// The core that receives the whole physical range at boot
pub const BOOT_CPU: usize = 0;

impl Kernel {
    pub fn new(params: Params, device: Arc<dyn BlockDevice>) -> KernelResult<Self> {
        params.validate()?;
        if device.block_size() != params.block_size {
            return Err(KernelError::BlockSizeMismatch {
                expected: params.block_size,
                actual: device.block_size(),
            });
        }

        let bcache = BufferCache::new(&params, device);

        let range = params.phys_range();
        let kmem = FrameAllocator::new(range, params.ncpu);
        kmem.seed(BOOT_CPU, range);

        info!(
            "kernel up: {} buffers, {} frames over {} cpus",
            params.nbuf,
            kmem.total_free(),
            params.ncpu
        );

        Ok(Self {
            params,
            bcache,
            kmem,
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}
