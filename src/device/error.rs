use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown device: {0}")]
    UnknownDevice(u32),

    #[error("Device already attached: {0}")]
    AlreadyAttached(u32),

    #[error("Invalid block size: expected {expected}, got {actual}")]
    InvalidBlockSize { expected: usize, actual: usize },

    #[error("Device offline: {0}")]
    Offline(u32),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
