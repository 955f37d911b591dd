use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::kalloc::{PAGE_SIZE, PhysAddr, PhysRange};

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed parameter file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid parameter {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

pub type ParamResult<T> = Result<T, ParamError>;

/// Sizing of the buffer pool, the hash table and the physical frame pool.
///
/// Every field is optional in a parameter file; missing ones take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Number of buffer slots in the cache
    pub nbuf: usize,
    /// Number of hash buckets the slots are spread over
    pub nbucket: usize,
    /// Size of one on-device block in bytes
    pub block_size: usize,
    /// Number of cores, one free list each
    pub ncpu: usize,
    /// First byte of the managed physical range (page aligned)
    pub phys_start: u64,
    /// Number of pages in the managed physical range
    pub phys_pages: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            nbuf: 30,
            nbucket: 13,
            block_size: 1024,
            ncpu: 8,
            phys_start: 0x8800_0000,
            phys_pages: 1024,
        }
    }
}

impl Params {
    /// Parse parameters from a JSON document
    pub fn from_json(text: &str) -> ParamResult<Self> {
        let params: Params = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    /// Load parameters from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> ParamResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> ParamResult<()> {
        let positive = [
            ("nbuf", self.nbuf),
            ("nbucket", self.nbucket),
            ("block_size", self.block_size),
            ("ncpu", self.ncpu),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ParamError::Invalid {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if !PhysAddr::new(self.phys_start).is_page_aligned() {
            return Err(ParamError::Invalid {
                name: "phys_start",
                reason: format!("{:#x} is not aligned to {PAGE_SIZE} bytes", self.phys_start),
            });
        }

        if self.phys_end().is_none() {
            return Err(ParamError::Invalid {
                name: "phys_pages",
                reason: format!(
                    "{} pages from {:#x} run past the end of the address space",
                    self.phys_pages, self.phys_start
                ),
            });
        }

        Ok(())
    }

    /// The physical span handed to the frame allocator.
    ///
    /// # Panics
    ///
    /// If the span overflows; [`validate`](Self::validate) rejects that.
    pub fn phys_range(&self) -> PhysRange {
        let Some(end) = self.phys_end() else {
            panic!("phys_range: {:#x} + {} pages overflows", self.phys_start, self.phys_pages);
        };
        PhysRange::new(PhysAddr::new(self.phys_start), end)
    }

    fn phys_end(&self) -> Option<PhysAddr> {
        let pages = u64::try_from(self.phys_pages).ok()?;
        let bytes = pages.checked_mul(PAGE_SIZE as u64)?;
        self.phys_start.checked_add(bytes).map(PhysAddr::new)
    }
}
