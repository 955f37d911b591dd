use ahash::AHashMap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{BlockDevice, DeviceError, DeviceResult};

/// Block device backed by one image file per device id.
pub struct FileDisk {
    block_size: usize,
    /// Map from device ids to their image files
    devices: AHashMap<u32, DiskImage>,
}

struct DiskImage {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileDisk {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            devices: AHashMap::new(),
        }
    }

    /// Create an empty image file
    pub fn create_image<P: AsRef<Path>>(path: P) -> DeviceResult<()> {
        let path = path.as_ref();

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        File::create(path)?;
        Ok(())
    }

    /// Attach an existing image file as device `dev`
    pub fn attach<P: AsRef<Path>>(&mut self, dev: u32, path: P) -> DeviceResult<()> {
        if self.devices.contains_key(&dev) {
            return Err(DeviceError::AlreadyAttached(dev));
        }

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        self.devices.insert(
            dev,
            DiskImage {
                file: Mutex::new(file),
                path,
            },
        );
        Ok(())
    }

    /// Detach a device, returning the path of its image
    pub fn detach(&mut self, dev: u32) -> DeviceResult<PathBuf> {
        let image = self
            .devices
            .remove(&dev)
            .ok_or(DeviceError::UnknownDevice(dev))?;
        Ok(image.path)
    }

    /// Number of whole or partial blocks in a device image
    pub fn block_count(&self, dev: u32) -> DeviceResult<u64> {
        let image = self.image(dev)?;
        let len = image.file.lock().metadata()?.len();
        Ok(len.div_ceil(self.block_size as u64))
    }

    /// Sync every attached image to stable storage
    pub fn sync_all(&self) -> DeviceResult<()> {
        for image in self.devices.values() {
            image.file.lock().sync_data()?;
        }
        Ok(())
    }

    pub fn is_attached(&self, dev: u32) -> bool {
        self.devices.contains_key(&dev)
    }

    fn image(&self, dev: u32) -> DeviceResult<&DiskImage> {
        self.devices.get(&dev).ok_or(DeviceError::UnknownDevice(dev))
    }

    fn offset(&self, blockno: u32) -> u64 {
        u64::from(blockno) * self.block_size as u64
    }
}

impl BlockDevice for FileDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]) -> DeviceResult<()> {
        self.check_len(buf.len())?;
        let image = self.image(dev)?;
        let mut file = image.file.lock();

        file.seek(SeekFrom::Start(self.offset(blockno)))?;

        // A short read past the end of the image leaves zeros
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);

        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]) -> DeviceResult<()> {
        self.check_len(buf.len())?;
        let image = self.image(dev)?;
        let mut file = image.file.lock();

        let offset = self.offset(blockno);
        let required_size = offset + self.block_size as u64;

        // Extend the image so the write lands at the right offset
        let current_size = file.metadata()?.len();
        if current_size < required_size {
            file.set_len(required_size)?;
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }
}
