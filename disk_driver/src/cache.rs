use std::num::NonZeroUsize;

use anyhow::Result;
use lru::LruCache;

use crate::{DiskDriver, SeekType, IOC_REQ_DEVICE_IO_SZ, IOC_REQ_DEVICE_RESET};

const CACHE_UNITS: usize = 1024;

/// Write-through LRU cache over another driver, keyed by io-unit index.
/// Reads of hot units skip the backend entirely.
pub struct CacheDiskDriver<T: DiskDriver> {
    inner: T,
    cache: LruCache<u64, Vec<u8>>,
    pointer: u64,
    unit: usize,
}

impl<T: DiskDriver> CacheDiskDriver<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            cache: LruCache::new(NonZeroUsize::new(CACHE_UNITS).unwrap()),
            pointer: 0,
            unit: 512,
        }
    }

    fn load_unit(&mut self, index: u64) -> Result<&Vec<u8>> {
        if !self.cache.contains(&index) {
            let mut data = vec![0 as u8; self.unit];
            self.inner
                .ddriver_seek((index * self.unit as u64) as i64, SeekType::Set)?;
            self.inner.ddriver_read(&mut data, self.unit)?;
            self.cache.put(index, data);
        }
        Ok(self.cache.get(&index).unwrap())
    }
}

impl<T: DiskDriver> DiskDriver for CacheDiskDriver<T> {
    fn ddriver_open(&mut self, path: &str) -> Result<()> {
        self.inner.ddriver_open(path)?;
        let mut arg = [0 as u8; 4];
        self.inner.ddriver_ioctl(IOC_REQ_DEVICE_IO_SZ, &mut arg)?;
        self.unit = u32::from_le_bytes(arg) as usize;
        self.cache.clear();
        Ok(())
    }

    fn ddriver_close(&mut self) -> Result<()> {
        self.cache.clear();
        self.inner.ddriver_close()
    }

    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.pointer = match whence {
            SeekType::Set => offset as u64,
            SeekType::Cur => (self.pointer as i64 + offset) as u64,
            SeekType::End => self.inner.ddriver_seek(offset, whence)?,
        };
        Ok(self.pointer)
    }

    fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize> {
        if size == 0 {
            return Ok(0);
        }
        self.inner.ddriver_seek(self.pointer as i64, SeekType::Set)?;
        self.inner.ddriver_write(buf, size)?;
        let unit = self.unit as u64;
        let first = self.pointer / unit;
        let last = (self.pointer + size as u64 - 1) / unit;
        for index in first..=last {
            let unit_start = index * unit;
            let left = self.pointer.max(unit_start);
            let right = (self.pointer + size as u64).min(unit_start + unit);
            if let Some(data) = self.cache.get_mut(&index) {
                let src = (left - self.pointer) as usize;
                let dst = (left - unit_start) as usize;
                let len = (right - left) as usize;
                data[dst..dst + len].copy_from_slice(&buf[src..src + len]);
            }
        }
        self.pointer += size as u64;
        Ok(size)
    }

    fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize> {
        if size == 0 {
            return Ok(0);
        }
        let unit = self.unit as u64;
        let start = self.pointer;
        let first = start / unit;
        let last = (start + size as u64 - 1) / unit;
        for index in first..=last {
            let unit_start = index * unit;
            let left = start.max(unit_start);
            let right = (start + size as u64).min(unit_start + unit);
            let data = self.load_unit(index)?;
            let src = (left - unit_start) as usize;
            let dst = (left - start) as usize;
            let len = (right - left) as usize;
            buf[dst..dst + len].copy_from_slice(&data[src..src + len]);
        }
        self.pointer += size as u64;
        Ok(size)
    }

    fn ddriver_ioctl(&mut self, cmd: u32, arg: &mut [u8]) -> Result<()> {
        if cmd == IOC_REQ_DEVICE_RESET {
            self.cache.clear();
        }
        self.inner.ddriver_ioctl(cmd, arg)
    }

    fn ddriver_reset(&mut self) -> Result<()> {
        self.cache.clear();
        self.pointer = 0;
        self.inner.ddriver_reset()
    }

    fn ddriver_flush(&mut self) -> Result<()> {
        self.inner.ddriver_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver_tester;
    use crate::memory::MemoryDiskDriver;
    use anyhow::Result;

    #[test]
    fn simple_test() -> Result<()> {
        let mut driver = CacheDiskDriver::new(MemoryDiskDriver::new());
        driver.ddriver_open("mem")?;
        driver_tester(&mut driver)
    }

    #[test]
    fn cached_read_sees_writes() -> Result<()> {
        let mut driver = CacheDiskDriver::new(MemoryDiskDriver::new());
        driver.ddriver_open("mem")?;
        let unit = 512;
        let ones = vec![1 as u8; unit];
        // warm the cache, then overwrite through it
        driver.ddriver_seek(0, SeekType::Set)?;
        let mut scratch = vec![0 as u8; unit];
        driver.ddriver_read(&mut scratch, unit)?;
        driver.ddriver_seek(0, SeekType::Set)?;
        driver.ddriver_write(&ones, unit)?;
        driver.ddriver_seek(0, SeekType::Set)?;
        driver.ddriver_read(&mut scratch, unit)?;
        assert_eq!(scratch, ones);
        Ok(())
    }
}
