use anyhow::Result;

use crate::*;

const MEM_DISK_SIZE: usize = 16 * 0x400 * 0x400;

/// Disk driver backed by an in-memory buffer, for tests and throwaway
/// engines that never need to persist.
pub struct MemoryDiskDriver {
    pub info: DiskInfo,
    pub mem: Vec<u8>,
    pointer: usize,
}

impl DiskDriver for MemoryDiskDriver {
    fn ddriver_open(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn ddriver_close(&mut self) -> Result<()> {
        Ok(())
    }

    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        match whence {
            SeekType::Set => self.pointer = offset as usize,
            SeekType::Cur => self.pointer = (self.pointer as i64 + offset) as usize,
            SeekType::End => {
                self.pointer = (self.info.consts.layout_size as i64 - offset) as usize
            }
        };
        self.info.stats.seek_cnt += 1;
        Ok(self.pointer as u64)
    }

    fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize> {
        assert!(buf.len() >= size);
        if self.mem.len() < self.pointer + size {
            self.mem.resize(self.pointer + size, 0);
        }
        self.mem[self.pointer..self.pointer + size].copy_from_slice(&buf[..size]);
        self.pointer += size;
        self.info.stats.write_cnt += 1;
        Ok(size)
    }

    fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize> {
        assert!(buf.len() >= size);
        let end = (self.pointer + size).min(self.mem.len());
        let have = end.saturating_sub(self.pointer);
        buf[..have].copy_from_slice(&self.mem[self.pointer..end]);
        buf[have..size].fill(0);
        self.pointer += size;
        self.info.stats.read_cnt += 1;
        Ok(size)
    }

    fn ddriver_ioctl(&mut self, cmd: u32, arg: &mut [u8]) -> Result<()> {
        match cmd {
            IOC_REQ_DEVICE_SIZE => {
                arg[0..4].copy_from_slice(&self.info.consts.layout_size.to_le_bytes());
                Ok(())
            }
            IOC_REQ_DEVICE_STATE => {
                arg[0..4].copy_from_slice(&self.info.stats.write_cnt.to_le_bytes());
                arg[4..8].copy_from_slice(&self.info.stats.read_cnt.to_le_bytes());
                arg[8..12].copy_from_slice(&self.info.stats.seek_cnt.to_le_bytes());
                Ok(())
            }
            IOC_REQ_DEVICE_RESET => self.ddriver_reset(),
            IOC_REQ_DEVICE_IO_SZ => {
                arg[0..4].copy_from_slice(&self.info.consts.iounit_size.to_le_bytes());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ddriver_reset(&mut self) -> Result<()> {
        self.mem.clear();
        self.info.stats = Default::default();
        self.pointer = 0;
        Ok(())
    }

    fn ddriver_flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl MemoryDiskDriver {
    pub fn new() -> Self {
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst {
                    layout_size: MEM_DISK_SIZE as u32,
                    ..Default::default()
                },
            },
            mem: Vec::new(),
            pointer: 0,
        }
    }
}

impl Default for MemoryDiskDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn simple_test() -> Result<()> {
        let mut driver = MemoryDiskDriver::new();
        driver.ddriver_open("mem")?;
        driver_tester(&mut driver)
    }
}
