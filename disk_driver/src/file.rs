use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{anyhow, Result};
use log::*;

use crate::*;

const FILE_DISK_SIZE: usize = 64 * 0x400 * 0x400;
const FILE_DISK_UNIT: usize = 512;

/// Disk driver backed by a regular file. The file grows on demand up to
/// `layout_size`; unwritten ranges read back as zeros.
pub struct FileDiskDriver {
    pub info: DiskInfo,
    file: Option<File>,
    pointer: u64,
}

impl DiskDriver for FileDiskDriver {
    fn ddriver_open(&mut self, path: &str) -> Result<()> {
        info!("FileDrv open: {}", path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        self.file = Some(file);
        self.pointer = 0;
        Ok(())
    }

    fn ddriver_close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.pointer = match whence {
            SeekType::Set => offset as u64,
            SeekType::Cur => (self.pointer as i64 + offset) as u64,
            SeekType::End => (self.info.consts.layout_size as i64 - offset) as u64,
        };
        self.info.stats.seek_cnt += 1;
        Ok(self.pointer)
    }

    fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize> {
        assert!(buf.len() >= size);
        let pointer = self.pointer;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pointer))?;
        file.write_all(&buf[..size])?;
        self.pointer += size as u64;
        self.info.stats.write_cnt += 1;
        Ok(size)
    }

    fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize> {
        assert!(buf.len() >= size);
        let pointer = self.pointer;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pointer))?;
        // short reads past EOF fill with zeros
        let mut done = 0;
        while done < size {
            let n = file.read(&mut buf[done..size])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        buf[done..size].fill(0);
        self.pointer += size as u64;
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
        if let Some(file) = self.file.as_mut() {
            file.set_len(0)?;
        }
        self.info.stats = Default::default();
        self.pointer = 0;
        Ok(())
    }

    fn ddriver_flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl FileDiskDriver {
    pub fn new() -> Self {
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst {
                    layout_size: FILE_DISK_SIZE as u32,
                    iounit_size: FILE_DISK_UNIT as u32,
                    ..Default::default()
                },
            },
            file: None,
            pointer: 0,
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| anyhow!("Driver not opened!"))
    }
}

impl Default for FileDiskDriver {
    fn default() -> Self {
        Self::new()
    }
}
