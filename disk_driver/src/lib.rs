use anyhow::Result;

#[derive(Default, Debug, Clone, Copy)]
pub struct DiskStats {
    pub read_cnt: u32,
    pub write_cnt: u32,
    pub seek_cnt: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DiskConst {
    pub read_lat: u32,
    pub write_lat: u32,
    pub seek_lat: u32,
    pub track_num: i32,
    pub major_num: i32,
    pub layout_size: u32,
    pub iounit_size: u32,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct DiskInfo {
    pub stats: DiskStats,
    pub consts: DiskConst,
}

impl Default for DiskConst {
    fn default() -> Self {
        Self {
            read_lat: 2,
            write_lat: 1,
            seek_lat: 4,
            track_num: 0,
            major_num: 100,
            layout_size: 64 * 0x400 * 0x400,
            iounit_size: 512,
        }
    }
}

impl DiskConst {
    pub fn disk_block_count(&self) -> usize {
        (self.layout_size / self.iounit_size) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekType {
    Set,
    Cur,
    End,
}

pub const IOC_REQ_DEVICE_SIZE: u32 = 0x4801;
pub const IOC_REQ_DEVICE_STATE: u32 = 0x4802;
pub const IOC_REQ_DEVICE_RESET: u32 = 0x4803;
pub const IOC_REQ_DEVICE_IO_SZ: u32 = 0x4804;

/// DiskDriver abstract interface
pub trait DiskDriver {
    fn ddriver_open(&mut self, path: &str) -> Result<()>;
    fn ddriver_close(&mut self) -> Result<()>;
    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64>;
    fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize>;
    fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize>;
    fn ddriver_ioctl(&mut self, cmd: u32, arg: &mut [u8]) -> Result<()>;
    fn ddriver_reset(&mut self) -> Result<()>;
    fn ddriver_flush(&mut self) -> Result<()>;
}

/// Shared exerciser for driver implementations: seek/write/read round trip
/// plus ioctl queries on an already opened driver. Kept here so every
/// backend runs the same checks.
pub fn driver_tester(driver: &mut dyn DiskDriver) -> Result<()> {
    let mut arg = [0 as u8; 4];
    driver.ddriver_ioctl(IOC_REQ_DEVICE_IO_SZ, &mut arg)?;
    let unit = u32::from_le_bytes(arg) as usize;
    assert!(unit > 0);
    let pattern = (0..unit).map(|x| (x % 0xff) as u8).collect::<Vec<u8>>();
    driver.ddriver_seek(unit as i64, SeekType::Set)?;
    driver.ddriver_write(&pattern, unit)?;
    driver.ddriver_seek(unit as i64, SeekType::Set)?;
    let mut readback = vec![0 as u8; unit];
    driver.ddriver_read(&mut readback, unit)?;
    assert_eq!(pattern, readback);
    driver.ddriver_flush()?;
    Ok(())
}

pub mod cache;
pub mod file;
pub mod memory;
