use core::mem::size_of;
use core::slice::from_raw_parts;

use anyhow::{anyhow, Result};

/// View a `#[repr(C)]` row as raw bytes.
///
/// # Safety
///
/// `T` must be a plain-old-data row without padding the caller cares about
/// leaking; the returned slice borrows `src`.
pub unsafe fn serialize_row<T: Sized>(src: &T) -> &[u8] {
    from_raw_parts((src as *const T) as *const u8, size_of::<T>())
}

/// Read a `#[repr(C)]` row back from raw bytes.
///
/// # Safety
///
/// `src` must hold at least `size_of::<T>()` bytes that are a valid bit
/// pattern for `T`.
pub unsafe fn deserialize_row<T>(src: &[u8]) -> T {
    assert!(src.len() >= size_of::<T>());
    std::ptr::read_unaligned(src.as_ptr() as *const _)
}

/*
 * Little-endian codec for the variable-size part of the on-disk image
 * (names, block lists, version and snapshot records).
 */

pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_bits().to_le_bytes());
}

pub fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

pub fn put_ids(buf: &mut Vec<u8>, ids: &[u32]) {
    put_u32(buf, ids.len() as u32);
    for id in ids {
        put_u32(buf, *id);
    }
}

/// Bounds-checked reader over a serialized image.
pub struct RowCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RowCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(anyhow!(
                "Truncated image: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn take_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn take_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.take_u64()?))
    }

    pub fn take_str(&mut self) -> Result<String> {
        let len = self.take_u32()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).to_string())
    }

    pub fn take_ids(&mut self) -> Result<Vec<u32>> {
        let len = self.take_u32()? as usize;
        let mut ids = Vec::with_capacity(len);
        for _ in 0..len {
            ids.push(self.take_u32()?);
        }
        Ok(ids)
    }
}

/// Truncate free-form text to `max` characters on a char boundary.
pub fn clip_string(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn init_logs() {
    let _ = env_logger::builder().format_timestamp(None).try_init();
}

#[macro_export]
macro_rules! prv {
    ($e:expr) => {
        {
            println!("{} = {:?}", stringify!($e), $e);
        }
    };
}

#[cfg(test)]
mod test {
    use anyhow::Result;

    use super::*;
    use crate::vsfs_lib::desc::{DiskSuperBlock, VSFS_SUPER_MAGIC};

    #[test]
    fn test_row_round_trip() -> Result<()> {
        let mut row = DiskSuperBlock::default();
        row.s_total_blocks = 1000;
        row.s_total_inodes = 100;
        let bytes = unsafe { serialize_row(&row) }.to_vec();
        let back: DiskSuperBlock = unsafe { deserialize_row(&bytes) };
        assert_eq!(back.s_magic, VSFS_SUPER_MAGIC);
        assert_eq!(back.s_total_blocks, 1000);
        assert_eq!(back.s_uuid, row.s_uuid);
        Ok(())
    }

    #[test]
    fn test_codec_round_trip() -> Result<()> {
        let mut buf = vec![];
        put_u32(&mut buf, 42);
        put_str(&mut buf, "hello");
        put_ids(&mut buf, &[1, 2, 3]);
        put_f64(&mut buf, 0.5);
        let mut cursor = RowCursor::new(&buf);
        assert_eq!(cursor.take_u32()?, 42);
        assert_eq!(cursor.take_str()?, "hello");
        assert_eq!(cursor.take_ids()?, vec![1, 2, 3]);
        assert_eq!(cursor.take_f64()?, 0.5);
        assert!(cursor.take_u32().is_err());
        Ok(())
    }
}
