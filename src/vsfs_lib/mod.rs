/// Storage engine logics
use std::mem::size_of;
use std::time::Instant;

pub use disk_driver;

use anyhow::{anyhow, Result};
use disk_driver::{DiskDriver, DiskInfo, SeekType, IOC_REQ_DEVICE_IO_SZ, IOC_REQ_DEVICE_SIZE};
use log::*;

pub mod dedup;
pub mod desc;
pub mod fs;
pub mod mem;
pub mod snapshot;
pub mod types;
pub mod utils;
pub mod version;

use desc::*;
use mem::*;
use utils::*;

/// Reserved space for the super block row at the head of the image.
const SUPER_BLOCK_REGION: usize = 512;

/// The engine value. One `VSFS` owns a fixed pool of data blocks, a fixed
/// inode table, the snapshot store and the dedup index; callers that share
/// it across threads must serialize every call themselves.
pub struct VSFS<T: DiskDriver> {
    pub driver: T,
    pub driver_info: DiskInfo,
    pub super_block: SuperBlockMem,
    /// Block metadata, indexed by block id
    pub blocks: Vec<BlockMeta>,
    /// Block payloads, allocated lazily on first use
    pub block_data: Vec<Vec<u8>>,
    /// Inode table; slot i holds inode id i + 1
    pub inodes: Vec<Inode>,
    /// Snapshot store; slot i holds snapshot id i + 1, dead slots stay
    pub snapshots: Vec<Snapshot>,
    pub dedup_table: Vec<DedupEntry>,
    pub metrics: PerformanceMetrics,
    pub default_strategy: WriteStrategy,
    pub default_granularity: SnapshotGranularity,
    pub auto_snapshot_enabled: bool,
    pub auto_snapshot_threshold: u32,
    pub volume_uuid: [u8; 16],
    pub disk_file: String,
    pub is_dirty: bool,
}

impl<T: DiskDriver> VSFS<T> {
    /// Create a fresh engine over `driver`: all blocks free, all inode
    /// slots empty. Nothing touches the disk until `vsfs_init` or `save`.
    pub fn create(
        driver: T,
        total_blocks: u32,
        total_inodes: u32,
        disk_file: &str,
    ) -> FsResult<Self> {
        if total_blocks == 0 || total_inodes == 0 {
            return Err(FsError::InvalidArgument(
                "block and inode capacities must be non-zero".to_string(),
            ));
        }
        if disk_file.len() >= MAX_PATH {
            return Err(FsError::InvalidArgument("disk path too long".to_string()));
        }
        let blocks = (0..total_blocks)
            .map(|i| BlockMeta {
                block_id: i,
                ..Default::default()
            })
            .collect();
        let super_block = SuperBlockMem {
            s_total_blocks: total_blocks,
            s_total_inodes: total_inodes,
            s_mkfs_time: unix_now(),
            ..Default::default()
        };
        Ok(Self {
            driver,
            driver_info: Default::default(),
            super_block,
            blocks,
            block_data: vec![Vec::new(); total_blocks as usize],
            inodes: vec![Inode::default(); total_inodes as usize],
            snapshots: vec![],
            dedup_table: vec![],
            metrics: Default::default(),
            default_strategy: WriteStrategy::Cow,
            default_granularity: SnapshotGranularity::Medium,
            auto_snapshot_enabled: true,
            auto_snapshot_threshold: 100,
            volume_uuid: create_uuid(),
            disk_file: disk_file.to_string(),
            is_dirty: true,
        })
    }

    /// Open the backing device and bring the engine up: an existing image
    /// is loaded, anything else (or `force_format`) formats the volume.
    pub fn vsfs_init(&mut self, path: &str, force_format: bool) -> Result<()> {
        self.driver.ddriver_open(path)?;
        let mut buf = [0 as u8; 4];
        self.driver.ddriver_ioctl(IOC_REQ_DEVICE_SIZE, &mut buf)?;
        self.driver_info.consts.layout_size = u32::from_le_bytes(buf);
        self.driver.ddriver_ioctl(IOC_REQ_DEVICE_IO_SZ, &mut buf)?;
        self.driver_info.consts.iounit_size = u32::from_le_bytes(buf);
        debug!("size of super block struct is {}", size_of::<DiskSuperBlock>());
        debug!("size of block meta struct is {}", size_of::<DiskBlockMeta>());
        info!(
            "Disk {} has {} IO blocks.",
            path,
            self.driver_info.consts.disk_block_count()
        );
        self.disk_file = path.to_string();
        if force_format {
            warn!("Will format volume!");
            self.format();
            self.save()?;
        } else if self.load()? {
            info!("FileSystem found!");
        } else {
            warn!("FileSystem not found! formatting volume...");
            self.format();
            self.save()?;
        }
        self.print_stats();
        debug!("Init done.");
        Ok(())
    }

    /// Flush state if needed and close the backing device.
    pub fn vsfs_destroy(&mut self) -> Result<()> {
        if self.is_dirty {
            self.save()?;
        }
        self.driver.ddriver_close()
    }

    /// Reset to the post-create state: all blocks free and zeroed, all
    /// inodes empty, snapshots and dedup index dropped, metrics zeroed.
    pub fn format(&mut self) {
        for meta in self.blocks.iter_mut() {
            meta.kind = BlockKind::Free;
            meta.ref_count = 0;
            meta.content_hash = Default::default();
            meta.is_cow = false;
            meta.is_deduplicated = false;
            meta.original_block = 0;
        }
        for data in self.block_data.iter_mut() {
            if !data.is_empty() {
                data.fill(0);
            }
        }
        for inode in self.inodes.iter_mut() {
            *inode = Inode::default();
        }
        self.snapshots.clear();
        self.dedup_table.clear();
        self.metrics = Default::default();
        self.super_block.s_used_blocks = 0;
        self.super_block.s_used_inodes = 0;
        self.super_block.s_mkfs_time = unix_now();
        self.volume_uuid = create_uuid();
        self.is_dirty = true;
        info!("Filesystem formatted.");
    }

    pub fn total_blocks(&self) -> usize {
        self.super_block.s_total_blocks as usize
    }

    pub fn used_blocks(&self) -> u32 {
        self.super_block.s_used_blocks
    }

    pub fn total_inodes(&self) -> usize {
        self.super_block.s_total_inodes as usize
    }

    pub fn used_inodes(&self) -> u32 {
        self.super_block.s_used_inodes
    }

    /// Print basic engine info
    pub fn print_stats(&self) {
        info!("fs stats: {}", self.super_block.to_string());
    }

    pub fn set_default_strategy(&mut self, strategy: WriteStrategy) {
        self.default_strategy = strategy;
        self.is_dirty = true;
    }

    pub fn get_metrics(&self) -> PerformanceMetrics {
        self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = Default::default();
        self.is_dirty = true;
    }

    /*
     * Block pool
     */

    /// Allocate the first free block, lowest id first. The returned block
    /// starts with `ref_count == 1` and zeroed data.
    pub fn allocate_block(&mut self, kind: BlockKind) -> FsResult<u32> {
        let total = self.total_blocks();
        for i in 0..total {
            if self.blocks[i].kind == BlockKind::Free {
                let now = unix_now();
                let meta = &mut self.blocks[i];
                meta.kind = kind;
                meta.ref_count = 1;
                meta.created_at = now;
                meta.modified_at = now;
                meta.is_cow = false;
                meta.is_deduplicated = false;
                meta.original_block = 0;
                if self.block_data[i].is_empty() {
                    self.block_data[i] = vec![0 as u8; BLOCK_SIZE];
                }
                self.super_block.s_used_blocks += 1;
                self.metrics.blocks_allocated += 1;
                self.is_dirty = true;
                return Ok(i as u32);
            }
        }
        Err(FsError::NoSpace("block pool"))
    }

    /// Drop one reference; the block returns to the free pool (zeroed)
    /// when the count reaches zero. No-op on free or out-of-range blocks.
    pub fn free_block(&mut self, block_id: u32) {
        let idx = block_id as usize;
        if idx >= self.total_blocks() {
            return;
        }
        let meta = &mut self.blocks[idx];
        if meta.kind == BlockKind::Free {
            return;
        }
        if meta.ref_count > 0 {
            meta.ref_count -= 1;
        }
        if meta.ref_count == 0 {
            meta.kind = BlockKind::Free;
            self.block_data[idx].fill(0);
            self.super_block.s_used_blocks -= 1;
            self.metrics.blocks_freed += 1;
            self.is_dirty = true;
        }
    }

    /// Copy a full block into `buf`.
    pub fn read_block(&mut self, block_id: u32, buf: &mut [u8]) -> FsResult<()> {
        let idx = block_id as usize;
        if idx >= self.total_blocks() {
            return Err(FsError::NotFound(format!("block {}", block_id)));
        }
        if buf.len() < BLOCK_SIZE {
            return Err(FsError::InvalidArgument("read buffer shorter than a block".to_string()));
        }
        if self.blocks[idx].kind == BlockKind::Free {
            return Err(FsError::Corruption(format!("read of free block {}", block_id)));
        }
        buf[..BLOCK_SIZE].copy_from_slice(&self.block_data[idx]);
        self.metrics.total_reads += 1;
        Ok(())
    }

    /// Copy `buf` into the block and refresh its content digest.
    pub fn write_block(&mut self, block_id: u32, buf: &[u8]) -> FsResult<()> {
        let idx = block_id as usize;
        if idx >= self.total_blocks() {
            return Err(FsError::NotFound(format!("block {}", block_id)));
        }
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument("write buffer must be one block".to_string()));
        }
        if self.blocks[idx].kind == BlockKind::Free {
            return Err(FsError::Corruption(format!("write to free block {}", block_id)));
        }
        let start = Instant::now();
        self.block_data[idx].copy_from_slice(buf);
        let meta = &mut self.blocks[idx];
        meta.modified_at = unix_now();
        meta.content_hash = compute_hash(buf);
        self.metrics.total_writes += 1;
        self.is_dirty = true;
        let sample = start.elapsed().as_secs_f64();
        self.metrics.avg_write_time =
            running_avg(self.metrics.avg_write_time, self.metrics.total_writes, sample);
        Ok(())
    }

    /// Explicit CoW branch: fresh block with the source's data and digest,
    /// marked `is_cow` and pointing back at its origin.
    pub fn cow_block(&mut self, original_block: u32) -> FsResult<u32> {
        let src = original_block as usize;
        if src >= self.total_blocks() {
            return Err(FsError::NotFound(format!("block {}", original_block)));
        }
        if self.blocks[src].kind == BlockKind::Free {
            return Err(FsError::InvalidArgument(format!(
                "cow of free block {}",
                original_block
            )));
        }
        let kind = self.blocks[src].kind;
        let data = self.block_data[src].clone();
        let hash = self.blocks[src].content_hash;
        let new_block = self.allocate_block(kind)?;
        self.block_data[new_block as usize].copy_from_slice(&data);
        let meta = &mut self.blocks[new_block as usize];
        meta.is_cow = true;
        meta.original_block = original_block;
        meta.content_hash = hash;
        self.metrics.bytes_saved_cow += BLOCK_SIZE as u64;
        Ok(new_block)
    }

    /*
     * Disk image I/O through the driver, in io-unit sized steps
     */

    fn disk_unit_size(&self) -> usize {
        self.driver_info.consts.iounit_size as usize
    }

    fn read_disk_block(&mut self, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), self.disk_unit_size());
        let sz = self.disk_unit_size();
        self.driver.ddriver_read(buf, sz)?;
        Ok(())
    }

    fn write_disk_block(&mut self, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), self.disk_unit_size());
        let sz = self.disk_unit_size();
        self.driver.ddriver_write(buf, sz)?;
        Ok(())
    }

    fn read_disk_blocks(&mut self, buf: &mut [u8], count: usize) -> Result<()> {
        let sz = self.disk_unit_size();
        for i in 0..count {
            self.read_disk_block(&mut buf[(i * sz)..((i + 1) * sz)])?
        }
        Ok(())
    }

    fn write_disk_blocks(&mut self, buf: &[u8], count: usize) -> Result<()> {
        let sz = self.disk_unit_size();
        for i in 0..count {
            self.write_disk_block(&buf[(i * sz)..((i + 1) * sz)])?
        }
        Ok(())
    }

    fn seek_disk_block(&mut self, index: usize) -> Result<()> {
        let sz = self.disk_unit_size();
        let _n = self.driver.ddriver_seek((index * sz) as i64, SeekType::Set)?;
        Ok(())
    }

    /*
     * Persistence: one contiguous image starting at offset zero.
     * [super row | metrics row | block meta rows | block data | inodes | snapshots]
     */

    /// Serialize the whole engine state to the backing device.
    pub fn save(&mut self) -> Result<()> {
        let mut body: Vec<u8> = vec![];
        body.extend_from_slice(unsafe { serialize_row(&self.metrics) });
        for meta in self.blocks.iter() {
            let row = DiskBlockMeta::from(meta);
            body.extend_from_slice(unsafe { serialize_row(&row) });
        }
        let non_free: Vec<usize> = (0..self.total_blocks())
            .filter(|i| self.blocks[*i].kind != BlockKind::Free)
            .collect();
        put_u32(&mut body, non_free.len() as u32);
        for i in non_free {
            put_u32(&mut body, i as u32);
            body.extend_from_slice(&self.block_data[i]);
        }
        let live: Vec<&Inode> = self.inodes.iter().filter(|i| i.is_live()).collect();
        put_u32(&mut body, live.len() as u32);
        for inode in live {
            encode_inode(&mut body, inode);
        }
        put_u32(&mut body, self.snapshots.len() as u32);
        for snap in self.snapshots.iter() {
            encode_snapshot(&mut body, snap);
        }

        let mut super_row = DiskSuperBlock::default();
        self.super_block.s_wtime = unix_now();
        self.super_block.apply_to(&mut super_row);
        super_row.s_snapshot_count = self.snapshots.len() as u32;
        super_row.s_default_strategy = u8::from(self.default_strategy) as u32;
        super_row.s_default_granularity = u8::from(self.default_granularity) as u32;
        super_row.s_auto_snapshot_enabled = self.auto_snapshot_enabled as u32;
        super_row.s_auto_snapshot_threshold = self.auto_snapshot_threshold;
        super_row.s_image_size = (SUPER_BLOCK_REGION + body.len()) as u64;
        super_row.s_uuid = self.volume_uuid;

        let unit = self.disk_unit_size();
        let mut image = Vec::with_capacity(SUPER_BLOCK_REGION + body.len());
        image.extend_from_slice(unsafe { serialize_row(&super_row) });
        image.resize(SUPER_BLOCK_REGION, 0);
        image.extend_from_slice(&body);
        let padded = (image.len() + unit - 1) / unit * unit;
        image.resize(padded, 0);
        self.seek_disk_block(0)?;
        self.write_disk_blocks(&image, padded / unit)?;
        self.driver.ddriver_flush()?;
        self.is_dirty = false;
        info!("Saved {} bytes to {}", padded, self.disk_file);
        Ok(())
    }

    /// Try to load an image from the backing device. `Ok(false)` means no
    /// valid super block was found and the volume needs formatting.
    pub fn load(&mut self) -> Result<bool> {
        let unit = self.disk_unit_size();
        assert!(unit <= SUPER_BLOCK_REGION && SUPER_BLOCK_REGION % unit == 0);
        let head_units = SUPER_BLOCK_REGION / unit;
        let mut head = vec![0 as u8; head_units * unit];
        self.seek_disk_block(0)?;
        self.read_disk_blocks(&mut head, head_units)?;
        let super_row: DiskSuperBlock = unsafe { deserialize_row(&head) };
        if !super_row.magic_matched() {
            return Ok(false);
        }
        if super_row.s_block_size != BLOCK_SIZE as u32 || super_row.s_hash_size != HASH_SIZE as u32 {
            return Err(anyhow!(
                "Image geometry mismatch: block size {}, hash size {}",
                super_row.s_block_size,
                super_row.s_hash_size
            ));
        }
        let image_size = super_row.s_image_size as usize;
        if image_size < SUPER_BLOCK_REGION {
            return Err(anyhow!("Image size {} too small", image_size));
        }
        if self.super_block.s_total_blocks != super_row.s_total_blocks
            || self.super_block.s_total_inodes != super_row.s_total_inodes
        {
            warn!(
                "Image geometry {}x{} replaces requested {}x{}",
                super_row.s_total_blocks,
                super_row.s_total_inodes,
                self.super_block.s_total_blocks,
                self.super_block.s_total_inodes
            );
        }

        let body_len = image_size - SUPER_BLOCK_REGION;
        let body_units = (body_len + unit - 1) / unit;
        let mut body = vec![0 as u8; body_units * unit];
        self.seek_disk_block(SUPER_BLOCK_REGION / unit)?;
        self.read_disk_blocks(&mut body, body_units)?;
        body.truncate(body_len);

        let total_blocks = super_row.s_total_blocks as usize;
        let total_inodes = super_row.s_total_inodes as usize;
        let mut cursor = RowCursor::new(&body);
        let metrics: PerformanceMetrics =
            unsafe { deserialize_row(cursor.take(size_of::<PerformanceMetrics>())?) };
        let mut blocks = Vec::with_capacity(total_blocks);
        for i in 0..total_blocks {
            let row: DiskBlockMeta =
                unsafe { deserialize_row(cursor.take(size_of::<DiskBlockMeta>())?) };
            blocks.push(BlockMeta::from_disk(i as u32, &row)?);
        }
        let mut block_data = vec![Vec::new(); total_blocks];
        let used_blocks = cursor.take_u32()?;
        for _ in 0..used_blocks {
            let id = cursor.take_u32()? as usize;
            if id >= total_blocks {
                return Err(anyhow!("Image data for block {} out of range", id));
            }
            block_data[id] = cursor.take(BLOCK_SIZE)?.to_vec();
        }
        let mut inodes = vec![Inode::default(); total_inodes];
        let used_inodes = cursor.take_u32()?;
        for _ in 0..used_inodes {
            let inode = decode_inode(&mut cursor)?;
            let slot = inode.inode_id as usize - 1;
            if slot >= total_inodes {
                return Err(anyhow!("Image inode {} out of range", inode.inode_id));
            }
            inodes[slot] = inode;
        }
        let snapshot_count = cursor.take_u32()?;
        let mut snapshots = Vec::with_capacity(snapshot_count as usize);
        for _ in 0..snapshot_count {
            snapshots.push(decode_snapshot(&mut cursor)?);
        }

        self.super_block.apply_from(&super_row);
        self.default_strategy = WriteStrategy::try_from(super_row.s_default_strategy as u8)?;
        self.default_granularity =
            SnapshotGranularity::try_from(super_row.s_default_granularity as u8)?;
        self.auto_snapshot_enabled = super_row.s_auto_snapshot_enabled != 0;
        self.auto_snapshot_threshold = super_row.s_auto_snapshot_threshold;
        self.volume_uuid = super_row.s_uuid;
        self.metrics = metrics;
        self.blocks = blocks;
        self.block_data = block_data;
        self.inodes = inodes;
        self.snapshots = snapshots;
        self.rebuild_dedup_index();
        self.is_dirty = false;
        info!("Loaded image of {} bytes", image_size);
        Ok(true)
    }

    /// The index is not persisted; reseed it from live DATA blocks so the
    /// next write can share them again.
    fn rebuild_dedup_index(&mut self) {
        self.dedup_table.clear();
        for meta in self.blocks.iter() {
            if meta.kind == BlockKind::Data {
                self.dedup_table.push(DedupEntry {
                    content_hash: meta.content_hash,
                    block_id: meta.block_id,
                    ref_count: meta.ref_count,
                    size: BLOCK_SIZE as u64,
                    first_seen: meta.created_at,
                });
            }
        }
    }
}

fn encode_tags(buf: &mut Vec<u8>, tags: &[SemanticTag]) {
    put_u32(buf, tags.len() as u32);
    for tag in tags {
        put_str(buf, &tag.tag);
        put_str(buf, &tag.description);
        put_i64(buf, tag.created_at);
    }
}

fn decode_tags(cursor: &mut RowCursor) -> Result<Vec<SemanticTag>> {
    let count = cursor.take_u32()?;
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        tags.push(SemanticTag {
            tag: cursor.take_str()?,
            description: cursor.take_str()?,
            created_at: cursor.take_i64()?,
        });
    }
    Ok(tags)
}

fn encode_inode(buf: &mut Vec<u8>, inode: &Inode) {
    put_u32(buf, inode.inode_id);
    put_str(buf, &inode.filename);
    put_u64(buf, inode.size);
    put_i64(buf, inode.created_at);
    put_i64(buf, inode.modified_at);
    put_i64(buf, inode.accessed_at);
    put_u8(buf, inode.immutable_policy.into());
    put_i64(buf, inode.immutable_since);
    put_u32(buf, inode.current_version);
    put_ids(buf, &inode.blocks);
    put_u32(buf, inode.attributes.len() as u32);
    for attr in inode.attributes.iter() {
        put_str(buf, &attr.key);
        put_str(buf, &attr.value);
    }
    put_u32(buf, inode.versions.len() as u32);
    for version in inode.versions.iter() {
        put_u32(buf, version.version_id);
        put_u32(buf, version.parent_version);
        put_i64(buf, version.created_at);
        put_u64(buf, version.size);
        put_u8(buf, version.strategy.into());
        put_str(buf, &version.description);
        put_ids(buf, &version.blocks);
        encode_tags(buf, &version.tags);
    }
}

fn decode_inode(cursor: &mut RowCursor) -> Result<Inode> {
    let mut inode = Inode {
        inode_id: cursor.take_u32()?,
        filename: cursor.take_str()?,
        size: cursor.take_u64()?,
        created_at: cursor.take_i64()?,
        modified_at: cursor.take_i64()?,
        accessed_at: cursor.take_i64()?,
        immutable_policy: ImmutablePolicy::try_from(cursor.take_u8()?)?,
        immutable_since: cursor.take_i64()?,
        current_version: cursor.take_u32()?,
        blocks: cursor.take_ids()?,
        ..Default::default()
    };
    let attr_count = cursor.take_u32()?;
    for _ in 0..attr_count {
        inode.attributes.push(ExtendedAttribute {
            key: cursor.take_str()?,
            value: cursor.take_str()?,
        });
    }
    let version_count = cursor.take_u32()?;
    for _ in 0..version_count {
        inode.versions.push(FileVersion {
            version_id: cursor.take_u32()?,
            parent_version: cursor.take_u32()?,
            created_at: cursor.take_i64()?,
            size: cursor.take_u64()?,
            strategy: WriteStrategy::try_from(cursor.take_u8()?)?,
            description: cursor.take_str()?,
            blocks: cursor.take_ids()?,
            tags: decode_tags(cursor)?,
        });
    }
    Ok(inode)
}

fn encode_snapshot(buf: &mut Vec<u8>, snap: &Snapshot) {
    put_u32(buf, snap.snapshot_id);
    put_str(buf, &snap.name);
    put_str(buf, &snap.description);
    put_i64(buf, snap.created_at);
    put_u64(buf, snap.total_size);
    put_u32(buf, snap.captured.len() as u32);
    for (inode_id, version_id) in snap.captured.iter() {
        put_u32(buf, *inode_id);
        put_u32(buf, *version_id);
    }
    put_u32(buf, snap.parent_snapshot);
    put_ids(buf, &snap.child_snapshots);
    put_str(buf, &snap.group_name);
    put_u8(buf, snap.granularity.into());
    put_u32(buf, snap.operations_since_last);
    put_f64(buf, snap.importance_score);
    encode_tags(buf, &snap.tags);
    put_u8(buf, snap.is_trimmed as u8);
    put_u32(buf, snap.ref_count);
}

fn decode_snapshot(cursor: &mut RowCursor) -> Result<Snapshot> {
    let mut snap = Snapshot {
        snapshot_id: cursor.take_u32()?,
        name: cursor.take_str()?,
        description: cursor.take_str()?,
        created_at: cursor.take_i64()?,
        total_size: cursor.take_u64()?,
        ..Default::default()
    };
    let captured = cursor.take_u32()?;
    for _ in 0..captured {
        let inode_id = cursor.take_u32()?;
        let version_id = cursor.take_u32()?;
        snap.captured.insert(inode_id, version_id);
    }
    snap.parent_snapshot = cursor.take_u32()?;
    snap.child_snapshots = cursor.take_ids()?;
    snap.group_name = cursor.take_str()?;
    snap.granularity = SnapshotGranularity::try_from(cursor.take_u8()?)?;
    snap.operations_since_last = cursor.take_u32()?;
    snap.importance_score = cursor.take_f64()?;
    snap.tags = decode_tags(cursor)?;
    snap.is_trimmed = cursor.take_u8()? != 0;
    snap.ref_count = cursor.take_u32()?;
    Ok(snap)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use disk_driver::memory::MemoryDiskDriver;

    use super::*;

    fn fresh(total_blocks: u32, total_inodes: u32) -> VSFS<MemoryDiskDriver> {
        VSFS::create(MemoryDiskDriver::new(), total_blocks, total_inodes, "mem").unwrap()
    }

    #[test]
    fn allocate_prefers_lowest_free_slot() -> Result<()> {
        let mut fs = fresh(8, 4);
        let a = fs.allocate_block(BlockKind::Data)?;
        let b = fs.allocate_block(BlockKind::Data)?;
        assert_eq!((a, b), (0, 1));
        fs.free_block(a);
        let c = fs.allocate_block(BlockKind::Data)?;
        assert_eq!(c, 0);
        Ok(())
    }

    #[test]
    fn free_is_idempotent_on_free_blocks() -> Result<()> {
        let mut fs = fresh(4, 4);
        let a = fs.allocate_block(BlockKind::Data)?;
        fs.free_block(a);
        assert_eq!(fs.used_blocks(), 0);
        fs.free_block(a);
        assert_eq!(fs.used_blocks(), 0);
        assert_eq!(fs.metrics.blocks_freed, 1);
        Ok(())
    }

    #[test]
    fn pool_exhaustion_reports_no_space() -> Result<()> {
        let mut fs = fresh(2, 4);
        fs.allocate_block(BlockKind::Data)?;
        fs.allocate_block(BlockKind::Data)?;
        match fs.allocate_block(BlockKind::Data) {
            Err(FsError::NoSpace(_)) => Ok(()),
            other => panic!("expected NoSpace, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn write_refreshes_digest_and_rejects_free_blocks() -> Result<()> {
        let mut fs = fresh(4, 4);
        let a = fs.allocate_block(BlockKind::Data)?;
        let mut payload = vec![0 as u8; BLOCK_SIZE];
        payload[..5].copy_from_slice(b"hello");
        fs.write_block(a, &payload)?;
        assert!(fs.blocks[a as usize].content_hash.equals(&compute_hash(&payload)));
        let mut out = vec![0 as u8; BLOCK_SIZE];
        fs.read_block(a, &mut out)?;
        assert_eq!(out, payload);
        fs.free_block(a);
        assert!(matches!(fs.write_block(a, &payload), Err(FsError::Corruption(_))));
        assert!(matches!(fs.read_block(a, &mut out), Err(FsError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn cow_copies_data_and_marks_origin() -> Result<()> {
        let mut fs = fresh(4, 4);
        let a = fs.allocate_block(BlockKind::Data)?;
        let mut payload = vec![0 as u8; BLOCK_SIZE];
        payload[..3].copy_from_slice(b"abc");
        fs.write_block(a, &payload)?;
        let b = fs.cow_block(a)?;
        assert_ne!(a, b);
        assert!(fs.blocks[b as usize].is_cow);
        assert_eq!(fs.blocks[b as usize].original_block, a);
        assert_eq!(fs.block_data[b as usize], payload);
        assert!(fs.blocks[b as usize]
            .content_hash
            .equals(&fs.blocks[a as usize].content_hash));
        Ok(())
    }

    #[test]
    fn format_resets_everything() -> Result<()> {
        let mut fs = fresh(4, 4);
        let a = fs.allocate_block(BlockKind::Data)?;
        fs.write_block(a, &vec![7 as u8; BLOCK_SIZE])?;
        fs.format();
        assert_eq!(fs.used_blocks(), 0);
        assert_eq!(fs.metrics.blocks_allocated, 0);
        assert!(fs.blocks.iter().all(|b| b.kind == BlockKind::Free));
        assert!(fs.block_data[a as usize].iter().all(|x| *x == 0));
        Ok(())
    }

    #[test]
    fn save_and_load_round_trip() -> Result<()> {
        let mut fs = fresh(16, 4);
        fs.vsfs_init("mem", true)?;
        fs.create_file("keep", ImmutablePolicy::None)?;
        fs.write_file("keep", b"some bytes worth keeping", WriteStrategy::Cow)?;
        fs.create_snapshot("s1", "before reload")?;
        fs.save()?;

        // hand the same backing memory to a second engine
        let mem = std::mem::take(&mut fs.driver.mem);
        let mut driver = MemoryDiskDriver::new();
        driver.mem = mem;
        let mut other = VSFS::create(driver, 16, 4, "mem").unwrap();
        other.vsfs_init("mem", false)?;
        let ino = other.lookup_file("keep")?;
        assert_eq!(other.read_file(ino)?, b"some bytes worth keeping");
        assert_eq!(other.snapshots.len(), 1);
        assert_eq!(other.used_blocks(), fs.used_blocks());
        assert_eq!(other.metrics.total_writes, fs.metrics.total_writes);
        assert!(!other.dedup_table.is_empty());
        Ok(())
    }
}
