/// File API: name lookup, the append-and-grow write path, block-sequential
/// reads, deletion, truncation, immutability policies and extended
/// attributes.
use std::time::Instant;

use disk_driver::DiskDriver;
use log::*;

use crate::vsfs_lib::desc::*;
use crate::vsfs_lib::VSFS;

impl<T: DiskDriver> VSFS<T> {
    /// Slot index for a live 1-based inode id.
    pub fn inode_slot(&self, inode_id: u32) -> FsResult<usize> {
        if inode_id == 0 || inode_id as usize > self.total_inodes() {
            return Err(FsError::NotFound(format!("inode {}", inode_id)));
        }
        let slot = inode_id as usize - 1;
        if !self.inodes[slot].is_live() {
            return Err(FsError::NotFound(format!("inode {}", inode_id)));
        }
        Ok(slot)
    }

    pub fn get_inode(&self, inode_id: u32) -> FsResult<&Inode> {
        Ok(&self.inodes[self.inode_slot(inode_id)?])
    }

    /// Single-valued name lookup; live names are unique.
    pub fn lookup_file(&self, name: &str) -> FsResult<u32> {
        self.inodes
            .iter()
            .find(|i| i.is_live() && i.filename == name)
            .map(|i| i.inode_id)
            .ok_or_else(|| FsError::NotFound(format!("file '{}'", name)))
    }

    /// Allocate an inode slot under a unique name and install the policy.
    pub fn create_file(&mut self, name: &str, policy: ImmutablePolicy) -> FsResult<u32> {
        if name.is_empty() || name.len() >= MAX_FILENAME {
            return Err(FsError::InvalidArgument("bad file name".to_string()));
        }
        if self.lookup_file(name).is_ok() {
            return Err(FsError::InvalidArgument(format!(
                "file '{}' already exists",
                name
            )));
        }
        let slot = match self.inodes.iter().position(|i| !i.is_live()) {
            Some(slot) => slot,
            None => return Err(FsError::NoSpace("inode table")),
        };
        let now = unix_now();
        self.inodes[slot] = Inode {
            inode_id: slot as u32 + 1,
            filename: name.to_string(),
            created_at: now,
            modified_at: now,
            accessed_at: now,
            immutable_policy: policy,
            immutable_since: if policy == ImmutablePolicy::None { 0 } else { now },
            ..Default::default()
        };
        self.super_block.s_used_inodes += 1;
        self.is_dirty = true;
        debug!("created inode {} '{}'", slot + 1, name);
        Ok(slot as u32 + 1)
    }

    /// Write by name; returns the file's updated size.
    pub fn write_file(&mut self, name: &str, data: &[u8], strategy: WriteStrategy) -> FsResult<u64> {
        let inode_id = self.lookup_file(name)?;
        self.write_inode(inode_id, data, strategy)
    }

    /// The write path is append-and-grow: the payload is split into
    /// block-sized chunks (zero-padded at the tail), each chunk goes
    /// through the dedup index, and the resulting ids extend the inode's
    /// block list. A version is captured automatically. On any failure
    /// every block this call allocated or shared is released again; the
    /// inode is untouched.
    pub fn write_inode(&mut self, inode_id: u32, data: &[u8], strategy: WriteStrategy) -> FsResult<u64> {
        let idx = self.inode_slot(inode_id)?;
        let policy = self.inodes[idx].immutable_policy;
        match policy {
            ImmutablePolicy::ReadOnly => return Err(FsError::PolicyDenied(policy)),
            ImmutablePolicy::Worm if self.inodes[idx].size > 0 => {
                return Err(FsError::PolicyDenied(policy))
            }
            _ => {}
        }
        if data.is_empty() {
            return Err(FsError::InvalidArgument("empty write".to_string()));
        }
        let mut new_blocks: Vec<u32> = vec![];
        let mut chunk_buf = vec![0 as u8; BLOCK_SIZE];
        for chunk in data.chunks(BLOCK_SIZE) {
            chunk_buf.fill(0);
            chunk_buf[..chunk.len()].copy_from_slice(chunk);
            match self.deduplicate_block(&chunk_buf, strategy) {
                Ok(id) => new_blocks.push(id),
                Err(e) => {
                    for id in new_blocks {
                        self.free_block(id);
                    }
                    return Err(e);
                }
            }
        }
        let inode = &mut self.inodes[idx];
        inode.blocks.extend_from_slice(&new_blocks);
        inode.size += data.len() as u64;
        inode.modified_at = unix_now();
        self.is_dirty = true;
        self.create_version(inode_id, "auto-version from write")?;
        self.note_write_operation();
        Ok(self.inodes[idx].size)
    }

    /// Exactly `inode.size` bytes, read block-sequentially.
    pub fn read_file(&mut self, inode_id: u32) -> FsResult<Vec<u8>> {
        let idx = self.inode_slot(inode_id)?;
        let start = Instant::now();
        let block_list = self.inodes[idx].blocks.clone();
        let size = self.inodes[idx].size as usize;
        let mut out = Vec::with_capacity(size);
        let mut remaining = size;
        let mut scratch = vec![0 as u8; BLOCK_SIZE];
        for b in block_list {
            if remaining == 0 {
                break;
            }
            self.read_block(b, &mut scratch)?;
            let take = remaining.min(BLOCK_SIZE);
            out.extend_from_slice(&scratch[..take]);
            remaining -= take;
        }
        if remaining > 0 {
            return Err(FsError::Corruption(format!(
                "inode {} is {} bytes short of its size",
                inode_id, remaining
            )));
        }
        self.inodes[idx].accessed_at = unix_now();
        let sample = start.elapsed().as_secs_f64();
        self.metrics.avg_read_time =
            running_avg(self.metrics.avg_read_time, self.metrics.total_reads, sample);
        Ok(out)
    }

    /// Content becomes old-contents ++ data. The write path is already
    /// append-semantic, so this is the write path under the default
    /// strategy, admitted for APPEND_ONLY inodes.
    pub fn append_file(&mut self, inode_id: u32, data: &[u8]) -> FsResult<u64> {
        let strategy = self.default_strategy;
        self.write_inode(inode_id, data, strategy)
    }

    /// Remove the file: release its current block references and drop the
    /// version store with the inode. Versions hold no block references of
    /// their own, so nothing else needs releasing; a block only versions
    /// still pointed at was freed when it rotated out of the current list.
    /// Denied unless the policy is NONE.
    pub fn delete_file(&mut self, inode_id: u32) -> FsResult<()> {
        let idx = self.inode_slot(inode_id)?;
        let policy = self.inodes[idx].immutable_policy;
        if policy != ImmutablePolicy::None {
            return Err(FsError::PolicyDenied(policy));
        }
        let inode = std::mem::take(&mut self.inodes[idx]);
        for b in inode.blocks {
            self.free_block(b);
        }
        self.super_block.s_used_inodes -= 1;
        self.is_dirty = true;
        debug!("deleted inode {} '{}'", inode_id, inode.filename);
        Ok(())
    }

    /// Explicit shrink to `new_size`; tail blocks past the new end are
    /// released. Growth goes through the write path instead.
    pub fn truncate_file(&mut self, inode_id: u32, new_size: u64) -> FsResult<()> {
        let idx = self.inode_slot(inode_id)?;
        let policy = self.inodes[idx].immutable_policy;
        if policy != ImmutablePolicy::None {
            return Err(FsError::PolicyDenied(policy));
        }
        if new_size > self.inodes[idx].size {
            return Err(FsError::InvalidArgument(format!(
                "cannot truncate inode {} upwards to {}",
                inode_id, new_size
            )));
        }
        let keep = ((new_size as usize) + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let tail = self.inodes[idx].blocks.split_off(keep);
        for b in tail {
            self.free_block(b);
        }
        let inode = &mut self.inodes[idx];
        inode.size = new_size;
        inode.modified_at = unix_now();
        self.is_dirty = true;
        Ok(())
    }

    /// Install an immutability policy. Policies only tighten: anything
    /// other than NONE sticks for the life of the inode.
    pub fn set_immutable_policy(&mut self, inode_id: u32, policy: ImmutablePolicy) -> FsResult<()> {
        let idx = self.inode_slot(inode_id)?;
        let current = self.inodes[idx].immutable_policy;
        if current == policy {
            return Ok(());
        }
        if current != ImmutablePolicy::None {
            return Err(FsError::PolicyDenied(current));
        }
        let inode = &mut self.inodes[idx];
        inode.immutable_policy = policy;
        inode.immutable_since = if policy == ImmutablePolicy::None { 0 } else { unix_now() };
        self.is_dirty = true;
        Ok(())
    }

    pub fn set_extended_attribute(&mut self, inode_id: u32, key: &str, value: &str) -> FsResult<()> {
        if key.is_empty() || key.len() > MAX_XATTR_KEY || value.len() > MAX_XATTR_VALUE {
            return Err(FsError::InvalidArgument("bad attribute".to_string()));
        }
        let idx = self.inode_slot(inode_id)?;
        let inode = &mut self.inodes[idx];
        if let Some(attr) = inode.attributes.iter_mut().find(|a| a.key == key) {
            attr.value = value.to_string();
        } else {
            if inode.attributes.len() >= MAX_XATTRS_PER_INODE {
                return Err(FsError::NoSpace("extended attribute table"));
            }
            inode.attributes.push(ExtendedAttribute {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        self.is_dirty = true;
        Ok(())
    }

    pub fn get_extended_attribute(&self, inode_id: u32, key: &str) -> FsResult<Option<String>> {
        let inode = self.get_inode(inode_id)?;
        Ok(inode
            .attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.clone()))
    }

    pub fn list_files(&self) -> Vec<&Inode> {
        self.inodes.iter().filter(|i| i.is_live()).collect()
    }

    /// Logical bytes: the sum of live file sizes.
    pub fn storage_usage(&self) -> u64 {
        self.inodes
            .iter()
            .filter(|i| i.is_live())
            .map(|i| i.size)
            .sum()
    }

    /// Physical bytes: used blocks times the block size.
    pub fn actual_usage(&self) -> u64 {
        self.used_blocks() as u64 * BLOCK_SIZE as u64
    }

    /// Share of bytes dedup avoided storing, of everything ever written.
    pub fn dedup_ratio(&self) -> f64 {
        let saved = self.metrics.bytes_saved_dedup as f64;
        let actual = self.actual_usage() as f64;
        if actual + saved == 0.0 {
            0.0
        } else {
            saved / (actual + saved)
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use disk_driver::memory::MemoryDiskDriver;

    use super::*;

    fn fresh() -> VSFS<MemoryDiskDriver> {
        VSFS::create(MemoryDiskDriver::new(), 64, 8, "mem").unwrap()
    }

    #[test]
    fn write_then_read_round_trips() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("f", ImmutablePolicy::None)?;
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let size = fs.write_inode(ino, &payload, WriteStrategy::Cow)?;
        assert_eq!(size, 10_000);
        assert_eq!(fs.read_file(ino)?, payload);
        Ok(())
    }

    #[test]
    fn writes_append_and_grow() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("f", ImmutablePolicy::None)?;
        // a block-aligned first write keeps the byte stream contiguous
        let head = vec![0x41 as u8; BLOCK_SIZE];
        fs.write_inode(ino, &head, WriteStrategy::Cow)?;
        fs.write_inode(ino, b"tail", WriteStrategy::Cow)?;
        let mut expected = head;
        expected.extend_from_slice(b"tail");
        assert_eq!(fs.read_file(ino)?, expected);
        assert_eq!(fs.get_inode(ino)?.size, BLOCK_SIZE as u64 + 4);
        assert_eq!(fs.get_inode(ino)?.blocks.len(), 2);
        assert_eq!(fs.get_inode(ino)?.versions.len(), 2);
        Ok(())
    }

    #[test]
    fn duplicate_names_are_rejected() -> Result<()> {
        let mut fs = fresh();
        fs.create_file("f", ImmutablePolicy::None)?;
        assert!(matches!(
            fs.create_file("f", ImmutablePolicy::None),
            Err(FsError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn read_only_denies_write_and_delete() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("f", ImmutablePolicy::None)?;
        fs.write_inode(ino, b"locked", WriteStrategy::Cow)?;
        fs.set_immutable_policy(ino, ImmutablePolicy::ReadOnly)?;
        let before = fs.get_inode(ino)?.blocks.clone();
        assert!(matches!(
            fs.write_inode(ino, b"x", WriteStrategy::Cow),
            Err(FsError::PolicyDenied(_))
        ));
        assert!(matches!(
            fs.append_file(ino, b"x"),
            Err(FsError::PolicyDenied(_))
        ));
        assert!(matches!(fs.delete_file(ino), Err(FsError::PolicyDenied(_))));
        assert_eq!(fs.get_inode(ino)?.blocks, before);
        assert_eq!(fs.get_inode(ino)?.size, 6);
        assert_eq!(fs.read_file(ino)?, b"locked");
        Ok(())
    }

    #[test]
    fn append_only_appends_but_never_deletes() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("log", ImmutablePolicy::AppendOnly)?;
        fs.append_file(ino, b"line1\n")?;
        let size = fs.append_file(ino, b"line2\n")?;
        assert_eq!(size, 12);
        assert_eq!(fs.get_inode(ino)?.blocks.len(), 2);
        assert!(fs.read_file(ino)?.starts_with(b"line1\n"));
        assert!(matches!(fs.delete_file(ino), Err(FsError::PolicyDenied(_))));
        assert!(matches!(
            fs.truncate_file(ino, 0),
            Err(FsError::PolicyDenied(_))
        ));
        Ok(())
    }

    #[test]
    fn worm_allows_exactly_one_write() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("w", ImmutablePolicy::Worm)?;
        fs.write_inode(ino, b"x", WriteStrategy::Cow)?;
        assert!(matches!(
            fs.write_inode(ino, b"y", WriteStrategy::Cow),
            Err(FsError::PolicyDenied(_))
        ));
        assert_eq!(fs.read_file(ino)?, b"x");
        assert!(matches!(fs.delete_file(ino), Err(FsError::PolicyDenied(_))));
        Ok(())
    }

    #[test]
    fn policies_only_tighten() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("f", ImmutablePolicy::None)?;
        fs.set_immutable_policy(ino, ImmutablePolicy::ReadOnly)?;
        assert!(matches!(
            fs.set_immutable_policy(ino, ImmutablePolicy::None),
            Err(FsError::PolicyDenied(_))
        ));
        assert!(fs.get_inode(ino)?.immutable_since > 0);
        Ok(())
    }

    #[test]
    fn failed_write_unwinds_all_allocations() -> Result<()> {
        let mut fs = VSFS::create(MemoryDiskDriver::new(), 1, 8, "mem").unwrap();
        let ino = fs.create_file("f", ImmutablePolicy::None)?;
        let payload = vec![0x5a as u8; 5000];
        assert!(matches!(
            fs.write_inode(ino, &payload, WriteStrategy::Cow),
            Err(FsError::NoSpace(_))
        ));
        assert_eq!(fs.get_inode(ino)?.size, 0);
        assert!(fs.get_inode(ino)?.blocks.is_empty());
        assert!(fs.get_inode(ino)?.versions.is_empty());
        assert_eq!(fs.used_blocks(), 0);
        assert_eq!(fs.blocks[0].ref_count, 0);
        Ok(())
    }

    #[test]
    fn truncate_frees_tail_blocks() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("f", ImmutablePolicy::None)?;
        let payload: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i / BLOCK_SIZE) as u8).collect();
        fs.write_inode(ino, &payload, WriteStrategy::Cow)?;
        assert_eq!(fs.used_blocks(), 3);
        fs.truncate_file(ino, BLOCK_SIZE as u64 + 1)?;
        assert_eq!(fs.get_inode(ino)?.blocks.len(), 2);
        assert_eq!(fs.get_inode(ino)?.size, BLOCK_SIZE as u64 + 1);
        assert_eq!(fs.read_file(ino)?, payload[..BLOCK_SIZE + 1].to_vec());
        assert!(matches!(
            fs.truncate_file(ino, BLOCK_SIZE as u64 * 4),
            Err(FsError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn delete_releases_uniquely_owned_blocks() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("f", ImmutablePolicy::None)?;
        fs.write_inode(ino, &vec![9 as u8; BLOCK_SIZE * 2], WriteStrategy::Cow)?;
        let owned = fs.get_inode(ino)?.blocks.clone();
        fs.delete_file(ino)?;
        for b in owned {
            assert_eq!(fs.blocks[b as usize].kind, BlockKind::Free);
            assert_eq!(fs.blocks[b as usize].ref_count, 0);
        }
        assert_eq!(fs.used_inodes(), 0);
        assert!(matches!(fs.lookup_file("f"), Err(FsError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn xattrs_update_in_place_and_cap_out() -> Result<()> {
        let mut fs = fresh();
        let ino = fs.create_file("f", ImmutablePolicy::None)?;
        fs.set_extended_attribute(ino, "owner", "alice")?;
        fs.set_extended_attribute(ino, "owner", "bob")?;
        assert_eq!(fs.get_extended_attribute(ino, "owner")?.as_deref(), Some("bob"));
        assert_eq!(fs.get_extended_attribute(ino, "missing")?, None);
        for i in 0..(MAX_XATTRS_PER_INODE - 1) {
            fs.set_extended_attribute(ino, &format!("k{}", i), "v")?;
        }
        assert!(matches!(
            fs.set_extended_attribute(ino, "overflow", "v"),
            Err(FsError::NoSpace(_))
        ));
        Ok(())
    }

    #[test]
    fn usage_counters_track_logical_and_physical_bytes() -> Result<()> {
        let mut fs = fresh();
        let a = fs.create_file("a", ImmutablePolicy::None)?;
        let b = fs.create_file("b", ImmutablePolicy::None)?;
        fs.write_inode(a, &vec![3 as u8; BLOCK_SIZE], WriteStrategy::Cow)?;
        fs.write_inode(b, &vec![3 as u8; BLOCK_SIZE], WriteStrategy::Cow)?;
        assert_eq!(fs.storage_usage(), 2 * BLOCK_SIZE as u64);
        assert_eq!(fs.actual_usage(), BLOCK_SIZE as u64);
        assert!(fs.dedup_ratio() > 0.0);
        Ok(())
    }
}
