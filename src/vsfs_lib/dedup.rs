/// Content deduplication: the index, the single-block write path and the
/// offline scan.
use disk_driver::DiskDriver;
use log::*;

use crate::vsfs_lib::desc::*;
use crate::vsfs_lib::VSFS;

impl<T: DiskDriver> VSFS<T> {
    /// Write one block-sized buffer through the dedup index: share an
    /// existing block whose *current* digest matches, otherwise allocate
    /// and register a fresh one. Stale index entries (their block was
    /// freed since) are compacted on the way.
    pub fn deduplicate_block(&mut self, buf: &[u8], strategy: WriteStrategy) -> FsResult<u32> {
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument(
                "dedup buffer must be one block".to_string(),
            ));
        }
        let hash = compute_hash(buf);
        {
            let blocks = &self.blocks;
            self.dedup_table
                .retain(|e| blocks[e.block_id as usize].kind != BlockKind::Free);
        }
        let blocks = &self.blocks;
        let hit = self
            .dedup_table
            .iter()
            .position(|e| blocks[e.block_id as usize].content_hash.equals(&hash));
        if let Some(pos) = hit {
            let block_id = self.dedup_table[pos].block_id;
            self.dedup_table[pos].ref_count += 1;
            let meta = &mut self.blocks[block_id as usize];
            meta.ref_count += 1;
            meta.is_deduplicated = true;
            self.metrics.blocks_deduplicated += 1;
            self.metrics.bytes_saved_dedup += BLOCK_SIZE as u64;
            debug!("dedup hit on block {}", block_id);
            return Ok(block_id);
        }
        let new_block = self.allocate_block(BlockKind::Data)?;
        self.write_block(new_block, buf)?;
        if strategy == WriteStrategy::Cow {
            self.blocks[new_block as usize].is_cow = true;
        }
        self.dedup_table.push(DedupEntry {
            content_hash: hash,
            block_id: new_block,
            ref_count: 1,
            size: BLOCK_SIZE as u64,
            first_seen: unix_now(),
        });
        Ok(new_block)
    }

    /// Offline pass: collapse DATA blocks with identical contents onto the
    /// lowest id, rewriting inode block lists and transferring references.
    /// Version block lists are left alone; a freed duplicate they point to
    /// is reconstructed by rollback if ever needed.
    pub fn scan_and_deduplicate(&mut self) {
        info!("Starting deduplication scan...");
        let blocks_before = self.used_blocks();
        let mut bytes_saved: u64 = 0;
        let total = self.total_blocks();
        for keep in 0..total {
            if self.blocks[keep].kind != BlockKind::Data {
                continue;
            }
            for dup in (keep + 1)..total {
                if self.blocks[dup].kind != BlockKind::Data {
                    continue;
                }
                if !self.blocks[keep]
                    .content_hash
                    .equals(&self.blocks[dup].content_hash)
                {
                    continue;
                }
                // digest equality is only suspected equality
                if self.block_data[keep] != self.block_data[dup] {
                    continue;
                }
                let mut moved = 0;
                for inode in self.inodes.iter_mut().filter(|i| i.is_live()) {
                    for b in inode.blocks.iter_mut() {
                        if *b == dup as u32 {
                            *b = keep as u32;
                            moved += 1;
                        }
                    }
                }
                for _ in 0..moved {
                    self.blocks[keep].ref_count += 1;
                    self.free_block(dup as u32);
                }
                if moved > 0 {
                    self.blocks[keep].is_deduplicated = true;
                    if self.blocks[dup].kind == BlockKind::Free {
                        bytes_saved += BLOCK_SIZE as u64;
                    }
                }
            }
        }
        self.metrics.bytes_saved_dedup += bytes_saved;
        self.is_dirty = true;
        info!(
            "Deduplication complete: {} blocks freed, {} bytes saved",
            blocks_before - self.used_blocks(),
            bytes_saved
        );
    }

    /// Total bytes saved through deduplication so far.
    pub fn dedup_savings(&self) -> u64 {
        self.metrics.bytes_saved_dedup
    }
}
