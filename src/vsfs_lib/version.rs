/// Per-inode version store: cheap captures of the current block list and
/// rollback that survives intervening block churn.
use disk_driver::DiskDriver;
use log::*;

use crate::vsfs_lib::desc::*;
use crate::vsfs_lib::utils::clip_string;
use crate::vsfs_lib::VSFS;

impl<T: DiskDriver> VSFS<T> {
    /// Capture the inode's current size and block list as a new version.
    /// The block list is copied by value and no ref-count changes: the
    /// inode itself still holds those references.
    pub fn create_version(&mut self, inode_id: u32, description: &str) -> FsResult<u32> {
        let default_strategy = self.default_strategy;
        let idx = self.inode_slot(inode_id)?;
        let inode = &mut self.inodes[idx];
        let version_id = inode.versions.len() as u32 + 1;
        inode.versions.push(FileVersion {
            version_id,
            parent_version: inode.current_version,
            created_at: unix_now(),
            size: inode.size,
            blocks: inode.blocks.clone(),
            strategy: default_strategy,
            description: clip_string(description, MAX_DESCRIPTION),
            tags: vec![],
        });
        inode.current_version = version_id;
        self.is_dirty = true;
        debug!("inode {} now at version {}", inode_id, version_id);
        Ok(version_id)
    }

    /// Restore the inode's block list and size to those of a version.
    ///
    /// Target blocks that are still live get their ref-count bumped
    /// *before* the current list is released, so blocks shared between the
    /// two lists survive the swap. Target blocks that were freed since are
    /// materialized from the byte images saved at entry (a freed block's
    /// image is the zero block) and the version's entry is rewritten to
    /// the replacement id. Running out of blocks mid-materialization means
    /// the version cannot be reproduced: the partial work is unwound and
    /// `Corruption` reported.
    pub fn rollback_version(&mut self, inode_id: u32, version_id: u32) -> FsResult<()> {
        let idx = self.inode_slot(inode_id)?;
        let version_count = self.inodes[idx].versions.len() as u32;
        if version_id == 0 || version_id > version_count {
            return Err(FsError::InvalidArgument(format!(
                "version {} out of range for inode {}",
                version_id, inode_id
            )));
        }
        let vslot = version_id as usize - 1;
        let mut target_blocks = self.inodes[idx].versions[vslot].blocks.clone();
        let target_size = self.inodes[idx].versions[vslot].size;

        let mut saved: Vec<Vec<u8>> = Vec::with_capacity(target_blocks.len());
        for b in target_blocks.iter() {
            let i = *b as usize;
            if i >= self.total_blocks() {
                return Err(FsError::Corruption(format!(
                    "version {} of inode {} points at block {} outside the pool",
                    version_id, inode_id, b
                )));
            }
            if self.block_data[i].is_empty() {
                saved.push(vec![0 as u8; BLOCK_SIZE]);
            } else {
                saved.push(self.block_data[i].clone());
            }
        }

        let mut bumped: Vec<u32> = vec![];
        let mut materialized: Vec<u32> = vec![];
        for i in 0..target_blocks.len() {
            let b = target_blocks[i];
            if self.blocks[b as usize].kind == BlockKind::Free {
                let new_block = match self.allocate_block(BlockKind::Data) {
                    Ok(id) => id,
                    Err(FsError::NoSpace(_)) => {
                        for id in materialized {
                            self.free_block(id);
                        }
                        for id in bumped {
                            self.free_block(id);
                        }
                        return Err(FsError::Corruption(format!(
                            "version {} of inode {} is unrecoverable: block pool exhausted",
                            version_id, inode_id
                        )));
                    }
                    Err(e) => return Err(e),
                };
                self.write_block(new_block, &saved[i])?;
                self.blocks[new_block as usize].is_cow = true;
                self.blocks[new_block as usize].original_block = b;
                target_blocks[i] = new_block;
                materialized.push(new_block);
            } else {
                self.blocks[b as usize].ref_count += 1;
                bumped.push(b);
            }
        }

        let current = self.inodes[idx].blocks.clone();
        for b in current {
            self.free_block(b);
        }

        let inode = &mut self.inodes[idx];
        inode.versions[vslot].blocks = target_blocks.clone();
        inode.blocks = target_blocks;
        inode.size = target_size;
        inode.current_version = version_id;
        inode.modified_at = unix_now();
        self.is_dirty = true;
        Ok(())
    }

    /// Attach a semantic tag to a version, capped per version.
    pub fn add_version_tag(
        &mut self,
        inode_id: u32,
        version_id: u32,
        tag: &str,
        description: &str,
    ) -> FsResult<()> {
        if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
            return Err(FsError::InvalidArgument("bad tag length".to_string()));
        }
        let idx = self.inode_slot(inode_id)?;
        if version_id == 0 || version_id as usize > self.inodes[idx].versions.len() {
            return Err(FsError::InvalidArgument(format!(
                "version {} out of range for inode {}",
                version_id, inode_id
            )));
        }
        let version = &mut self.inodes[idx].versions[version_id as usize - 1];
        if version.tags.len() >= MAX_TAGS_PER_VERSION {
            return Err(FsError::NoSpace("version tag list"));
        }
        version.tags.push(SemanticTag {
            tag: tag.to_string(),
            description: clip_string(description, MAX_DESCRIPTION),
            created_at: unix_now(),
        });
        self.is_dirty = true;
        Ok(())
    }

    /// Ids of the inode's versions carrying `tag`.
    pub fn find_versions_by_tag(&self, inode_id: u32, tag: &str) -> FsResult<Vec<u32>> {
        let inode = self.get_inode(inode_id)?;
        Ok(inode
            .versions
            .iter()
            .filter(|v| v.tags.iter().any(|t| t.tag == tag))
            .map(|v| v.version_id)
            .collect())
    }

    pub fn list_versions(&self, inode_id: u32) -> FsResult<&[FileVersion]> {
        Ok(&self.get_inode(inode_id)?.versions)
    }
}
