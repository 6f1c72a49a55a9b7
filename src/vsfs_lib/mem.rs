/// Engine state kept in memory and synced with the on-disk super block
use macro_tools::*;

use crate::vsfs_lib::desc::DiskSuperBlock;

#[derive(ApplyMem, Default, Clone, Copy)]
#[ApplyMemTo(DiskSuperBlock)]
pub struct SuperBlockMem {
    /// Block pool capacity
    pub s_total_blocks: u32,
    /// Non-free blocks
    pub s_used_blocks: u32,
    /// Inode table capacity
    pub s_total_inodes: u32,
    /// Live inodes
    pub s_used_inodes: u32,
    /// When the volume was formatted
    pub s_mkfs_time: i64,
    /// Last save time
    pub s_wtime: i64,
}

impl SuperBlockMem {
    pub fn to_string(&self) -> String {
        format!(
            "VSFS {}/{} blocks used, {}/{} inodes used",
            self.s_used_blocks, self.s_total_blocks, self.s_used_inodes, self.s_total_inodes
        )
    }
}
