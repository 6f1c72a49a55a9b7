//! Data model of the versioned block store: constants, block / inode /
//! version / snapshot records, the dedup entry, metrics, the error taxonomy
//! and the on-disk rows used by save/load.
use std::collections::BTreeMap;
use std::hash::Hasher;

use chrono::{DateTime, NaiveDateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::Rng;
use siphasher::sip::SipHasher24;
use thiserror::Error;

use crate::vsfs_lib::types::{le32, le64};

/// Fixed data block size in bytes. Persisted images depend on this value.
pub const BLOCK_SIZE: usize = 4096;
/// Content digest width in bytes. Persisted images depend on this value.
pub const HASH_SIZE: usize = 32;

pub const MAX_FILENAME: usize = 256;
pub const MAX_PATH: usize = 1024;
pub const MAX_SNAPSHOTS: usize = 1000;
pub const MAX_TAG_LENGTH: usize = 128;
pub const MAX_TAGS_PER_VERSION: usize = 10;
pub const MAX_XATTRS_PER_INODE: usize = 20;
pub const MAX_XATTR_KEY: usize = 64;
pub const MAX_XATTR_VALUE: usize = 256;
pub const MAX_DESCRIPTION: usize = 512;

/// On-media magic, "VSFS".
pub const VSFS_SUPER_MAGIC: u32 = 0x5653_4653;
pub const VSFS_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BlockKind {
    Free = 0,
    Data = 1,
    Inode = 2,
    Metadata = 3,
    Snapshot = 4,
}

impl Default for BlockKind {
    fn default() -> Self {
        BlockKind::Free
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum WriteStrategy {
    /// Copy-on-Write
    Cow = 0,
    /// Redirect-on-Write
    Row = 1,
}

impl Default for WriteStrategy {
    fn default() -> Self {
        WriteStrategy::Cow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SnapshotGranularity {
    /// Every few operations
    Fine = 0,
    /// Moderate frequency
    Medium = 1,
    /// Infrequent
    Coarse = 2,
}

impl Default for SnapshotGranularity {
    fn default() -> Self {
        SnapshotGranularity::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ImmutablePolicy {
    None = 0,
    ReadOnly = 1,
    AppendOnly = 2,
    /// Write Once Read Many
    Worm = 3,
}

impl Default for ImmutablePolicy {
    fn default() -> Self {
        ImmutablePolicy::None
    }
}

/// Error taxonomy shared by every public engine operation.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no space left in {0}")]
    NoSpace(&'static str),
    #[error("operation denied by {0:?} policy")]
    PolicyDenied(ImmutablePolicy),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
}

pub type FsResult<T> = Result<T, FsError>;

/// Content digest over a block-sized buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentHash(pub [u8; HASH_SIZE]);

impl Default for ContentHash {
    fn default() -> Self {
        ContentHash([0; HASH_SIZE])
    }
}

impl ContentHash {
    pub fn equals(&self, other: &ContentHash) -> bool {
        self.0 == other.0
    }
}

// Distinct keys per 8-byte lane of the digest.
const HASH_LANE_KEYS: [(u64, u64); 4] = [
    (0x7673_6673_0000_0001, 0x9e37_79b9_7f4a_7c15),
    (0x7673_6673_0000_0002, 0xc2b2_ae3d_27d4_eb4f),
    (0x7673_6673_0000_0003, 0x1656_67b1_9e37_79f9),
    (0x7673_6673_0000_0004, 0x27d4_eb2f_1656_67c5),
];

/// Fill the fixed-width digest with four keyed SipHash-2-4 passes. Fast and
/// non-cryptographic; equality of digests is only *suspected* equality of
/// contents, resolved against the canonical block (see the dedup lookup).
pub fn compute_hash(data: &[u8]) -> ContentHash {
    let mut out = [0 as u8; HASH_SIZE];
    for (lane, (k0, k1)) in HASH_LANE_KEYS.iter().enumerate() {
        let mut hasher = SipHasher24::new_with_keys(*k0, *k1);
        hasher.write(data);
        out[lane * 8..(lane + 1) * 8].copy_from_slice(&hasher.finish().to_le_bytes());
    }
    ContentHash(out)
}

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

pub fn utc_time(timestamp_seconds: i64) -> DateTime<Utc> {
    let naive = NaiveDateTime::from_timestamp_millis(timestamp_seconds * 1000).unwrap();
    DateTime::from_utc(naive, Utc)
}

pub fn create_uuid() -> [u8; 16] {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| rng.gen::<u8>()).collect::<Vec<u8>>().try_into().unwrap()
}

/// Per-block metadata. The block's identity is its index in the pool.
#[derive(Debug, Default, Clone)]
pub struct BlockMeta {
    pub block_id: u32,
    pub kind: BlockKind,
    pub ref_count: u32,
    pub content_hash: ContentHash,
    pub created_at: i64,
    pub modified_at: i64,
    pub is_cow: bool,
    pub is_deduplicated: bool,
    /// Source block of a CoW copy
    pub original_block: u32,
}

#[derive(Debug, Clone)]
pub struct SemanticTag {
    pub tag: String,
    pub description: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct ExtendedAttribute {
    pub key: String,
    pub value: String,
}

/// Immutable record of a file's size and block list at a point in time.
/// The block list is a value copy of ids; creating a version never touches
/// ref-counts, the owning inode still holds those references.
#[derive(Debug, Default, Clone)]
pub struct FileVersion {
    pub version_id: u32,
    pub parent_version: u32,
    pub created_at: i64,
    pub size: u64,
    pub blocks: Vec<u32>,
    pub strategy: WriteStrategy,
    pub description: String,
    pub tags: Vec<SemanticTag>,
}

/// File descriptor. `inode_id == 0` marks an empty slot; live ids are
/// 1-based (slot index + 1).
#[derive(Debug, Default, Clone)]
pub struct Inode {
    pub inode_id: u32,
    pub filename: String,
    pub size: u64,
    pub created_at: i64,
    pub modified_at: i64,
    pub accessed_at: i64,
    pub blocks: Vec<u32>,
    /// 1-based index into `versions`, 0 when no version exists
    pub current_version: u32,
    pub versions: Vec<FileVersion>,
    pub immutable_policy: ImmutablePolicy,
    pub immutable_since: i64,
    pub attributes: Vec<ExtendedAttribute>,
}

impl Inode {
    pub fn is_live(&self) -> bool {
        self.inode_id != 0
    }
}

/// Named system-wide capture of {inode -> version at capture time}.
/// Snapshots hold no block references; liveness is transitive through the
/// captured versions. `snapshot_id == 0` marks a deleted slot.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub snapshot_id: u32,
    pub name: String,
    pub description: String,
    pub created_at: i64,
    pub total_size: u64,
    pub captured: BTreeMap<u32, u32>,
    pub parent_snapshot: u32,
    pub child_snapshots: Vec<u32>,
    pub group_name: String,
    pub granularity: SnapshotGranularity,
    pub operations_since_last: u32,
    pub importance_score: f64,
    pub tags: Vec<SemanticTag>,
    pub is_trimmed: bool,
    pub ref_count: u32,
}

impl Snapshot {
    pub fn is_live(&self) -> bool {
        self.snapshot_id != 0
    }
}

/// Dedup index entry. Entries go stale when their block is freed; the
/// lookup path skips and compacts them.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub content_hash: ContentHash,
    pub block_id: u32,
    pub ref_count: u32,
    pub size: u64,
    pub first_seen: i64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C, align(8))]
pub struct PerformanceMetrics {
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_snapshots: u64,
    pub total_rollbacks: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub blocks_deduplicated: u64,
    pub bytes_saved_dedup: u64,
    pub bytes_saved_cow: u64,
    pub avg_snapshot_time: f64,
    pub avg_rollback_time: f64,
    pub avg_write_time: f64,
    pub avg_read_time: f64,
}

/// Fold one sample into a running average whose population is `count`
/// (the counter is incremented before folding).
pub fn running_avg(avg: f64, count: u64, sample: f64) -> f64 {
    if count == 0 {
        sample
    } else {
        (avg * (count - 1) as f64 + sample) / count as f64
    }
}

/*
 * On-disk rows. Fixed-size #[repr(C)] structs written with
 * utils::serialize_row; variable-size records (names, lists, versions)
 * use the explicit little-endian codec in mod.rs.
 */

#[derive(Debug)]
#[repr(C, align(8))]
pub struct DiskSuperBlock {
    pub s_magic: le32,              /* Magic signature */
    pub s_version: le32,            /* Format version */
    pub s_block_size: le32,         /* Data block size */
    pub s_hash_size: le32,          /* Content digest width */
    pub s_total_blocks: le32,       /* Block pool capacity */
    pub s_used_blocks: le32,        /* Non-free blocks */
    pub s_total_inodes: le32,       /* Inode table capacity */
    pub s_used_inodes: le32,        /* Live inodes */
    pub s_snapshot_count: le32,     /* Snapshot slots in image */
    pub s_default_strategy: le32,
    pub s_default_granularity: le32,
    pub s_auto_snapshot_enabled: le32,
    pub s_auto_snapshot_threshold: le32,
    pub s_reserved: le32,
    pub s_mkfs_time: i64,           /* When the volume was formatted */
    pub s_wtime: i64,               /* Last save time */
    pub s_image_size: le64,         /* Total serialized image length */
    pub s_uuid: [u8; 16],           /* Volume uuid, stamped at format */
}

impl Default for DiskSuperBlock {
    fn default() -> Self {
        Self {
            s_magic: VSFS_SUPER_MAGIC,
            s_version: VSFS_FORMAT_VERSION,
            s_block_size: BLOCK_SIZE as u32,
            s_hash_size: HASH_SIZE as u32,
            s_total_blocks: 0,
            s_used_blocks: 0,
            s_total_inodes: 0,
            s_used_inodes: 0,
            s_snapshot_count: 0,
            s_default_strategy: 0,
            s_default_granularity: 1,
            s_auto_snapshot_enabled: 1,
            s_auto_snapshot_threshold: 100,
            s_reserved: 0,
            s_mkfs_time: 0,
            s_wtime: 0,
            s_image_size: 0,
            s_uuid: create_uuid(),
        }
    }
}

impl DiskSuperBlock {
    pub fn magic_matched(&self) -> bool {
        self.s_magic == VSFS_SUPER_MAGIC && self.s_version == VSFS_FORMAT_VERSION
    }
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C, align(8))]
pub struct DiskBlockMeta {
    pub b_kind: u8,
    pub b_is_cow: u8,
    pub b_is_deduplicated: u8,
    pub b_pad: u8,
    pub b_ref_count: le32,
    pub b_original_block: le32,
    pub b_reserved: le32,
    pub b_created_at: i64,
    pub b_modified_at: i64,
    pub b_content_hash: [u8; HASH_SIZE],
}

impl From<&BlockMeta> for DiskBlockMeta {
    fn from(meta: &BlockMeta) -> Self {
        Self {
            b_kind: meta.kind.into(),
            b_is_cow: meta.is_cow as u8,
            b_is_deduplicated: meta.is_deduplicated as u8,
            b_pad: 0,
            b_ref_count: meta.ref_count,
            b_original_block: meta.original_block,
            b_reserved: 0,
            b_created_at: meta.created_at,
            b_modified_at: meta.modified_at,
            b_content_hash: meta.content_hash.0,
        }
    }
}

impl BlockMeta {
    pub fn from_disk(block_id: u32, row: &DiskBlockMeta) -> FsResult<Self> {
        let kind = BlockKind::try_from(row.b_kind)
            .map_err(|_| FsError::Corruption(format!("bad block kind {} on block {}", row.b_kind, block_id)))?;
        Ok(Self {
            block_id,
            kind,
            ref_count: row.b_ref_count,
            content_hash: ContentHash(row.b_content_hash),
            created_at: row.b_created_at,
            modified_at: row.b_modified_at,
            is_cow: row.b_is_cow != 0,
            is_deduplicated: row.b_is_deduplicated != 0,
            original_block: row.b_original_block,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = compute_hash(b"some block payload");
        let b = compute_hash(b"some block payload");
        let c = compute_hash(b"some other payload");
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
        assert_ne!(a.0, [0 as u8; HASH_SIZE]);
    }

    #[test]
    fn enums_decode_from_raw() {
        assert_eq!(ImmutablePolicy::try_from(3).unwrap(), ImmutablePolicy::Worm);
        assert_eq!(BlockKind::try_from(1).unwrap(), BlockKind::Data);
        assert!(BlockKind::try_from(0xff).is_err());
    }

    #[test]
    fn block_meta_row_round_trips() {
        let meta = BlockMeta {
            block_id: 7,
            kind: BlockKind::Data,
            ref_count: 3,
            content_hash: compute_hash(b"x"),
            created_at: 1000,
            modified_at: 2000,
            is_cow: true,
            is_deduplicated: false,
            original_block: 2,
        };
        let row = DiskBlockMeta::from(&meta);
        let back = BlockMeta::from_disk(7, &row).unwrap();
        assert_eq!(back.kind, BlockKind::Data);
        assert_eq!(back.ref_count, 3);
        assert!(back.is_cow);
        assert!(back.content_hash.equals(&meta.content_hash));
    }
}
