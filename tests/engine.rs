//! End-to-end scenarios over a freshly created engine.
use anyhow::Result;

use vsfs::desc::{BlockKind, FsError, ImmutablePolicy, WriteStrategy, BLOCK_SIZE};
use vsfs::disk_driver::memory::MemoryDiskDriver;
use vsfs::VSFS;

fn fresh_engine() -> VSFS<MemoryDiskDriver> {
    VSFS::create(MemoryDiskDriver::new(), 1000, 100, "mem").unwrap()
}

/// Operational ref-count check: with no rollbacks in play, every live
/// block is referenced exactly `ref_count` times from current block lists.
fn assert_refcounts_match_block_lists(fs: &VSFS<MemoryDiskDriver>) {
    for meta in fs.blocks.iter() {
        if meta.kind == BlockKind::Free {
            assert_eq!(meta.ref_count, 0, "free block {} has references", meta.block_id);
            continue;
        }
        let refs = fs
            .inodes
            .iter()
            .filter(|i| i.is_live())
            .flat_map(|i| i.blocks.iter())
            .filter(|b| **b == meta.block_id)
            .count() as u32;
        assert_eq!(
            meta.ref_count, refs,
            "block {} has ref_count {} but {} list references",
            meta.block_id, meta.ref_count, refs
        );
    }
}

#[test]
fn e1_identical_content_occupies_one_block() -> Result<()> {
    let mut fs = fresh_engine();
    fs.create_file("a", ImmutablePolicy::None)?;
    fs.write_file("a", b"XYZ", WriteStrategy::Cow)?;
    fs.create_file("b", ImmutablePolicy::None)?;
    fs.write_file("b", b"XYZ", WriteStrategy::Cow)?;
    assert_eq!(fs.used_blocks(), 1);
    assert_eq!(fs.metrics.blocks_deduplicated, 1);
    assert_eq!(fs.metrics.bytes_saved_dedup, 4096);
    assert_refcounts_match_block_lists(&fs);
    Ok(())
}

#[test]
fn e2_version_rollback_is_an_inverse_of_writes() -> Result<()> {
    let mut fs = fresh_engine();
    let f = fs.create_file("f", ImmutablePolicy::None)?;
    fs.write_file("f", b"hello", WriteStrategy::Cow)?;
    assert_eq!(fs.get_inode(f)?.current_version, 1);
    fs.write_file("f", b"world", WriteStrategy::Cow)?;
    assert_eq!(fs.get_inode(f)?.current_version, 2);
    fs.rollback_version(f, 1)?;
    assert_eq!(fs.read_file(f)?, b"hello");
    assert_eq!(fs.get_inode(f)?.size, 5);
    Ok(())
}

#[test]
fn e3_snapshot_rollback_restores_captured_bytes() -> Result<()> {
    let mut fs = fresh_engine();
    let f = fs.create_file("f", ImmutablePolicy::None)?;
    fs.write_file("f", b"A", WriteStrategy::Cow)?;
    let snap = fs.create_snapshot("S1", "first state")?;
    fs.write_file("f", b"B", WriteStrategy::Cow)?;
    fs.rollback_snapshot(snap)?;
    assert_eq!(fs.read_file(f)?, b"A");
    Ok(())
}

#[test]
fn e4_worm_takes_one_write_then_reads_forever() -> Result<()> {
    let mut fs = fresh_engine();
    let w = fs.create_file("w", ImmutablePolicy::Worm)?;
    fs.write_file("w", b"x", WriteStrategy::Cow)?;
    match fs.write_file("w", b"y", WriteStrategy::Cow) {
        Err(FsError::PolicyDenied(_)) => {}
        other => panic!("expected PolicyDenied, got {:?}", other.map(|_| ())),
    }
    assert_eq!(fs.read_file(w)?, b"x");
    Ok(())
}

#[test]
fn e5_no_space_unwinds_the_partial_write() -> Result<()> {
    let mut fs = VSFS::create(MemoryDiskDriver::new(), 1, 100, "mem").unwrap();
    let f = fs.create_file("f", ImmutablePolicy::None)?;
    let payload = vec![0x42 as u8; 5000];
    match fs.write_file("f", &payload, WriteStrategy::Cow) {
        Err(FsError::NoSpace(_)) => {}
        other => panic!("expected NoSpace, got {:?}", other.map(|_| ())),
    }
    assert_eq!(fs.get_inode(f)?.size, 0);
    assert_eq!(fs.blocks[0].ref_count, 0);
    assert_eq!(fs.blocks[0].kind, BlockKind::Free);
    assert_eq!(fs.used_blocks(), 0);
    Ok(())
}

#[test]
fn e6_delete_drops_version_held_blocks_to_free() -> Result<()> {
    let mut fs = fresh_engine();
    let f = fs.create_file("f", ImmutablePolicy::None)?;
    fs.write_file("f", &vec![0 as u8; 4096], WriteStrategy::Cow)?;
    fs.create_version(f, "pin it")?;
    let block = fs.get_inode(f)?.blocks[0];
    fs.delete_file(f)?;
    assert_eq!(fs.blocks[block as usize].ref_count, 0);
    assert_eq!(fs.blocks[block as usize].kind, BlockKind::Free);
    Ok(())
}

#[test]
fn round_trip_any_length_on_a_fresh_inode() -> Result<()> {
    for n in [1usize, 100, 4095, 4096, 4097, 10_000, 50_000] {
        let mut fs = fresh_engine();
        let f = fs.create_file("f", ImmutablePolicy::None)?;
        let payload: Vec<u8> = (0..n).map(|i| (i % 241) as u8).collect();
        fs.write_file("f", &payload, WriteStrategy::Cow)?;
        assert_eq!(fs.read_file(f)?, payload, "length {}", n);
    }
    Ok(())
}

#[test]
fn snapshot_independence_for_files_written_after_capture() -> Result<()> {
    let mut fs = fresh_engine();
    let old = fs.create_file("old", ImmutablePolicy::None)?;
    fs.write_file("old", b"captured", WriteStrategy::Cow)?;
    let snap = fs.create_snapshot("S", "")?;
    fs.write_file("old", b"!", WriteStrategy::Cow)?;
    let young1 = fs.create_file("young1", ImmutablePolicy::None)?;
    let young2 = fs.create_file("young2", ImmutablePolicy::None)?;
    fs.write_file("young1", b"later", WriteStrategy::Cow)?;
    fs.write_file("young2", b"files", WriteStrategy::Cow)?;
    fs.rollback_snapshot(snap)?;
    assert_eq!(fs.read_file(old)?, b"captured");
    assert_eq!(fs.read_file(young1)?, b"later");
    assert_eq!(fs.read_file(young2)?, b"files");
    Ok(())
}

#[test]
fn read_only_policy_freezes_size_and_blocks() -> Result<()> {
    let mut fs = fresh_engine();
    let f = fs.create_file("f", ImmutablePolicy::None)?;
    fs.write_file("f", b"frozen", WriteStrategy::Cow)?;
    fs.set_immutable_policy(f, ImmutablePolicy::ReadOnly)?;
    let blocks = fs.get_inode(f)?.blocks.clone();
    let size = fs.get_inode(f)?.size;
    for _ in 0..3 {
        assert!(fs.write_file("f", b"nope", WriteStrategy::Cow).is_err());
    }
    assert_eq!(fs.get_inode(f)?.blocks, blocks);
    assert_eq!(fs.get_inode(f)?.size, size);
    Ok(())
}

#[test]
fn dedup_keeps_one_canonical_copy_across_many_writers() -> Result<()> {
    let mut fs = fresh_engine();
    let chunk = vec![0xab as u8; BLOCK_SIZE];
    for i in 0..10 {
        let name = format!("file{}", i);
        fs.create_file(&name, ImmutablePolicy::None)?;
        fs.write_file(&name, &chunk, WriteStrategy::Cow)?;
    }
    assert_eq!(fs.used_blocks(), 1);
    assert_eq!(fs.metrics.blocks_deduplicated, 9);
    assert_refcounts_match_block_lists(&fs);
    let canonical = fs.inodes[0].blocks[0];
    assert_eq!(fs.blocks[canonical as usize].ref_count, 10);
    Ok(())
}

#[test]
fn deleting_one_sharer_keeps_the_block_live() -> Result<()> {
    let mut fs = fresh_engine();
    let a = fs.create_file("a", ImmutablePolicy::None)?;
    fs.create_file("b", ImmutablePolicy::None)?;
    fs.write_file("a", b"shared bytes", WriteStrategy::Cow)?;
    fs.write_file("b", b"shared bytes", WriteStrategy::Cow)?;
    let block = fs.get_inode(a)?.blocks[0];
    fs.delete_file(a)?;
    assert_eq!(fs.blocks[block as usize].kind, BlockKind::Data);
    assert_eq!(fs.blocks[block as usize].ref_count, 1);
    let b = fs.lookup_file("b")?;
    assert_eq!(fs.read_file(b)?, b"shared bytes");
    Ok(())
}

#[test]
fn metrics_reset_zeroes_counters_but_not_state() -> Result<()> {
    let mut fs = fresh_engine();
    let f = fs.create_file("f", ImmutablePolicy::None)?;
    fs.write_file("f", b"payload", WriteStrategy::Cow)?;
    assert!(fs.metrics.total_writes > 0);
    fs.reset_metrics();
    assert_eq!(fs.metrics.total_writes, 0);
    assert_eq!(fs.read_file(f)?, b"payload");
    Ok(())
}
