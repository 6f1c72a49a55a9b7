/// System-wide snapshots: named {inode -> version} captures, per-file
/// rollback, and the metadata layer (tags, groups, hierarchy, importance,
/// adaptive granularity).
use std::time::Instant;

use disk_driver::DiskDriver;
use log::*;

use crate::vsfs_lib::desc::*;
use crate::vsfs_lib::utils::clip_string;
use crate::vsfs_lib::VSFS;

impl<T: DiskDriver> VSFS<T> {
    fn snapshot_slot(&self, snapshot_id: u32) -> FsResult<usize> {
        if snapshot_id == 0 || snapshot_id as usize > self.snapshots.len() {
            return Err(FsError::NotFound(format!("snapshot {}", snapshot_id)));
        }
        let slot = snapshot_id as usize - 1;
        if !self.snapshots[slot].is_live() {
            return Err(FsError::NotFound(format!("snapshot {}", snapshot_id)));
        }
        Ok(slot)
    }

    pub fn lookup_snapshot(&self, name: &str) -> FsResult<u32> {
        self.snapshots
            .iter()
            .find(|s| s.is_live() && s.name == name)
            .map(|s| s.snapshot_id)
            .ok_or_else(|| FsError::NotFound(format!("snapshot '{}'", name)))
    }

    /// Capture `captured[i] = current_version` for every live inode. Block
    /// ref-counts are untouched; snapshot liveness is transitive through
    /// the captured versions.
    pub fn create_snapshot(&mut self, name: &str, description: &str) -> FsResult<u32> {
        if name.is_empty() || name.len() >= MAX_FILENAME {
            return Err(FsError::InvalidArgument("bad snapshot name".to_string()));
        }
        if self.lookup_snapshot(name).is_ok() {
            return Err(FsError::InvalidArgument(format!(
                "snapshot '{}' already exists",
                name
            )));
        }
        if self.snapshots.len() >= MAX_SNAPSHOTS {
            return Err(FsError::NoSpace("snapshot store"));
        }
        let start = Instant::now();
        let mut snap = Snapshot {
            snapshot_id: self.snapshots.len() as u32 + 1,
            name: name.to_string(),
            description: clip_string(description, MAX_DESCRIPTION),
            created_at: unix_now(),
            granularity: self.default_granularity,
            ref_count: 1,
            ..Default::default()
        };
        for inode in self.inodes.iter().filter(|i| i.is_live()) {
            snap.captured.insert(inode.inode_id, inode.current_version);
            snap.total_size += inode.size;
        }
        let snapshot_id = snap.snapshot_id;
        self.snapshots.push(snap);
        self.metrics.total_snapshots += 1;
        let sample = start.elapsed().as_secs_f64();
        self.metrics.avg_snapshot_time = running_avg(
            self.metrics.avg_snapshot_time,
            self.metrics.total_snapshots,
            sample,
        );
        self.is_dirty = true;
        Ok(snapshot_id)
    }

    /// Per-file restoration: roll every captured inode back to its
    /// captured version. Inodes created after the capture are untouched;
    /// captured inodes that were deleted since are skipped.
    pub fn rollback_snapshot(&mut self, snapshot_id: u32) -> FsResult<()> {
        let slot = self.snapshot_slot(snapshot_id)?;
        let start = Instant::now();
        info!(
            "Rolling back to snapshot: {} (ID: {})",
            self.snapshots[slot].name, snapshot_id
        );
        let captured: Vec<(u32, u32)> = self.snapshots[slot]
            .captured
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        for (inode_id, version_id) in captured {
            if version_id == 0 {
                continue;
            }
            match self.inode_slot(inode_id) {
                Ok(idx) => {
                    if version_id as usize <= self.inodes[idx].versions.len() {
                        debug!("  rolling back inode {} to version {}", inode_id, version_id);
                        self.rollback_version(inode_id, version_id)?;
                    }
                }
                Err(_) => {
                    warn!(
                        "snapshot {} captured inode {} which no longer exists",
                        snapshot_id, inode_id
                    );
                }
            }
        }
        self.metrics.total_rollbacks += 1;
        let sample = start.elapsed().as_secs_f64();
        self.metrics.avg_rollback_time = running_avg(
            self.metrics.avg_rollback_time,
            self.metrics.total_rollbacks,
            sample,
        );
        self.is_dirty = true;
        Ok(())
    }

    /// Clear the slot; later snapshot ids keep their positions.
    pub fn delete_snapshot(&mut self, snapshot_id: u32) -> FsResult<()> {
        let slot = self.snapshot_slot(snapshot_id)?;
        self.snapshots[slot] = Snapshot::default();
        self.is_dirty = true;
        Ok(())
    }

    /// Advisory only; no block lifecycle change.
    pub fn trim_snapshot(&mut self, snapshot_id: u32) -> FsResult<()> {
        let slot = self.snapshot_slot(snapshot_id)?;
        self.snapshots[slot].is_trimmed = true;
        self.is_dirty = true;
        Ok(())
    }

    pub fn add_snapshot_tag(
        &mut self,
        snapshot_id: u32,
        tag: &str,
        description: &str,
    ) -> FsResult<()> {
        if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
            return Err(FsError::InvalidArgument("bad tag length".to_string()));
        }
        let slot = self.snapshot_slot(snapshot_id)?;
        let snap = &mut self.snapshots[slot];
        if snap.tags.len() >= MAX_TAGS_PER_VERSION {
            return Err(FsError::NoSpace("snapshot tag list"));
        }
        snap.tags.push(SemanticTag {
            tag: tag.to_string(),
            description: clip_string(description, MAX_DESCRIPTION),
            created_at: unix_now(),
        });
        self.is_dirty = true;
        Ok(())
    }

    pub fn find_snapshots_by_tag(&self, tag: &str) -> Vec<u32> {
        self.snapshots
            .iter()
            .filter(|s| s.is_live() && s.tags.iter().any(|t| t.tag == tag))
            .map(|s| s.snapshot_id)
            .collect()
    }

    /// Stamp every listed snapshot with a shared group name.
    pub fn create_snapshot_group(&mut self, group_name: &str, ids: &[u32]) -> FsResult<()> {
        if group_name.is_empty() || group_name.len() >= MAX_FILENAME {
            return Err(FsError::InvalidArgument("bad group name".to_string()));
        }
        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            slots.push(self.snapshot_slot(*id)?);
        }
        for slot in slots {
            self.snapshots[slot].group_name = group_name.to_string();
        }
        self.is_dirty = true;
        Ok(())
    }

    pub fn set_snapshot_parent(&mut self, snapshot_id: u32, parent_id: u32) -> FsResult<()> {
        if snapshot_id == parent_id {
            return Err(FsError::InvalidArgument(
                "a snapshot cannot parent itself".to_string(),
            ));
        }
        let child_slot = self.snapshot_slot(snapshot_id)?;
        let parent_slot = self.snapshot_slot(parent_id)?;
        self.snapshots[child_slot].parent_snapshot = parent_id;
        if !self.snapshots[parent_slot].child_snapshots.contains(&snapshot_id) {
            self.snapshots[parent_slot].child_snapshots.push(snapshot_id);
        }
        self.is_dirty = true;
        Ok(())
    }

    /// Preorder walk over the parent/child links starting at `root_id`.
    pub fn snapshot_hierarchy(&self, root_id: u32) -> FsResult<Vec<u32>> {
        self.snapshot_slot(root_id)?;
        let mut out: Vec<u32> = vec![];
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            if out.contains(&id) {
                continue;
            }
            out.push(id);
            if let Ok(slot) = self.snapshot_slot(id) {
                for child in self.snapshots[slot].child_snapshots.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        Ok(out)
    }

    /// importance = age_factor * size_mb * (1 + 0.5 * tags) * ref_count,
    /// age_factor = 1 / (1 + age_days / 30)
    pub fn update_snapshot_importance(&mut self, snapshot_id: u32) -> FsResult<f64> {
        let slot = self.snapshot_slot(snapshot_id)?;
        let snap = &mut self.snapshots[slot];
        let age_days = (unix_now() - snap.created_at).max(0) as f64 / 86400.0;
        let age_factor = 1.0 / (1.0 + age_days / 30.0);
        let size_mb = snap.total_size as f64 / (1024.0 * 1024.0);
        let score = age_factor * size_mb * (1.0 + 0.5 * snap.tags.len() as f64) * snap.ref_count as f64;
        snap.importance_score = score;
        self.is_dirty = true;
        Ok(score)
    }

    pub fn adjust_granularity(&mut self, granularity: SnapshotGranularity) {
        self.default_granularity = granularity;
        self.is_dirty = true;
    }

    /// Operations between auto-snapshots for a given granularity.
    pub fn auto_snapshot_interval(&self, granularity: SnapshotGranularity) -> u32 {
        let base = self.auto_snapshot_threshold;
        match granularity {
            SnapshotGranularity::Fine => base / 2,
            SnapshotGranularity::Medium => base,
            SnapshotGranularity::Coarse => base * 2,
        }
    }

    /// True once the newest live snapshot has seen enough operations for
    /// its granularity. With no snapshot there is no counter to compare.
    pub fn should_create_snapshot(&self) -> bool {
        match self.snapshots.iter().rev().find(|s| s.is_live()) {
            Some(last) => {
                last.operations_since_last >= self.auto_snapshot_interval(last.granularity)
            }
            None => false,
        }
    }

    /// Called by the write path: advance the operation counter and capture
    /// an automatic snapshot when the threshold is crossed.
    pub(crate) fn note_write_operation(&mut self) {
        if let Some(last) = self.snapshots.iter_mut().rev().find(|s| s.is_live()) {
            last.operations_since_last += 1;
        }
        if self.auto_snapshot_enabled && self.should_create_snapshot() {
            let name = format!("auto-{}", self.snapshots.len() as u32 + 1);
            match self.create_snapshot(&name, "automatic snapshot") {
                Ok(id) => info!("auto snapshot '{}' created as id {}", name, id),
                Err(e) => warn!("auto snapshot skipped: {}", e),
            }
        }
    }

    pub fn list_snapshots(&self) -> Vec<&Snapshot> {
        self.snapshots.iter().filter(|s| s.is_live()).collect()
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
    fn snapshot_rollback_restores_captured_files_only() -> Result<()> {
        let mut fs = fresh();
        let f = fs.create_file("f", ImmutablePolicy::None)?;
        fs.write_inode(f, b"A", WriteStrategy::Cow)?;
        let snap = fs.create_snapshot("S1", "checkpoint")?;
        fs.write_inode(f, b"B", WriteStrategy::Cow)?;
        // a file born after the capture must not be disturbed
        let g = fs.create_file("late", ImmutablePolicy::None)?;
        fs.write_inode(g, b"untouched", WriteStrategy::Cow)?;
        fs.rollback_snapshot(snap)?;
        assert_eq!(fs.read_file(f)?, b"A");
        assert_eq!(fs.read_file(g)?, b"untouched");
        Ok(())
    }

    #[test]
    fn snapshot_survives_deleted_inode() -> Result<()> {
        let mut fs = fresh();
        let f = fs.create_file("f", ImmutablePolicy::None)?;
        fs.write_inode(f, b"data", WriteStrategy::Cow)?;
        let snap = fs.create_snapshot("S1", "")?;
        fs.delete_file(f)?;
        fs.rollback_snapshot(snap)?;
        assert!(matches!(fs.read_file(f), Err(FsError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn snapshot_names_are_unique_and_searchable() -> Result<()> {
        let mut fs = fresh();
        let a = fs.create_snapshot("daily", "")?;
        assert!(matches!(
            fs.create_snapshot("daily", ""),
            Err(FsError::InvalidArgument(_))
        ));
        assert_eq!(fs.lookup_snapshot("daily")?, a);
        fs.add_snapshot_tag(a, "stable", "passed checks")?;
        assert_eq!(fs.find_snapshots_by_tag("stable"), vec![a]);
        Ok(())
    }

    #[test]
    fn deleted_slots_keep_later_ids_stable() -> Result<()> {
        let mut fs = fresh();
        let a = fs.create_snapshot("one", "")?;
        let b = fs.create_snapshot("two", "")?;
        fs.delete_snapshot(a)?;
        assert!(matches!(fs.rollback_snapshot(a), Err(FsError::NotFound(_))));
        assert_eq!(fs.lookup_snapshot("two")?, b);
        let c = fs.create_snapshot("three", "")?;
        assert_eq!(c, 3);
        Ok(())
    }

    #[test]
    fn hierarchy_walks_children_preorder() -> Result<()> {
        let mut fs = fresh();
        let root = fs.create_snapshot("root", "")?;
        let left = fs.create_snapshot("left", "")?;
        let right = fs.create_snapshot("right", "")?;
        let leaf = fs.create_snapshot("leaf", "")?;
        fs.set_snapshot_parent(left, root)?;
        fs.set_snapshot_parent(right, root)?;
        fs.set_snapshot_parent(leaf, left)?;
        assert_eq!(fs.snapshot_hierarchy(root)?, vec![root, left, leaf, right]);
        Ok(())
    }

    #[test]
    fn granularity_scales_the_auto_threshold() -> Result<()> {
        let mut fs = fresh();
        fs.auto_snapshot_threshold = 10;
        assert_eq!(fs.auto_snapshot_interval(SnapshotGranularity::Fine), 5);
        assert_eq!(fs.auto_snapshot_interval(SnapshotGranularity::Medium), 10);
        assert_eq!(fs.auto_snapshot_interval(SnapshotGranularity::Coarse), 20);
        // no snapshot yet: nothing to compare against
        assert!(!fs.should_create_snapshot());
        fs.adjust_granularity(SnapshotGranularity::Fine);
        let f = fs.create_file("f", ImmutablePolicy::None)?;
        fs.create_snapshot("seed", "")?;
        for _ in 0..4 {
            fs.write_inode(f, b"x", WriteStrategy::Cow)?;
        }
        assert!(!fs.should_create_snapshot());
        fs.write_inode(f, b"x", WriteStrategy::Cow)?;
        // the fifth write crossed the FINE threshold and auto-captured
        assert_eq!(fs.snapshots.len(), 2);
        assert!(fs.lookup_snapshot("auto-2").is_ok());
        Ok(())
    }

    #[test]
    fn importance_score_follows_the_formula() -> Result<()> {
        let mut fs = fresh();
        let f = fs.create_file("f", ImmutablePolicy::None)?;
        fs.write_inode(f, &vec![1 as u8; 2 * 1024 * 1024], WriteStrategy::Cow)?;
        let snap = fs.create_snapshot("big", "")?;
        fs.add_snapshot_tag(snap, "keep", "")?;
        fs.add_snapshot_tag(snap, "prod", "")?;
        let score = fs.update_snapshot_importance(snap)?;
        // fresh snapshot: age_factor == 1; 2 MiB * (1 + 0.5 * 2) * 1
        assert!((score - 4.0).abs() < 0.05);
        Ok(())
    }
}
