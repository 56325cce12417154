//! Directory-of-blocks storage engine (spec §3/§4.1, component C1) plus the
//! checkpoint stream protocol (component C9).
//!
//! A *storage instance* owns a directory holding one file per contiguous,
//! power-of-16-aligned run of blocks ("range file"), an optional
//! `rollback/` subdirectory of single-block preimages, and a `meta.json`
//! declaring the logical size. All writes go through temp-then-rename so a
//! crash never leaves a half-written `.dat`/`.pre`/`meta.json` observable
//! (spec I-S4).

pub mod checkpoint;
pub mod range;

use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

pub const BLOCK_SIZE: u32 = 512;

/// Configuration accepted by [`Storage::open`] (spec §4.1/§6).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub path_dir: PathBuf,
    pub block_count: u32,
    pub block_size: u32,
    /// `< 0` disables consolidation entirely; `0` means "use the default of
    /// 1"; `> 0` is used as-is.
    pub consolidations_per_tick: i32,
}

impl StorageConfig {
    pub fn new(path_dir: impl Into<PathBuf>, block_count: u32) -> Self {
        Self {
            path_dir: path_dir.into(),
            block_count,
            block_size: BLOCK_SIZE,
            consolidations_per_tick: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Meta {
    block_count: u32,
    block_size: u32,
}

/// A directory-backed, content-addressed flat block device.
pub struct Storage {
    dir: PathBuf,
    block_count: u32,
    max_level: u8,
    consolidations_per_tick: u32,
    /// `indices[level]` holds the set of base LBAs with a range file at
    /// that level, sorted ascending by construction (spec I-S2).
    indices: Vec<BTreeSet<u32>>,
    rollback: BTreeSet<u32>,
    capture_rollback: bool,
    cursor_level: u8,
    cursor_base: u32,
}

impl Storage {
    /// Open (creating if absent) a storage directory. Fails if an existing
    /// `meta.json` disagrees with `config`.
    pub fn open(config: StorageConfig) -> CoreResult<Self> {
        if config.block_size != BLOCK_SIZE {
            return Err(CoreError::invalid_argument(format!(
                "block_size must be {BLOCK_SIZE}, got {}",
                config.block_size
            )));
        }
        if config.block_count == 0 {
            return Err(CoreError::invalid_argument("block_count must be > 0"));
        }

        fs::create_dir_all(&config.path_dir)?;
        let meta_path = config.path_dir.join("meta.json");
        let meta = Meta {
            block_count: config.block_count,
            block_size: config.block_size,
        };
        if meta_path.exists() {
            let text = fs::read_to_string(&meta_path)?;
            let on_disk: Meta = serde_json::from_str(&text).map_err(|e| {
                CoreError::invalid_argument(format!("corrupt meta.json: {e}"))
            })?;
            if on_disk != meta {
                return Err(CoreError::invalid_argument(format!(
                    "meta.json mismatch: on-disk {on_disk:?} != requested {meta:?}"
                )));
            }
        } else {
            let text = serde_json::to_string(&meta)
                .map_err(|e| CoreError::invalid_argument(e.to_string()))?;
            write_atomic(&meta_path, text.as_bytes())?;
        }

        let max_level = range::max_level_for(config.block_count);
        let mut indices = vec![BTreeSet::new(); max_level as usize + 1];
        let mut rollback = BTreeSet::new();

        for entry in fs::read_dir(&config.path_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((base, level)) = range::parse_dat_filename(name) else {
                continue;
            };
            if level as usize >= indices.len() {
                log::warn!(target: "storage", "ignoring {name}: level {level} exceeds max {max_level}");
                continue;
            }
            if base % range::span(level) as u32 != 0 {
                log::warn!(target: "storage", "ignoring {name}: base not aligned to its level");
                continue;
            }
            indices[level as usize].insert(base);
        }

        let rollback_dir = config.path_dir.join("rollback");
        if rollback_dir.exists() {
            for entry in fs::read_dir(&rollback_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(lba) = range::parse_pre_filename(name) {
                    if lba < config.block_count {
                        rollback.insert(lba);
                    }
                }
            }
        }

        let consolidations_per_tick = if config.consolidations_per_tick < 0 {
            0
        } else if config.consolidations_per_tick == 0 {
            1
        } else {
            config.consolidations_per_tick as u32
        };

        log::info!(
            target: "storage",
            "opened {:?}: {} blocks, max_level {}, {} pending rollback entries",
            config.path_dir, config.block_count, max_level, rollback.len()
        );

        Ok(Self {
            dir: config.path_dir,
            block_count: config.block_count,
            max_level,
            consolidations_per_tick,
            indices,
            rollback,
            capture_rollback: true,
            cursor_level: 0,
            cursor_base: 0,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    fn validate_offset(&self, offset: u64) -> CoreResult<u32> {
        if offset % BLOCK_SIZE as u64 != 0 {
            return Err(CoreError::invalid_argument(format!(
                "offset {offset} is not block-aligned"
            )));
        }
        let lba = offset / BLOCK_SIZE as u64;
        if lba >= self.block_count as u64 {
            return Err(CoreError::invalid_argument(format!(
                "offset {offset} is out of range (block_count {})",
                self.block_count
            )));
        }
        Ok(lba as u32)
    }

    fn dat_path(&self, base: u32, level: u8) -> PathBuf {
        self.dir.join(range::filename(base, level))
    }

    fn rollback_path(&self, lba: u32) -> PathBuf {
        self.dir.join("rollback").join(range::rollback_filename(lba))
    }

    /// Read a single 512-byte block. Unwritten regions read as zero — this
    /// is success, not an error (spec §4.1).
    pub fn read_block(&self, offset: u64) -> CoreResult<[u8; 512]> {
        let lba = self.validate_offset(offset)?;
        for level in 0..=self.max_level {
            let base = range::base_for(lba, level);
            if self.indices[level as usize].contains(&base) {
                let path = self.dat_path(base, level);
                let inner_offset = (lba - base) as u64 * BLOCK_SIZE as u64;
                let mut buf = [0u8; 512];
                read_exact_at(&path, inner_offset, &mut buf)?;
                return Ok(buf);
            }
        }
        Ok([0u8; 512])
    }

    /// Write a single 512-byte block, capturing a rollback preimage first
    /// if one doesn't already exist for this LBA since the last checkpoint.
    pub fn write_block(&mut self, offset: u64, data: &[u8; 512]) -> CoreResult<()> {
        let lba = self.validate_offset(offset)?;
        if self.capture_rollback && !self.rollback.contains(&lba) {
            let previous = self.read_block(offset)?;
            let path = self.rollback_path(lba);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_atomic(&path, &previous)?;
            self.rollback.insert(lba);
        }
        self.write_range_file(lba, 0, data)?;
        Ok(())
    }

    fn write_range_file(&mut self, base: u32, level: u8, data: &[u8]) -> CoreResult<()> {
        let path = self.dat_path(base, level);
        write_atomic(&path, data)?;
        self.indices[level as usize].insert(base);
        Ok(())
    }

    fn remove_range_file(&mut self, base: u32, level: u8) -> CoreResult<()> {
        let path = self.dat_path(base, level);
        fs::remove_file(&path)?;
        self.indices[level as usize].remove(&base);
        Ok(())
    }

    /// Perform up to `consolidations_per_tick` sibling merges, advancing a
    /// rolling `(level, base)` cursor across calls (spec §4.1).
    pub fn tick(&mut self) -> CoreResult<()> {
        if self.consolidations_per_tick == 0 || self.max_level == 0 {
            return Ok(());
        }
        let mut done = 0u32;
        // One full lap of the cursor bounds a single tick() call so an
        // all-empty disk doesn't spin forever looking for a candidate.
        let cap = self.cursor_positions();
        let mut visited = 0u64;
        while done < self.consolidations_per_tick && visited < cap {
            if self.try_consolidate_at_cursor()? {
                done += 1;
            }
            self.advance_cursor();
            visited += 1;
        }
        Ok(())
    }

    fn cursor_positions(&self) -> u64 {
        let mut total = 0u64;
        for level in 0..self.max_level {
            let parent_span = range::span(level + 1);
            total += (self.block_count as u64).div_ceil(parent_span).max(1);
        }
        total.max(1)
    }

    fn advance_cursor(&mut self) {
        if self.max_level == 0 {
            return;
        }
        let span = range::span(self.cursor_level + 1);
        let next_base = self.cursor_base as u64 + span;
        if next_base >= self.block_count as u64 {
            self.cursor_level = if self.cursor_level + 1 >= self.max_level {
                0
            } else {
                self.cursor_level + 1
            };
            self.cursor_base = 0;
        } else {
            self.cursor_base = next_base as u32;
        }
    }

    fn try_consolidate_at_cursor(&mut self) -> CoreResult<bool> {
        let level = self.cursor_level;
        if level >= self.max_level {
            return Ok(false);
        }
        let child_span = range::span(level);
        let base = self.cursor_base;
        let mut children = Vec::with_capacity(16);
        for i in 0..16u64 {
            let child_base = base as u64 + i * child_span;
            if child_base >= self.block_count as u64 {
                return Ok(false);
            }
            children.push(child_base as u32);
        }
        if !children.iter().all(|b| self.indices[level as usize].contains(b)) {
            return Ok(false);
        }

        let parent_span_bytes = range::span(level + 1) as usize * BLOCK_SIZE as usize;
        let mut merged = Vec::with_capacity(parent_span_bytes);
        for &child in &children {
            let mut buf = vec![0u8; child_span as usize * BLOCK_SIZE as usize];
            read_exact_at(&self.dat_path(child, level), 0, &mut buf)?;
            merged.extend_from_slice(&buf);
        }

        let parent_path = self.dat_path(base, level + 1);
        if let Err(e) = write_atomic(&parent_path, &merged) {
            log::warn!(target: "storage", "consolidation at level {level} base {base} failed: {e}");
            return Err(e);
        }
        self.indices[level as usize + 1].insert(base);

        for &child in &children {
            if let Err(e) = self.remove_range_file(child, level) {
                log::warn!(
                    target: "storage",
                    "consolidation at level {level} base {base}: failed to remove child {child}: {e}"
                );
                return Err(e);
            }
        }
        log::debug!(target: "storage", "consolidated 16 level-{level} files at base {base} into level {}", level + 1);
        Ok(true)
    }

    /// Rebuild the pre-checkpoint state: for every outstanding preimage,
    /// write it back through the normal path (with capture suspended) then
    /// remove it.
    pub fn apply_rollback(&mut self) -> CoreResult<()> {
        let lbas: Vec<u32> = self.rollback.iter().copied().collect();
        self.capture_rollback = false;
        let result = (|| -> CoreResult<()> {
            for lba in lbas {
                let path = self.rollback_path(lba);
                let mut data = [0u8; 512];
                read_exact_at(&path, 0, &mut data)?;
                self.write_range_file(lba, 0, &data)?;
                fs::remove_file(&path)?;
                self.rollback.remove(&lba);
            }
            Ok(())
        })();
        self.capture_rollback = true;
        result
    }

    /// Delete every outstanding preimage without applying it.
    pub fn clear_rollback(&mut self) -> CoreResult<()> {
        let dir = self.dir.join("rollback");
        for &lba in self.rollback.iter() {
            let path = dir.join(range::rollback_filename(lba));
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        self.rollback.clear();
        Ok(())
    }

    fn remove_all_range_files(&mut self) -> CoreResult<()> {
        for level in 0..=self.max_level {
            let bases: Vec<u32> = self.indices[level as usize].iter().copied().collect();
            for base in bases {
                self.remove_range_file(base, level)?;
            }
        }
        Ok(())
    }

    /// Largest level whose span both fits in `remaining` blocks and is
    /// aligned with `pos` (spec §4.1 "largest level that fits"/"divides").
    fn best_level_at(&self, pos: u32, remaining: u32) -> u8 {
        let mut level = self.max_level;
        loop {
            let span = range::span(level);
            if span <= remaining as u64 && pos as u64 % span == 0 {
                return level;
            }
            if level == 0 {
                return 0;
            }
            level -= 1;
        }
    }

    fn load_blocks_from_reader(&mut self, reader: &mut dyn Read) -> CoreResult<()> {
        let mut pos = 0u32;
        let mut remaining = self.block_count;
        while remaining > 0 {
            let level = self.best_level_at(pos, remaining);
            let span = range::span(level) as u32;
            let mut buf = vec![0u8; span as usize * BLOCK_SIZE as usize];
            reader.read_exact(&mut buf)?;
            self.write_range_file(pos, level, &buf)?;
            pos += span;
            remaining -= span;
        }
        Ok(())
    }

    /// Write a checkpoint: a small header, followed by every block (if
    /// `full`), then clear the rollback set — this is the checkpoint
    /// boundary the rollback invariant is defined relative to (spec §4.1/
    /// §8; see DESIGN.md for why `full` is an explicit parameter here).
    pub fn checkpoint(&mut self, sink: &mut dyn Write, full: bool) -> CoreResult<()> {
        checkpoint::write_header(sink, full, self.block_count as u64, BLOCK_SIZE)?;
        if full {
            for lba in 0..self.block_count {
                let data = self.read_block(lba as u64 * BLOCK_SIZE as u64)?;
                sink.write_all(&data)?;
            }
        }
        self.clear_rollback()?;
        Ok(())
    }

    /// Restore from a checkpoint stream: `has_data=false` applies the
    /// rollback set; `has_data=true` discards existing state and rebuilds
    /// from the streamed blocks.
    pub fn restore(&mut self, source: &mut dyn Read) -> CoreResult<()> {
        let header = checkpoint::read_header(source)?;
        if header.block_count != self.block_count as u64 || header.block_size != BLOCK_SIZE {
            return Err(CoreError::invalid_argument(format!(
                "checkpoint header {:?} does not match storage ({} blocks x {} bytes)",
                header, self.block_count, BLOCK_SIZE
            )));
        }
        if header.has_data {
            self.clear_rollback()?;
            self.remove_all_range_files()?;
            self.load_blocks_from_reader(source)?;
        } else {
            self.apply_rollback()?;
        }
        Ok(())
    }

    /// Flat block-by-block export with no header.
    pub fn save_state(&self, writer: &mut dyn Write) -> CoreResult<()> {
        for lba in 0..self.block_count {
            let data = self.read_block(lba as u64 * BLOCK_SIZE as u64)?;
            writer.write_all(&data)?;
        }
        Ok(())
    }

    /// Flat block-by-block import with no header; clears rollback and
    /// existing range files first.
    pub fn load_state(&mut self, reader: &mut dyn Read) -> CoreResult<()> {
        self.clear_rollback()?;
        self.remove_all_range_files()?;
        self.load_blocks_from_reader(reader)
    }
}

/// Write `data` to `path` via a sibling `.tmp` file and `rename()`, so a
/// reader never observes a half-written file (spec I-S4). On failure the
/// temp file is removed rather than left behind.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> CoreResult<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    let result = (|| -> std::io::Result<()> {
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result.map_err(CoreError::from)
}

fn read_exact_at(path: &Path, offset: u64, buf: &mut [u8]) -> CoreResult<()> {
    use std::io::{Seek, SeekFrom};
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pattern(byte: u8) -> [u8; 512] {
        [byte; 512]
    }

    #[test]
    fn unwritten_block_reads_zero() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(StorageConfig::new(dir.path(), 16)).unwrap();
        assert_eq!(storage.read_block(0).unwrap(), [0u8; 512]);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(StorageConfig::new(dir.path(), 16)).unwrap();
        storage.write_block(5 * 512, &pattern(0xAB)).unwrap();
        assert_eq!(storage.read_block(5 * 512).unwrap(), pattern(0xAB));
        assert_eq!(storage.read_block(4 * 512).unwrap(), [0u8; 512]);
    }

    #[test]
    fn misaligned_offset_rejected() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(StorageConfig::new(dir.path(), 16)).unwrap();
        assert!(storage.read_block(5).is_err());
    }

    #[test]
    fn out_of_range_offset_rejected() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(StorageConfig::new(dir.path(), 16)).unwrap();
        assert!(storage.read_block(16 * 512).is_err());
    }

    #[test]
    fn meta_mismatch_fails_reopen() {
        let dir = tempdir().unwrap();
        let _s = Storage::open(StorageConfig::new(dir.path(), 16)).unwrap();
        let err = Storage::open(StorageConfig::new(dir.path(), 32)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn reopen_is_observationally_equal() {
        let dir = tempdir().unwrap();
        let mut s1 = Storage::open(StorageConfig::new(dir.path(), 16)).unwrap();
        s1.write_block(0, &pattern(0x11)).unwrap();
        drop(s1);
        let s2 = Storage::open(StorageConfig::new(dir.path(), 16)).unwrap();
        assert_eq!(s2.read_block(0).unwrap(), pattern(0x11));
    }

    /// Scenario 1 from spec §8: consolidating a full sibling run of
    /// level-0 files is a read-transparent no-op.
    #[test]
    fn consolidation_is_read_transparent() {
        let _ = env_logger::try_init();
        let dir = tempdir().unwrap();
        let mut config = StorageConfig::new(dir.path(), 256);
        config.consolidations_per_tick = 1;
        let mut storage = Storage::open(config).unwrap();

        for lba in [0u32, 16, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240] {
            storage
                .write_block(lba as u64 * 512, &pattern(lba as u8))
                .unwrap();
        }
        for lba in 1..16u32 {
            storage.write_block(lba as u64 * 512, &pattern(lba as u8)).unwrap();
        }
        for lba in 17..32u32 {
            storage.write_block(lba as u64 * 512, &pattern(lba as u8)).unwrap();
        }

        let before: Vec<[u8; 512]> = (0..32).map(|l| storage.read_block(l as u64 * 512).unwrap()).collect();
        storage.tick().unwrap();
        let after: Vec<[u8; 512]> = (0..32).map(|l| storage.read_block(l as u64 * 512).unwrap()).collect();
        assert_eq!(before, after);
        assert_eq!(storage.read_block(5 * 512).unwrap(), pattern(5));

        let parent = dir.path().join("0000000X.dat");
        assert!(parent.exists());
        assert_eq!(fs::metadata(&parent).unwrap().len(), 16 * 512);
        for lba in 0..16u32 {
            assert!(!dir.path().join(range::filename(lba, 0)).exists());
        }
    }

    /// Scenario 2 from spec §8: rollback restores pre-checkpoint content.
    #[test]
    fn rollback_restores_prior_value() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(StorageConfig::new(dir.path(), 16)).unwrap();
        storage.write_block(0, &pattern(0xAA)).unwrap();
        let mut sink = std::io::sink();
        storage.checkpoint(&mut sink, false).unwrap();
        storage.write_block(0, &pattern(0xBB)).unwrap();
        storage.apply_rollback().unwrap();
        assert_eq!(storage.read_block(0).unwrap(), pattern(0xAA));
        assert!(!dir.path().join("rollback").exists() || fs::read_dir(dir.path().join("rollback")).unwrap().next().is_none());
    }

    #[test]
    fn save_state_load_state_roundtrip() {
        let src_dir = tempdir().unwrap();
        let mut src = Storage::open(StorageConfig::new(src_dir.path(), 64)).unwrap();
        for lba in [0u32, 3, 17, 63] {
            src.write_block(lba as u64 * 512, &pattern(lba as u8)).unwrap();
        }
        let mut buf = Vec::new();
        src.save_state(&mut buf).unwrap();

        let dst_dir = tempdir().unwrap();
        let mut dst = Storage::open(StorageConfig::new(dst_dir.path(), 64)).unwrap();
        dst.load_state(&mut &buf[..]).unwrap();

        for lba in 0..64u32 {
            assert_eq!(
                src.read_block(lba as u64 * 512).unwrap(),
                dst.read_block(lba as u64 * 512).unwrap()
            );
        }
    }

    #[test]
    fn full_checkpoint_restore_roundtrip() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::open(StorageConfig::new(dir.path(), 32)).unwrap();
        storage.write_block(4 * 512, &pattern(0x42)).unwrap();
        let mut buf = Vec::new();
        storage.checkpoint(&mut buf, true).unwrap();

        storage.write_block(4 * 512, &pattern(0x99)).unwrap();
        storage.restore(&mut &buf[..]).unwrap();
        assert_eq!(storage.read_block(4 * 512).unwrap(), pattern(0x42));
    }
}
