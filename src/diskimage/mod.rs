//! Disk image layer (spec §4.2, component C2): maps a user-facing image
//! file onto a [`crate::storage::Storage`] instance, detecting a DiskCopy
//! 4.2 wrapper and seeding the block store from the raw file on first open.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::storage::{Storage, StorageConfig, BLOCK_SIZE};

const DISKCOPY_HEADER_LEN: u64 = 0x54;
const DISKCOPY_DATA_SIZE_OFFSET: u64 = 0x40;
const DISKCOPY_TAG_SIZE_OFFSET: u64 = 0x44;

/// Environment variable pointing at a cache root for block directories
/// (spec §6 Configuration surface).
pub const STORAGE_CACHE_ENV: &str = "GS_STORAGE_CACHE";

/// Coarse media type, inferred from logical size alone (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    FloppySingleSided400K,
    FloppyDoubleSided800K,
    HardDisk,
}

impl MediaKind {
    fn from_logical_size(size: u64) -> Self {
        match size {
            0x64000 => MediaKind::FloppySingleSided400K,
            0xC8000 => MediaKind::FloppyDoubleSided800K,
            _ => MediaKind::HardDisk,
        }
    }
}

/// Result of probing a file for a DiskCopy 4.2 wrapper (spec §4.2/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DiskCopyInfo {
    data_size: u64,
}

/// Probe `file` for a DiskCopy 4.2 header: present if the file is at least
/// `DISKCOPY_HEADER_LEN` bytes, the big-endian u32 at 0x40 is non-zero and a
/// multiple of 512, and the declared data+tag extent fits inside the file.
fn detect_diskcopy(file: &mut File, file_size: u64) -> CoreResult<Option<DiskCopyInfo>> {
    if file_size < DISKCOPY_HEADER_LEN {
        return Ok(None);
    }
    let data_size = read_u32_be(file, DISKCOPY_DATA_SIZE_OFFSET)? as u64;
    if data_size == 0 || data_size % BLOCK_SIZE as u64 != 0 {
        return Ok(None);
    }
    let tag_size = read_u32_be(file, DISKCOPY_TAG_SIZE_OFFSET)? as u64;
    if DISKCOPY_HEADER_LEN + data_size + tag_size > file_size {
        return Ok(None);
    }
    Ok(Some(DiskCopyInfo { data_size }))
}

fn read_u32_be(file: &mut File, offset: u64) -> CoreResult<u32> {
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// An open disk image: the originating path, logical geometry, and the
/// backing content-addressed store.
pub struct DiskImage {
    path: PathBuf,
    logical_size: u64,
    writable: bool,
    kind: MediaKind,
    is_diskcopy: bool,
    storage: Storage,
}

impl DiskImage {
    /// Resolve the storage directory for `image_path`, honoring
    /// `GS_STORAGE_CACHE` when set (spec §6).
    pub fn blocks_dir_for(image_path: &Path) -> CoreResult<PathBuf> {
        let abs = fs::canonicalize(image_path).unwrap_or_else(|_| image_path.to_path_buf());
        match std::env::var_os(STORAGE_CACHE_ENV) {
            Some(cache_root) if !cache_root.is_empty() => {
                let mut rel = PathBuf::new();
                for component in abs.components() {
                    use std::path::Component;
                    match component {
                        Component::RootDir | Component::Prefix(_) => {}
                        other => rel.push(other.as_os_str()),
                    }
                }
                let mut dir = PathBuf::from(cache_root);
                dir.push(rel);
                let mut name = dir.file_name().unwrap_or_default().to_os_string();
                name.push(".blocks");
                Ok(dir.with_file_name(name))
            }
            _ => {
                let mut name = image_path.file_name().unwrap_or_default().to_os_string();
                name.push(".blocks");
                Ok(image_path.with_file_name(name))
            }
        }
    }

    /// Open (and, on first use, seed) a disk image. `writable` controls
    /// whether [`Self::write_block`] is permitted.
    pub fn open(image_path: impl Into<PathBuf>, writable: bool) -> CoreResult<Self> {
        let image_path = image_path.into();
        let mut file = File::open(&image_path)?;
        let file_size = file.metadata()?.len();

        let diskcopy = detect_diskcopy(&mut file, file_size)?;
        let (logical_size, data_offset) = match diskcopy {
            Some(info) => (info.data_size, DISKCOPY_HEADER_LEN),
            None => (file_size, 0),
        };
        if logical_size % BLOCK_SIZE as u64 != 0 {
            return Err(CoreError::invalid_argument(format!(
                "image {image_path:?} has logical size {logical_size}, not a multiple of {BLOCK_SIZE}"
            )));
        }

        let blocks_dir = Self::blocks_dir_for(&image_path)?;
        if let Some(parent) = blocks_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        let first_open = !blocks_dir.join("meta.json").exists();

        let block_count = (logical_size / BLOCK_SIZE as u64) as u32;
        let config = StorageConfig::new(&blocks_dir, block_count);
        let mut storage = Storage::open(config)?;

        if first_open {
            log::info!(
                target: "diskimage",
                "seeding {:?} from {:?} ({} blocks, diskcopy={})",
                blocks_dir, image_path, block_count, diskcopy.is_some()
            );
            file.seek(SeekFrom::Start(data_offset))?;
            storage.load_state(&mut file)?;
        }

        Ok(Self {
            path: image_path,
            logical_size,
            writable,
            kind: MediaKind::from_logical_size(logical_size),
            is_diskcopy: diskcopy.is_some(),
            storage,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_diskcopy(&self) -> bool {
        self.is_diskcopy
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    fn validate_offset(&self, offset: u64) -> CoreResult<()> {
        if offset % BLOCK_SIZE as u64 != 0 {
            return Err(CoreError::invalid_argument(format!(
                "offset {offset} is not block-aligned"
            )));
        }
        Ok(())
    }

    pub fn read_block(&self, offset: u64) -> CoreResult<[u8; 512]> {
        self.validate_offset(offset)?;
        self.storage.read_block(offset)
    }

    pub fn write_block(&mut self, offset: u64, data: &[u8; 512]) -> CoreResult<()> {
        self.validate_offset(offset)?;
        if !self.writable {
            return Err(CoreError::invalid_argument(format!(
                "image {:?} is read-only",
                self.path
            )));
        }
        self.storage.write_block(offset, data)
    }

    /// Export the current content to a fresh file via `save_state`. Refuses
    /// for DiskCopy-originated images, which this layer cannot re-wrap.
    pub fn image_save(&self, dest_path: impl AsRef<Path>) -> CoreResult<()> {
        if self.is_diskcopy {
            return Err(CoreError::invalid_argument(
                "cannot save a DiskCopy-originated image without re-wrapping its header",
            ));
        }
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest_path)?;
        self.storage.save_state(&mut out)?;
        out.flush()?;
        Ok(())
    }

    /// Called once per scheduler quantum for this image (spec §4.2).
    pub fn tick(&mut self) -> CoreResult<()> {
        self.storage.tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_raw_image(path: &Path, block_count: u32) {
        let mut file = File::create(path).unwrap();
        for lba in 0..block_count {
            let pattern = [(lba % 256) as u8; 512];
            file.write_all(&pattern).unwrap();
        }
    }

    #[test]
    fn open_plain_image_seeds_from_raw_bytes() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("disk.img");
        write_raw_image(&image_path, 32);

        let image = DiskImage::open(&image_path, true).unwrap();
        assert!(!image.is_diskcopy());
        assert_eq!(image.logical_size(), 32 * 512);
        assert_eq!(image.read_block(5 * 512).unwrap(), [5u8; 512]);
    }

    #[test]
    fn reopen_does_not_reseed() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("disk.img");
        write_raw_image(&image_path, 16);

        {
            let mut image = DiskImage::open(&image_path, true).unwrap();
            image.write_block(0, &[0xFFu8; 512]).unwrap();
        }
        let image = DiskImage::open(&image_path, true).unwrap();
        assert_eq!(image.read_block(0).unwrap(), [0xFFu8; 512]);
    }

    #[test]
    fn misaligned_offset_rejected() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("disk.img");
        write_raw_image(&image_path, 16);
        let image = DiskImage::open(&image_path, true).unwrap();
        assert!(image.read_block(3).is_err());
    }

    #[test]
    fn write_to_readonly_image_rejected() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("disk.img");
        write_raw_image(&image_path, 16);
        let mut image = DiskImage::open(&image_path, false).unwrap();
        assert!(image.write_block(0, &[0u8; 512]).is_err());
    }

    /// Scenario 3 from spec §8: a well-formed DiskCopy 4.2 header is
    /// detected and its raw data starts right after the 0x54-byte header.
    #[test]
    fn diskcopy_header_detected_and_skipped() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("disk.dc42");
        let data_size: u32 = 0x00080000;
        let mut file = File::create(&image_path).unwrap();
        let mut header = vec![0u8; DISKCOPY_HEADER_LEN as usize];
        header[0x40..0x44].copy_from_slice(&data_size.to_be_bytes());
        file.write_all(&header).unwrap();
        let mut data = vec![0u8; data_size as usize];
        data[0] = 0x42;
        file.write_all(&data).unwrap();
        drop(file);

        let image = DiskImage::open(&image_path, true).unwrap();
        assert!(image.is_diskcopy());
        assert_eq!(image.logical_size(), data_size as u64);
        let mut expected = [0u8; 512];
        expected[0] = 0x42;
        assert_eq!(image.read_block(0).unwrap(), expected);
    }

    #[test]
    fn image_save_refuses_for_diskcopy_origin() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("disk.dc42");
        let data_size: u32 = 512;
        let mut file = File::create(&image_path).unwrap();
        let mut header = vec![0u8; DISKCOPY_HEADER_LEN as usize];
        header[0x40..0x44].copy_from_slice(&data_size.to_be_bytes());
        file.write_all(&header).unwrap();
        file.write_all(&[0u8; 512]).unwrap();
        drop(file);

        let image = DiskImage::open(&image_path, true).unwrap();
        let out_path = dir.path().join("out.img");
        assert!(image.image_save(&out_path).is_err());
    }

    #[test]
    fn image_save_plain_roundtrips() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("disk.img");
        write_raw_image(&image_path, 8);
        let image = DiskImage::open(&image_path, true).unwrap();
        let out_path = dir.path().join("out.img");
        image.image_save(&out_path).unwrap();
        let saved = fs::read(&out_path).unwrap();
        let original = fs::read(&image_path).unwrap();
        assert_eq!(saved, original);
    }
}
