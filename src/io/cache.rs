use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::asset::types::MeshId;
use crate::error::RepoError;
use crate::{CACHE_PREAMBLE_SIZE, CACHE_PREAMBLE_VERSION, MESH_HEADER_SIZE};

/// Fixed prefix of every cache blob: version tag, header size, presence
/// flags, followed by the header bytes and the sub-sections at their
/// in-header offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub version: u32,
    pub header_size: u32,
    pub flags: u32,
}

/// Single-blob-per-asset disk cache. One backing file per mesh
/// identifier, sized to fit the header plus every present sub-section.
pub struct MeshCache {
    dir: PathBuf,
}

impl MeshCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RepoError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, mesh_id: &MeshId) -> PathBuf {
        self.dir.join(format!("{}.mesh", mesh_id.as_simple()))
    }

    pub fn blob_len(&self, mesh_id: &MeshId) -> Option<u64> {
        std::fs::metadata(self.blob_path(mesh_id))
            .ok()
            .map(|meta| meta.len())
    }

    fn read_preamble_from(file: &mut File) -> Result<Preamble, RepoError> {
        Ok(Preamble {
            version: file.read_u32::<LittleEndian>()?,
            header_size: file.read_u32::<LittleEndian>()?,
            flags: file.read_u32::<LittleEndian>()?,
        })
    }

    pub fn read_preamble(&self, mesh_id: &MeshId) -> Result<Option<Preamble>, RepoError> {
        let mut file = match File::open(self.blob_path(mesh_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() < CACHE_PREAMBLE_SIZE {
            return Ok(None);
        }
        Ok(Some(Self::read_preamble_from(&mut file)?))
    }

    /// Updates the fixed-size preamble in place, creating the blob when
    /// it does not exist yet.
    pub fn write_preamble(
        &self,
        mesh_id: &MeshId,
        header_size: u32,
        flags: u32,
    ) -> Result<(), RepoError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.blob_path(mesh_id))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_u32::<LittleEndian>(CACHE_PREAMBLE_VERSION)?;
        file.write_u32::<LittleEndian>(header_size)?;
        file.write_u32::<LittleEndian>(flags)?;
        Ok(())
    }

    /// Reads `out.len()` bytes at an absolute blob offset. Yields absent
    /// when the blob is missing, carries a foreign preamble version, or
    /// does not reach the requested range.
    pub fn read_range_into(
        &self,
        mesh_id: &MeshId,
        offset: u64,
        out: &mut [u8],
    ) -> Result<Option<()>, RepoError> {
        let mut file = match File::open(self.blob_path(mesh_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < CACHE_PREAMBLE_SIZE {
            return Ok(None);
        }

        let preamble = Self::read_preamble_from(&mut file)?;
        if preamble.version != CACHE_PREAMBLE_VERSION {
            debug!(
                "Cache blob for {} has preamble version {}, ignoring it",
                mesh_id, preamble.version
            );
            return Ok(None);
        }

        if offset + out.len() as u64 > len {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(out)?;
        Ok(Some(()))
    }

    pub fn read_range(
        &self,
        mesh_id: &MeshId,
        offset: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>, RepoError> {
        let mut out = vec![0u8; len];
        Ok(self
            .read_range_into(mesh_id, offset, &mut out)?
            .map(|_| out))
    }

    /// Writes at an absolute offset past the preamble. A gap between the
    /// current end of the blob and the offset is zero filled.
    pub fn write_range(&self, mesh_id: &MeshId, offset: u64, data: &[u8]) -> Result<(), RepoError> {
        if offset < CACHE_PREAMBLE_SIZE {
            return Err(RepoError::RangeOutOfBounds {
                offset,
                len: data.len() as u64,
            });
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.blob_path(mesh_id))?;

        let len = file.metadata()?.len();
        if offset > len {
            // reserve the gap explicitly so later reads see zeros
            file.set_len(offset)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Grows the blob to `total_len`, zero filling the reserved region so
    /// unwritten sub-sections are recognizable as such.
    pub fn reserve(&self, mesh_id: &MeshId, total_len: u64) -> Result<(), RepoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.blob_path(mesh_id))?;
        if file.metadata()?.len() < total_len {
            file.set_len(total_len)?;
        }
        Ok(())
    }

    /// Header probe for the fetch path: the preamble plus up to the first
    /// two minimal disk reads worth of header bytes. Headers are assumed
    /// to fit in `MESH_HEADER_SIZE`, the second read covers a header that
    /// straddles the first block together with the preamble.
    pub fn read_header_block(
        &self,
        mesh_id: &MeshId,
    ) -> Result<Option<(Preamble, Vec<u8>)>, RepoError> {
        let mut file = match File::open(self.blob_path(mesh_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < CACHE_PREAMBLE_SIZE {
            return Ok(None);
        }

        let preamble = Self::read_preamble_from(&mut file)?;
        if preamble.version != CACHE_PREAMBLE_VERSION {
            return Ok(None);
        }

        let minimal_read = MESH_HEADER_SIZE as u64;
        let mut wanted = minimal_read.min(len);
        if preamble.header_size as u64 + CACHE_PREAMBLE_SIZE > minimal_read {
            wanted = (2 * minimal_read).min(len);
        }

        let mut bytes = vec![0u8; (wanted - CACHE_PREAMBLE_SIZE) as usize];
        file.read_exact(&mut bytes)?;
        Ok(Some((preamble, bytes)))
    }

    pub fn remove(&self, mesh_id: &MeshId) {
        if let Err(e) = std::fs::remove_file(self.blob_path(mesh_id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to drop cache blob for {}: {}", mesh_id, e);
            }
        }
    }
}

/// Reserved but unwritten cache regions present as zeros. Before a cached
/// sub-section is trusted its first kilobyte must contain data.
pub fn leading_kilobyte_is_zero(data: &[u8]) -> bool {
    data.iter().take(1024).all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cache() -> (tempfile::TempDir, MeshCache) {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache = MeshCache::new(dir.path().join("mesh")).expect("cache dir");
        (dir, cache)
    }

    #[test]
    fn preamble_roundtrips() {
        let (_guard, cache) = cache();
        let id = Uuid::new_v4();

        cache.write_preamble(&id, 420, 0b101_1001).expect("writes");
        let preamble = cache.read_preamble(&id).expect("reads").expect("present");

        assert_eq!(preamble.version, CACHE_PREAMBLE_VERSION);
        assert_eq!(preamble.header_size, 420);
        assert_eq!(preamble.flags, 0b101_1001);
    }

    #[test]
    fn read_range_of_missing_blob_is_absent() {
        let (_guard, cache) = cache();
        let id = Uuid::new_v4();
        assert!(cache.read_range(&id, 12, 16).expect("no io error").is_none());
    }

    #[test]
    fn read_range_rejects_foreign_preamble_version() {
        let (_guard, cache) = cache();
        let id = Uuid::new_v4();

        cache.write_preamble(&id, 64, 0).expect("writes");
        cache.write_range(&id, 12, &[7u8; 16]).expect("writes");

        // stomp the version tag
        let path = cache.blob_path(&id);
        let mut raw = std::fs::read(&path).expect("raw blob");
        raw[0] = 0xFF;
        std::fs::write(&path, raw).expect("rewrites");

        assert!(cache.read_range(&id, 12, 16).expect("no io error").is_none());
    }

    #[test]
    fn write_range_zero_pads_the_gap() {
        let (_guard, cache) = cache();
        let id = Uuid::new_v4();

        cache.write_preamble(&id, 8, 0).expect("writes");
        cache.write_range(&id, 100, &[1u8, 2, 3]).expect("writes");

        let gap = cache.read_range(&id, 12, 88).expect("reads").expect("present");
        assert!(gap.iter().all(|&b| b == 0));
        let tail = cache.read_range(&id, 100, 3).expect("reads").expect("present");
        assert_eq!(tail, vec![1, 2, 3]);
    }

    #[test]
    fn read_range_does_not_reach_past_the_blob() {
        let (_guard, cache) = cache();
        let id = Uuid::new_v4();

        cache.write_preamble(&id, 8, 0).expect("writes");
        cache.write_range(&id, 12, &[9u8; 4]).expect("writes");
        assert!(cache.read_range(&id, 12, 5).expect("no io error").is_none());
    }

    #[test]
    fn write_range_into_preamble_is_rejected() {
        let (_guard, cache) = cache();
        let id = Uuid::new_v4();
        assert!(cache.write_range(&id, 4, &[0u8; 4]).is_err());
    }

    #[test]
    fn reserve_only_grows() {
        let (_guard, cache) = cache();
        let id = Uuid::new_v4();

        cache.write_preamble(&id, 8, 0).expect("writes");
        cache.write_range(&id, 12, &[5u8; 20]).expect("writes");
        cache.reserve(&id, 16).expect("no shrink");
        assert_eq!(cache.blob_len(&id), Some(32));

        cache.reserve(&id, 64).expect("grows");
        assert_eq!(cache.blob_len(&id), Some(64));
    }

    #[test]
    fn header_block_extends_to_a_second_read_for_large_headers() {
        let (_guard, cache) = cache();
        let id = Uuid::new_v4();

        let header_size = MESH_HEADER_SIZE as u32 + 100;
        cache.write_preamble(&id, header_size, 0).expect("writes");
        let payload = vec![0xCDu8; header_size as usize + 64];
        cache.write_range(&id, CACHE_PREAMBLE_SIZE, &payload).expect("writes");

        let (preamble, bytes) = cache
            .read_header_block(&id)
            .expect("reads")
            .expect("present");
        assert_eq!(preamble.header_size, header_size);
        assert!(bytes.len() as u64 > MESH_HEADER_SIZE as u64 - CACHE_PREAMBLE_SIZE);
    }

    #[test]
    fn zero_region_detection_checks_the_first_kilobyte_only() {
        let mut data = vec![0u8; 2048];
        assert!(leading_kilobyte_is_zero(&data));
        data[1500] = 1;
        assert!(leading_kilobyte_is_zero(&data));
        data[512] = 1;
        assert!(!leading_kilobyte_is_zero(&data));
        assert!(leading_kilobyte_is_zero(&[]));
    }
}
