//! On-disk layout of chunk voxel data.
//!
//! One file per chunk, named after the chunk's minimum corner. The file holds the chunk's voxels
//! as big-endian `u16` values in chunk order (x fastest, then y, then z) with no header and no
//! compression, so a valid file is always exactly `2 * 32^3` bytes.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use cgmath::Point3;
use thiserror::Error;

use crate::core::{ChunkVoxels, Voxel};
use crate::index_utils;

pub const VOXEL_FILE_EXTENSION: &str = "voxels";

/// Size in bytes of a valid chunk file.
pub const VOXEL_FILE_SIZE: u64 = 2 * index_utils::chunk_size_total() as u64;

#[derive(Debug, Error)]
pub enum LoadError {
    /// No data has been saved for this chunk yet; it must be generated.
    #[error("no voxel data file at {}", .path.display())]
    NotFound { path: PathBuf },
    /// A file exists but cannot be voxel data for a chunk.
    #[error("invalid voxel data in {}: {reason}", .path.display())]
    InvalidData { path: PathBuf, reason: String },
    #[error("failed to read voxel data from {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// File name for the chunk whose minimum corner is `min_corner`. Distinct corners always give
/// distinct names, and the name depends on nothing else.
pub fn file_name_for_voxel_data(min_corner: Point3<i64>) -> String {
    format!(
        "chunk_{}_{}_{}.{}",
        min_corner.x, min_corner.y, min_corner.z, VOXEL_FILE_EXTENSION
    )
}

pub fn voxel_data_path(folder: &Path, min_corner: Point3<i64>) -> PathBuf {
    folder.join(file_name_for_voxel_data(min_corner))
}

pub fn serialize_voxels<W: Write>(voxels: &ChunkVoxels, target: &mut W) -> io::Result<()> {
    for voxel in voxels.as_slice() {
        target.write_u16::<BigEndian>(voxel.to_u16())?;
    }
    Ok(())
}

pub fn deserialize_voxels<R: Read>(src: &mut R) -> io::Result<ChunkVoxels> {
    let mut raw = vec![0u16; index_utils::chunk_size_total()];
    src.read_u16_into::<BigEndian>(&mut raw)?;
    Ok(ChunkVoxels::from_raw(
        raw.into_iter().map(Voxel::from_u16).collect(),
    ))
}

/// Writes the chunk's voxels next to their final location and renames them into place, so a
/// crash mid-write never leaves a truncated file under the real name.
pub fn save_voxels(folder: &Path, min_corner: Point3<i64>, voxels: &ChunkVoxels) -> Result<()> {
    let path = voxel_data_path(folder, min_corner);
    let tmp_path = path.with_extension(format!("{}.tmp", VOXEL_FILE_EXTENSION));

    {
        let file = File::create(&tmp_path)
            .with_context(|| format!("Creating voxel data file {}", tmp_path.display()))?;
        let mut writer = BufWriter::new(file);
        serialize_voxels(voxels, &mut writer)
            .with_context(|| format!("Writing voxel data to {}", tmp_path.display()))?;
        writer
            .flush()
            .with_context(|| format!("Flushing voxel data to {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, &path).with_context(|| {
        format!(
            "Moving voxel data from {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;

    log::debug!("Saved voxel data for chunk at {:?}", min_corner);
    Ok(())
}

pub fn load_voxels(folder: &Path, min_corner: Point3<i64>) -> Result<ChunkVoxels, LoadError> {
    let path = voxel_data_path(folder, min_corner);

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(LoadError::NotFound { path })
        }
        Err(source) => return Err(LoadError::Io { path, source }),
    };

    let len = match file.metadata() {
        Ok(metadata) => metadata.len(),
        Err(source) => return Err(LoadError::Io { path, source }),
    };

    if len != VOXEL_FILE_SIZE {
        return Err(LoadError::InvalidData {
            reason: format!("expected {} bytes, found {}", VOXEL_FILE_SIZE, len),
            path,
        });
    }

    let mut reader = BufReader::new(file);
    match deserialize_voxels(&mut reader) {
        Ok(voxels) => Ok(voxels),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(LoadError::InvalidData {
            reason: "file ended early".into(),
            path,
        }),
        Err(source) => Err(LoadError::Io { path, source }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// A fresh empty directory under the system temp dir.
    pub(crate) fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "terra_voxels_{}_{}_{}",
            name,
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_file_names_are_distinct() {
        let mut names = HashSet::new();
        for x in -2..=2 {
            for y in -2..=2 {
                for z in -2..=2 {
                    let corner = Point3::new(x * 32, y * 32, z * 32);
                    assert!(names.insert(file_name_for_voxel_data(corner)));
                }
            }
        }

        assert_eq!(
            file_name_for_voxel_data(Point3::new(-32, 0, 64)),
            "chunk_-32_0_64.voxels"
        );
        assert_ne!(
            file_name_for_voxel_data(Point3::new(1, 23, 4)),
            file_name_for_voxel_data(Point3::new(12, 3, 4))
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = scratch_dir("save_then_load");
        let corner = Point3::new(-32, 64, 0);

        let mut voxels = ChunkVoxels::empty();
        voxels.set_voxel(Point3::new(0, 0, 0), Voxel::from_u16(1));
        voxels.set_voxel(Point3::new(31, 2, 17), Voxel::from_u16(0x1234));
        voxels.set_voxel(Point3::new(5, 5, 5), Voxel::from_u16(3));

        save_voxels(&dir, corner, &voxels).unwrap();
        assert_eq!(
            fs::metadata(voxel_data_path(&dir, corner)).unwrap().len(),
            VOXEL_FILE_SIZE
        );

        let loaded = load_voxels(&dir, corner).unwrap();
        assert_eq!(loaded, voxels);

        // overwriting replaces the previous contents
        voxels.set_voxel(Point3::new(5, 5, 5), Voxel::air());
        save_voxels(&dir, corner, &voxels).unwrap();
        assert_eq!(load_voxels(&dir, corner).unwrap(), voxels);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_big_endian_layout() {
        let mut voxels = ChunkVoxels::empty();
        voxels.set_voxel(Point3::new(1, 0, 0), Voxel::from_u16(0x0102));

        let mut bytes = Vec::new();
        serialize_voxels(&voxels, &mut bytes).unwrap();

        assert_eq!(bytes.len() as u64, VOXEL_FILE_SIZE);
        assert_eq!(&bytes[0..4], &[0, 0, 1, 2]);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = scratch_dir("missing");
        match load_voxels(&dir, Point3::new(0, 0, 0)) {
            Err(LoadError::NotFound { path }) => {
                assert_eq!(path, dir.join("chunk_0_0_0.voxels"))
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_wrong_size_is_invalid_data() {
        let dir = scratch_dir("wrong_size");
        let corner = Point3::new(32, 32, 32);
        fs::write(voxel_data_path(&dir, corner), vec![0u8; 100]).unwrap();

        match load_voxels(&dir, corner) {
            Err(LoadError::InvalidData { .. }) => {}
            other => panic!("expected InvalidData, got {:?}", other),
        }

        let mut too_long = vec![0u8; VOXEL_FILE_SIZE as usize];
        too_long.push(0);
        fs::write(voxel_data_path(&dir, corner), too_long).unwrap();
        assert!(matches!(
            load_voxels(&dir, corner),
            Err(LoadError::InvalidData { .. })
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
