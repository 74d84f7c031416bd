//! Binary storage for tag embeddings.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - tag_len: u16 (little-endian)
//! - tag: [u8; tag_len] (utf-8)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::TagIndex;

const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {found}, supported version {supported}")]
    VersionMismatch { found: u8, supported: u8 },

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Persists a [`TagIndex`] to a single binary file. Saves go through a
/// temp file and atomic rename, so a crash mid-save leaves the previous
/// index intact.
pub struct TagVectorStorage {
    path: PathBuf,
}

impl TagVectorStorage {
    pub fn new(path: impl Into<PathBuf>) -> TagVectorStorage {
        TagVectorStorage { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save(&self, index: &TagIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let tmp_path = self.path.with_extension("bin.tmp");
        let result = self.write_to(&tmp_path, index, model_id);
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
            return result;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn write_to(
        &self,
        path: &Path,
        index: &TagIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let dimensions = index.dimensions();
        if dimensions > u16::MAX as usize {
            return Err(VectorStorageError::InvalidFormat(format!(
                "dimensions {dimensions} exceed format limit"
            )));
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[1..33].copy_from_slice(model_id);
        header[33..35].copy_from_slice(&(dimensions as u16).to_le_bytes());
        header[35..43].copy_from_slice(&(index.len() as u64).to_le_bytes());
        let checksum = crc32fast::hash(&header[..43]);
        header[43..47].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header)?;

        for (tag, embedding) in index.iter() {
            let bytes = tag.as_bytes();
            if bytes.len() > u16::MAX as usize {
                let preview: String = tag.chars().take(32).collect();
                return Err(VectorStorageError::InvalidFormat(format!(
                    "tag {preview:?}... exceeds format limit"
                )));
            }
            writer.write_all(&(bytes.len() as u16).to_le_bytes())?;
            writer.write_all(bytes)?;
            for value in embedding {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|err| VectorStorageError::Io(err.into_error()))?;
        file.sync_all()?;
        Ok(())
    }

    /// Load and verify. The caller supplies the model identity and the
    /// dimensions it expects; anything else is a mismatch, not a merge.
    pub fn load(
        &self,
        model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<TagIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).map_err(|_| {
            VectorStorageError::InvalidFormat("file too small for header".to_string())
        })?;

        let version = header[0];
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch {
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let stored_checksum = u32::from_le_bytes(
            header[43..47]
                .try_into()
                .map_err(|_| VectorStorageError::InvalidFormat("bad header".to_string()))?,
        );
        if crc32fast::hash(&header[..43]) != stored_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        if &header[1..33] != model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        let dimensions = u16::from_le_bytes(
            header[33..35]
                .try_into()
                .map_err(|_| VectorStorageError::InvalidFormat("bad header".to_string()))?,
        ) as usize;
        if dimensions != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let entry_count = u64::from_le_bytes(
            header[35..43]
                .try_into()
                .map_err(|_| VectorStorageError::InvalidFormat("bad header".to_string()))?,
        );

        let mut index = TagIndex::new(dimensions);
        for _ in 0..entry_count {
            let mut len_bytes = [0u8; 2];
            reader.read_exact(&mut len_bytes).map_err(|_| {
                VectorStorageError::InvalidFormat("truncated entry".to_string())
            })?;
            let tag_len = u16::from_le_bytes(len_bytes) as usize;
            if tag_len == 0 {
                return Err(VectorStorageError::InvalidFormat(
                    "zero-length tag".to_string(),
                ));
            }

            let mut tag_bytes = vec![0u8; tag_len];
            reader.read_exact(&mut tag_bytes).map_err(|_| {
                VectorStorageError::InvalidFormat("truncated tag".to_string())
            })?;
            let tag = String::from_utf8(tag_bytes).map_err(|_| {
                VectorStorageError::InvalidFormat("tag is not valid utf-8".to_string())
            })?;

            let mut embedding = Vec::with_capacity(dimensions);
            let mut value_bytes = [0u8; 4];
            for _ in 0..dimensions {
                reader.read_exact(&mut value_bytes).map_err(|_| {
                    VectorStorageError::InvalidFormat("truncated embedding".to_string())
                })?;
                embedding.push(f32::from_le_bytes(value_bytes));
            }

            index.insert(tag, embedding).map_err(|err| {
                VectorStorageError::InvalidFormat(format!("unusable entry: {err}"))
            })?;
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(VectorStorageError::InvalidFormat(
                "trailing bytes after last entry".to_string(),
            ));
        }

        Ok(index)
    }

    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: usize = 4;

    fn model_id(name: &str) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(name.as_bytes()));
        out
    }

    fn sample_index() -> TagIndex {
        let mut index = TagIndex::new(DIMS);
        index.insert("rust".to_string(), vec![1.0, 0.0, 0.5, -0.5]).unwrap();
        index.insert("memory".to_string(), vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        index.insert("längere-wörter".to_string(), vec![-1.0, 1.0, -1.0, 1.0]).unwrap();
        index
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TagVectorStorage::new(dir.path().join("vectors.bin"));
        let id = model_id("test-model");

        storage.save(&sample_index(), &id).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&id, DIMS).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.contains("rust"));
        assert!(loaded.contains("längere-wörter"));
        let original = sample_index();
        for (tag, embedding) in original.iter() {
            let roundtripped = loaded
                .iter()
                .find(|(t, _)| t.as_str() == tag.as_str())
                .map(|(_, v)| v)
                .unwrap();
            assert_eq!(roundtripped, embedding, "{tag}");
        }
    }

    #[test]
    fn empty_index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TagVectorStorage::new(dir.path().join("vectors.bin"));
        let id = model_id("test-model");
        storage.save(&TagIndex::new(DIMS), &id).unwrap();
        assert!(storage.load(&id, DIMS).unwrap().is_empty());
    }

    #[test]
    fn load_rejects_different_model() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TagVectorStorage::new(dir.path().join("vectors.bin"));
        storage.save(&sample_index(), &model_id("model-a")).unwrap();

        let err = storage.load(&model_id("model-b"), DIMS).unwrap_err();
        assert!(matches!(err, VectorStorageError::ModelMismatch));
    }

    #[test]
    fn load_rejects_different_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TagVectorStorage::new(dir.path().join("vectors.bin"));
        let id = model_id("test-model");
        storage.save(&sample_index(), &id).unwrap();

        let err = storage.load(&id, DIMS + 1).unwrap_err();
        assert!(matches!(
            err,
            VectorStorageError::DimensionMismatch { expected: 5, got: 4 }
        ));
    }

    #[test]
    fn load_detects_header_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        let storage = TagVectorStorage::new(path.clone());
        let id = model_id("test-model");
        storage.save(&sample_index(), &id).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[5] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = storage.load(&id, DIMS).unwrap_err();
        assert!(matches!(err, VectorStorageError::ChecksumMismatch));
    }

    #[test]
    fn load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        let storage = TagVectorStorage::new(path.clone());
        let id = model_id("test-model");
        storage.save(&sample_index(), &id).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 99;
        std::fs::write(&path, bytes).unwrap();

        let err = storage.load(&id, DIMS).unwrap_err();
        assert!(matches!(
            err,
            VectorStorageError::VersionMismatch { found: 99, supported: 1 }
        ));
    }

    #[test]
    fn load_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        let storage = TagVectorStorage::new(path.clone());
        let id = model_id("test-model");
        storage.save(&sample_index(), &id).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = storage.load(&id, DIMS).unwrap_err();
        assert!(matches!(err, VectorStorageError::InvalidFormat(_)));
    }

    #[test]
    fn load_rejects_trailing_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        let storage = TagVectorStorage::new(path.clone());
        let id = model_id("test-model");
        storage.save(&sample_index(), &id).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(b"junk");
        std::fs::write(&path, bytes).unwrap();

        let err = storage.load(&id, DIMS).unwrap_err();
        assert!(matches!(err, VectorStorageError::InvalidFormat(_)));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TagVectorStorage::new(dir.path().join("vectors.bin"));
        let err = storage.load(&model_id("test-model"), DIMS).unwrap_err();
        assert!(matches!(err, VectorStorageError::Io(_)));
    }

    #[test]
    fn save_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TagVectorStorage::new(dir.path().join("vectors.bin"));
        let id = model_id("test-model");

        storage.save(&sample_index(), &id).unwrap();
        let mut smaller = TagIndex::new(DIMS);
        smaller.insert("only".to_string(), vec![1.0; DIMS]).unwrap();
        storage.save(&smaller, &id).unwrap();

        let loaded = storage.load(&id, DIMS).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains("only"));
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TagVectorStorage::new(dir.path().join("vectors.bin"));
        let id = model_id("test-model");
        storage.save(&sample_index(), &id).unwrap();
        storage.delete().unwrap();
        assert!(!storage.exists());
        // Deleting again is fine.
        storage.delete().unwrap();
    }
}
